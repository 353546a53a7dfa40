// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Template dictionary
//!
//! A bounded, per-device collection of representative windows. Lookups are
//! a linear scan: capacities are small (tens of templates) and the scan
//! keeps the nearest-template answer easy to audit.
//!
//! Eviction only removes a template from future matching. Its id is never
//! handed out again, and the persisted copy stays readable for
//! reconstruction of records that cite it. Templates leave either under
//! capacity pressure or, with `max_idle_ms` set, after going unmatched
//! for too long.

use serde::{Deserialize, Serialize};

use crate::config::CodecConfig;
use crate::distance::DistanceMetric;
use crate::error::{DictionaryError, Result};
use crate::record::Template;
use crate::sample::{DeviceId, TemplateId, Window};

/// Strategy used to pick the template to drop when the dictionary is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Lowest match count, ties broken by oldest last match
    #[default]
    LfuAging,
    /// Oldest last match
    Lru,
    /// Oldest creation
    Fifo,
}

impl EvictionPolicy {
    /// Pick the victim among `templates`
    ///
    /// Remaining ties are broken by the lowest template id so that the
    /// choice is deterministic.
    pub fn select_victim<'a, I>(&self, templates: I) -> Option<TemplateId>
    where
        I: IntoIterator<Item = &'a Template>,
    {
        let iter = templates.into_iter();
        let victim = match self {
            EvictionPolicy::LfuAging => {
                iter.min_by_key(|t| (t.match_count, t.last_matched_at, t.id))
            }
            EvictionPolicy::Lru => iter.min_by_key(|t| (t.last_matched_at, t.id)),
            EvictionPolicy::Fifo => iter.min_by_key(|t| (t.created_at, t.id)),
        };
        victim.map(|t| t.id)
    }
}

/// Outcome of admitting a window into the dictionary
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Id of the new template
    pub template_id: TemplateId,
    /// Template removed to make room, if the dictionary was full
    pub evicted: Option<Template>,
    /// Templates retired for being idle longer than `max_idle_ms`
    pub expired: Vec<Template>,
}

/// Bounded set of templates for one device
#[derive(Debug, Clone)]
pub struct TemplateDictionary {
    device_id: DeviceId,
    window_len: usize,
    capacity: usize,
    policy: EvictionPolicy,
    metric: DistanceMetric,
    max_idle_ms: Option<u64>,
    templates: Vec<Template>,
    next_id: TemplateId,
}

impl TemplateDictionary {
    /// Create an empty dictionary
    pub fn new(device_id: DeviceId, config: &CodecConfig) -> Self {
        Self {
            device_id,
            window_len: config.window_len,
            capacity: config.capacity.max(1),
            policy: config.eviction,
            metric: config.metric,
            max_idle_ms: config.max_idle_ms,
            templates: Vec::with_capacity(config.capacity),
            next_id: 0,
        }
    }

    /// Rebuild a dictionary from persisted active templates
    ///
    /// Templates whose length no longer matches the configured window are
    /// skipped. If more templates than `capacity` remain, the policy trims
    /// the excess. `next_id` is raised past every known id.
    pub fn restore(
        device_id: DeviceId,
        config: &CodecConfig,
        templates: Vec<Template>,
        next_id: TemplateId,
    ) -> (Self, Vec<Template>) {
        let mut dict = Self::new(device_id, config);
        dict.next_id = templates
            .iter()
            .map(|t| t.id.saturating_add(1))
            .fold(next_id, TemplateId::max);
        dict.templates = templates
            .into_iter()
            .filter(|t| t.window.len() == dict.window_len)
            .collect();
        dict.templates.sort_by_key(|t| t.id);

        let mut dropped = Vec::new();
        while dict.templates.len() > dict.capacity {
            match dict.remove_victim() {
                Some(t) => dropped.push(t),
                None => break,
            }
        }
        (dict, dropped)
    }

    /// Device owning this dictionary
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Number of active templates
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no template is active
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Maximum number of active templates
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Id the next admitted template will receive
    pub fn next_id(&self) -> TemplateId {
        self.next_id
    }

    /// Eviction policy in use
    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Look up an active template
    pub fn get(&self, id: TemplateId) -> Option<&Template> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Iterate over active templates in admission order
    pub fn iter(&self) -> impl Iterator<Item = &Template> {
        self.templates.iter()
    }

    /// Nearest active template to `window` and its distance
    ///
    /// Fails with `EmptyDictionary` when no template exists yet. On equal
    /// distances the earliest admitted template wins.
    pub fn find_nearest(&self, window: &Window) -> Result<(TemplateId, f64)> {
        let mut best: Option<(TemplateId, f64)> = None;
        for template in &self.templates {
            let d = self
                .metric
                .distance(window.values(), template.window.values())?;
            if best.map_or(true, |(_, best_d)| d < best_d) {
                best = Some((template.id, d));
            }
        }
        best.ok_or_else(|| {
            DictionaryError::EmptyDictionary {
                device: self.device_id.clone(),
            }
            .into()
        })
    }

    /// Insert `window` as a new template
    ///
    /// Idle templates expire first; if the dictionary is still at capacity
    /// the policy evicts one more.
    pub fn admit(&mut self, window: Window, now: u64) -> Result<Admission> {
        if window.len() != self.window_len {
            return Err(DictionaryError::WindowLength {
                expected: self.window_len,
                actual: window.len(),
            }
            .into());
        }

        let expired = self.expire_idle(now);
        let evicted = if self.templates.len() >= self.capacity {
            self.remove_victim()
        } else {
            None
        };
        if let Some(victim) = &evicted {
            log::debug!(
                "device {}: evicted template {} (matches {}, last matched {})",
                self.device_id,
                victim.id,
                victim.match_count,
                victim.last_matched_at
            );
        }

        let template_id = self.next_id;
        self.next_id += 1;
        self.templates
            .push(Template::new(template_id, self.device_id.clone(), window, now));

        Ok(Admission {
            template_id,
            evicted,
            expired,
        })
    }

    /// Remove templates last matched more than `max_idle_ms` before `now`
    pub fn expire_idle(&mut self, now: u64) -> Vec<Template> {
        let Some(max_idle) = self.max_idle_ms else {
            return Vec::new();
        };
        let (expired, active): (Vec<Template>, Vec<Template>) =
            std::mem::take(&mut self.templates)
                .into_iter()
                .partition(|t| now.saturating_sub(t.last_matched_at) > max_idle);
        self.templates = active;
        for t in &expired {
            log::debug!(
                "device {}: template {} expired (last matched {}, now {})",
                self.device_id,
                t.id,
                t.last_matched_at,
                now
            );
        }
        expired
    }

    /// Count a match against template `id` at time `at`
    pub fn record_match(&mut self, id: TemplateId, at: u64) {
        if let Some(t) = self.templates.iter_mut().find(|t| t.id == id) {
            t.match_count += 1;
            t.last_matched_at = t.last_matched_at.max(at);
        }
    }

    fn remove_victim(&mut self) -> Option<Template> {
        let victim = self.policy.select_victim(&self.templates)?;
        let pos = self.templates.iter().position(|t| t.id == victim)?;
        Some(self.templates.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelepressError;

    fn dict(capacity: usize, policy: EvictionPolicy) -> TemplateDictionary {
        let config = CodecConfig {
            eviction: policy,
            ..CodecConfig::with_window(4, capacity)
        };
        TemplateDictionary::new(DeviceId::from("d1"), &config)
    }

    fn w(v: f64) -> Window {
        Window::new(vec![v; 4])
    }

    #[test]
    fn test_empty_dictionary() {
        let d = dict(2, EvictionPolicy::LfuAging);
        let err = d.find_nearest(&w(1.0)).unwrap_err();
        assert!(matches!(
            err,
            TelepressError::Dictionary(DictionaryError::EmptyDictionary { .. })
        ));
    }

    #[test]
    fn test_find_nearest() {
        let mut d = dict(4, EvictionPolicy::LfuAging);
        let a = d.admit(w(1.0), 0).unwrap().template_id;
        let b = d.admit(w(9.0), 1).unwrap().template_id;

        let (id, dist) = d.find_nearest(&w(1.0)).unwrap();
        assert_eq!(id, a);
        assert_eq!(dist, 0.0);

        let (id, _) = d.find_nearest(&w(8.0)).unwrap();
        assert_eq!(id, b);
    }

    #[test]
    fn test_wrong_window_length() {
        let mut d = dict(2, EvictionPolicy::LfuAging);
        assert!(d.admit(Window::new(vec![1.0; 3]), 0).is_err());
        d.admit(w(1.0), 0).unwrap();
        let err = d.find_nearest(&Window::new(vec![1.0; 3])).unwrap_err();
        assert!(matches!(err, TelepressError::Distance(_)));
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut d = dict(3, EvictionPolicy::LfuAging);
        for i in 0..20 {
            d.admit(w(i as f64), i).unwrap();
            assert!(d.len() <= 3);
        }
        assert_eq!(d.len(), 3);
        assert_eq!(d.next_id(), 20);
    }

    #[test]
    fn test_lfu_evicts_least_matched() {
        let mut d = dict(2, EvictionPolicy::LfuAging);
        let t1 = d.admit(w(1.0), 0).unwrap().template_id;
        let t2 = d.admit(w(9.0), 1).unwrap().template_id;
        d.record_match(t1, 2);

        let admission = d.admit(w(5.0), 3).unwrap();
        assert_eq!(admission.evicted.map(|t| t.id), Some(t2));
        assert!(d.get(t1).is_some());
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_lfu_tie_breaks_by_oldest_match() {
        let mut d = dict(2, EvictionPolicy::LfuAging);
        let t1 = d.admit(w(1.0), 0).unwrap().template_id;
        let t2 = d.admit(w(9.0), 1).unwrap().template_id;
        d.record_match(t1, 10);
        d.record_match(t2, 5);

        let admission = d.admit(w(5.0), 11).unwrap();
        assert_eq!(admission.evicted.map(|t| t.id), Some(t2));
    }

    #[test]
    fn test_lru_and_fifo() {
        let mut lru = dict(2, EvictionPolicy::Lru);
        let a = lru.admit(w(1.0), 0).unwrap().template_id;
        let b = lru.admit(w(2.0), 1).unwrap().template_id;
        lru.record_match(a, 5);
        assert_eq!(lru.admit(w(3.0), 6).unwrap().evicted.map(|t| t.id), Some(b));

        let mut fifo = dict(2, EvictionPolicy::Fifo);
        let a = fifo.admit(w(1.0), 0).unwrap().template_id;
        fifo.admit(w(2.0), 1).unwrap();
        fifo.record_match(a, 5);
        assert_eq!(fifo.admit(w(3.0), 6).unwrap().evicted.map(|t| t.id), Some(a));
    }

    #[test]
    fn test_record_match_updates_stats() {
        let mut d = dict(2, EvictionPolicy::LfuAging);
        let id = d.admit(w(1.0), 100).unwrap().template_id;
        d.record_match(id, 200);
        d.record_match(id, 150);
        let t = d.get(id).unwrap();
        assert_eq!(t.match_count, 2);
        assert_eq!(t.last_matched_at, 200);

        // Unknown ids are ignored
        d.record_match(99, 300);
    }

    #[test]
    fn test_idle_templates_expire_below_capacity() {
        let config = CodecConfig {
            max_idle_ms: Some(1_000),
            ..CodecConfig::with_window(4, 8)
        };
        let mut d = TemplateDictionary::new(DeviceId::from("d1"), &config);
        let stale = d.admit(w(1.0), 0).unwrap().template_id;
        let busy = d.admit(w(5.0), 100).unwrap().template_id;
        d.record_match(busy, 1_500);

        // Stale is 1_200 ms idle; busy was matched after `now`
        let admission = d.admit(w(9.0), 1_200).unwrap();
        assert_eq!(admission.evicted, None);
        let expired: Vec<TemplateId> = admission.expired.iter().map(|t| t.id).collect();
        assert_eq!(expired, vec![stale]);
        assert!(d.get(stale).is_none());
        assert!(d.get(busy).is_some());
        assert_eq!(d.len(), 2);
        assert_eq!(d.next_id(), 3);
    }

    #[test]
    fn test_expiry_disabled_by_default() {
        let mut d = dict(8, EvictionPolicy::LfuAging);
        d.admit(w(1.0), 0).unwrap();
        let admission = d.admit(w(9.0), u64::MAX).unwrap();
        assert!(admission.expired.is_empty());
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_expiry_frees_room_before_eviction() {
        let config = CodecConfig {
            max_idle_ms: Some(10),
            ..CodecConfig::with_window(4, 2)
        };
        let mut d = TemplateDictionary::new(DeviceId::from("d1"), &config);
        let old = d.admit(w(1.0), 0).unwrap().template_id;
        let recent = d.admit(w(5.0), 95).unwrap().template_id;

        let admission = d.admit(w(9.0), 100).unwrap();
        assert_eq!(admission.expired.len(), 1);
        assert_eq!(admission.expired[0].id, old);
        assert_eq!(admission.evicted, None);
        assert!(d.get(recent).is_some());
    }

    #[test]
    fn test_restore_trims_and_advances_ids() {
        let config = CodecConfig::with_window(4, 2);
        let device = DeviceId::from("d1");
        let templates = (0..3)
            .map(|i| Template::new(i * 2, device.clone(), w(i as f64), i as u64))
            .collect();

        let (d, dropped) = TemplateDictionary::restore(device, &config, templates, 0);
        assert_eq!(d.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, 0);
        assert_eq!(d.next_id(), 5);
    }
}
