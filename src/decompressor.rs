// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Stream reconstruction
//!
//! Replays compact records against the stored templates (evicted ones
//! included) and yields the approximated stream lazily, one sample at a
//! time. Reconstruction never writes to the store, so it can run
//! concurrently with compression and be repeated with identical output.

use std::collections::{HashMap, VecDeque};
use std::io::Write;

use crate::error::{DecodeError, Result, TelepressError};
use crate::record::{CompactRecord, ReconstructedSample, RecordKind, Template};
use crate::sample::{DeviceId, TemplateId, TimeSpan};
use crate::store::Store;

/// Values of one record, truncated to its true length
///
/// `template` must be the template cited by a `MatchedReference`; it is
/// ignored for `NewTemplate` records.
pub fn record_values(record: &CompactRecord, template: Option<&Template>) -> Result<Vec<f64>> {
    let malformed = |reason: String| DecodeError::MalformedRecord {
        seq: record.seq,
        reason,
    };

    let mut values = match &record.kind {
        RecordKind::NewTemplate { window, .. } => window.values().to_vec(),
        RecordKind::MatchedReference {
            template_id,
            residual,
        } => {
            let template = template.ok_or_else(|| DecodeError::DanglingReference {
                device: record.device_id.clone(),
                template_id: *template_id,
            })?;
            let base = template.window.values();
            match residual {
                Some(r) if r.steps.len() != base.len() => {
                    return Err(malformed(format!(
                        "residual has {} steps for a window of {}",
                        r.steps.len(),
                        base.len()
                    ))
                    .into())
                }
                Some(r) => r.apply(base),
                None => base.to_vec(),
            }
        }
    };

    if record.len == 0 || record.len > values.len() {
        return Err(malformed(format!(
            "length {} outside 1..={}",
            record.len,
            values.len()
        ))
        .into());
    }
    values.truncate(record.len);
    Ok(values)
}

/// Read-only reconstruction entry point over a store
pub struct Decompressor<'a, S: Store + ?Sized> {
    store: &'a S,
}

impl<'a, S: Store + ?Sized> Decompressor<'a, S> {
    /// Create a decompressor reading from `store`
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Lazily reconstruct `device`'s stream, optionally limited to `range`
    pub fn reconstruct(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Reconstruction<'a, S>> {
        let records = self.store.records(device, range)?;
        Ok(Reconstruction::new(self.store, records, range))
    }

    /// Reconstruct into a vector, failing on the first error
    pub fn collect(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Vec<ReconstructedSample>> {
        self.reconstruct(device, range)?.collect()
    }
}

/// Lazy sequence of reconstructed samples
///
/// Yields samples in record order; after the first error it yields that
/// error once and then ends.
pub struct Reconstruction<'a, S: Store + ?Sized> {
    store: &'a S,
    records: std::vec::IntoIter<CompactRecord>,
    range: Option<TimeSpan>,
    templates: HashMap<(DeviceId, TemplateId), Template>,
    pending: VecDeque<ReconstructedSample>,
    done: bool,
}

impl<'a, S: Store + ?Sized> Reconstruction<'a, S> {
    /// Reconstruct a given record sequence, resolving templates from `store`
    pub fn new(store: &'a S, records: Vec<CompactRecord>, range: Option<TimeSpan>) -> Self {
        Self {
            store,
            records: records.into_iter(),
            range,
            templates: HashMap::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn template(&mut self, device: &DeviceId, id: TemplateId) -> Result<Option<&Template>> {
        let key = (device.clone(), id);
        if !self.templates.contains_key(&key) {
            match self.store.template(device, id)? {
                Some(t) => {
                    self.templates.insert(key.clone(), t);
                }
                None => return Ok(None),
            }
        }
        Ok(self.templates.get(&key))
    }

    fn expand(&mut self, record: CompactRecord) -> Result<()> {
        let template = match &record.kind {
            RecordKind::MatchedReference { template_id, .. } => {
                self.template(&record.device_id, *template_id)?
            }
            RecordKind::NewTemplate { .. } => None,
        };
        let values = record_values(&record, template)?;

        let len = values.len();
        for (i, value) in values.into_iter().enumerate() {
            let timestamp = record.span.spread(i, len);
            if self.range.map_or(true, |r| r.contains(timestamp)) {
                self.pending.push_back(ReconstructedSample {
                    device_id: record.device_id.clone(),
                    timestamp,
                    value,
                });
            }
        }
        Ok(())
    }
}

impl<S: Store + ?Sized> Iterator for Reconstruction<'_, S> {
    type Item = Result<ReconstructedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(sample) = self.pending.pop_front() {
                return Some(Ok(sample));
            }
            if self.done {
                return None;
            }
            let record = match self.records.next() {
                Some(r) => r,
                None => {
                    self.done = true;
                    return None;
                }
            };
            if let Err(e) = self.expand(record) {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

/// Write samples as a JSON array, one object per sample
///
/// Returns the number of samples written. Stops at the first
/// reconstruction error.
pub fn export_json<I, W>(samples: I, mut writer: W) -> Result<usize>
where
    I: IntoIterator<Item = Result<ReconstructedSample>>,
    W: Write,
{
    let export_err = |e: std::io::Error| TelepressError::Export(e.to_string());

    writer.write_all(b"[").map_err(export_err)?;
    let mut count = 0;
    for sample in samples {
        let sample = sample?;
        if count > 0 {
            writer.write_all(b",").map_err(export_err)?;
        }
        serde_json::to_writer(&mut writer, &sample)
            .map_err(|e| TelepressError::Export(e.to_string()))?;
        count += 1;
    }
    writer.write_all(b"]").map_err(export_err)?;
    writer.flush().map_err(export_err)?;
    Ok(count)
}
