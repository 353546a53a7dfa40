// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Persistence adapter
//!
//! Two logical collections: templates keyed by (device, template id) and
//! records ordered by (device, time). Evicted templates stay readable so
//! that every record remains reconstructible.
//!
//! # Snapshot format
//!
//! [`MemoryStore`] can be saved to a little-endian snapshot file:
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Magic "TPLZ"        (4 bytes) │
//! │ Format version      (4 bytes) │
//! │ Body length         (8 bytes) │
//! │ CRC32 of body       (4 bytes) │
//! ├──────────────────────────────┤
//! │ JSON body                     │
//! └──────────────────────────────┘
//! ```

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::StoreError;
use crate::record::{CompactRecord, Template};
use crate::sample::{DeviceId, TemplateId, TimeSpan};

/// Magic bytes for snapshot files
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"TPLZ";

/// Current snapshot format version
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Snapshot header size in bytes
pub const SNAPSHOT_HEADER_SIZE: usize = 20;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A single write against the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert or update a template (usage statistics included)
    PutTemplate(Template),
    /// Remove a template from active matching; it stays readable
    MarkEvicted {
        device_id: DeviceId,
        template_id: TemplateId,
    },
    /// Append a compact record (idempotent on `seq`)
    AppendRecord(CompactRecord),
    /// Persist the current threshold of a device
    PutThreshold { device_id: DeviceId, tau: f64 },
}

/// Durable storage for templates, records and thresholds
///
/// Batches passed to [`Store::apply`] must be applied in order; a batch that
/// fails with [`StoreError::PersistenceUnavailable`] may be retried as a
/// whole.
pub trait Store: Send + Sync {
    /// Apply a batch of writes in order
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError>;

    /// Point lookup of a template, evicted or not
    fn template(&self, device: &DeviceId, id: TemplateId) -> Result<Option<Template>, StoreError>;

    /// Templates of a device in id order
    fn templates(&self, device: &DeviceId, active_only: bool) -> Result<Vec<Template>, StoreError>;

    /// Records of a device in sequence order, optionally limited to those
    /// overlapping `range`
    fn records(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Vec<CompactRecord>, StoreError>;

    /// Newest record of a device
    ///
    /// The default reads every record; backends should override it with a
    /// point read.
    fn last_record(&self, device: &DeviceId) -> Result<Option<CompactRecord>, StoreError> {
        Ok(self.records(device, None)?.pop())
    }

    /// Last persisted threshold of a device
    fn threshold(&self, device: &DeviceId) -> Result<Option<f64>, StoreError>;

    /// Every device with stored data
    fn devices(&self) -> Result<Vec<DeviceId>, StoreError>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        (**self).apply(ops)
    }

    fn template(&self, device: &DeviceId, id: TemplateId) -> Result<Option<Template>, StoreError> {
        (**self).template(device, id)
    }

    fn templates(&self, device: &DeviceId, active_only: bool) -> Result<Vec<Template>, StoreError> {
        (**self).templates(device, active_only)
    }

    fn records(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Vec<CompactRecord>, StoreError> {
        (**self).records(device, range)
    }

    fn last_record(&self, device: &DeviceId) -> Result<Option<CompactRecord>, StoreError> {
        (**self).last_record(device)
    }

    fn threshold(&self, device: &DeviceId) -> Result<Option<f64>, StoreError> {
        (**self).threshold(device)
    }

    fn devices(&self) -> Result<Vec<DeviceId>, StoreError> {
        (**self).devices()
    }
}

/// Template as persisted, with its eviction flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTemplate {
    /// The template
    pub template: Template,
    /// Whether it has been removed from active matching
    pub evicted: bool,
}

#[derive(Debug, Clone, Default)]
struct DeviceTables {
    templates: BTreeMap<TemplateId, StoredTemplate>,
    records: BTreeMap<u64, CompactRecord>,
    threshold: Option<f64>,
}

/// Flat serializable form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotBody {
    templates: Vec<StoredTemplate>,
    records: Vec<CompactRecord>,
    thresholds: Vec<(DeviceId, f64)>,
}

/// Ordered in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<DeviceId, DeviceTables>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across devices
    pub fn record_count(&self) -> usize {
        self.read()
            .map(|t| t.values().map(|d| d.records.len()).sum())
            .unwrap_or(0)
    }

    /// Total number of templates (active and evicted) across devices
    pub fn template_count(&self) -> usize {
        self.read()
            .map(|t| t.values().map(|d| d.templates.len()).sum())
            .unwrap_or(0)
    }

    /// Serialize into snapshot bytes
    pub fn to_snapshot_bytes(&self) -> Result<Vec<u8>, StoreError> {
        let body = {
            let tables = self.read()?;
            let mut snapshot = SnapshotBody::default();
            for (device, t) in tables.iter() {
                snapshot.templates.extend(t.templates.values().cloned());
                snapshot.records.extend(t.records.values().cloned());
                if let Some(tau) = t.threshold {
                    snapshot.thresholds.push((device.clone(), tau));
                }
            }
            serde_json::to_vec(&snapshot).map_err(|e| StoreError::Corrupt {
                reason: e.to_string(),
            })?
        };

        let mut bytes = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + body.len());
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(body.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&CRC32.checksum(&body).to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Rebuild a store from snapshot bytes
    pub fn from_snapshot_bytes(data: &[u8]) -> Result<Self, StoreError> {
        if data.len() < SNAPSHOT_HEADER_SIZE {
            return Err(corrupt(format!(
                "snapshot too short: {} bytes",
                data.len()
            )));
        }
        if data[0..4] != SNAPSHOT_MAGIC {
            return Err(corrupt("invalid magic bytes".to_string()));
        }

        let version = u32::from_le_bytes(le_array(&data[4..8]));
        if version != SNAPSHOT_FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let body_len = u64::from_le_bytes(le_array(&data[8..16])) as usize;
        let stored_crc = u32::from_le_bytes(le_array(&data[16..20]));

        let body = &data[SNAPSHOT_HEADER_SIZE..];
        if body.len() != body_len {
            return Err(corrupt(format!(
                "body length {} does not match header {}",
                body.len(),
                body_len
            )));
        }
        let computed_crc = CRC32.checksum(body);
        if computed_crc != stored_crc {
            return Err(corrupt(format!(
                "checksum mismatch: expected {:08x}, got {:08x}",
                stored_crc, computed_crc
            )));
        }

        let snapshot: SnapshotBody =
            serde_json::from_slice(body).map_err(|e| corrupt(e.to_string()))?;

        let mut tables: BTreeMap<DeviceId, DeviceTables> = BTreeMap::new();
        for stored in snapshot.templates {
            tables
                .entry(stored.template.device_id.clone())
                .or_default()
                .templates
                .insert(stored.template.id, stored);
        }
        for record in snapshot.records {
            tables
                .entry(record.device_id.clone())
                .or_default()
                .records
                .insert(record.seq, record);
        }
        for (device, tau) in snapshot.thresholds {
            tables.entry(device).or_default().threshold = Some(tau);
        }

        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Write a snapshot file (via a temporary file and rename)
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = self.to_snapshot_bytes()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        log::debug!("snapshot saved to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Load a snapshot file
    pub fn load_snapshot(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path)?;
        Self::from_snapshot_bytes(&bytes)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<DeviceId, DeviceTables>>, StoreError> {
        self.tables.read().map_err(|_| StoreError::PersistenceUnavailable {
            reason: "store lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<DeviceId, DeviceTables>>, StoreError> {
        self.tables.write().map_err(|_| StoreError::PersistenceUnavailable {
            reason: "store lock poisoned".to_string(),
        })
    }
}

impl Store for MemoryStore {
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        for op in ops {
            match op {
                StoreOp::PutTemplate(template) => {
                    let device = tables.entry(template.device_id.clone()).or_default();
                    let evicted = device
                        .templates
                        .get(&template.id)
                        .map_or(false, |t| t.evicted);
                    device.templates.insert(
                        template.id,
                        StoredTemplate {
                            template: template.clone(),
                            evicted,
                        },
                    );
                }
                StoreOp::MarkEvicted {
                    device_id,
                    template_id,
                } => {
                    if let Some(t) = tables
                        .get_mut(device_id)
                        .and_then(|d| d.templates.get_mut(template_id))
                    {
                        t.evicted = true;
                    }
                }
                StoreOp::AppendRecord(record) => {
                    tables
                        .entry(record.device_id.clone())
                        .or_default()
                        .records
                        .insert(record.seq, record.clone());
                }
                StoreOp::PutThreshold { device_id, tau } => {
                    tables.entry(device_id.clone()).or_default().threshold = Some(*tau);
                }
            }
        }
        Ok(())
    }

    fn template(&self, device: &DeviceId, id: TemplateId) -> Result<Option<Template>, StoreError> {
        Ok(self
            .read()?
            .get(device)
            .and_then(|d| d.templates.get(&id))
            .map(|t| t.template.clone()))
    }

    fn templates(&self, device: &DeviceId, active_only: bool) -> Result<Vec<Template>, StoreError> {
        Ok(self
            .read()?
            .get(device)
            .map(|d| {
                d.templates
                    .values()
                    .filter(|t| !(active_only && t.evicted))
                    .map(|t| t.template.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn records(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Vec<CompactRecord>, StoreError> {
        let tables = self.read()?;
        let Some(d) = tables.get(device) else {
            return Ok(Vec::new());
        };
        let records = match range {
            None => d.records.values().cloned().collect(),
            // Spans grow with seq, so the scan stops at the first record past the range
            Some(range) => d
                .records
                .values()
                .skip_while(|r| r.span.end < range.start)
                .take_while(|r| r.span.start <= range.end)
                .filter(|r| r.span.overlaps(&range))
                .cloned()
                .collect(),
        };
        Ok(records)
    }

    fn last_record(&self, device: &DeviceId) -> Result<Option<CompactRecord>, StoreError> {
        Ok(self
            .read()?
            .get(device)
            .and_then(|d| d.records.values().next_back().cloned()))
    }

    fn threshold(&self, device: &DeviceId) -> Result<Option<f64>, StoreError> {
        Ok(self.read()?.get(device).and_then(|d| d.threshold))
    }

    fn devices(&self) -> Result<Vec<DeviceId>, StoreError> {
        Ok(self.read()?.keys().cloned().collect())
    }
}

fn corrupt(reason: String) -> StoreError {
    StoreError::Corrupt { reason }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::sample::Window;
    use tempfile::tempdir;

    fn device() -> DeviceId {
        DeviceId::from("d1")
    }

    fn template(id: TemplateId) -> Template {
        Template::new(id, device(), Window::new(vec![id as f64; 4]), id as u64)
    }

    fn record(seq: u64, start: u64) -> CompactRecord {
        CompactRecord {
            device_id: device(),
            seq,
            span: TimeSpan::new(start, start + 3),
            len: 4,
            kind: RecordKind::MatchedReference {
                template_id: 0,
                residual: None,
            },
        }
    }

    fn populated() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .apply(&[
                StoreOp::PutTemplate(template(0)),
                StoreOp::PutTemplate(template(1)),
                StoreOp::MarkEvicted {
                    device_id: device(),
                    template_id: 0,
                },
                StoreOp::AppendRecord(record(0, 0)),
                StoreOp::AppendRecord(record(1, 4)),
                StoreOp::AppendRecord(record(2, 8)),
                StoreOp::PutThreshold {
                    device_id: device(),
                    tau: 0.25,
                },
            ])
            .unwrap();
        store
    }

    #[test]
    fn test_evicted_templates_stay_readable() {
        let store = populated();
        assert!(store.template(&device(), 0).unwrap().is_some());
        assert_eq!(store.templates(&device(), false).unwrap().len(), 2);
        let active = store.templates(&device(), true).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);

        // Re-putting an evicted template does not revive it
        store.apply(&[StoreOp::PutTemplate(template(0))]).unwrap();
        assert_eq!(store.templates(&device(), true).unwrap().len(), 1);
    }

    #[test]
    fn test_record_range_scan() {
        let store = populated();
        assert_eq!(store.records(&device(), None).unwrap().len(), 3);

        let hits = store.records(&device(), Some(TimeSpan::new(5, 8))).unwrap();
        let seqs: Vec<u64> = hits.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);

        assert!(store
            .records(&device(), Some(TimeSpan::new(100, 200)))
            .unwrap()
            .is_empty());
        assert!(store
            .records(&DeviceId::from("unknown"), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_last_record() {
        let store = populated();
        let last = store.last_record(&device()).unwrap().unwrap();
        assert_eq!(last.seq, 2);
        assert_eq!(
            Arc::new(store).last_record(&device()).unwrap().map(|r| r.seq),
            Some(2)
        );
        assert_eq!(MemoryStore::new().last_record(&device()).unwrap(), None);
    }

    #[test]
    fn test_append_is_idempotent() {
        let store = populated();
        store.apply(&[StoreOp::AppendRecord(record(1, 4))]).unwrap();
        assert_eq!(store.record_count(), 3);
    }

    #[test]
    fn test_threshold_and_devices() {
        let store = populated();
        assert_eq!(store.threshold(&device()).unwrap(), Some(0.25));
        assert_eq!(store.devices().unwrap(), vec![device()]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.tplz");

        let store = populated();
        store.save_snapshot(&path).unwrap();
        let loaded = MemoryStore::load_snapshot(&path).unwrap();

        assert_eq!(loaded.record_count(), 3);
        assert_eq!(loaded.template_count(), 2);
        assert_eq!(loaded.templates(&device(), true).unwrap().len(), 1);
        assert_eq!(loaded.threshold(&device()).unwrap(), Some(0.25));
        assert_eq!(
            loaded.records(&device(), None).unwrap(),
            store.records(&device(), None).unwrap()
        );
    }

    #[test]
    fn test_snapshot_rejects_corruption() {
        let mut bytes = populated().to_snapshot_bytes().unwrap();
        let last = bytes.len() - 2;
        bytes[last] ^= 0xFF;
        let err = MemoryStore::from_snapshot_bytes(&bytes).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let mut bad_magic = populated().to_snapshot_bytes().unwrap();
        bad_magic[0] = b'X';
        assert!(MemoryStore::from_snapshot_bytes(&bad_magic).is_err());

        assert!(MemoryStore::from_snapshot_bytes(&[0u8; 4]).is_err());
    }
}
