// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! CSV ingest.
//!
//! Two layouts are accepted:
//!
//! - long: header `device_id,timestamp,value`, one reading per row
//! - wide: header `timestamp_ms,<device>,<device>...`, one column per device
//!
//! Timestamps are integer milliseconds or RFC 3339. A value that does not
//! parse (or an empty cell) becomes a NaN sample, which the compressor
//! rejects as an invalid sample and treats as a stream discontinuity.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;

use chrono::DateTime;
use telepress::{DeviceId, Sample};
use tracing::{debug, info};

use crate::error::ServerError;

/// Samples read from a CSV file.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    /// Samples in file order
    pub samples: Vec<Sample>,
    /// Devices seen, sorted
    pub devices: Vec<DeviceId>,
    /// Rows whose value could not be parsed
    pub unparsable: usize,
}

/// Dataset summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub device_count: usize,
    pub sample_count: usize,
    pub duration_ms: u64,
}

impl Dataset {
    /// Summarize the dataset.
    pub fn info(&self) -> DatasetInfo {
        let first = self.samples.iter().map(|s| s.timestamp).min().unwrap_or(0);
        let last = self.samples.iter().map(|s| s.timestamp).max().unwrap_or(0);
        DatasetInfo {
            device_count: self.devices.len(),
            sample_count: self.samples.len(),
            duration_ms: last - first,
        }
    }
}

/// Read a CSV file from disk.
pub fn read_csv(path: &Path) -> Result<Dataset, ServerError> {
    if !path.exists() {
        return Err(ServerError::FileNotFound(path.display().to_string()));
    }
    let dataset = read_csv_from(std::fs::File::open(path)?)?;
    let info = dataset.info();
    info!(
        "Loaded {}: {} devices, {} samples, {}ms",
        path.display(),
        info.device_count,
        info.sample_count,
        info.duration_ms
    );
    Ok(dataset)
}

/// Read CSV from any reader.
pub fn read_csv_from<R: io::Read>(reader: R) -> Result<Dataset, ServerError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = reader.headers()?.clone();
    let header: Vec<&str> = headers.iter().collect();

    let dataset = match header.as_slice() {
        ["device_id", "timestamp", "value"] => read_long(&mut reader)?,
        ["timestamp_ms", devices @ ..] if !devices.is_empty() => {
            let devices: Vec<DeviceId> = devices.iter().map(|d| DeviceId::new(*d)).collect();
            read_wide(&mut reader, &devices)?
        }
        _ => {
            return Err(ServerError::InvalidFormat {
                line: 1,
                reason: "expected 'device_id,timestamp,value' or 'timestamp_ms,<devices>'"
                    .to_string(),
            })
        }
    };

    if dataset.samples.is_empty() {
        return Err(ServerError::EmptyDataset);
    }
    if dataset.unparsable > 0 {
        debug!("{} unparsable values kept as invalid samples", dataset.unparsable);
    }
    Ok(dataset)
}

fn read_long<R: io::Read>(reader: &mut csv::Reader<R>) -> Result<Dataset, ServerError> {
    let mut dataset = Dataset::default();
    let mut devices = BTreeSet::new();

    for result in reader.records() {
        let record = result?;
        let line = line_of(&record);
        let (Some(device), Some(timestamp), Some(value)) =
            (record.get(0), record.get(1), record.get(2))
        else {
            return Err(ServerError::InvalidFormat {
                line,
                reason: "expected 3 fields".to_string(),
            });
        };
        if device.is_empty() {
            return Err(ServerError::InvalidFormat {
                line,
                reason: "empty device_id".to_string(),
            });
        }

        let device = DeviceId::new(device);
        let timestamp = parse_timestamp(timestamp, line)?;
        let value = parse_value(value, &mut dataset.unparsable);
        devices.insert(device.clone());
        dataset.samples.push(Sample::new(device, timestamp, value));
    }

    dataset.devices = devices.into_iter().collect();
    Ok(dataset)
}

fn read_wide<R: io::Read>(
    reader: &mut csv::Reader<R>,
    devices: &[DeviceId],
) -> Result<Dataset, ServerError> {
    let mut dataset = Dataset {
        devices: devices.to_vec(),
        ..Default::default()
    };
    dataset.devices.sort();
    dataset.devices.dedup();

    for result in reader.records() {
        let record = result?;
        let line = line_of(&record);
        let Some(timestamp) = record.get(0) else {
            continue;
        };
        let timestamp = parse_timestamp(timestamp, line)?;
        for (i, device) in devices.iter().enumerate() {
            let value = parse_value(record.get(i + 1).unwrap_or(""), &mut dataset.unparsable);
            dataset
                .samples
                .push(Sample::new(device.clone(), timestamp, value));
        }
    }
    Ok(dataset)
}

fn line_of(record: &csv::StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

/// Integer milliseconds or an RFC 3339 date.
pub fn parse_timestamp(field: &str, line: u64) -> Result<u64, ServerError> {
    if let Ok(ms) = field.parse::<u64>() {
        return Ok(ms);
    }
    let parsed = DateTime::parse_from_rfc3339(field).map_err(|e| ServerError::InvalidFormat {
        line,
        reason: format!("invalid timestamp '{}': {}", field, e),
    })?;
    u64::try_from(parsed.timestamp_millis()).map_err(|_| ServerError::InvalidFormat {
        line,
        reason: format!("timestamp '{}' is before the epoch", field),
    })
}

fn parse_value(field: &str, unparsable: &mut usize) -> f64 {
    match field.parse::<f64>() {
        Ok(v) => v,
        Err(_) => {
            *unparsable += 1;
            f64::NAN
        }
    }
}
