// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Synchronous multi-device engine
//!
//! Routes samples to one [`DeviceCompressor`] per device (resumed from the
//! store on first sight) and persists every emission before returning.
//!
//! Writes that still fail after retrying stay queued and are attempted
//! again before any new write, so a record is never lost between calls.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::compressor::{DeviceCompressor, Emission, PushOutcome};
use crate::config::ConfigSet;
use crate::error::Result;
use crate::metrics::CompressionMetrics;
use crate::recovery::{apply_with_retry, RetryStrategy};
use crate::sample::{DeviceId, Sample};
use crate::store::{Store, StoreOp};

/// Compression engine over a store
pub struct Engine<S: Store> {
    store: S,
    configs: ConfigSet,
    retry: RetryStrategy,
    compressors: HashMap<DeviceId, DeviceCompressor>,
    pending: Vec<StoreOp>,
}

impl<S: Store> Engine<S> {
    /// Create an engine; fails on an invalid configuration
    pub fn new(store: S, configs: ConfigSet) -> Result<Self> {
        configs.validate()?;
        Ok(Self {
            store,
            configs,
            retry: RetryStrategy::persistence(),
            compressors: HashMap::new(),
            pending: Vec::new(),
        })
    }

    /// Use a different retry strategy for persistence
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// Compress one sample and persist whatever it produced
    pub fn push(&mut self, sample: Sample) -> Result<PushOutcome> {
        let outcome = self.compressor(&sample.device_id)?.push(sample)?;
        self.persist(&outcome.emissions)?;
        Ok(outcome)
    }

    /// Compress a batch of samples
    pub fn push_all<I>(&mut self, samples: I) -> Result<Vec<Emission>>
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut emissions = Vec::new();
        for sample in samples {
            emissions.extend(self.push(sample)?.emissions);
        }
        Ok(emissions)
    }

    /// Emit the trailing window of one device
    pub fn flush_device(&mut self, device: &DeviceId) -> Result<Option<Emission>> {
        let emission = match self.compressors.get_mut(device) {
            Some(c) => c.flush()?,
            None => None,
        };
        if let Some(e) = &emission {
            self.persist(std::slice::from_ref(e))?;
        }
        Ok(emission)
    }

    /// Flush every device and return the aggregated statistics
    pub fn finish(&mut self) -> Result<CompressionMetrics> {
        let mut devices: Vec<DeviceId> = self.compressors.keys().cloned().collect();
        devices.sort();
        for device in &devices {
            self.flush_device(device)?;
        }
        self.retry_pending()?;
        let metrics = self.metrics();
        log::info!(
            "engine finished: {} devices, {} windows, ratio {:.2}x",
            devices.len(),
            metrics.windows,
            metrics.compression_ratio()
        );
        Ok(metrics)
    }

    /// Aggregated statistics across devices
    pub fn metrics(&self) -> CompressionMetrics {
        let mut total = CompressionMetrics::new();
        for c in self.compressors.values() {
            total.merge(c.metrics());
        }
        total
    }

    /// Compressor of a device, if it has been seen
    pub fn device(&self, device: &DeviceId) -> Option<&DeviceCompressor> {
        self.compressors.get(device)
    }

    /// Devices seen by this engine
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.compressors.keys()
    }

    /// Writes waiting for the store to come back
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release the backing store
    pub fn into_store(self) -> S {
        self.store
    }

    fn compressor(&mut self, device: &DeviceId) -> Result<&mut DeviceCompressor> {
        match self.compressors.entry(device.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let config = self.configs.for_device(device).clone();
                let compressor = DeviceCompressor::resume(device.clone(), config, &self.store)?;
                Ok(entry.insert(compressor))
            }
        }
    }

    fn persist(&mut self, emissions: &[Emission]) -> Result<()> {
        for emission in emissions {
            self.pending.extend(emission.store_ops());
        }
        self.retry_pending()
    }

    fn retry_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        apply_with_retry(&self.store, &self.pending, &self.retry)?;
        self.pending.clear();
        Ok(())
    }
}
