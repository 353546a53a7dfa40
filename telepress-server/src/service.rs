// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Concurrent ingest service.
//!
//! Every device gets its own tokio task fed through a bounded mailbox, so
//! a device's windowing and dictionary decisions are serialized while
//! devices run in parallel. Emissions are queued as op batches on a single
//! bounded write queue drained by one writer task. A full queue makes the
//! device task wait, and a full mailbox makes [`Service::ingest`] wait, so
//! backpressure reaches the producer and no record is dropped.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use telepress::{
    CompressionMetrics, ConfigSet, DeviceCompressor, DeviceId, Emission, RetryStrategy, Sample,
    Store, StoreOp,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::metrics;

/// Service tuning.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Samples buffered per device before `ingest` waits
    pub mailbox_capacity: usize,
    /// Op batches buffered before device tasks wait
    pub write_queue_capacity: usize,
    /// Backoff for transient store failures
    pub retry: RetryStrategy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            write_queue_capacity: 256,
            retry: RetryStrategy::persistence(),
        }
    }
}

/// Statistics returned by [`Service::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Aggregated over all devices
    pub metrics: CompressionMetrics,
    /// Per device
    pub per_device: BTreeMap<DeviceId, CompressionMetrics>,
    /// Op batches written by the writer task
    pub batches_written: u64,
}

enum Command {
    Sample(Sample),
    Cancel,
}

struct DeviceHandle {
    mailbox: mpsc::Sender<Command>,
    task: JoinHandle<Result<CompressionMetrics, ServerError>>,
}

type WriteQueue = mpsc::Sender<Vec<StoreOp>>;

/// Multi-device compression service over a shared store.
pub struct Service<S: Store + 'static> {
    store: Arc<S>,
    configs: ConfigSet,
    settings: ServiceConfig,
    devices: HashMap<DeviceId, DeviceHandle>,
    writer: WriteQueue,
    writer_task: JoinHandle<Result<u64, ServerError>>,
}

impl<S: Store + 'static> Service<S> {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn start(
        store: Arc<S>,
        configs: ConfigSet,
        settings: ServiceConfig,
    ) -> Result<Self, ServerError> {
        configs.validate()?;
        let (writer, queue) = mpsc::channel(settings.write_queue_capacity.max(1));
        let writer_task = tokio::spawn(run_writer(
            Arc::clone(&store),
            queue,
            settings.retry.clone(),
        ));
        info!(
            "Service started: mailbox {}, write queue {}",
            settings.mailbox_capacity, settings.write_queue_capacity
        );

        Ok(Self {
            store,
            configs,
            settings,
            devices: HashMap::new(),
            writer,
            writer_task,
        })
    }

    /// Route one sample to its device task, waiting if the mailbox is full.
    ///
    /// A device seen for the first time is resumed from the store.
    pub async fn ingest(&mut self, sample: Sample) -> Result<(), ServerError> {
        let device = sample.device_id.clone();
        let mailbox = self.mailbox(&device)?;
        if mailbox.send(Command::Sample(sample)).await.is_err() {
            return Err(self.device_failure(&device).await);
        }
        Ok(())
    }

    /// Route a batch of samples; returns how many were routed.
    pub async fn ingest_all<I>(&mut self, samples: I) -> Result<usize, ServerError>
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut count = 0;
        for sample in samples {
            self.ingest(sample).await?;
            count += 1;
        }
        Ok(count)
    }

    /// Devices with a running task.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Flush every device, drain the write queue and report.
    pub async fn shutdown(self) -> Result<ShutdownReport, ServerError> {
        self.stop(false).await
    }

    /// Stop every device without flushing partial windows.
    ///
    /// Buffered samples of an incomplete window are discarded. Records
    /// already emitted are still written.
    pub async fn cancel(self) -> Result<ShutdownReport, ServerError> {
        self.stop(true).await
    }

    fn mailbox(&mut self, device: &DeviceId) -> Result<&mpsc::Sender<Command>, ServerError> {
        match self.devices.entry(device.clone()) {
            Entry::Occupied(entry) => Ok(&entry.into_mut().mailbox),
            Entry::Vacant(entry) => {
                let config = self.configs.for_device(device).clone();
                let compressor =
                    DeviceCompressor::resume(device.clone(), config, self.store.as_ref())?;
                let (mailbox, inbox) = mpsc::channel(self.settings.mailbox_capacity.max(1));
                let task = tokio::spawn(run_device(compressor, inbox, self.writer.clone()));
                metrics::ACTIVE_DEVICES.inc();
                debug!(%device, "device task spawned");
                Ok(&entry.insert(DeviceHandle { mailbox, task }).mailbox)
            }
        }
    }

    async fn device_failure(&mut self, device: &DeviceId) -> ServerError {
        let Some(handle) = self.devices.remove(device) else {
            return ServerError::ChannelClosed("device mailbox");
        };
        match handle.task.await {
            Ok(Err(e)) => e,
            Ok(Ok(_)) => ServerError::ChannelClosed("device mailbox"),
            Err(e) => e.into(),
        }
    }

    async fn stop(self, cancel: bool) -> Result<ShutdownReport, ServerError> {
        let Service {
            devices,
            writer,
            writer_task,
            ..
        } = self;

        let mut tasks = Vec::with_capacity(devices.len());
        for (device, handle) in devices {
            if cancel && handle.mailbox.send(Command::Cancel).await.is_err() {
                debug!(%device, "device task already stopped");
            }
            tasks.push((device, handle.task));
        }

        let mut report = ShutdownReport::default();
        let mut first_error = None;
        for (device, task) in tasks {
            match task.await {
                Ok(Ok(device_metrics)) => {
                    report.metrics.merge(&device_metrics);
                    report.per_device.insert(device, device_metrics);
                }
                Ok(Err(e)) => {
                    error!(%device, "device task failed: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(e.into());
                }
            }
        }

        // Last sender: the writer drains what is queued and exits
        drop(writer);
        report.batches_written = writer_task.await??;
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            "Service stopped: {} devices, {} windows, {} batches, ratio {:.2}x",
            report.per_device.len(),
            report.metrics.windows,
            report.batches_written,
            report.metrics.compression_ratio()
        );
        Ok(report)
    }
}

async fn run_device(
    compressor: DeviceCompressor,
    inbox: mpsc::Receiver<Command>,
    writer: WriteQueue,
) -> Result<CompressionMetrics, ServerError> {
    let result = drive_device(compressor, inbox, writer).await;
    metrics::ACTIVE_DEVICES.dec();
    result
}

async fn drive_device(
    mut compressor: DeviceCompressor,
    mut inbox: mpsc::Receiver<Command>,
    writer: WriteQueue,
) -> Result<CompressionMetrics, ServerError> {
    while let Some(command) = inbox.recv().await {
        match command {
            Command::Sample(sample) => {
                let outcome = compressor.push(sample)?;
                if outcome.rejected.is_some() {
                    metrics::record_invalid(compressor.device_id());
                }
                forward(&compressor, outcome.emissions, &writer).await?;
            }
            Command::Cancel => {
                let dropped = compressor.discard();
                debug!(device = %compressor.device_id(), dropped, "device cancelled");
                return Ok(compressor.metrics().clone());
            }
        }
    }

    // Mailbox closed: emit the trailing window
    if let Some(emission) = compressor.flush()? {
        forward(&compressor, vec![emission], &writer).await?;
    }
    Ok(compressor.metrics().clone())
}

async fn forward(
    compressor: &DeviceCompressor,
    emissions: Vec<Emission>,
    writer: &WriteQueue,
) -> Result<(), ServerError> {
    for emission in emissions {
        metrics::record_emission(&emission, compressor.match_rate());
        writer
            .send(emission.store_ops())
            .await
            .map_err(|_| ServerError::ChannelClosed("write queue"))?;
    }
    Ok(())
}

async fn run_writer<S: Store>(
    store: Arc<S>,
    mut queue: mpsc::Receiver<Vec<StoreOp>>,
    retry: RetryStrategy,
) -> Result<u64, ServerError> {
    let mut batches = 0;
    while let Some(ops) = queue.recv().await {
        write_with_backoff(store.as_ref(), &ops, &retry).await?;
        batches += 1;
        metrics::PERSISTED_BATCHES_TOTAL.inc();
    }
    Ok(batches)
}

/// Apply a batch, sleeping between attempts while the store is unavailable.
pub async fn write_with_backoff<S: Store + ?Sized>(
    store: &S,
    ops: &[StoreOp],
    retry: &RetryStrategy,
) -> Result<(), ServerError> {
    let mut attempt = 0;
    loop {
        match store.apply(ops) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => match retry.delay_for_attempt(attempt) {
                Some(delay) => {
                    warn!(attempt = attempt + 1, ?delay, "store unavailable: {}", e);
                    metrics::PERSIST_RETRIES_TOTAL.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    error!(ops = ops.len(), "giving up after {} retries: {}", attempt, e);
                    return Err(e.into());
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
}
