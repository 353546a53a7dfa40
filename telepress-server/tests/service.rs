//! Service against flaky stores, restarts and CSV datasets

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use telepress::{
    CodecConfig, CompactRecord, ConfigSet, Decompressor, DeviceId, MemoryStore, RetryStrategy,
    Sample, Store, StoreError, StoreOp, Template, TemplateId, TimeSpan,
};
use telepress_server::{read_csv_from, ServerError, Service, ServiceConfig};

/// Store that rejects writes while `outage` is non-zero
struct FlakyStore {
    outage: AtomicU32,
    inner: MemoryStore,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            outage: AtomicU32::new(failures),
            inner: MemoryStore::new(),
        }
    }
}

impl Store for FlakyStore {
    fn apply(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let remaining = self.outage.load(Ordering::SeqCst);
        if remaining > 0 {
            self.outage.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::PersistenceUnavailable {
                reason: "backend restarting".to_string(),
            });
        }
        self.inner.apply(ops)
    }

    fn template(&self, device: &DeviceId, id: TemplateId) -> Result<Option<Template>, StoreError> {
        self.inner.template(device, id)
    }

    fn templates(&self, device: &DeviceId, active_only: bool) -> Result<Vec<Template>, StoreError> {
        self.inner.templates(device, active_only)
    }

    fn records(
        &self,
        device: &DeviceId,
        range: Option<TimeSpan>,
    ) -> Result<Vec<CompactRecord>, StoreError> {
        self.inner.records(device, range)
    }

    fn last_record(&self, device: &DeviceId) -> Result<Option<CompactRecord>, StoreError> {
        self.inner.last_record(device)
    }

    fn threshold(&self, device: &DeviceId) -> Result<Option<f64>, StoreError> {
        self.inner.threshold(device)
    }

    fn devices(&self) -> Result<Vec<DeviceId>, StoreError> {
        self.inner.devices()
    }
}

fn configs() -> ConfigSet {
    ConfigSet::new(CodecConfig::with_window(4, 3))
}

fn settings(retry: RetryStrategy) -> ServiceConfig {
    ServiceConfig {
        mailbox_capacity: 4,
        write_queue_capacity: 2,
        retry,
    }
}

fn wave(device: &str, from: u64, to: u64) -> Vec<Sample> {
    (from..to)
        .map(|i| Sample::new(device, i * 100, (i as f64 * 0.5).sin() * 10.0))
        .collect()
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(5));
    let retry = RetryStrategy::fixed(10, Duration::from_millis(1));
    let mut service = Service::start(Arc::clone(&store), configs(), settings(retry)).unwrap();

    service.ingest_all(wave("d1", 0, 40)).await.unwrap();
    service.ingest_all(wave("d2", 0, 40)).await.unwrap();
    let report = service.shutdown().await.unwrap();

    assert_eq!(report.batches_written, 20);
    assert_eq!(store.inner.record_count(), 20);
    for device in ["d1", "d2"] {
        let samples = Decompressor::new(store.as_ref())
            .collect(&device.into(), None)
            .unwrap();
        assert_eq!(samples.len(), 40);
    }
}

#[tokio::test]
async fn exhausted_retries_surface_at_shutdown() {
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let retry = RetryStrategy::fixed(2, Duration::from_millis(1));
    let mut service = Service::start(Arc::clone(&store), configs(), settings(retry)).unwrap();

    // The first batch fails; later sends may already see a closed queue
    let _ = service.ingest_all(wave("d1", 0, 40)).await;
    let result = service.shutdown().await;

    assert!(matches!(
        result,
        Err(ServerError::Store(StoreError::PersistenceUnavailable { .. }))
    ));
    assert_eq!(store.inner.record_count(), 0);
}

#[tokio::test]
async fn restarted_service_continues_the_archive() {
    let store = Arc::new(MemoryStore::new());

    let mut first =
        Service::start(Arc::clone(&store), configs(), ServiceConfig::default()).unwrap();
    first.ingest_all(wave("d1", 0, 16)).await.unwrap();
    first.shutdown().await.unwrap();

    let mut second =
        Service::start(Arc::clone(&store), configs(), ServiceConfig::default()).unwrap();
    second.ingest_all(wave("d1", 16, 32)).await.unwrap();
    let report = second.shutdown().await.unwrap();
    assert_eq!(report.metrics.samples, 16);

    let seqs: Vec<u64> = store
        .records(&"d1".into(), None)
        .unwrap()
        .iter()
        .map(|r| r.seq)
        .collect();
    assert_eq!(seqs, (0..8).collect::<Vec<u64>>());

    let samples = Decompressor::new(store.as_ref())
        .collect(&"d1".into(), None)
        .unwrap();
    assert_eq!(samples.len(), 32);
    assert_eq!(samples.last().map(|s| s.timestamp), Some(3_100));
}

#[tokio::test]
async fn csv_dataset_through_the_service() {
    let mut csv = String::from("device_id,timestamp,value\n");
    for i in 0..30u64 {
        csv.push_str(&format!("pump,{},{}\n", i * 1000, 4.0 + (i % 3) as f64));
        csv.push_str(&format!("valve,{},{}\n", i * 1000, if i == 10 { "err" } else { "1.5" }));
    }
    let dataset = read_csv_from(csv.as_bytes()).unwrap();
    assert_eq!(dataset.devices.len(), 2);

    let store = Arc::new(MemoryStore::new());
    let mut service =
        Service::start(Arc::clone(&store), configs(), ServiceConfig::default()).unwrap();
    service.ingest_all(dataset.samples).await.unwrap();
    let report = service.shutdown().await.unwrap();

    let valve = &report.per_device[&DeviceId::new("valve")];
    assert_eq!(valve.invalid_samples, 1);
    assert_eq!(valve.samples, 29);

    let pump = Decompressor::new(store.as_ref())
        .collect(&"pump".into(), None)
        .unwrap();
    assert_eq!(pump.len(), 30);
}
