//! End-to-end properties of the compress/reconstruct cycle

use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use telepress::decompressor::record_values;
use telepress::*;

fn compress(
    compressor: &mut DeviceCompressor,
    store: &MemoryStore,
    samples: &[Sample],
) -> Vec<Emission> {
    let mut emissions = Vec::new();
    for sample in samples {
        emissions.extend(compressor.push(sample.clone()).unwrap().emissions);
    }
    emissions.extend(compressor.flush().unwrap());
    for emission in &emissions {
        store.apply(&emission.store_ops()).unwrap();
    }
    emissions
}

fn random_stream(rng: &mut StdRng, device: &str, len: usize) -> Vec<Sample> {
    let base: f64 = rng.gen_range(-50.0..50.0);
    let amplitude: f64 = rng.gen_range(0.5..10.0);
    (0..len)
        .map(|i| {
            let noise: f64 = rng.gen_range(-0.2..0.2);
            let value = base + amplitude * ((i as f64) * 0.2).sin() + noise;
            Sample::new(device, 1_000 + i as u64 * 500, value)
        })
        .collect()
}

#[test]
fn scenario_four_windows_two_templates() {
    let store = MemoryStore::new();
    let config = CodecConfig::with_window(4, 2).initial_threshold(1.0);
    let mut compressor = DeviceCompressor::new("d1".into(), config).unwrap();
    let values = [
        1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 9.0, 9.0, 9.0, 9.0, 1.0, 1.0, 1.0, 2.0,
    ];
    let samples: Vec<Sample> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| Sample::new("d1", i as u64, v))
        .collect();
    let emissions = compress(&mut compressor, &store, &samples);

    let kinds: Vec<(bool, TemplateId)> = emissions
        .iter()
        .map(|e| (e.record.is_match(), e.record.template_id()))
        .collect();
    assert_eq!(kinds, vec![(false, 0), (true, 0), (false, 1), (true, 0)]);

    let reconstructed = Decompressor::new(&store).collect(&"d1".into(), None).unwrap();
    let values_out: Vec<f64> = reconstructed.iter().map(|s| s.value).collect();
    for (a, b) in values_out.iter().zip(values.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-9);
    }
}

#[test]
fn fifth_window_at_capacity_evicts_exactly_one() {
    let store = MemoryStore::new();
    let mut compressor =
        DeviceCompressor::new("d1".into(), CodecConfig::with_window(4, 2)).unwrap();
    let windows = [[1.0; 4], [1.0; 4], [9.0; 4], [1.0, 1.0, 1.0, 2.0], [-40.0; 4]];
    let samples: Vec<Sample> = windows
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, &v)| Sample::new("d1", i as u64, v))
        .collect();
    let emissions = compress(&mut compressor, &store, &samples);

    let last = emissions.last().unwrap();
    assert!(!last.record.is_match());
    assert!(last.evicted.is_some());
    assert_eq!(compressor.dictionary().len(), 2);
    assert_eq!(store.templates(&"d1".into(), true).unwrap().len(), 2);
}

#[test]
fn sample_counts_round_trip() {
    let mut rng = StdRng::seed_from_u64(7);
    let store = MemoryStore::new();

    for d in 0..5 {
        let device = format!("dev-{}", d);
        let window_len = rng.gen_range(2..12);
        let len = rng.gen_range(1..400);
        let samples = random_stream(&mut rng, &device, len);

        let mut compressor = DeviceCompressor::new(
            device.clone().into(),
            CodecConfig::with_window(window_len, 4),
        )
        .unwrap();
        let emissions = compress(&mut compressor, &store, &samples);
        assert_eq!(emissions.len(), (len + window_len - 1) / window_len);

        let out = Decompressor::new(&store)
            .collect(&device.clone().into(), None)
            .unwrap();
        assert_eq!(out.len(), len, "device {}", device);
        assert_eq!(out.first().map(|s| s.timestamp), Some(samples[0].timestamp));
        assert!(out.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}

#[test]
fn reconstruction_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(11);
    let store = MemoryStore::new();
    let samples = random_stream(&mut rng, "d1", 500);
    let mut compressor =
        DeviceCompressor::new("d1".into(), CodecConfig::with_window(8, 3)).unwrap();
    compress(&mut compressor, &store, &samples);

    let decompressor = Decompressor::new(&store);
    let first = decompressor.collect(&"d1".into(), None).unwrap();
    let second = decompressor.collect(&"d1".into(), None).unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.timestamp, b.timestamp);
        assert_eq!(a.value.to_bits(), b.value.to_bits());
    }
}

#[test]
fn matched_windows_stay_within_threshold() {
    let mut rng = StdRng::seed_from_u64(23);
    let window_len = 8;
    let config = CodecConfig::with_window(window_len, 6).initial_threshold(0.3);
    let metric = config.metric;
    let store = MemoryStore::new();
    let samples = random_stream(&mut rng, "d1", 2_000);
    let mut compressor = DeviceCompressor::new("d1".into(), config).unwrap();
    let emissions = compress(&mut compressor, &store, &samples);

    let mut matched = 0;
    for (i, emission) in emissions.iter().enumerate() {
        if !emission.record.is_match() {
            continue;
        }
        matched += 1;
        let original: Vec<f64> = samples[i * window_len..(i + 1) * window_len]
            .iter()
            .map(|s| s.value)
            .collect();
        let reconstructed = record_values(&emission.record, Some(&emission.template)).unwrap();
        let d = metric.distance(&reconstructed, &original).unwrap();
        assert!(
            d <= emission.threshold + 1e-12,
            "window {}: {} > {}",
            i,
            d,
            emission.threshold
        );
    }
    assert!(matched > 0);
}

#[test]
fn dictionary_size_and_eviction_choice() {
    let mut rng = StdRng::seed_from_u64(99);
    let capacity = 3;
    let mut compressor = DeviceCompressor::new(
        "d1".into(),
        CodecConfig::with_window(4, capacity).initial_threshold(0.05),
    )
    .unwrap();

    let mut evictions = 0;
    for i in 0..2_000u64 {
        let before: Vec<Template> = compressor.dictionary().iter().cloned().collect();
        let value = rng.gen_range(0..6u32) as f64 * 10.0 + rng.gen_range(-0.1..0.1);
        let outcome = compressor.push(Sample::new("d1", i, value)).unwrap();
        assert!(compressor.dictionary().len() <= capacity);

        for emission in &outcome.emissions {
            let Some(victim) = &emission.evicted else {
                continue;
            };
            evictions += 1;
            let min_count = before.iter().map(|t| t.match_count).min().unwrap();
            assert_eq!(victim.match_count, min_count);
            let oldest_among_least = before
                .iter()
                .filter(|t| t.match_count == min_count)
                .map(|t| t.last_matched_at)
                .min()
                .unwrap();
            assert_eq!(victim.last_matched_at, oldest_among_least);
        }
    }
    assert!(evictions > 0);
}

#[test]
fn threshold_never_leaves_bounds() {
    let mut rng = StdRng::seed_from_u64(5);
    let config = CodecConfig::with_window(4, 4);
    let (min, max) = (config.threshold.min, config.threshold.max);
    let mut compressor = DeviceCompressor::new("d1".into(), config).unwrap();

    for i in 0..5_000u64 {
        let value = if (i / 400) % 2 == 0 {
            20.0
        } else {
            rng.gen_range(-1_000.0..1_000.0)
        };
        compressor.push(Sample::new("d1", i, value)).unwrap();
        assert!(compressor.threshold() >= min && compressor.threshold() <= max);
    }
}

#[test]
fn evicted_templates_still_reconstruct() {
    let store = MemoryStore::new();
    let mut compressor =
        DeviceCompressor::new("d1".into(), CodecConfig::with_window(2, 1)).unwrap();
    let values = [1.0, 1.0, 1.0, 1.0, 50.0, 50.0, 1.0, 1.0, -7.0, -7.0];
    let samples: Vec<Sample> = values
        .iter()
        .enumerate()
        .map(|(i, &v)| Sample::new("d1", i as u64, v))
        .collect();
    let emissions = compress(&mut compressor, &store, &samples);
    assert!(emissions.iter().any(|e| e.evicted.is_some()));

    let out = Decompressor::new(&store).collect(&"d1".into(), None).unwrap();
    assert_eq!(out.len(), values.len());
    assert!(store.templates(&"d1".into(), false).unwrap().len() > 1);
}

#[test]
fn expired_templates_still_reconstruct() {
    let store = MemoryStore::new();
    let config = CodecConfig {
        max_idle_ms: Some(5),
        ..CodecConfig::with_window(2, 8)
    };
    let mut compressor = DeviceCompressor::new("d1".into(), config).unwrap();
    let samples: Vec<Sample> = [
        (0, 1.0),
        (1, 1.0),
        (2, 1.0),
        (3, 1.0),
        (4, 50.0),
        (5, 50.0),
        (20, -7.0),
        (21, -7.0),
        (22, 1.0),
        (23, 1.0),
    ]
    .iter()
    .map(|&(ts, v)| Sample::new("d1", ts, v))
    .collect();
    let emissions = compress(&mut compressor, &store, &samples);

    let kinds: Vec<(bool, TemplateId)> = emissions
        .iter()
        .map(|e| (e.record.is_match(), e.record.template_id()))
        .collect();
    assert_eq!(kinds, vec![(false, 0), (true, 0), (false, 1), (false, 2), (false, 3)]);
    let expired: Vec<TemplateId> = emissions[3].expired.iter().map(|t| t.id).collect();
    assert_eq!(expired, vec![0, 1]);
    assert!(emissions.iter().all(|e| e.evicted.is_none()));
    assert_eq!(compressor.metrics().expirations, 2);

    let active: Vec<TemplateId> = store
        .templates(&"d1".into(), true)
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(active, vec![2, 3]);
    assert_eq!(store.templates(&"d1".into(), false).unwrap().len(), 4);

    let out = Decompressor::new(&store).collect(&"d1".into(), None).unwrap();
    assert_eq!(out.len(), samples.len());
    for (got, want) in out.iter().zip(&samples) {
        assert_eq!(got.timestamp, want.timestamp);
        assert_relative_eq!(got.value, want.value, epsilon = 1e-9);
    }
}

#[test]
fn missing_template_is_a_dangling_reference() {
    let source = MemoryStore::new();
    let mut compressor =
        DeviceCompressor::new("d1".into(), CodecConfig::with_window(4, 2)).unwrap();
    let samples: Vec<Sample> = (0..8u64).map(|i| Sample::new("d1", i, 3.0)).collect();
    compress(&mut compressor, &source, &samples);

    // Records without their templates
    let broken = MemoryStore::new();
    let records = source.records(&"d1".into(), None).unwrap();
    let ops: Vec<StoreOp> = records.into_iter().map(StoreOp::AppendRecord).collect();
    broken.apply(&ops).unwrap();

    let result = Decompressor::new(&broken).collect(&"d1".into(), None);
    assert!(matches!(
        result,
        Err(TelepressError::Decode(DecodeError::DanglingReference {
            template_id: 0,
            ..
        }))
    ));
}
