// Telepress - Template-based telemetry compression
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Per-device compressor
//!
//! Buffers samples into windows of `W` values and turns every completed
//! window into exactly one [`CompactRecord`]:
//!
//! 1. Empty dictionary: the window becomes the first template.
//! 2. Nearest template within τ: a `MatchedReference` with a quantized
//!    residual, provided the reconstruction itself stays within τ.
//! 3. Otherwise: the window is admitted as a new template (evicting one if
//!    the dictionary is full, after expiring idle templates).
//!
//! Every decision except the first-window admission is reported to the
//! device's threshold controller.
//!
//! Invalid samples are dropped and close the current window early, as does
//! a timestamp gap larger than `max_gap_ms`. Short windows are padded with
//! their last value for comparison and carry their true length.

use crate::config::CodecConfig;
use crate::dictionary::TemplateDictionary;
use crate::error::{DictionaryError, Result, SampleError, TelepressError};
use crate::metrics::CompressionMetrics;
use crate::record::{CompactRecord, RecordKind, Residual, Template};
use crate::sample::{DeviceId, Sample, TemplateId, TimeSpan, Window};
use crate::store::{Store, StoreOp};
use crate::threshold::{Outcome, ThresholdState};

/// Lifecycle of a device compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorState {
    /// Buffering samples
    #[default]
    AwaitingWindow,
    /// Window complete, evaluating against the dictionary
    Deciding,
    /// Producing the record for the decided window
    Emitting,
    /// Stream ended; the trailing window has been emitted
    Flushed,
}

/// Everything produced by one window decision
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// The compact record
    pub record: CompactRecord,
    /// Distance to the nearest template (`None` for the first window)
    pub distance: Option<f64>,
    /// τ in force when the decision was made
    pub threshold: f64,
    /// τ after the controller observed the decision
    pub updated_threshold: f64,
    /// Created or matched template, with its updated usage statistics
    pub template: Template,
    /// Template evicted to make room for a new one
    pub evicted: Option<Template>,
    /// Templates expired for idleness on this admission
    pub expired: Vec<Template>,
}

impl Emission {
    /// Writes that persist this emission
    ///
    /// The template is written before the record that cites it.
    pub fn store_ops(&self) -> Vec<StoreOp> {
        let mut ops = Vec::with_capacity(4 + self.expired.len());
        for retired in self.expired.iter().chain(&self.evicted) {
            ops.push(StoreOp::MarkEvicted {
                device_id: retired.device_id.clone(),
                template_id: retired.id,
            });
        }
        ops.push(StoreOp::PutTemplate(self.template.clone()));
        ops.push(StoreOp::AppendRecord(self.record.clone()));
        ops.push(StoreOp::PutThreshold {
            device_id: self.record.device_id.clone(),
            tau: self.updated_threshold,
        });
        ops
    }
}

/// Result of pushing one sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushOutcome {
    /// Records produced by this sample (zero, one, or two on a gap)
    pub emissions: Vec<Emission>,
    /// Why the sample was dropped, if it was
    pub rejected: Option<SampleError>,
}

/// Compression state machine for one device
#[derive(Debug, Clone)]
pub struct DeviceCompressor {
    device_id: DeviceId,
    config: CodecConfig,
    state: CompressorState,
    buffer: Vec<f64>,
    span_start: u64,
    last_timestamp: Option<u64>,
    dictionary: TemplateDictionary,
    threshold: ThresholdState,
    next_seq: u64,
    metrics: CompressionMetrics,
}

impl DeviceCompressor {
    /// Create a compressor with an empty dictionary
    ///
    /// Fails with a `ConfigError` when `config` does not validate.
    pub fn new(device_id: DeviceId, config: CodecConfig) -> Result<Self> {
        config.validate()?;
        let dictionary = TemplateDictionary::new(device_id.clone(), &config);
        let threshold = ThresholdState::new(&config.threshold);
        Ok(Self {
            device_id,
            state: CompressorState::AwaitingWindow,
            buffer: Vec::with_capacity(config.window_len),
            span_start: 0,
            last_timestamp: None,
            dictionary,
            threshold,
            next_seq: 0,
            metrics: CompressionMetrics::new(),
            config,
        })
    }

    /// Rebuild a compressor from what `store` holds for `device_id`
    ///
    /// Restores the active templates, τ, the next record sequence and the
    /// next template id (past every id ever stored, evicted ones included).
    /// Templates trimmed because the capacity shrank are marked evicted in
    /// the store.
    pub fn resume<S: Store + ?Sized>(
        device_id: DeviceId,
        config: CodecConfig,
        store: &S,
    ) -> Result<Self> {
        config.validate()?;
        let all = store.templates(&device_id, false)?;
        let next_id = all.iter().map(|t| t.id.saturating_add(1)).max().unwrap_or(0);
        let active = store.templates(&device_id, true)?;
        let last = store.last_record(&device_id)?;

        let (dictionary, dropped) =
            TemplateDictionary::restore(device_id.clone(), &config, active, next_id);
        if !dropped.is_empty() {
            let ops: Vec<StoreOp> = dropped
                .iter()
                .map(|t| StoreOp::MarkEvicted {
                    device_id: device_id.clone(),
                    template_id: t.id,
                })
                .collect();
            store.apply(&ops)?;
        }

        let threshold = match store.threshold(&device_id)? {
            Some(tau) => ThresholdState::with_tau(&config.threshold, tau),
            None => ThresholdState::new(&config.threshold),
        };

        let mut compressor = Self::new(device_id, config)?;
        compressor.next_seq = last.as_ref().map_or(0, |r| r.seq + 1);
        compressor.last_timestamp = last.map(|r| r.span.end);
        compressor.dictionary = dictionary;
        compressor.threshold = threshold;

        log::info!(
            "device {}: resumed with {} templates, next seq {}, tau {:.4}",
            compressor.device_id,
            compressor.dictionary.len(),
            compressor.next_seq,
            compressor.threshold.tau()
        );
        Ok(compressor)
    }

    /// Device this compressor serves
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Active configuration
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> CompressorState {
        self.state
    }

    /// Current threshold τ
    pub fn threshold(&self) -> f64 {
        self.threshold.tau()
    }

    /// Recent match rate seen by the threshold controller
    pub fn match_rate(&self) -> f64 {
        self.threshold.match_rate()
    }

    /// Template dictionary
    pub fn dictionary(&self) -> &TemplateDictionary {
        &self.dictionary
    }

    /// Number of buffered samples not yet folded into a record
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence number the next record will carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Statistics for this device
    pub fn metrics(&self) -> &CompressionMetrics {
        &self.metrics
    }

    /// Feed one sample
    ///
    /// Invalid samples are dropped (reported in [`PushOutcome::rejected`])
    /// and force an early emission of the partial window. Only broken
    /// invariants are returned as errors.
    pub fn push(&mut self, sample: Sample) -> Result<PushOutcome> {
        if self.state == CompressorState::Flushed {
            self.state = CompressorState::AwaitingWindow;
        }

        if let Err(err) = self.validate(&sample) {
            log::warn!("{}", err);
            self.metrics.record_invalid();
            let emission = self.emit_partial()?;
            return Ok(PushOutcome {
                emissions: emission.into_iter().collect(),
                rejected: Some(err),
            });
        }

        let mut emissions = Vec::new();
        if self.is_gap(sample.timestamp) {
            log::debug!(
                "device {}: gap before {}, closing window early",
                self.device_id,
                sample.timestamp
            );
            emissions.extend(self.emit_partial()?);
        }

        if self.buffer.is_empty() {
            self.span_start = sample.timestamp;
        }
        self.buffer.push(sample.value);
        self.last_timestamp = Some(sample.timestamp);

        if self.buffer.len() >= self.config.window_len {
            emissions.extend(self.emit_partial()?);
        }

        Ok(PushOutcome {
            emissions,
            rejected: None,
        })
    }

    /// End of stream: emit the trailing short window, if any
    pub fn flush(&mut self) -> Result<Option<Emission>> {
        let emission = self.emit_partial()?;
        self.state = CompressorState::Flushed;
        Ok(emission)
    }

    /// Drop buffered samples without emitting them
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    fn validate(&self, sample: &Sample) -> std::result::Result<(), SampleError> {
        if sample.device_id != self.device_id {
            return Err(SampleError::InvalidSample {
                device: sample.device_id.clone(),
                timestamp: sample.timestamp,
                reason: format!("routed to compressor of device {}", self.device_id),
            });
        }
        sample.validate(self.last_timestamp)
    }

    fn is_gap(&self, timestamp: u64) -> bool {
        match (self.config.max_gap_ms, self.last_timestamp) {
            (Some(max_gap), Some(last)) if !self.buffer.is_empty() => {
                timestamp.saturating_sub(last) > max_gap
            }
            _ => false,
        }
    }

    fn emit_partial(&mut self) -> Result<Option<Emission>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let len = self.buffer.len();
        let values = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.window_len),
        );
        let end = self.last_timestamp.unwrap_or(self.span_start);
        let span = TimeSpan::new(self.span_start, end);
        let window = Window::new(values).padded(self.config.window_len);

        let emission = self.decide(window, span, len)?;
        self.state = CompressorState::AwaitingWindow;
        Ok(Some(emission))
    }

    fn decide(&mut self, window: Window, span: TimeSpan, len: usize) -> Result<Emission> {
        self.state = CompressorState::Deciding;
        let tau = self.threshold.tau();

        let nearest = match self.dictionary.find_nearest(&window) {
            Ok(found) => Some(found),
            Err(TelepressError::Dictionary(DictionaryError::EmptyDictionary { .. })) => None,
            Err(err) => return Err(err),
        };

        let Some((template_id, distance)) = nearest else {
            // First window: admitted unconditionally, not a controller decision
            return self.emit_new(window, span, len, None, tau);
        };

        if distance <= tau {
            if let Some(residual) = self.residual_within(&window, template_id, tau)? {
                self.dictionary.record_match(template_id, span.end);
                let updated = self.threshold.observe(Outcome {
                    matched: true,
                    distance,
                });
                return self.emit(
                    RecordKind::MatchedReference {
                        template_id,
                        residual,
                    },
                    span,
                    len,
                    Some(distance),
                    tau,
                    updated,
                    None,
                    Vec::new(),
                );
            }
            log::debug!(
                "device {}: reconstruction from template {} exceeds tau {:.4}",
                self.device_id,
                template_id,
                tau
            );
        }

        self.threshold.observe(Outcome {
            matched: false,
            distance,
        });
        self.emit_new(window, span, len, Some(distance), tau)
    }

    /// Residual for matching `window` against `template_id`, if the
    /// reconstruction stays within `tau`
    fn residual_within(
        &self,
        window: &Window,
        template_id: TemplateId,
        tau: f64,
    ) -> Result<Option<Option<Residual>>> {
        let Some(template) = self.dictionary.get(template_id) else {
            return Ok(None);
        };
        let residual = Residual::quantize(
            window.values(),
            template.window.values(),
            self.config.residual_scale,
        );
        let reconstructed = match &residual {
            Some(r) => r.apply(template.window.values()),
            None => template.window.values().to_vec(),
        };
        let error = self
            .config
            .metric
            .distance(&reconstructed, window.values())?;
        Ok((error <= tau).then_some(residual))
    }

    fn emit_new(
        &mut self,
        window: Window,
        span: TimeSpan,
        len: usize,
        distance: Option<f64>,
        tau: f64,
    ) -> Result<Emission> {
        let admission = self.dictionary.admit(window.clone(), span.start)?;
        let updated = self.threshold.tau();
        self.emit(
            RecordKind::NewTemplate {
                template_id: admission.template_id,
                window,
            },
            span,
            len,
            distance,
            tau,
            updated,
            admission.evicted,
            admission.expired,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        kind: RecordKind,
        span: TimeSpan,
        len: usize,
        distance: Option<f64>,
        threshold: f64,
        updated_threshold: f64,
        evicted: Option<Template>,
        expired: Vec<Template>,
    ) -> Result<Emission> {
        self.state = CompressorState::Emitting;

        let record = CompactRecord {
            device_id: self.device_id.clone(),
            seq: self.next_seq,
            span,
            len,
            kind,
        };
        let template_id = record.template_id();
        let template = self
            .dictionary
            .get(template_id)
            .cloned()
            .ok_or_else(|| DictionaryError::UnknownTemplate {
                device: self.device_id.clone(),
                template_id,
            })?;
        self.next_seq += 1;

        let emission = Emission {
            record,
            distance,
            threshold,
            updated_threshold,
            template,
            evicted,
            expired,
        };
        self.metrics.record_emission(&emission);
        Ok(emission)
    }
}
