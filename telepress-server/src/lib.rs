// Telepress Server - Ingest service, HTTP export and metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Telepress Server
//!
//! Runs Telepress compression as a concurrent service:
//!
//! - [`service`]: one tokio task per device, a bounded write queue with
//!   backpressure and async retry against the store
//! - [`ingest`]: CSV datasets (long or wide layout)
//! - [`http`]: reconstructed samples, device summaries and metrics over HTTP
//! - [`metrics`]: Prometheus counters and gauges

pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod service;
pub mod summary;

pub use error::ServerError;
pub use ingest::{read_csv, read_csv_from, Dataset, DatasetInfo};
pub use service::{Service, ServiceConfig, ShutdownReport};
pub use summary::{summarize, DeviceSummary};
