//! # epi-gateway
//!
//! Evidence capture sidecar. Producers post capture events; an
//! [`EvidenceWorker`](worker::EvidenceWorker) redacts them, groups them into
//! batches, signs each batch and persists it through a
//! [`BatchSink`](batch::BatchSink).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use epi_gateway::batch::{CaptureEvent, FileBatchSink};
//! use epi_gateway::worker::{EvidenceWorker, WorkerConfig};
//! use serde_json::json;
//!
//! let sink = Arc::new(FileBatchSink::open("./evidence_vault")?);
//! let worker = EvidenceWorker::new(WorkerConfig::default(), sink);
//! worker.start()?;
//! worker.enqueue(CaptureEvent::new("llm.request", json!({ "model": "m" })))?;
//! worker.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod batch;
pub mod config;
pub mod http;
pub mod worker;

pub use batch::{Batch, BatchSink, CaptureEvent, FileBatchSink, MemoryBatchSink};
pub use config::GatewayConfig;
pub use worker::{EnqueueError, EvidenceWorker, StopOutcome, WorkerConfig, WorkerState};
