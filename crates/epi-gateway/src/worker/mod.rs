//! Background evidence worker.
//!
//! Producers hand [`CaptureEvent`]s to [`EvidenceWorker::enqueue`], which
//! never blocks. A single consumer thread redacts each event, groups events
//! into batches and persists each batch through a [`BatchSink`], signing it
//! first when a [`BatchSigner`] is configured.
//!
//! # Lifecycle
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Draining --(consumer done)--> Stopped
//! ```
//!
//! A batch is flushed when the buffer reaches `max_batch_size`, or when it
//! is non-empty and older than `batch_timeout`. The batch timer starts when
//! the first event lands in an empty buffer, so an idle worker never flushes
//! a lone event early. On stop, events already queued are drained and the
//! remainder is flushed once before the consumer exits.
//!
//! The queue is bounded. When it is full, `enqueue` rejects the newest event
//! with [`EnqueueError::QueueFull`] and counts it in `dropped_count`.
//!
//! An event a signed batch could not carry is refused by `enqueue` with
//! [`EnqueueError::Unsignable`]. If redaction turns an accepted event into
//! one, the consumer discards that event alone and counts it in
//! `discarded_count`; the rest of its batch is persisted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use epi_core::canonical::CanonicalError;
use epi_core::redact::Redactor;
use epi_core::trust::{KeyId, SigningKey};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchSink, CaptureEvent, WorkerPersistenceError};


/// Name of the consumer thread.
pub const WORKER_THREAD_NAME: &str = "epi-evidence-worker";

/// Default number of events per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// Default age at which a non-empty buffer is flushed.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Default consumer poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default bound on how long `stop` waits for the consumer.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Batching and lifecycle tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Flush once this many events are buffered.
    pub max_batch_size: usize,
    /// Flush a non-empty buffer once it is older than this.
    pub batch_timeout: Duration,
    /// How long the consumer waits for an event before re-checking timers.
    pub poll_interval: Duration,
    /// Bounded queue capacity.
    pub queue_capacity: usize,
    /// How long `stop` waits for the consumer to finish draining.
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Key used to sign every persisted batch.
pub struct BatchSigner {
    key: SigningKey,
    key_id: KeyId,
}

impl BatchSigner {
    /// Creates a signer.
    #[must_use]
    pub const fn new(key: SigningKey, key_id: KeyId) -> Self {
        Self { key, key_id }
    }

    /// Key id embedded in signatures.
    #[must_use]
    pub const fn key_id(&self) -> &KeyId {
        &self.key_id
    }
}

impl std::fmt::Debug for BatchSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSigner")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No consumer thread.
    Stopped,
    /// Consumer running, accepting events.
    Running,
    /// Stop requested, consumer flushing what is queued.
    Draining,
}

impl WorkerState {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Draining => "draining",
        }
    }

    const fn to_u8(self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Running => 1,
            Self::Draining => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection of a single event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EnqueueError {
    /// The worker is stopped.
    #[error("evidence worker is not running")]
    NotRunning,

    /// The queue is at capacity; the event was dropped.
    #[error("evidence queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured capacity.
        capacity: usize,
    },

    /// The event has no canonical encoding, so no batch carrying it could be
    /// signed.
    #[error("event cannot be canonically encoded: {0}")]
    Unsignable(#[source] CanonicalError),
}

/// Lifecycle failure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The consumer thread could not be spawned.
    #[error("failed to spawn evidence worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The consumer did not finish draining in time.
    ///
    /// The worker stays in [`WorkerState::Draining`]; calling `stop` again
    /// waits for it once more.
    #[error("evidence worker did not stop within {timeout:?}")]
    StopTimeout {
        /// Bound that was exceeded.
        timeout: Duration,
    },

    /// A previous stop is still pending.
    #[error("evidence worker is still draining")]
    Draining,

    /// The consumer thread panicked; buffered events were lost.
    #[error("evidence worker thread panicked")]
    ConsumerPanicked,
}

/// Result of a successful `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The consumer drained and exited.
    Stopped,
    /// The worker was not running.
    AlreadyStopped,
}

/// State visible to both producers and the consumer.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    stop_requested: AtomicBool,
    queued: AtomicUsize,
    processed: AtomicU64,
    failed_batches: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    redactions: AtomicU64,
}

impl Shared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition_to(&self, state: WorkerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }
}

/// Everything the consumer needs besides the channel.
struct Pipeline {
    sink: Arc<dyn BatchSink>,
    redactor: Redactor,
    signer: Option<BatchSigner>,
    max_batch_size: usize,
    batch_timeout: Duration,
    poll_interval: Duration,
}

struct RunningConsumer {
    handle: JoinHandle<Receiver<CaptureEvent>>,
    done_rx: Receiver<()>,
}

struct Lifecycle {
    /// Parked receiver while stopped.
    receiver: Option<Receiver<CaptureEvent>>,
    running: Option<RunningConsumer>,
}

/// Batching, signing evidence worker.
///
/// Owned by its caller and usually shared as `Arc<EvidenceWorker>`; every
/// method takes `&self`.
pub struct EvidenceWorker {
    config: WorkerConfig,
    pipeline: Arc<Pipeline>,
    shared: Arc<Shared>,
    sender: Mutex<SyncSender<CaptureEvent>>,
    lifecycle: Mutex<Lifecycle>,
}

impl EvidenceWorker {
    /// Creates a stopped worker persisting to `sink`.
    ///
    /// Zero sizes in `config` are raised to one.
    #[must_use]
    pub fn new(config: WorkerConfig, sink: Arc<dyn BatchSink>) -> Self {
        Self::with_parts(config, sink, Redactor::new(), None)
    }

    /// Creates a stopped worker with an explicit redactor and optional signer.
    #[must_use]
    pub fn with_parts(
        mut config: WorkerConfig,
        sink: Arc<dyn BatchSink>,
        redactor: Redactor,
        signer: Option<BatchSigner>,
    ) -> Self {
        config.max_batch_size = config.max_batch_size.max(1);
        config.queue_capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let pipeline = Pipeline {
            sink,
            redactor,
            signer,
            max_batch_size: config.max_batch_size,
            batch_timeout: config.batch_timeout,
            poll_interval: config.poll_interval,
        };
        Self {
            config,
            pipeline: Arc::new(pipeline),
            shared: Arc::new(Shared::default()),
            sender: Mutex::new(sender),
            lifecycle: Mutex::new(Lifecycle {
                receiver: Some(receiver),
                running: None,
            }),
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether batches are signed.
    #[must_use]
    pub fn is_signing(&self) -> bool {
        self.pipeline.signer.is_some()
    }

    /// Starts the consumer thread. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Draining`] while a timed-out stop is still
    /// pending, or [`WorkerError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut lifecycle = self.lock_lifecycle();
        match self.shared.state() {
            WorkerState::Running => return Ok(()),
            WorkerState::Draining => return Err(WorkerError::Draining),
            WorkerState::Stopped => {},
        }

        let receiver = lifecycle.receiver.take().unwrap_or_else(|| {
            let (sender, receiver) = mpsc::sync_channel(self.config.queue_capacity);
            *self.lock_sender() = sender;
            self.shared.queued.store(0, Ordering::Release);
            warn!("evidence channel was lost with its consumer; starting with an empty queue");
            receiver
        });

        self.shared.stop_requested.store(false, Ordering::Release);
        let (done_tx, done_rx) = mpsc::channel();
        let pipeline = Arc::clone(&self.pipeline);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let receiver = run_consumer(receiver, &pipeline, &shared);
                let _ = done_tx.send(());
                receiver
            })
            .map_err(WorkerError::Spawn)?;

        lifecycle.running = Some(RunningConsumer { handle, done_rx });
        self.shared.transition_to(WorkerState::Running);
        info!(
            max_batch_size = self.config.max_batch_size,
            batch_timeout_ms = duration_ms(self.config.batch_timeout),
            queue_capacity = self.config.queue_capacity,
            signing = self.is_signing(),
            "evidence worker started"
        );
        Ok(())
    }

    /// Stops the worker, flushing everything already queued.
    ///
    /// Idempotent. Waits at most `stop_timeout` for the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::StopTimeout`] if the consumer is still draining
    /// when the bound expires, or [`WorkerError::ConsumerPanicked`].
    pub fn stop(&self) -> Result<StopOutcome, WorkerError> {
        let mut lifecycle = self.lock_lifecycle();
        let Some(running) = lifecycle.running.take() else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        self.shared.transition_to(WorkerState::Draining);
        self.shared.stop_requested.store(true, Ordering::Release);
        info!(queue_size = self.queue_size(), "stopping evidence worker");

        match running.done_rx.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {},
            Err(RecvTimeoutError::Timeout) => {
                lifecycle.running = Some(running);
                warn!(
                    timeout_ms = duration_ms(self.config.stop_timeout),
                    "evidence worker did not finish draining in time"
                );
                return Err(WorkerError::StopTimeout {
                    timeout: self.config.stop_timeout,
                });
            },
        }

        let joined = running.handle.join();
        self.shared.transition_to(WorkerState::Stopped);
        match joined {
            Ok(receiver) => {
                lifecycle.receiver = Some(receiver);
                info!(
                    processed_count = self.processed_count(),
                    failed_batches = self.failed_batches(),
                    "evidence worker stopped"
                );
                Ok(StopOutcome::Stopped)
            },
            Err(_) => {
                error!("evidence worker thread panicked");
                Err(WorkerError::ConsumerPanicked)
            },
        }
    }

    /// Queues an event without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::NotRunning`] when stopped,
    /// [`EnqueueError::Unsignable`] for an event without a canonical
    /// encoding, or [`EnqueueError::QueueFull`] when the queue is at
    /// capacity.
    pub fn enqueue(&self, event: CaptureEvent) -> Result<(), EnqueueError> {
        if self.shared.state() == WorkerState::Stopped {
            return Err(EnqueueError::NotRunning);
        }
        if let Err(err) = event.check_signable() {
            debug!(error = %err, "refusing unsignable event");
            return Err(EnqueueError::Unsignable(err));
        }

        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let sent = self.lock_sender().try_send(event);
        match sent {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = self.config.queue_capacity,
                    dropped_count = dropped,
                    "evidence queue full, dropping event"
                );
                Err(EnqueueError::QueueFull {
                    capacity: self.config.queue_capacity,
                })
            },
            Err(TrySendError::Disconnected(_)) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                Err(EnqueueError::NotRunning)
            },
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Events queued but not yet picked up by the consumer.
    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Events in successfully persisted batches.
    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Batches that failed to persist.
    #[must_use]
    pub fn failed_batches(&self) -> u64 {
        self.shared.failed_batches.load(Ordering::Relaxed)
    }

    /// Events rejected because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Accepted events discarded because their redacted form could not be
    /// signed.
    #[must_use]
    pub fn discarded_count(&self) -> u64 {
        self.shared.discarded.load(Ordering::Relaxed)
    }

    /// Secrets redacted from events so far.
    #[must_use]
    pub fn redaction_count(&self) -> u64 {
        self.shared.redactions.load(Ordering::Relaxed)
    }

    fn lock_sender(&self) -> MutexGuard<'_, SyncSender<CaptureEvent>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for EvidenceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceWorker")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("queue_size", &self.queue_size())
            .field("processed_count", &self.processed_count())
            .finish_non_exhaustive()
    }
}

impl Drop for EvidenceWorker {
    fn drop(&mut self) {
        // The detached consumer still drains and flushes on its own.
        self.shared.stop_requested.store(true, Ordering::Release);
    }
}

fn run_consumer(
    receiver: Receiver<CaptureEvent>,
    pipeline: &Pipeline,
    shared: &Shared,
) -> Receiver<CaptureEvent> {
    let mut buffer: Vec<CaptureEvent> = Vec::with_capacity(pipeline.max_batch_size);
    let mut buffer_started = Instant::now();

    while !shared.stop_requested.load(Ordering::Acquire) {
        match receiver.recv_timeout(pipeline.poll_interval) {
            Ok(event) => {
                shared.queued.fetch_sub(1, Ordering::AcqRel);
                if let Some(event) = pipeline.redact(event, shared) {
                    if buffer.is_empty() {
                        buffer_started = Instant::now();
                    }
                    buffer.push(event);
                }
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if buffer.len() >= pipeline.max_batch_size {
            pipeline.flush(&mut buffer, shared);
        } else if !buffer.is_empty() && buffer_started.elapsed() > pipeline.batch_timeout {
            debug!(count = buffer.len(), "batch timeout reached");
            pipeline.flush(&mut buffer, shared);
        }
    }

    // Bounded by what was queued when the drain began.
    let pending = shared.queued.load(Ordering::Acquire);
    let mut drained = 0usize;
    while drained < pending {
        let Ok(event) = receiver.try_recv() else {
            break;
        };
        drained += 1;
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        buffer.extend(pipeline.redact(event, shared));
        if buffer.len() >= pipeline.max_batch_size {
            pipeline.flush(&mut buffer, shared);
        }
    }
    if !buffer.is_empty() {
        info!(count = buffer.len(), "flushing remaining events on shutdown");
        pipeline.flush(&mut buffer, shared);
    }
    receiver
}

impl Pipeline {
    /// Redacts an event, or discards it when the redacted form cannot be
    /// signed.
    fn redact(&self, mut event: CaptureEvent, shared: &Shared) -> Option<CaptureEvent> {
        let (kind, kind_hits) = self.redactor.redact_str(&event.kind);
        let (content, content_hits) = self.redactor.redact_value(&event.content);
        let (meta, meta_hits) = self.redactor.redact_value(&event.meta);
        event.kind = kind;
        event.content = content;
        event.meta = meta;

        let hits = kind_hits + content_hits + meta_hits;
        if hits > 0 {
            shared.redactions.fetch_add(hits as u64, Ordering::Relaxed);
            debug!(redactions = hits, "redacted capture event");
        }
        if let Err(err) = event.check_signable() {
            let discarded = shared.discarded.fetch_add(1, Ordering::Relaxed) + 1;
            error!(
                kind = %event.kind,
                error = %err,
                discarded_count = discarded,
                "redacted event cannot be signed, discarding it"
            );
            return None;
        }
        Some(event)
    }

    fn flush(&self, buffer: &mut Vec<CaptureEvent>, shared: &Shared) {
        if buffer.is_empty() {
            return;
        }
        let items = std::mem::replace(buffer, Vec::with_capacity(self.max_batch_size));
        let mut batch = Batch::new(items);
        let count = batch.count;

        match self.seal_and_persist(&mut batch) {
            Ok(()) => {
                shared.processed.fetch_add(count as u64, Ordering::Relaxed);
                info!(
                    batch_id = %batch.batch_id,
                    count,
                    signed = batch.signed,
                    "flushed evidence batch"
                );
            },
            Err(err) => {
                shared.failed_batches.fetch_add(1, Ordering::Relaxed);
                error!(
                    batch_id = %batch.batch_id,
                    count,
                    error = %err,
                    "failed to persist evidence batch, items lost"
                );
            },
        }
    }

    fn seal_and_persist(&self, batch: &mut Batch) -> Result<(), WorkerPersistenceError> {
        if let Some(signer) = &self.signer {
            batch
                .sign(&signer.key, &signer.key_id)
                .map_err(|source| WorkerPersistenceError::Sign {
                    batch_id: batch.batch_id.clone(),
                    source,
                })?;
        }
        self.sink.persist(batch)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
