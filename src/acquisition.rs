//! The read-decode-assemble loop.
//!
//! # Polling
//!
//! The loop busy-polls the transport until at least [`MIN_READ_BYTES`] are
//! waiting. It does not sleep: a sleeping thread is woken late by the
//! scheduler, and that delay lands directly on how fresh each batch is. The
//! cost is one core spinning while acquisition runs. If fewer bytes than that
//! have been waiting for [`POLL_WINDOW`], whatever whole frames are there get
//! read anyway so a quiet sensor does not strand its last events.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::error;

use crate::batch::EventBatch;
use crate::config::EDVS_EVENT_SIZE;
use crate::decoder::{BatchSink, EventDecoder};
use crate::errors::Result;
use crate::exchange::{AcquisitionObserver, DataExchange, PushOutcome, StateFlag, ThreadState};
use crate::logging::SessionLog;
use crate::transport::{ByteSource, CommandChannel};

/// Wait for 16 whole frames before reading.
pub const MIN_READ_BYTES: usize = 16 * EDVS_EVENT_SIZE;

/// Time after which a shorter run of frames is read anyway.
pub const POLL_WINDOW: Duration = Duration::from_millis(1);

/// Timeout of a single transport read.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Linux limits thread names to 15 bytes.
const MAX_THREAD_NAME_LENGTH: usize = 15;

/// Everything the acquisition thread owns.
pub struct AcquisitionContext {
    pub source: Box<dyn ByteSource>,
    pub decoder: EventDecoder,
    pub exchange: Arc<DataExchange>,
    pub commands: Arc<CommandChannel>,
    pub state: StateFlag,
    pub read_size: Arc<AtomicUsize>,
    pub observer: Arc<dyn AcquisitionObserver>,
    pub log: Arc<SessionLog>,
}

/// Handle to a running acquisition thread.
pub struct AcquisitionThread {
    handle: JoinHandle<Box<dyn ByteSource>>,
    state: StateFlag,
    exchange: Arc<DataExchange>,
}

impl AcquisitionThread {
    /// Spawn the loop and wait until it has left `Idle`.
    pub fn spawn(context: AcquisitionContext) -> Result<Self> {
        let name: String = context
            .log
            .device()
            .chars()
            .take(MAX_THREAD_NAME_LENGTH)
            .collect();
        let state = context.state.clone();
        let exchange = Arc::clone(&context.exchange);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(context))?;

        while state.get() == ThreadState::Idle {
            thread::yield_now();
        }

        Ok(Self {
            handle,
            state,
            exchange,
        })
    }

    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    /// Signal exit, release blocked waiters and join.
    ///
    /// Returns the transport so a later session can reuse it, or `None` if
    /// the thread panicked.
    pub fn stop(self) -> Option<Box<dyn ByteSource>> {
        self.state.set(ThreadState::Exited);
        self.exchange.wake_all();

        match self.handle.join() {
            Ok(source) => Some(source),
            Err(_) => {
                error!("acquisition thread panicked");
                None
            }
        }
    }
}

/// Pushes sealed batches into the exchange, honoring the backpressure policy.
struct ExchangeSink<'a> {
    exchange: &'a DataExchange,
    log: &'a SessionLog,
}

impl BatchSink for ExchangeSink<'_> {
    fn deliver(&mut self, batch: EventBatch, forced: bool) -> bool {
        let outcome = if forced {
            self.exchange.push_blocking(batch)
        } else {
            self.exchange.push(batch)
        };

        match outcome {
            PushOutcome::Queued => true,
            PushOutcome::ReplacedOldest => {
                self.log.info(format_args!("queue full, dropped oldest batch"));
                true
            }
            PushOutcome::Dropped => {
                self.log.info(format_args!("queue full, dropped new batch"));
                true
            }
            PushOutcome::Closed => false,
        }
    }
}

/// Busy-poll until enough bytes are waiting. `carried` bytes of a partial
/// frame from the previous read count towards the goal. `Ok(None)` means the
/// state left `Running` or a command write failed while polling.
fn wait_for_bytes(
    source: &mut dyn ByteSource,
    state: &StateFlag,
    commands: &CommandChannel,
    carried: usize,
) -> io::Result<Option<usize>> {
    let started = Instant::now();
    loop {
        if !state.is_running() || commands.has_failed() {
            return Ok(None);
        }
        let available = source.bytes_available()?;
        let total = available + carried;
        if total >= MIN_READ_BYTES
            || (total >= EDVS_EVENT_SIZE && started.elapsed() >= POLL_WINDOW)
        {
            return Ok(Some(available));
        }
        std::hint::spin_loop();
    }
}

fn run(context: AcquisitionContext) -> Box<dyn ByteSource> {
    let AcquisitionContext {
        mut source,
        mut decoder,
        exchange,
        commands,
        state,
        read_size,
        observer,
        log,
    } = context;

    // Stays Exited if stop() won the race against startup.
    state.transition(ThreadState::Idle, ThreadState::Running);
    log.debug(format_args!("acquisition thread running"));

    let mut chunk = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut failed = false;

    while state.is_running() {
        if commands.has_failed() {
            log.error(format_args!("command write failed, shutting down"));
            failed = true;
            break;
        }

        let available = match wait_for_bytes(source.as_mut(), &state, &commands, pending.len()) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                log.error(format_args!("failed to query transport: {e}"));
                failed = true;
                break;
            }
        };

        // Read so that carried plus new bytes end on a frame boundary.
        let limit = read_size.load(Ordering::Relaxed).max(EDVS_EVENT_SIZE);
        let total = pending.len() + available.min(limit);
        let want = (total - total % EDVS_EVENT_SIZE).saturating_sub(pending.len());
        chunk.resize(want, 0);

        let n = match source.read(&mut chunk, READ_TIMEOUT) {
            Ok(n) => n,
            Err(e) => {
                log.error(format_args!("transport read failed: {e}"));
                failed = true;
                break;
            }
        };
        if n == 0 {
            continue;
        }
        pending.extend_from_slice(&chunk[..n]);

        if !state.is_running() {
            break;
        }

        let mut sink = ExchangeSink {
            exchange: &exchange,
            log: &log,
        };
        match decoder.feed(&pending, &mut sink) {
            Ok(stats) => {
                pending.drain(..stats.consumed);
                if stats.stopped {
                    break;
                }
            }
            Err(e) => {
                log.error(format_args!("dropping open batch: {e}"));
                decoder.discard();
                pending.clear();
            }
        }
    }

    // Partially filled buffers are never forwarded.
    decoder.discard();
    state.set(ThreadState::Exited);
    exchange.wake_all();

    if failed {
        observer.shutdown();
    }

    log.debug(format_args!("acquisition thread shut down"));
    source
}
