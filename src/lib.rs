//! eDVS4337 event camera driver.
//!
//! The sensor streams 4-byte address events over a high-speed serial link.
//! This crate decodes that stream on a dedicated thread, extends the 16-bit
//! sensor timestamps, groups events into [`EventBatch`]es and hands them to
//! the application through a bounded queue.
//!
//! # Timestamps
//!
//! The sensor clock counts microseconds in 16 bits and wraps every 65.5 ms.
//! The driver tracks every wrap and keeps timestamps monotonic up to
//! `i32::MAX`; past that point a batch carrying a
//! [`SpecialEventKind::TimestampWrap`] event is emitted and the batch's
//! [`EventBatch::wrap_overflow`] counter is bumped. A timestamp reset
//! requested through [`Edvs::reset_timestamps`] always arrives as its own
//! batch with [`EventBatch::is_timestamp_reset`] set.
//!
//! # Threads
//!
//! [`Edvs::start`] spawns the acquisition thread; batches come back through
//! [`Edvs::next_batch`] or a [`BatchReceiver`]. Commands can be sent from any
//! thread while acquisition runs.

pub mod acquisition;
pub mod assembler;
pub mod batch;
pub mod config;
pub mod decoder;
pub mod device;
mod errors;
pub mod event;
pub mod exchange;
pub mod logging;
pub mod protocol;
pub mod timebase;
pub mod transport;

pub use batch::EventBatch;
pub use config::{AcquisitionConfig, Backpressure, SerialConfig};
pub use decoder::{BatchSink, DecodeStats, EventDecoder, RawFrame};
pub use device::{BatchReceiver, DeviceInfo, Edvs};
pub use errors::*;
pub use event::{Event, PixelEvent, SpecialEvent, SpecialEventKind};
pub use exchange::{AcquisitionObserver, NoopObserver, ThreadState};
pub use protocol::{Bias, BiasSet, Command};
pub use transport::{ByteSource, CommandSink};
