//! eDVS event stream decoder.
//!
//! # Frame format (event format 2)
//!
//! ```text
//! byte 0: 1yyyyyyy   sync bit + Y address
//! byte 1: pxxxxxxx   polarity + X address
//! byte 2: tttttttt   timestamp, high byte
//! byte 3: tttttttt   timestamp, low byte
//! ```
//!
//! Only byte 0 carries the sync bit, so a stream that starts mid-frame is
//! realigned by skipping single bytes until one with bit 7 set turns up. A
//! trailing partial frame is left unconsumed for the caller to prepend to the
//! next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::assembler::{CommitReason, PacketAssembler};
use crate::batch::EventBatch;
use crate::config::{AcquisitionConfig, EDVS_EVENT_SIZE};
use crate::errors::Result;
use crate::event::PixelEvent;
use crate::logging::SessionLog;
use crate::protocol::Command;
use crate::timebase::{Advance, TimeBase};
use crate::transport::CommandChannel;

const HIGH_BIT_MASK: u8 = 0x80;
const LOW_BITS_MASK: u8 = 0x7F;

/// One sync-aligned 4-byte frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame([u8; EDVS_EVENT_SIZE]);

impl RawFrame {
    /// Take the first four bytes of `bytes` if they form a frame.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; EDVS_EVENT_SIZE] = bytes.get(..EDVS_EVENT_SIZE)?.try_into().ok()?;
        (raw[0] & HIGH_BIT_MASK != 0).then_some(Self(raw))
    }

    /// Build the wire form of an event; coordinates are masked to 7 bits.
    pub fn encode(x: u8, y: u8, polarity: bool, short_timestamp: u16) -> [u8; EDVS_EVENT_SIZE] {
        let [ts_high, ts_low] = short_timestamp.to_be_bytes();
        let pol = if polarity { HIGH_BIT_MASK } else { 0 };
        [
            HIGH_BIT_MASK | (y & LOW_BITS_MASK),
            pol | (x & LOW_BITS_MASK),
            ts_high,
            ts_low,
        ]
    }

    pub fn x(&self) -> u16 {
        u16::from(self.0[1] & LOW_BITS_MASK)
    }

    pub fn y(&self) -> u16 {
        u16::from(self.0[0] & LOW_BITS_MASK)
    }

    pub fn polarity(&self) -> bool {
        self.0[1] & HIGH_BIT_MASK != 0
    }

    pub fn short_timestamp(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }
}

/// Receiver of sealed batches.
pub trait BatchSink {
    /// Take ownership of a sealed batch. `forced` batches must not be dropped
    /// by backpressure. Returns `false` once the receiver is shut down.
    fn deliver(&mut self, batch: EventBatch, forced: bool) -> bool;
}

impl BatchSink for Vec<EventBatch> {
    fn deliver(&mut self, batch: EventBatch, _forced: bool) -> bool {
        self.push(batch);
        true
    }
}

/// Counters for one `feed` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// Bytes consumed from the input; the rest is an incomplete frame.
    pub consumed: usize,
    /// Non-sync bytes skipped.
    pub resyncs: usize,
    pub pixels: usize,
    /// Frames dropped for out-of-range coordinates.
    pub dropped: usize,
    /// Batches handed to the sink.
    pub batches: usize,
    /// The sink refused a batch; decoding stopped early.
    pub stopped: bool,
}

pub struct EventDecoder {
    device_id: u16,
    size_x: u16,
    size_y: u16,
    timebase: TimeBase,
    assembler: PacketAssembler,
    /// Overflow epoch the last decoded frame arrived in.
    frame_epoch: u32,
    reset_request: Arc<AtomicBool>,
    commands: Option<Arc<CommandChannel>>,
    log: Arc<SessionLog>,
}

impl EventDecoder {
    pub fn new(config: &AcquisitionConfig, log: Arc<SessionLog>) -> Self {
        Self::with_assembler(config, PacketAssembler::new(config), log)
    }

    pub fn with_assembler(
        config: &AcquisitionConfig,
        assembler: PacketAssembler,
        log: Arc<SessionLog>,
    ) -> Self {
        Self {
            device_id: config.device_id,
            size_x: config.size_x,
            size_y: config.size_y,
            timebase: TimeBase::new(),
            assembler,
            frame_epoch: 0,
            reset_request: Arc::new(AtomicBool::new(false)),
            commands: None,
            log,
        }
    }

    /// Send the timestamp-reset command through `commands` when a reset is applied.
    pub fn with_commands(mut self, commands: Arc<CommandChannel>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Share an externally owned reset flag.
    pub fn with_reset_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.reset_request = flag;
        self
    }

    /// Ask for a timestamp reset; applied on the next decoded frame.
    pub fn request_timestamp_reset(&self) {
        self.reset_request.store(true, Ordering::Release);
    }

    pub fn timebase(&self) -> &TimeBase {
        &self.timebase
    }

    pub fn assembler(&self) -> &PacketAssembler {
        &self.assembler
    }

    /// Allocate the open buffers ahead of the first frame.
    pub fn allocate(&mut self) -> Result<()> {
        self.assembler.allocate()
    }

    /// Drop the open batch without forwarding it.
    pub fn discard(&mut self) {
        self.assembler.discard();
    }

    /// Decode as many whole frames from `bytes` as possible.
    pub fn feed(&mut self, bytes: &[u8], sink: &mut dyn BatchSink) -> Result<DecodeStats> {
        let mut stats = DecodeStats::default();
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] & HIGH_BIT_MASK == 0 {
                self.log.info(format_args!(
                    "data not aligned, skipping byte {} of {}",
                    i,
                    bytes.len()
                ));
                stats.resyncs += 1;
                i += 1;
                continue;
            }

            let Some(frame) = RawFrame::parse(&bytes[i..]) else {
                break;
            };
            i += EDVS_EVENT_SIZE;

            if let Some(reason) = self.decode_frame(frame, &mut stats)? {
                if !self.commit(reason, sink, &mut stats) {
                    stats.stopped = true;
                    break;
                }
            }
        }

        stats.consumed = i;
        Ok(stats)
    }

    fn decode_frame(
        &mut self,
        frame: RawFrame,
        stats: &mut DecodeStats,
    ) -> Result<Option<CommitReason>> {
        let reset = self.reset_request.swap(false, Ordering::AcqRel);
        self.frame_epoch = self.timebase.wrap_overflow();

        match self.timebase.advance(frame.short_timestamp(), reset, &self.log) {
            Advance::Reset => {
                if let Some(commands) = &self.commands {
                    if let Err(e) = commands.send(&Command::TimestampReset) {
                        self.log.warn(format_args!("failed to send timestamp reset: {e}"));
                    }
                }
                self.log.debug(format_args!("timestamp reset applied"));
                Ok(Some(CommitReason::TimestampReset))
            }
            Advance::BigWrap(event) => {
                self.assembler.append_special(event)?;
                Ok(Some(CommitReason::BigWrap))
            }
            Advance::Timestamp(timestamp) => {
                let overflow = self.timebase.wrap_overflow();
                self.assembler.note_timestamp(overflow, timestamp);

                let (x, y) = (frame.x(), frame.y());
                if x < self.size_x && y < self.size_y {
                    self.assembler.append_pixel(PixelEvent {
                        timestamp,
                        x,
                        y,
                        polarity: frame.polarity(),
                    })?;
                    stats.pixels += 1;
                } else {
                    if x >= self.size_x {
                        self.log.warn(format_args!(
                            "X address out of range (0-{}): {}",
                            self.size_x - 1,
                            x
                        ));
                    }
                    if y >= self.size_y {
                        self.log.warn(format_args!(
                            "Y address out of range (0-{}): {}",
                            self.size_y - 1,
                            y
                        ));
                    }
                    stats.dropped += 1;
                }

                Ok(self
                    .assembler
                    .commit_reason(false, false, overflow, timestamp))
            }
        }
    }

    fn commit(
        &mut self,
        reason: CommitReason,
        sink: &mut dyn BatchSink,
        stats: &mut DecodeStats,
    ) -> bool {
        // Resets and big wraps have already moved the time base on; the sealed
        // events belong to the epoch they were decoded in.
        let mut open = true;
        if let Some(batch) = self.assembler.seal(self.frame_epoch) {
            self.log.trace(format_args!(
                "sealed batch ({:?}): {} pixel, {} special events",
                reason,
                batch.pixel_count(),
                batch.special_count()
            ));
            stats.batches += 1;
            open = sink.deliver(batch, false);
        }

        if reason == CommitReason::TimestampReset && open {
            stats.batches += 1;
            open = sink.deliver(EventBatch::reset_marker(self.device_id), true);
        }
        open
    }
}
