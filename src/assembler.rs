//! Open per-type buffers and the rules for sealing them into batches.

use crate::batch::EventBatch;
use crate::config::AcquisitionConfig;
use crate::errors::Result;
use crate::event::{EventBuffer, PixelEvent, SpecialEvent};

/// Starting capacity of a fresh pixel buffer.
pub const PIXEL_DEFAULT_CAPACITY: usize = 4096;
/// Starting capacity of a fresh special-event buffer.
pub const SPECIAL_DEFAULT_CAPACITY: usize = 128;

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    TimestampReset,
    BigWrap,
    Size,
    Interval,
}

/// Extend a timestamp with its overflow epoch so interval checks survive a big wrap.
fn extended(wrap_overflow: u32, timestamp: u32) -> u64 {
    (u64::from(wrap_overflow) << 31) | u64::from(timestamp)
}

#[derive(Debug)]
pub struct PacketAssembler {
    device_id: u16,
    max_events: usize,
    max_interval_us: u32,
    pixel_capacity: usize,
    special_capacity: usize,
    pixels: Option<EventBuffer<PixelEvent>>,
    specials: Option<EventBuffer<SpecialEvent>>,
    commit_deadline: Option<u64>,
}

impl PacketAssembler {
    pub fn new(config: &AcquisitionConfig) -> Self {
        Self::with_capacities(config, PIXEL_DEFAULT_CAPACITY, SPECIAL_DEFAULT_CAPACITY)
    }

    pub fn with_capacities(
        config: &AcquisitionConfig,
        pixel_capacity: usize,
        special_capacity: usize,
    ) -> Self {
        Self {
            device_id: config.device_id,
            max_events: config.max_events_per_batch,
            max_interval_us: config.max_batch_interval_us,
            pixel_capacity,
            special_capacity,
            pixels: None,
            specials: None,
            commit_deadline: None,
        }
    }

    /// Make sure both open buffers exist.
    pub fn allocate(&mut self) -> Result<()> {
        if self.pixels.is_none() {
            self.pixels = Some(EventBuffer::with_capacity(self.pixel_capacity)?);
        }
        if self.specials.is_none() {
            self.specials = Some(EventBuffer::with_capacity(self.special_capacity)?);
        }
        Ok(())
    }

    pub fn append_pixel(&mut self, event: PixelEvent) -> Result<()> {
        match &mut self.pixels {
            Some(buffer) => buffer.push(event),
            None => {
                let mut buffer = EventBuffer::with_capacity(self.pixel_capacity)?;
                buffer.push(event)?;
                self.pixels = Some(buffer);
                Ok(())
            }
        }
    }

    pub fn append_special(&mut self, event: SpecialEvent) -> Result<()> {
        match &mut self.specials {
            Some(buffer) => buffer.push(event),
            None => {
                let mut buffer = EventBuffer::with_capacity(self.special_capacity)?;
                buffer.push(event)?;
                self.specials = Some(buffer);
                Ok(())
            }
        }
    }

    pub fn pixel_len(&self) -> usize {
        self.pixels.as_ref().map_or(0, EventBuffer::len)
    }

    pub fn special_len(&self) -> usize {
        self.specials.as_ref().map_or(0, EventBuffer::len)
    }

    pub fn pixel_capacity(&self) -> usize {
        self.pixels.as_ref().map_or(0, EventBuffer::capacity)
    }

    pub fn open_pixels(&self) -> &[PixelEvent] {
        self.pixels
            .as_ref()
            .map(EventBuffer::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pixel_len() == 0 && self.special_len() == 0
    }

    /// Start the interval window at the first timestamp seen after a seal.
    pub fn note_timestamp(&mut self, wrap_overflow: u32, timestamp: u32) {
        if self.commit_deadline.is_none() {
            self.commit_deadline =
                Some(extended(wrap_overflow, timestamp) + u64::from(self.max_interval_us));
        }
    }

    fn size_reached(&self) -> bool {
        self.max_events > 0
            && (self.pixel_len() >= self.max_events || self.special_len() >= self.max_events)
    }

    fn interval_elapsed(&self, wrap_overflow: u32, timestamp: u32) -> bool {
        self.max_interval_us > 0
            && self
                .commit_deadline
                .is_some_and(|deadline| extended(wrap_overflow, timestamp) >= deadline)
    }

    /// First commit trigger that applies, if any.
    pub fn commit_reason(
        &self,
        reset: bool,
        big_wrap: bool,
        wrap_overflow: u32,
        timestamp: u32,
    ) -> Option<CommitReason> {
        if reset {
            Some(CommitReason::TimestampReset)
        } else if big_wrap {
            Some(CommitReason::BigWrap)
        } else if self.size_reached() {
            Some(CommitReason::Size)
        } else if self.interval_elapsed(wrap_overflow, timestamp) {
            Some(CommitReason::Interval)
        } else {
            None
        }
    }

    /// Close the open buffers into a batch.
    ///
    /// Empty buffers are not attached, and a batch with no events at all is not
    /// returned. Either way the position counters restart at zero and the
    /// interval window is cleared.
    pub fn seal(&mut self, wrap_overflow: u32) -> Option<EventBatch> {
        self.commit_deadline = None;

        let pixels = self.pixels.take_if_filled();
        let specials = self.specials.take_if_filled();

        if pixels.is_none() && specials.is_none() {
            return None;
        }

        Some(EventBatch::seal(
            self.device_id,
            wrap_overflow,
            false,
            pixels,
            specials,
        ))
    }

    /// Drop whatever is open without forwarding it.
    pub fn discard(&mut self) {
        self.pixels = None;
        self.specials = None;
        self.commit_deadline = None;
    }
}

trait TakeIfFilled<T> {
    fn take_if_filled(&mut self) -> Option<Vec<T>>;
}

impl<T> TakeIfFilled<T> for Option<EventBuffer<T>> {
    fn take_if_filled(&mut self) -> Option<Vec<T>> {
        if self.as_ref().is_some_and(|b| !b.is_empty()) {
            self.take().map(EventBuffer::into_vec)
        } else {
            None
        }
    }
}
