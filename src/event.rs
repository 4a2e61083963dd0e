//! Event types and the growable per-type buffer they are collected in.

use crate::errors::Result;

/// A pixel brightness change reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelEvent {
    /// Reconstructed timestamp in microseconds.
    pub timestamp: u32,
    pub x: u16,
    pub y: u16,
    /// `true` for an ON (brightness increase) event.
    pub polarity: bool,
}

/// Housekeeping signals inserted into the stream by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialEventKind {
    /// The software-extended timestamp overflowed; later timestamps restart at 0.
    TimestampWrap,
    /// Timestamps were reset on request; later timestamps restart at 0.
    TimestampReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialEvent {
    pub timestamp: u32,
    pub kind: SpecialEventKind,
}

impl SpecialEvent {
    /// Timestamp carried by wrap and reset markers.
    pub const MARKER_TIMESTAMP: u32 = i32::MAX as u32;

    pub fn timestamp_wrap() -> Self {
        Self {
            timestamp: Self::MARKER_TIMESTAMP,
            kind: SpecialEventKind::TimestampWrap,
        }
    }

    pub fn timestamp_reset() -> Self {
        Self {
            timestamp: Self::MARKER_TIMESTAMP,
            kind: SpecialEventKind::TimestampReset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Pixel(PixelEvent),
    Special(SpecialEvent),
}

impl Event {
    pub fn timestamp(&self) -> u32 {
        match self {
            Event::Pixel(e) => e.timestamp,
            Event::Special(e) => e.timestamp,
        }
    }
}

impl From<PixelEvent> for Event {
    fn from(e: PixelEvent) -> Self {
        Event::Pixel(e)
    }
}

impl From<SpecialEvent> for Event {
    fn from(e: SpecialEvent) -> Self {
        Event::Special(e)
    }
}

/// Append-only buffer with an explicit event capacity.
///
/// Capacity is tracked separately from the backing `Vec` so growth happens in
/// well-defined doubling steps: when a push finds the buffer full, capacity
/// becomes twice the current position. Allocation failure is reported instead
/// of aborting, since the acquisition thread has to keep running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBuffer<T> {
    events: Vec<T>,
    capacity: usize,
}

impl<T> EventBuffer<T> {
    /// Allocate a buffer able to hold `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut events = Vec::new();
        events.try_reserve_exact(capacity)?;
        Ok(Self { events, capacity })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    /// Double the capacity, keeping every stored event in place.
    pub fn grow(&mut self) -> Result<()> {
        let target = self.events.len().max(self.capacity).max(1) * 2;
        self.events.try_reserve_exact(target - self.events.len())?;
        self.capacity = target;
        Ok(())
    }

    pub fn push(&mut self, event: T) -> Result<()> {
        if self.is_full() {
            self.grow()?;
        }
        self.events.push(event);
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.events
    }

    pub fn into_vec(self) -> Vec<T> {
        self.events
    }
}
