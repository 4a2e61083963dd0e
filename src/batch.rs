use crate::event::{Event, PixelEvent, SpecialEvent, SpecialEventKind};

/// A sealed group of events handed to the consumer.
///
/// Batches are built by the acquisition thread and never change after they
/// are sealed. Each event type keeps its own buffer, so pixel events are in
/// decode order and special events are in decode order, but nothing is said
/// about ordering between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    device_id: u16,
    wrap_overflow: u32,
    timestamp_reset: bool,
    pixels: Option<Vec<PixelEvent>>,
    specials: Option<Vec<SpecialEvent>>,
    lowest_timestamp: u32,
    highest_timestamp: u32,
}

impl EventBatch {
    pub(crate) fn seal(
        device_id: u16,
        wrap_overflow: u32,
        timestamp_reset: bool,
        pixels: Option<Vec<PixelEvent>>,
        specials: Option<Vec<SpecialEvent>>,
    ) -> Self {
        let stamps = pixels
            .iter()
            .flatten()
            .map(|e| e.timestamp)
            .chain(specials.iter().flatten().map(|e| e.timestamp));

        let (lowest, highest) = stamps.fold((u32::MAX, 0u32), |(lo, hi), ts| {
            (lo.min(ts), hi.max(ts))
        });
        let lowest = if lowest > highest { 0 } else { lowest };

        Self {
            device_id,
            wrap_overflow,
            timestamp_reset,
            pixels: pixels.filter(|v| !v.is_empty()),
            specials: specials.filter(|v| !v.is_empty()),
            lowest_timestamp: lowest,
            highest_timestamp: highest,
        }
    }

    /// Batch that only announces a timestamp reset.
    pub(crate) fn reset_marker(device_id: u16) -> Self {
        Self::seal(
            device_id,
            0,
            true,
            None,
            Some(vec![SpecialEvent::timestamp_reset()]),
        )
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Overflow epoch the timestamps belong to.
    pub fn wrap_overflow(&self) -> u32 {
        self.wrap_overflow
    }

    /// `true` for the marker batch emitted after a timestamp reset.
    pub fn is_timestamp_reset(&self) -> bool {
        self.timestamp_reset
    }

    /// `true` if the batch carries a big-wrap marker.
    pub fn has_timestamp_wrap(&self) -> bool {
        self.special_events()
            .iter()
            .any(|e| e.kind == SpecialEventKind::TimestampWrap)
    }

    pub fn pixel_events(&self) -> &[PixelEvent] {
        self.pixels.as_deref().unwrap_or(&[])
    }

    pub fn special_events(&self) -> &[SpecialEvent] {
        self.specials.as_deref().unwrap_or(&[])
    }

    pub fn pixel_count(&self) -> usize {
        self.pixel_events().len()
    }

    pub fn special_count(&self) -> usize {
        self.special_events().len()
    }

    pub fn event_count(&self) -> usize {
        self.pixel_count() + self.special_count()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    pub fn lowest_timestamp(&self) -> u32 {
        self.lowest_timestamp
    }

    pub fn highest_timestamp(&self) -> u32 {
        self.highest_timestamp
    }

    /// All events, pixel buffer first.
    pub fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.pixel_events()
            .iter()
            .copied()
            .map(Event::Pixel)
            .chain(self.special_events().iter().copied().map(Event::Special))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(timestamp: u32) -> PixelEvent {
        PixelEvent {
            timestamp,
            x: 1,
            y: 2,
            polarity: true,
        }
    }

    #[test]
    fn bounds_span_both_types() {
        let batch = EventBatch::seal(
            5,
            0,
            false,
            Some(vec![pixel(40), pixel(10), pixel(30)]),
            Some(vec![SpecialEvent::timestamp_wrap()]),
        );
        assert_eq!(batch.device_id(), 5);
        assert_eq!(batch.lowest_timestamp(), 10);
        assert_eq!(batch.highest_timestamp(), i32::MAX as u32);
        assert_eq!(batch.pixel_count(), 3);
        assert_eq!(batch.special_count(), 1);
        assert!(batch.has_timestamp_wrap());
        assert_eq!(batch.events().count(), 4);
    }

    #[test]
    fn empty_buffers_are_not_attached() {
        let batch = EventBatch::seal(0, 0, false, Some(vec![pixel(3)]), Some(Vec::new()));
        assert!(batch.specials.is_none());
        assert_eq!(batch.lowest_timestamp(), 3);
        assert_eq!(batch.highest_timestamp(), 3);
    }

    #[test]
    fn reset_marker_carries_one_event() {
        let batch = EventBatch::reset_marker(9);
        assert!(batch.is_timestamp_reset());
        assert_eq!(batch.pixel_count(), 0);
        assert_eq!(
            batch.special_events(),
            &[SpecialEvent::timestamp_reset()]
        );
    }
}
