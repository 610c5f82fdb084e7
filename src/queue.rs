use std::collections::VecDeque;

use crate::track::TrackDescriptor;

/// FIFO of pending tracks for one guild.
///
/// Owned by exactly one guild actor, so `dequeue_next` cannot race an
/// `enqueue` for the same guild: both are applied in mailbox order.
#[derive(Debug, Default, Clone)]
pub struct TrackQueue {
    entries: VecDeque<TrackDescriptor>,
}

impl TrackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail. Returns the 1-based position of the first
    /// appended track, or `None` if `tracks` was empty.
    pub fn enqueue<I>(&mut self, tracks: I) -> Option<usize>
    where
        I: IntoIterator<Item = TrackDescriptor>,
    {
        let before = self.entries.len();
        self.entries.extend(tracks);
        (self.entries.len() > before).then_some(before + 1)
    }

    pub fn dequeue_next(&mut self) -> Option<TrackDescriptor> {
        self.entries.pop_front()
    }

    pub fn peek_all(&self) -> Vec<TrackDescriptor> {
        self.entries.iter().cloned().collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.entries.iter().map(|t| t.title().to_string()).collect()
    }

    /// Drops every pending entry, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
