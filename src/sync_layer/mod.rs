//! # Delta-frame ring
//!
//! The session keeps the recent past in a fixed ring of [`DeltaFrame`] slots. The slot
//! for a frame is always `frame % len`, so every pointer the session keeps (self, run,
//! other, unread, each player's read position) is simply a [`Frame`] and the slot is
//! derived from it on demand.
//!
//! A slot may be reclaimed for a new frame only once its previous frame has been
//! reconciled, i.e. it is older than the session's `other_frame`. Until then, capturing
//! input or reading from the network into that slot has to wait; this is what bounds
//! how far ahead one peer can run.
//!
//! ```
//! use fortress_netplay::{DeltaRing, Frame};
//!
//! let mut ring = DeltaRing::new(4);
//! assert!(ring.ready(Frame::new(0), Frame::ZERO));
//! assert!(ring.ready(Frame::new(3), Frame::ZERO));
//!
//! // Frame 4 maps onto frame 0's slot, which has not been reconciled yet.
//! assert!(!ring.ready(Frame::new(4), Frame::ZERO));
//! assert!(ring.ready(Frame::new(4), Frame::new(1)));
//! ```

mod delta_frame;

pub use delta_frame::DeltaFrame;

use crate::Frame;

/// A typed position in the ring, always within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingIndex(usize);

impl RingIndex {
    /// Raw slot number.
    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// Fixed-capacity ring of delta frames.
#[derive(Debug, Clone)]
pub struct DeltaRing {
    frames: Vec<DeltaFrame>,
}

impl DeltaRing {
    /// Creates a ring of `len` unused slots (at least one).
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            frames: vec![DeltaFrame::default(); len.max(1)],
        }
    }

    /// Ring size for a given stall allowance: two more than the allowance, doubled on
    /// the server, which has to hold input for clients at different positions.
    #[must_use]
    pub fn size_for(stall_frames: u32, is_server: bool) -> usize {
        (stall_frames as usize + 2) * if is_server { 2 } else { 1 }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the ring has no slots. Never true.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Slot for a frame.
    #[must_use]
    pub fn index(&self, frame: Frame) -> RingIndex {
        RingIndex(frame.as_u32() as usize % self.frames.len())
    }

    /// The following slot.
    #[must_use]
    pub fn next(&self, index: RingIndex) -> RingIndex {
        RingIndex((index.0 + 1) % self.frames.len())
    }

    /// The preceding slot.
    #[must_use]
    pub fn prev(&self, index: RingIndex) -> RingIndex {
        RingIndex((index.0 + self.frames.len() - 1) % self.frames.len())
    }

    /// A slot by index.
    #[must_use]
    pub fn get(&self, index: RingIndex) -> &DeltaFrame {
        &self.frames[index.0]
    }

    /// A slot by index, mutably.
    pub fn get_mut(&mut self, index: RingIndex) -> &mut DeltaFrame {
        &mut self.frames[index.0]
    }

    /// The slot a frame maps to, whatever it currently holds.
    #[must_use]
    pub fn slot(&self, frame: Frame) -> &DeltaFrame {
        self.get(self.index(frame))
    }

    /// The slot a frame maps to, mutably.
    pub fn slot_mut(&mut self, frame: Frame) -> &mut DeltaFrame {
        let index = self.index(frame);
        self.get_mut(index)
    }

    /// Prepares the slot for `frame` if it is free.
    ///
    /// Returns `true` if the slot already holds `frame`, or was unused, or held a frame
    /// older than `other_frame` (which is then discarded). Returns `false` when the slot
    /// still holds a frame that has not been reconciled.
    pub fn ready(&mut self, frame: Frame, other_frame: Frame) -> bool {
        let slot = self.slot_mut(frame);
        if slot.is_used() {
            if slot.frame() == frame {
                return true;
            }
            if other_frame <= slot.frame() {
                return false;
            }
        }
        slot.reset_for(frame);
        true
    }

    /// The slot for `frame` if it still holds that frame.
    #[must_use]
    pub fn find(&self, frame: Frame) -> Option<&DeltaFrame> {
        let slot = self.slot(frame);
        (slot.is_used() && slot.frame() == frame).then_some(slot)
    }

    /// Mutable variant of [`find`](Self::find).
    pub fn find_mut(&mut self, frame: Frame) -> Option<&mut DeltaFrame> {
        let slot = self.slot_mut(frame);
        if slot.is_used() && slot.frame() == frame {
            Some(slot)
        } else {
            None
        }
    }

    /// Sizes every slot's state buffer.
    pub fn allocate_states(&mut self, size: usize) {
        for frame in &mut self.frames {
            frame.allocate_state(size);
        }
    }

    /// Size of the per-slot state buffer, 0 before allocation.
    #[must_use]
    pub fn state_size(&self) -> usize {
        self.frames.first().map_or(0, |f| f.state().len())
    }

    /// Releases every slot, keeping state allocations.
    pub fn clear(&mut self) {
        for frame in &mut self.frames {
            frame.clear();
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn size_doubles_on_server() {
        assert_eq!(DeltaRing::size_for(60, false), 62);
        assert_eq!(DeltaRing::size_for(60, true), 124);
        assert_eq!(DeltaRing::size_for(0, false), 2);
    }

    #[test]
    fn index_wraps_and_neighbours() {
        let ring = DeltaRing::new(5);
        assert_eq!(ring.index(Frame::new(7)).get(), 2);
        let last = ring.index(Frame::new(4));
        assert_eq!(ring.next(last).get(), 0);
        assert_eq!(ring.prev(RingIndex(0)).get(), 4);
    }

    #[test]
    fn ready_same_frame_keeps_data() {
        let mut ring = DeltaRing::new(3);
        assert!(ring.ready(Frame::new(1), Frame::ZERO));
        ring.slot_mut(Frame::new(1)).set_real(0, [1, 0, 0]);
        assert!(ring.ready(Frame::new(1), Frame::ZERO));
        assert_eq!(ring.find(Frame::new(1)).unwrap().real(0), Some([1, 0, 0]));
    }

    #[test]
    fn reclaimed_slot_is_reset() {
        let mut ring = DeltaRing::new(2);
        ring.allocate_states(8);
        assert!(ring.ready(Frame::new(0), Frame::ZERO));
        ring.slot_mut(Frame::new(0)).set_real(0, [1, 0, 0]);
        ring.slot_mut(Frame::new(0)).mark_state(true);
        assert!(ring.ready(Frame::new(2), Frame::new(1)));
        let slot = ring.find(Frame::new(2)).unwrap();
        assert_eq!(slot.real(0), None);
        assert!(!slot.has_state());
        assert_eq!(slot.state().len(), 8);
        assert!(ring.find(Frame::new(0)).is_none());
    }

    #[test]
    fn clear_releases_every_slot() {
        let mut ring = DeltaRing::new(3);
        for f in 0..3 {
            assert!(ring.ready(Frame::new(f), Frame::ZERO));
        }
        ring.clear();
        assert!(ring.find(Frame::new(0)).is_none());
        assert!(ring.ready(Frame::new(10), Frame::ZERO));
    }

    #[test]
    fn state_size_tracks_allocation() {
        let mut ring = DeltaRing::new(3);
        assert_eq!(ring.state_size(), 0);
        ring.allocate_states(32);
        assert_eq!(ring.state_size(), 32);
    }
}
