//! One slot of the delta-frame ring.

use crate::{Frame, InputWords, PlayerMask, MAX_PLAYERS, WORDS_PER_INPUT};

/// Everything known about one frame: local, real and predicted input, and optionally the
/// core state at the start of the frame.
///
/// The state buffer is allocated once, when the serialization size is first known, and
/// survives every reuse of the slot.
#[derive(Debug, Clone, Default)]
pub struct DeltaFrame {
    frame: Frame,
    used: bool,
    have_local: bool,
    have_real: PlayerMask,
    real_input: [InputWords; MAX_PLAYERS],
    simulated_input: [InputWords; MAX_PLAYERS],
    self_input: InputWords,
    state: Vec<u8>,
    state_valid: bool,
    pending_crc: Option<u32>,
}

impl DeltaFrame {
    /// Frame currently held, meaningful only if [`is_used`](Self::is_used).
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Whether the slot holds a frame.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used
    }

    /// Claims the slot for `frame`, clearing input but keeping the state allocation.
    pub fn reset_for(&mut self, frame: Frame) {
        self.frame = frame;
        self.used = true;
        self.have_local = false;
        self.have_real = PlayerMask::EMPTY;
        self.real_input = [[0; WORDS_PER_INPUT]; MAX_PLAYERS];
        self.simulated_input = [[0; WORDS_PER_INPUT]; MAX_PLAYERS];
        self.self_input = [0; WORDS_PER_INPUT];
        self.state_valid = false;
        self.pending_crc = None;
    }

    /// Releases the slot.
    pub fn clear(&mut self) {
        self.used = false;
        self.state_valid = false;
        self.pending_crc = None;
    }

    /// Whether local input has been captured.
    #[must_use]
    pub fn have_local(&self) -> bool {
        self.have_local
    }

    /// Local input words.
    #[must_use]
    pub fn self_input(&self) -> InputWords {
        self.self_input
    }

    /// Records local input.
    pub fn set_self_input(&mut self, words: InputWords) {
        self.self_input = words;
        self.have_local = true;
    }

    /// Players whose real input has arrived.
    #[must_use]
    pub fn have_real(&self) -> PlayerMask {
        self.have_real
    }

    /// Real input for a player, if it has arrived.
    #[must_use]
    pub fn real(&self, player: usize) -> Option<InputWords> {
        if self.have_real.contains(player) {
            self.real_input.get(player).copied()
        } else {
            None
        }
    }

    /// Stores confirmed input for a player.
    pub fn set_real(&mut self, player: usize, words: InputWords) {
        if let Some(slot) = self.real_input.get_mut(player) {
            *slot = words;
            self.have_real.insert(player);
        }
    }

    /// Predicted input for a player.
    #[must_use]
    pub fn simulated(&self, player: usize) -> InputWords {
        self.simulated_input
            .get(player)
            .copied()
            .unwrap_or_default()
    }

    /// Stores predicted input for a player.
    pub fn set_simulated(&mut self, player: usize, words: InputWords) {
        if let Some(slot) = self.simulated_input.get_mut(player) {
            *slot = words;
        }
    }

    /// Best known input for a player: real if present, otherwise the prediction.
    #[must_use]
    pub fn best(&self, player: usize) -> InputWords {
        self.real(player).unwrap_or_else(|| self.simulated(player))
    }

    /// Whether a serialized state for this frame is stored.
    #[must_use]
    pub fn has_state(&self) -> bool {
        self.state_valid && !self.state.is_empty()
    }

    /// The state buffer, valid or not.
    #[must_use]
    pub fn state(&self) -> &[u8] {
        &self.state
    }

    /// The state buffer for writing; call [`mark_state`](Self::mark_state) after filling it.
    pub fn state_mut(&mut self) -> &mut [u8] {
        &mut self.state
    }

    /// Records whether the state buffer holds this frame's state.
    pub fn mark_state(&mut self, valid: bool) {
        self.state_valid = valid;
    }

    /// Sizes the state buffer. Only reallocates when the size changes.
    pub fn allocate_state(&mut self, size: usize) {
        if self.state.len() != size {
            self.state = vec![0; size];
            self.state_valid = false;
        }
    }

    /// A peer's CRC waiting until we have replayed this frame.
    #[must_use]
    pub fn pending_crc(&self) -> Option<u32> {
        self.pending_crc
    }

    /// Caches or clears a peer's CRC.
    pub fn set_pending_crc(&mut self, crc: Option<u32>) {
        self.pending_crc = crc;
    }
}
