//! A deterministic core for driving sessions in integration tests.

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::use_self
)]

use std::collections::BTreeMap;

use fortress_netplay::input::device;
use fortress_netplay::{CoreInfo, Frame, FrameInput, NetplayCore, MAX_PLAYERS};

/// Size of the serialized state: frame counter and accumulator, big-endian.
pub const STATE_SIZE: usize = 8;

/// Folds ports 0 and 1 into an accumulator every frame, and remembers the accumulator
/// it produced for each frame so two peers can be compared afterwards.
///
/// Replays overwrite the history, so once a frame is confirmed on both sides its entry
/// holds the final value.
#[derive(Debug, Clone)]
pub struct StubCore {
    pub frames: u32,
    pub acc: u32,
    /// Buttons the local input driver reports.
    pub pressed: u16,
    /// Mixed into [`scripted_buttons`] so every peer presses something different.
    pub seed: u32,
    pub name: &'static str,
    pub version: &'static str,
    pub serializable: bool,
    pub resets: u32,
    /// Added to the accumulator every frame without being part of the state, which
    /// makes this core non-deterministic while set.
    pub skew: u32,
    pub history: BTreeMap<u32, u32>,
    /// Ports 0 and 1, word 0, by session frame.
    pub inputs: BTreeMap<u32, [u32; 2]>,
    /// Battery-backed RAM; none when empty.
    pub save_ram: Vec<u8>,
    devices: [u32; MAX_PLAYERS],
}

impl StubCore {
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self {
            frames: 0,
            acc: 0,
            pressed: 0,
            seed,
            name: "stub-core",
            version: "1.0",
            serializable: true,
            resets: 0,
            skew: 0,
            history: BTreeMap::new(),
            inputs: BTreeMap::new(),
            save_ram: Vec::new(),
            devices: [device::JOYPAD; MAX_PLAYERS],
        }
    }

    #[allow(dead_code)]
    #[must_use]
    pub fn named(seed: u32, name: &'static str) -> Self {
        Self {
            name,
            ..Self::new(seed)
        }
    }

    /// Loads the input driver with this core's script for `frame`.
    pub fn press_for(&mut self, frame: Frame) {
        self.pressed = scripted_buttons(self.seed, frame);
    }
}

/// Buttons held at `frame`: mostly nothing, with bursts that change every few frames so
/// predictions regularly fail.
#[must_use]
pub fn scripted_buttons(seed: u32, frame: Frame) -> u16 {
    let block = frame.as_u32() / 4;
    let x = block.wrapping_mul(2_654_435_761).wrapping_add(seed.wrapping_mul(40_503));
    if (x >> 9) % 3 == 0 {
        (x >> 16) as u16 | 1
    } else {
        0
    }
}

impl NetplayCore for StubCore {
    fn serialize_size(&mut self) -> usize {
        if self.serializable {
            STATE_SIZE
        } else {
            0
        }
    }

    fn serialize(&mut self, buf: &mut [u8]) -> bool {
        if !self.serializable || buf.len() != STATE_SIZE {
            return false;
        }
        buf[..4].copy_from_slice(&self.frames.to_be_bytes());
        buf[4..].copy_from_slice(&self.acc.to_be_bytes());
        true
    }

    fn unserialize(&mut self, buf: &[u8]) -> bool {
        if buf.len() != STATE_SIZE {
            return false;
        }
        self.frames = u32::from_be_bytes(buf[..4].try_into().unwrap());
        self.acc = u32::from_be_bytes(buf[4..].try_into().unwrap());
        true
    }

    fn run(&mut self, input: &FrameInput) {
        self.frames += 1;
        for port in 0..2 {
            let words = input.port_words(port);
            self.acc = self.acc.rotate_left(7) ^ words[0] ^ words[1].rotate_left(3);
        }
        self.acc = self.acc.wrapping_add(self.skew);
        self.history.insert(self.frames, self.acc);
        self.inputs.insert(
            input.frame().as_u32(),
            [input.port_words(0)[0], input.port_words(1)[0]],
        );
    }

    fn reset(&mut self) {
        self.frames = 0;
        self.acc = 0;
        self.resets += 1;
    }

    fn info(&self) -> CoreInfo {
        CoreInfo::new(self.name, self.version, 0x5EED_0001)
    }

    fn save_ram(&mut self) -> Option<&mut [u8]> {
        if self.save_ram.is_empty() {
            None
        } else {
            Some(self.save_ram.as_mut_slice())
        }
    }

    fn port_device(&self, port: usize) -> u32 {
        self.devices.get(port).copied().unwrap_or(device::NONE)
    }

    fn set_port_device(&mut self, port: usize, device: u32) {
        if let Some(slot) = self.devices.get_mut(port) {
            *slot = device;
        }
    }

    fn local_input(&mut self, device_type: u32, _index: u32, id: u32) -> i16 {
        if device_type == device::JOYPAD && id < device::JOYPAD_BUTTONS {
            i16::from(self.pressed & (1 << id) != 0)
        } else {
            0
        }
    }
}
