//! A tiny deterministic core for unit tests.

use crate::input::device;
use crate::{CoreInfo, FrameInput, InputWords, NetplayCore, MAX_PLAYERS};

/// Folds every port's input into a running value, so any input difference shows up in
/// the serialized state.
#[derive(Debug, Clone, Default)]
pub(crate) struct TestCore {
    pub(crate) frames: u32,
    pub(crate) acc: u32,
    pub(crate) buttons: u16,
    pub(crate) seen: Vec<[InputWords; 2]>,
    pub(crate) serializable: bool,
    pub(crate) devices: [u32; MAX_PLAYERS],
}

impl TestCore {
    pub(crate) fn new() -> Self {
        Self {
            serializable: true,
            devices: [device::JOYPAD; MAX_PLAYERS],
            ..Self::default()
        }
    }

    pub(crate) fn stateless() -> Self {
        Self {
            serializable: false,
            ..Self::new()
        }
    }
}

impl NetplayCore for TestCore {
    fn serialize_size(&mut self) -> usize {
        if self.serializable {
            8
        } else {
            0
        }
    }

    fn serialize(&mut self, buf: &mut [u8]) -> bool {
        if !self.serializable || buf.len() != 8 {
            return false;
        }
        buf[..4].copy_from_slice(&self.frames.to_be_bytes());
        buf[4..].copy_from_slice(&self.acc.to_be_bytes());
        true
    }

    fn unserialize(&mut self, buf: &[u8]) -> bool {
        if buf.len() != 8 {
            return false;
        }
        let mut frames = [0; 4];
        let mut acc = [0; 4];
        frames.copy_from_slice(&buf[..4]);
        acc.copy_from_slice(&buf[4..]);
        self.frames = u32::from_be_bytes(frames);
        self.acc = u32::from_be_bytes(acc);
        true
    }

    fn run(&mut self, input: &FrameInput) {
        self.frames += 1;
        let ports = [input.port_words(0), input.port_words(1)];
        for words in ports {
            self.acc = self.acc.rotate_left(5) ^ words[0];
        }
        self.seen.push(ports);
    }

    fn reset(&mut self) {
        self.frames = 0;
        self.acc = 0;
    }

    fn info(&self) -> CoreInfo {
        CoreInfo::new("test-core", "1.0", 0xC0FF_EE00)
    }

    fn save_ram(&mut self) -> Option<&mut [u8]> {
        None
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
        if device_type == device::JOYPAD && id < 16 {
            i16::from(self.buttons & (1 << id) != 0)
        } else {
            0
        }
    }
}
