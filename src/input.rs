//! Input words, devices and how several players' input becomes one port's input.
//!
//! Each player's input for a frame is [`WORDS_PER_INPUT`](crate::WORDS_PER_INPUT) words:
//! word 0 carries the joypad buttons (bit `n` is button `n`), words 1 and 2 carry the
//! two analog sticks with x in the low and y in the high 16 bits.
//!
//! ```
//! use fortress_netplay::input::{decode_input, device};
//!
//! let words = [0b101, 0xFFFF_0010, 0];
//! assert_eq!(decode_input(&words, device::JOYPAD, 0, 0), 1);
//! assert_eq!(decode_input(&words, device::JOYPAD, 0, 1), 0);
//! assert_eq!(decode_input(&words, device::ANALOG, 0, 0), 16);
//! assert_eq!(decode_input(&words, device::ANALOG, 0, 1), -1);
//! ```

use smallvec::SmallVec;

use crate::{Frame, InputWords, NetplayCore, MAX_PLAYERS, WORDS_PER_INPUT};

/// Device type ids, as reported by [`NetplayCore::port_device`].
pub mod device {
    /// Nothing connected.
    pub const NONE: u32 = 0;
    /// Digital joypad.
    pub const JOYPAD: u32 = 1;
    /// Mouse.
    pub const MOUSE: u32 = 2;
    /// Keyboard.
    pub const KEYBOARD: u32 = 3;
    /// Light gun.
    pub const LIGHTGUN: u32 = 4;
    /// Joypad with analog sticks.
    pub const ANALOG: u32 = 5;
    /// Base type bits; subclassed devices keep their base type here.
    pub const MASK: u32 = 0xff;
    /// Joypad id that asks for every button at once.
    pub const JOYPAD_ID_MASK: u32 = 256;
    /// Number of joypad buttons in word 0.
    pub const JOYPAD_BUTTONS: u32 = 16;
}

/// How digital buttons of several players sharing a device are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigitalShare {
    /// No preference; behaves like [`DigitalShare::Or`].
    #[default]
    None,
    /// A button is down if anyone holds it.
    Or,
    /// A button is down if an odd number of players hold it.
    Xor,
    /// A button is down if more than half the players hold it.
    Vote,
}

/// How analog axes of several players sharing a device are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AnalogShare {
    /// No preference; behaves like [`AnalogShare::Max`].
    #[default]
    None,
    /// The deflection furthest from center wins.
    Max,
    /// The mean deflection.
    Average,
}

/// Share mode for one device, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShareMode {
    /// Button rule.
    pub digital: DigitalShare,
    /// Axis rule.
    pub analog: AnalogShare,
}

impl ShareMode {
    const DIGITAL_BITS: u8 = 0x07;
    const ANALOG_BITS: u8 = 0x18;

    /// Creates a share mode.
    #[must_use]
    pub const fn new(digital: DigitalShare, analog: AnalogShare) -> Self {
        Self { digital, analog }
    }

    /// Wire encoding.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        let digital = match self.digital {
            DigitalShare::None => 0,
            DigitalShare::Or => 1,
            DigitalShare::Xor => 2,
            DigitalShare::Vote => 3,
        };
        let analog = match self.analog {
            AnalogShare::None => 0,
            AnalogShare::Max => 0x08,
            AnalogShare::Average => 0x10,
        };
        digital | analog
    }

    /// Decodes the wire byte; unknown values fall back to no preference.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        let digital = match value & Self::DIGITAL_BITS {
            1 => DigitalShare::Or,
            2 => DigitalShare::Xor,
            3 => DigitalShare::Vote,
            _ => DigitalShare::None,
        };
        let analog = match value & Self::ANALOG_BITS {
            0x08 => AnalogShare::Max,
            0x10 => AnalogShare::Average,
            _ => AnalogShare::None,
        };
        Self { digital, analog }
    }
}

/// Decodes one input value out of a player's words.
#[must_use]
pub fn decode_input(words: &InputWords, device_type: u32, index: u32, id: u32) -> i16 {
    match device_type & device::MASK {
        device::JOYPAD => {
            if id == device::JOYPAD_ID_MASK {
                (words[0] & 0xFFFF) as u16 as i16
            } else if id < device::JOYPAD_BUTTONS {
                ((words[0] >> id) & 1) as i16
            } else {
                0
            }
        },
        device::ANALOG => {
            if index >= 2 || id >= 2 {
                return 0;
            }
            let word = words[1 + index as usize];
            (word >> (16 * id)) as u16 as i16
        },
        _ => 0,
    }
}

/// Combines several players' words for one device.
#[must_use]
pub fn merge(share: ShareMode, inputs: &[InputWords]) -> InputWords {
    match inputs {
        [] => [0; WORDS_PER_INPUT],
        [only] => *only,
        _ => {
            let mut out = [0; WORDS_PER_INPUT];
            out[0] = merge_digital(share.digital, inputs);
            for word in 1..WORDS_PER_INPUT {
                let low = merge_axis(share.analog, inputs, word, 0);
                let high = merge_axis(share.analog, inputs, word, 16);
                out[word] = u32::from(low as u16) | (u32::from(high as u16) << 16);
            }
            out
        },
    }
}

fn merge_digital(share: DigitalShare, inputs: &[InputWords]) -> u32 {
    match share {
        DigitalShare::None | DigitalShare::Or => inputs.iter().fold(0, |acc, w| acc | w[0]),
        DigitalShare::Xor => inputs.iter().fold(0, |acc, w| acc ^ w[0]),
        DigitalShare::Vote => {
            let mut out = 0;
            for bit in 0..32 {
                let held = inputs.iter().filter(|w| w[0] & (1 << bit) != 0).count();
                if held * 2 > inputs.len() {
                    out |= 1 << bit;
                }
            }
            out
        },
    }
}

fn merge_axis(share: AnalogShare, inputs: &[InputWords], word: usize, shift: u32) -> i16 {
    let values = inputs.iter().map(|w| (w[word] >> shift) as u16 as i16);
    match share {
        AnalogShare::None | AnalogShare::Max => values
            .max_by_key(|v| i32::from(*v).abs())
            .unwrap_or(0),
        AnalogShare::Average => {
            let sum: i32 = values.map(i32::from).sum();
            (sum / inputs.len() as i32) as i16
        },
    }
}

/// Reads the local input driver into words.
pub fn capture_local<C: NetplayCore + ?Sized>(core: &mut C) -> InputWords {
    let mut words = [0; WORDS_PER_INPUT];
    for id in 0..device::JOYPAD_BUTTONS {
        if core.local_input(device::JOYPAD, 0, id) != 0 {
            words[0] |= 1 << id;
        }
    }
    for index in 0..2_u32 {
        let x = core.local_input(device::ANALOG, index, 0) as u16;
        let y = core.local_input(device::ANALOG, index, 1) as u16;
        words[1 + index as usize] = u32::from(x) | (u32::from(y) << 16);
    }
    words
}

/// The input the core sees for one frame, already resolved per port.
///
/// Handed to [`NetplayCore::run`]. Port flipping and device sharing have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInput {
    frame: Frame,
    is_replay: bool,
    ports: [InputWords; MAX_PLAYERS],
    devices: [u32; MAX_PLAYERS],
}

impl FrameInput {
    /// Builds a resolved input.
    #[must_use]
    pub fn new(
        frame: Frame,
        is_replay: bool,
        ports: [InputWords; MAX_PLAYERS],
        devices: [u32; MAX_PLAYERS],
    ) -> Self {
        Self {
            frame,
            is_replay,
            ports,
            devices,
        }
    }

    /// The frame being run.
    #[must_use]
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Whether this run re-simulates a frame after a rollback.
    ///
    /// Cores should skip audio and video output for replayed frames.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.is_replay
    }

    /// Raw words for a port.
    #[must_use]
    pub fn port_words(&self, port: usize) -> InputWords {
        self.ports.get(port).copied().unwrap_or_default()
    }

    /// Device type the server assigned to a port.
    #[must_use]
    pub fn port_device(&self, port: usize) -> u32 {
        self.devices.get(port).copied().unwrap_or(device::NONE)
    }

    /// One input value, the way a core's input-state callback asks for it.
    ///
    /// Ports beyond [`MAX_PLAYERS`] read as 0.
    #[must_use]
    pub fn state(&self, port: usize, device_type: u32, index: u32, id: u32) -> i16 {
        match self.ports.get(port) {
            Some(words) => decode_input(words, device_type, index, id),
            None => 0,
        }
    }
}

/// Players feeding each device, as collected for one frame.
pub(crate) type PortPlayers = SmallVec<[InputWords; 4]>;

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
    fn joypad_mask_returns_all_buttons() {
        let words = [0x0001_8003, 0, 0];
        assert_eq!(
            decode_input(&words, device::JOYPAD, 0, device::JOYPAD_ID_MASK),
            0x8003_u16 as i16
        );
        assert_eq!(decode_input(&words, device::JOYPAD, 0, 15), 1);
        assert_eq!(decode_input(&words, device::JOYPAD, 0, 16), 0);
    }

    #[test]
    fn other_devices_read_zero() {
        let words = [u32::MAX; WORDS_PER_INPUT];
        assert_eq!(decode_input(&words, device::MOUSE, 0, 0), 0);
        assert_eq!(decode_input(&words, device::KEYBOARD, 0, 1), 0);
        assert_eq!(decode_input(&words, device::ANALOG, 2, 0), 0);
    }

    #[test]
    fn share_mode_byte_roundtrips_known_values() {
        let mode = ShareMode::new(DigitalShare::Vote, AnalogShare::Average);
        assert_eq!(mode.to_u8(), 0x13);
        assert_eq!(ShareMode::from_u8(0x13), mode);
        assert_eq!(ShareMode::from_u8(0xE0), ShareMode::default());
    }

    #[test]
    fn digital_merges() {
        let a = [0b0011, 0, 0];
        let b = [0b0110, 0, 0];
        let c = [0b0100, 0, 0];
        let or = ShareMode::new(DigitalShare::Or, AnalogShare::None);
        let xor = ShareMode::new(DigitalShare::Xor, AnalogShare::None);
        let vote = ShareMode::new(DigitalShare::Vote, AnalogShare::None);
        assert_eq!(merge(or, &[a, b])[0], 0b0111);
        assert_eq!(merge(xor, &[a, b])[0], 0b0101);
        assert_eq!(merge(vote, &[a, b, c])[0], 0b0110);
    }

    #[test]
    fn analog_max_keeps_largest_deflection() {
        let left = [0, u32::from((-300_i16) as u16), 0];
        let right = [0, 200, 0];
        let max = ShareMode::new(DigitalShare::None, AnalogShare::Max);
        let merged = merge(max, &[left, right]);
        assert_eq!(decode_input(&merged, device::ANALOG, 0, 0), -300);
    }

    #[test]
    fn analog_average() {
        let a = [0, 100 | (10 << 16), 0];
        let b = [0, 300 | (30 << 16), 0];
        let avg = ShareMode::new(DigitalShare::None, AnalogShare::Average);
        let merged = merge(avg, &[a, b]);
        assert_eq!(decode_input(&merged, device::ANALOG, 0, 0), 200);
        assert_eq!(decode_input(&merged, device::ANALOG, 0, 1), 20);
    }

    #[test]
    fn single_player_passes_through() {
        let words = [7, 8, 9];
        assert_eq!(merge(ShareMode::default(), &[words]), words);
        assert_eq!(merge(ShareMode::default(), &[]), [0; WORDS_PER_INPUT]);
    }

    #[test]
    fn frame_input_reads_per_port() {
        let mut ports = [[0; WORDS_PER_INPUT]; MAX_PLAYERS];
        ports[1] = [1, 5, 0];
        let mut devices = [device::JOYPAD; MAX_PLAYERS];
        devices[1] = device::ANALOG;
        let input = FrameInput::new(Frame::new(4), false, ports, devices);
        assert_eq!(input.state(1, device::ANALOG, 0, 0), 5);
        assert_eq!(input.state(1, device::JOYPAD, 0, 0), 1);
        assert_eq!(input.state(0, device::JOYPAD, 0, 0), 0);
        assert_eq!(input.port_device(1), device::ANALOG);
        assert_eq!(input.state(MAX_PLAYERS, device::JOYPAD, 0, 0), 0);
        assert_eq!(input.port_words(1), [1, 5, 0]);
        assert_eq!(input.frame(), Frame::new(4));
        assert!(!input.is_replay());
    }
}
