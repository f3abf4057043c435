//! Wire commands.
//!
//! Every command travels as `[u32 id][u32 payload_size][payload]`, all big-endian.
//! [`CommandId`] names the wire ids and knows how large each payload may be;
//! [`Command`] is the decoded form with typed payloads.

use serde::{Deserialize, Serialize};

use crate::error::NetplayError;
use crate::network::codec::{self, CodecError, CodecResult};
use crate::{Frame, InputWords, MAX_PLAYERS, NICK_LEN, PASS_HASH_LEN, WORDS_PER_INPUT};

/// Size of a command header on the wire.
pub const HEADER_LEN: usize = 8;

/// Set on the player word of INPUT when the data is the server's own.
pub const INPUT_BIT_SERVER: u32 = 0x8000_0000;

/// MODE: the change concerns the receiver.
pub const MODE_BIT_YOU: u32 = 0x8000_0000;
/// MODE: the player is now playing.
pub const MODE_BIT_PLAYING: u32 = 0x4000_0000;
/// MODE: the player plays in slave mode.
pub const MODE_BIT_SLAVE: u32 = 0x2000_0000;

/// SYNC: set on the connected-players word when the server is paused.
pub const SYNC_PAUSED_BIT: u32 = 0x8000_0000;

/// PLAY: the client asks to play as a slave.
pub const PLAY_FLAG_SLAVE: u32 = 0x1;

/// Size of the fixed part of an INFO payload.
pub const INFO_LEN: usize = NICK_LEN * 2 + 4;

/// Size of an INPUT payload.
pub const INPUT_LEN: usize = (2 + WORDS_PER_INPUT) * 4;

/// Size of the fixed part of a SYNC payload, before the save-RAM.
pub const SYNC_FIXED_LEN: usize = 4 * 3 + MAX_PLAYERS * 4 + MAX_PLAYERS + MAX_PLAYERS * 4 + NICK_LEN;

/// Wire ids of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    /// Acknowledgement, carries nothing.
    Ack = 0x00,
    /// Negative acknowledgement; the sender is about to hang up.
    Nak = 0x01,
    /// Orderly disconnect.
    Disconnect = 0x02,
    /// One player's input for one frame.
    Input = 0x03,
    /// The server has no input of its own for a frame.
    NoInput = 0x04,
    /// Nickname.
    Nick = 0x20,
    /// Salted password hash.
    Password = 0x21,
    /// Core identity.
    Info = 0x22,
    /// Initial session state, server to client.
    Sync = 0x23,
    /// Client asks to spectate.
    Spectate = 0x24,
    /// Client asks to play.
    Play = 0x25,
    /// A player changed mode.
    Mode = 0x26,
    /// A PLAY request was refused.
    ModeRefused = 0x27,
    /// State checksum for a frame.
    Crc = 0x40,
    /// Ask the peer for a savestate.
    RequestSavestate = 0x41,
    /// A (possibly compressed) savestate.
    LoadSavestate = 0x42,
    /// The sender paused.
    Pause = 0x43,
    /// The sender resumed.
    Resume = 0x44,
    /// Server asks a client to hold for some frames.
    Stall = 0x45,
    /// The core was reset at a frame.
    Reset = 0x46,
    /// Ports 0 and 1 swap at a frame.
    FlipPlayers = 0x60,
}

/// How large a payload may be for a given command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// Exactly this many bytes.
    Exact(usize),
    /// One of two sizes.
    Either(usize, usize),
    /// At least `min` bytes, at most the limit supplied by the session.
    Bounded {
        /// Smallest valid size.
        min: usize,
    },
}

/// Size limits that depend on the session rather than the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    /// Largest savestate payload accepted, including its 8-byte prefix.
    pub max_savestate: usize,
    /// Largest save-RAM accepted in SYNC.
    pub max_save_ram: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_savestate: 8,
            max_save_ram: 1 << 20,
        }
    }
}

impl CommandId {
    /// Maps a wire id, `None` if unknown.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x00 => Self::Ack,
            0x01 => Self::Nak,
            0x02 => Self::Disconnect,
            0x03 => Self::Input,
            0x04 => Self::NoInput,
            0x20 => Self::Nick,
            0x21 => Self::Password,
            0x22 => Self::Info,
            0x23 => Self::Sync,
            0x24 => Self::Spectate,
            0x25 => Self::Play,
            0x26 => Self::Mode,
            0x27 => Self::ModeRefused,
            0x40 => Self::Crc,
            0x41 => Self::RequestSavestate,
            0x42 => Self::LoadSavestate,
            0x43 => Self::Pause,
            0x44 => Self::Resume,
            0x45 => Self::Stall,
            0x46 => Self::Reset,
            0x60 => Self::FlipPlayers,
            _ => return None,
        })
    }

    /// The wire id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// The payload size rule for this command.
    #[must_use]
    pub const fn payload_rule(self) -> PayloadRule {
        match self {
            Self::Ack
            | Self::Nak
            | Self::Disconnect
            | Self::Spectate
            | Self::RequestSavestate
            | Self::Resume => PayloadRule::Exact(0),
            Self::Input => PayloadRule::Exact(INPUT_LEN),
            Self::NoInput
            | Self::ModeRefused
            | Self::Stall
            | Self::Reset
            | Self::FlipPlayers => PayloadRule::Exact(4),
            Self::Nick | Self::Pause => PayloadRule::Exact(NICK_LEN),
            Self::Password => PayloadRule::Exact(PASS_HASH_LEN),
            Self::Info => PayloadRule::Either(0, INFO_LEN),
            Self::Play => PayloadRule::Either(0, 4),
            Self::Mode | Self::Crc => PayloadRule::Exact(8),
            Self::Sync => PayloadRule::Bounded {
                min: SYNC_FIXED_LEN,
            },
            Self::LoadSavestate => PayloadRule::Bounded { min: 8 },
        }
    }

    /// Validates a header's announced payload size before the payload is awaited.
    pub fn check_size(self, size: usize, limits: &PayloadLimits) -> Result<(), NetplayError> {
        let ok = match self.payload_rule() {
            PayloadRule::Exact(n) => size == n,
            PayloadRule::Either(a, b) => size == a || size == b,
            PayloadRule::Bounded { min } => {
                let max = match self {
                    Self::Sync => SYNC_FIXED_LEN + limits.max_save_ram,
                    _ => limits.max_savestate,
                };
                size >= min && size <= max
            },
        };
        if ok {
            Ok(())
        } else {
            Err(NetplayError::violation(format!(
                "{:?} with unexpected payload size {}",
                self, size
            )))
        }
    }
}

/// Why a PLAY request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeRefusedReason {
    /// Unspecified.
    Other,
    /// The client authenticated with the spectate password.
    Unprivileged,
    /// Every player slot is taken.
    NoSlots,
    /// The client asked again too quickly.
    TooFast,
}

impl ModeRefusedReason {
    /// The wire value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Other => 0,
            Self::Unprivileged => 1,
            Self::NoSlots => 2,
            Self::TooFast => 3,
        }
    }

    /// Maps a wire value; unknown values become [`ModeRefusedReason::Other`].
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Unprivileged,
            2 => Self::NoSlots,
            3 => Self::TooFast,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ModeRefusedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other => write!(f, "refused"),
            Self::Unprivileged => write!(f, "not allowed to play"),
            Self::NoSlots => write!(f, "no free player slots"),
            Self::TooFast => write!(f, "asked too quickly"),
        }
    }
}

/// INPUT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPayload {
    /// Frame the input belongs to.
    pub frame: Frame,
    /// Player slot, with [`INPUT_BIT_SERVER`] when it is the server's own input.
    pub player: u32,
    /// The input words.
    pub words: InputWords,
}

impl InputPayload {
    /// Player slot without the server bit.
    #[must_use]
    pub const fn player_slot(&self) -> usize {
        (self.player & !INPUT_BIT_SERVER) as usize
    }

    /// Whether the input is the server's own.
    #[must_use]
    pub const fn from_server(&self) -> bool {
        self.player & INPUT_BIT_SERVER != 0
    }
}

/// INFO payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPayload {
    /// Core library name.
    pub core_name: String,
    /// Core library version.
    pub core_version: String,
    /// Content CRC32.
    pub content_crc: u32,
}

#[derive(Serialize, Deserialize)]
struct InfoWire {
    core_name: [u8; NICK_LEN],
    core_version: [u8; NICK_LEN],
    content_crc: u32,
}

/// MODE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePayload {
    /// First frame the mode applies to.
    pub frame: Frame,
    /// The change concerns the receiver.
    pub you: bool,
    /// The player is now playing.
    pub playing: bool,
    /// The player plays in slave mode.
    pub slave: bool,
    /// Player slot.
    pub player: u16,
}

impl ModePayload {
    /// Packs the flag word.
    #[must_use]
    pub fn mode_word(&self) -> u32 {
        let mut word = u32::from(self.player);
        if self.you {
            word |= MODE_BIT_YOU;
        }
        if self.playing {
            word |= MODE_BIT_PLAYING;
        }
        if self.slave {
            word |= MODE_BIT_SLAVE;
        }
        word
    }

    /// Unpacks the flag word.
    #[must_use]
    pub fn from_words(frame: Frame, word: u32) -> Self {
        Self {
            frame,
            you: word & MODE_BIT_YOU != 0,
            playing: word & MODE_BIT_PLAYING != 0,
            slave: word & MODE_BIT_SLAVE != 0,
            player: (word & 0xFFFF) as u16,
        }
    }
}

/// Fixed part of SYNC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncHeader {
    /// The server's current frame.
    pub frame: Frame,
    /// Connected players, with [`SYNC_PAUSED_BIT`] if the server is paused.
    pub connected_players: u32,
    /// Frame the current flip state takes effect, 0 if ports are not flipped.
    pub flip_frame: u32,
    /// Device type per port.
    pub devices: [u32; MAX_PLAYERS],
    /// Share mode per device.
    pub share_modes: [u8; MAX_PLAYERS],
    /// Bitmap of the players feeding each device.
    pub client_devices: [u32; MAX_PLAYERS],
    /// The client's (possibly de-duplicated) nickname, NUL padded.
    pub nick: [u8; NICK_LEN],
}

/// SYNC payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPayload {
    /// Fixed fields.
    pub header: SyncHeader,
    /// Save-RAM contents.
    pub save_ram: Vec<u8>,
}

/// LOAD_SAVESTATE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSavestatePayload {
    /// Frame the state belongs to.
    pub frame: Frame,
    /// Size of the state once decompressed.
    pub inflated_size: u32,
    /// The encoded state.
    pub data: Vec<u8>,
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ACK.
    Ack,
    /// NAK.
    Nak,
    /// DISCONNECT.
    Disconnect,
    /// INPUT.
    Input(InputPayload),
    /// NOINPUT.
    NoInput {
        /// Frame without server input.
        frame: Frame,
    },
    /// NICK.
    Nick(String),
    /// PASSWORD, as hex text.
    Password([u8; PASS_HASH_LEN]),
    /// INFO; `None` when the sender has no core loaded.
    Info(Option<InfoPayload>),
    /// SYNC.
    Sync(Box<SyncPayload>),
    /// SPECTATE.
    Spectate,
    /// PLAY.
    Play {
        /// Slave mode requested.
        slave: bool,
    },
    /// MODE.
    Mode(ModePayload),
    /// MODE_REFUSED.
    ModeRefused(ModeRefusedReason),
    /// CRC.
    Crc {
        /// Frame the checksum belongs to.
        frame: Frame,
        /// CRC32 of the serialized state.
        crc: u32,
    },
    /// REQUEST_SAVESTATE.
    RequestSavestate,
    /// LOAD_SAVESTATE.
    LoadSavestate(LoadSavestatePayload),
    /// PAUSE, with the nickname of whoever paused.
    Pause(String),
    /// RESUME.
    Resume,
    /// STALL.
    Stall {
        /// Number of frames to hold.
        frames: u32,
    },
    /// RESET.
    Reset {
        /// Frame the reset happened at.
        frame: Frame,
    },
    /// FLIP_PLAYERS.
    FlipPlayers {
        /// Frame the flip takes effect.
        frame: Frame,
    },
}

impl Command {
    /// The wire id of this command.
    #[must_use]
    pub const fn id(&self) -> CommandId {
        match self {
            Command::Ack => CommandId::Ack,
            Command::Nak => CommandId::Nak,
            Command::Disconnect => CommandId::Disconnect,
            Command::Input(_) => CommandId::Input,
            Command::NoInput { .. } => CommandId::NoInput,
            Command::Nick(_) => CommandId::Nick,
            Command::Password(_) => CommandId::Password,
            Command::Info(_) => CommandId::Info,
            Command::Sync(_) => CommandId::Sync,
            Command::Spectate => CommandId::Spectate,
            Command::Play { .. } => CommandId::Play,
            Command::Mode(_) => CommandId::Mode,
            Command::ModeRefused(_) => CommandId::ModeRefused,
            Command::Crc { .. } => CommandId::Crc,
            Command::RequestSavestate => CommandId::RequestSavestate,
            Command::LoadSavestate(_) => CommandId::LoadSavestate,
            Command::Pause(_) => CommandId::Pause,
            Command::Resume => CommandId::Resume,
            Command::Stall { .. } => CommandId::Stall,
            Command::Reset { .. } => CommandId::Reset,
            Command::FlipPlayers { .. } => CommandId::FlipPlayers,
        }
    }

    /// Appends the header and payload to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> CodecResult<()> {
        let mut payload = Vec::new();
        match self {
            Command::Ack
            | Command::Nak
            | Command::Disconnect
            | Command::Spectate
            | Command::RequestSavestate
            | Command::Resume => {},
            Command::Input(input) => {
                codec::encode_append(input, &mut payload)?;
            },
            Command::NoInput { frame }
            | Command::Reset { frame }
            | Command::FlipPlayers { frame } => {
                codec::encode_append(frame, &mut payload)?;
            },
            Command::Nick(nick) | Command::Pause(nick) => {
                payload.extend_from_slice(&nick_to_wire(nick));
            },
            Command::Password(hash) => payload.extend_from_slice(hash),
            Command::Info(None) => {},
            Command::Info(Some(info)) => {
                let wire = InfoWire {
                    core_name: nick_to_wire(&info.core_name),
                    core_version: nick_to_wire(&info.core_version),
                    content_crc: info.content_crc,
                };
                codec::encode_append(&wire, &mut payload)?;
            },
            Command::Sync(sync) => {
                codec::encode_append(&sync.header, &mut payload)?;
                payload.extend_from_slice(&sync.save_ram);
            },
            Command::Play { slave } => {
                if *slave {
                    codec::encode_append(&PLAY_FLAG_SLAVE, &mut payload)?;
                }
            },
            Command::Mode(mode) => {
                codec::encode_append(&(mode.frame, mode.mode_word()), &mut payload)?;
            },
            Command::ModeRefused(reason) => {
                codec::encode_append(&reason.as_u32(), &mut payload)?;
            },
            Command::Crc { frame, crc } => {
                codec::encode_append(&(*frame, *crc), &mut payload)?;
            },
            Command::LoadSavestate(state) => {
                codec::encode_append(&(state.frame, state.inflated_size), &mut payload)?;
                payload.extend_from_slice(&state.data);
            },
            Command::Stall { frames } => {
                codec::encode_append(frames, &mut payload)?;
            },
        }
        codec::encode_append(&(self.id().as_u32(), payload.len() as u32), out)?;
        out.extend_from_slice(&payload);
        Ok(())
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// Decodes a payload whose size already passed [`CommandId::check_size`].
    pub fn decode(id: CommandId, payload: &[u8]) -> Result<Command, CodecError> {
        Ok(match id {
            CommandId::Ack => Command::Ack,
            CommandId::Nak => Command::Nak,
            CommandId::Disconnect => Command::Disconnect,
            CommandId::Spectate => Command::Spectate,
            CommandId::RequestSavestate => Command::RequestSavestate,
            CommandId::Resume => Command::Resume,
            CommandId::Input => Command::Input(codec::decode_value(payload)?),
            CommandId::NoInput => Command::NoInput {
                frame: codec::decode_value(payload)?,
            },
            CommandId::Reset => Command::Reset {
                frame: codec::decode_value(payload)?,
            },
            CommandId::FlipPlayers => Command::FlipPlayers {
                frame: codec::decode_value(payload)?,
            },
            CommandId::Nick => Command::Nick(nick_from_wire(payload)),
            CommandId::Pause => Command::Pause(nick_from_wire(payload)),
            CommandId::Password => {
                let mut hash = [0u8; PASS_HASH_LEN];
                let src = payload.get(..PASS_HASH_LEN).ok_or(CodecError::Truncated {
                    needed: PASS_HASH_LEN,
                    available: payload.len(),
                })?;
                hash.copy_from_slice(src);
                Command::Password(hash)
            },
            CommandId::Info => {
                if payload.is_empty() {
                    Command::Info(None)
                } else {
                    let wire: InfoWire = codec::decode_value(payload)?;
                    Command::Info(Some(InfoPayload {
                        core_name: nick_from_wire(&wire.core_name),
                        core_version: nick_from_wire(&wire.core_version),
                        content_crc: wire.content_crc,
                    }))
                }
            },
            CommandId::Sync => {
                let (header, used): (SyncHeader, _) = codec::decode(payload)?;
                Command::Sync(Box::new(SyncPayload {
                    header,
                    save_ram: payload.get(used..).unwrap_or_default().to_vec(),
                }))
            },
            CommandId::Play => {
                let flags = if payload.is_empty() {
                    0
                } else {
                    codec::read_u32(payload, 0)?
                };
                Command::Play {
                    slave: flags & PLAY_FLAG_SLAVE != 0,
                }
            },
            CommandId::Mode => {
                let (frame, word): (Frame, u32) = codec::decode_value(payload)?;
                Command::Mode(ModePayload::from_words(frame, word))
            },
            CommandId::ModeRefused => {
                Command::ModeRefused(ModeRefusedReason::from_u32(codec::read_u32(payload, 0)?))
            },
            CommandId::Crc => {
                let (frame, crc) = codec::decode_value(payload)?;
                Command::Crc { frame, crc }
            },
            CommandId::LoadSavestate => {
                let ((frame, inflated_size), used): ((Frame, u32), _) = codec::decode(payload)?;
                Command::LoadSavestate(LoadSavestatePayload {
                    frame,
                    inflated_size,
                    data: payload.get(used..).unwrap_or_default().to_vec(),
                })
            },
            CommandId::Stall => Command::Stall {
                frames: codec::read_u32(payload, 0)?,
            },
        })
    }
}

/// The 6-word header both sides send first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Always [`PROTOCOL_MAGIC`](crate::PROTOCOL_MAGIC).
    pub magic: u32,
    /// Endianness and word sizes of the sender.
    pub platform_magic: u32,
    /// Compression capability bitmask.
    pub compression: u32,
    /// Password salt, 0 when no password is required.
    pub salt: u32,
    /// Protocol version.
    pub protocol_version: u32,
    /// Hash of the sender's implementation version.
    pub impl_hash: u32,
}

impl HandshakeHeader {
    /// Size on the wire.
    pub const LEN: usize = 24;
}

/// Encodes a nickname (or core name) into a NUL-terminated fixed buffer.
///
/// Truncates on a character boundary so that the terminator always fits.
#[must_use]
pub fn nick_to_wire(nick: &str) -> [u8; NICK_LEN] {
    let mut out = [0u8; NICK_LEN];
    let mut end = nick.len().min(NICK_LEN - 1);
    while !nick.is_char_boundary(end) {
        end -= 1;
    }
    out[..end].copy_from_slice(&nick.as_bytes()[..end]);
    out
}

/// Decodes a NUL-terminated fixed buffer.
#[must_use]
pub fn nick_from_wire(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
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

    fn roundtrip(cmd: &Command) -> Command {
        let bytes = cmd.to_bytes().unwrap();
        let id = CommandId::from_u32(codec::read_u32(&bytes, 0).unwrap()).unwrap();
        let size = codec::read_u32(&bytes, 4).unwrap() as usize;
        assert_eq!(bytes.len(), HEADER_LEN + size);
        let limits = PayloadLimits {
            max_savestate: 1 << 16,
            max_save_ram: 1 << 16,
        };
        id.check_size(size, &limits).unwrap();
        Command::decode(id, &bytes[HEADER_LEN..]).unwrap()
    }

    #[test]
    fn input_layout_matches_wire_format() {
        let cmd = Command::Input(InputPayload {
            frame: Frame::new(3),
            player: 1 | INPUT_BIT_SERVER,
            words: [0x10, 0, 0xFFFF_0001],
        });
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(
            bytes,
            [
                0, 0, 0, 3, 0, 0, 0, 20, // header
                0, 0, 0, 3, 0x80, 0, 0, 1, // frame, player
                0, 0, 0, 0x10, 0, 0, 0, 0, 0xFF, 0xFF, 0, 1,
            ]
        );
        let Command::Input(decoded) = roundtrip(&cmd) else {
            panic!("expected input");
        };
        assert_eq!(decoded.player_slot(), 1);
        assert!(decoded.from_server());
    }

    #[test]
    fn mode_word_packs_flags_and_player() {
        let mode = ModePayload {
            frame: Frame::new(100),
            you: true,
            playing: true,
            slave: false,
            player: 2,
        };
        assert_eq!(mode.mode_word(), 0xC000_0002);
        assert_eq!(roundtrip(&Command::Mode(mode)), Command::Mode(mode));

        let slave = ModePayload::from_words(Frame::new(1), MODE_BIT_SLAVE | MODE_BIT_PLAYING | 5);
        assert!(slave.slave && slave.playing && !slave.you);
        assert_eq!(slave.player, 5);
    }

    #[test]
    fn sync_carries_save_ram_tail() {
        let header = SyncHeader {
            frame: Frame::new(42),
            connected_players: 0b11 | SYNC_PAUSED_BIT,
            flip_frame: 0,
            devices: [1; MAX_PLAYERS],
            share_modes: [0; MAX_PLAYERS],
            client_devices: [0; MAX_PLAYERS],
            nick: nick_to_wire("guest (2)"),
        };
        let cmd = Command::Sync(Box::new(SyncPayload {
            header,
            save_ram: vec![9, 8, 7],
        }));
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + SYNC_FIXED_LEN + 3);
        assert_eq!(roundtrip(&cmd), cmd);
    }

    #[test]
    fn info_may_be_empty() {
        assert_eq!(roundtrip(&Command::Info(None)), Command::Info(None));
        let info = Command::Info(Some(InfoPayload {
            core_name: "snes9x".to_owned(),
            core_version: "1.62".to_owned(),
            content_crc: 0xDEAD_BEEF,
        }));
        assert_eq!(roundtrip(&info), info);
    }

    #[test]
    fn play_flags_are_optional() {
        assert_eq!(
            Command::Play { slave: false }.to_bytes().unwrap().len(),
            HEADER_LEN
        );
        assert_eq!(
            roundtrip(&Command::Play { slave: true }),
            Command::Play { slave: true }
        );
    }

    #[test]
    fn load_savestate_keeps_data() {
        let cmd = Command::LoadSavestate(LoadSavestatePayload {
            frame: Frame::new(77),
            inflated_size: 1024,
            data: vec![1, 2, 3, 4, 5],
        });
        assert_eq!(roundtrip(&cmd), cmd);
    }

    #[test]
    fn size_rules_reject_bad_headers() {
        let limits = PayloadLimits::default();
        assert!(CommandId::Input.check_size(INPUT_LEN, &limits).is_ok());
        assert!(CommandId::Input.check_size(INPUT_LEN - 4, &limits).is_err());
        assert!(CommandId::Nick.check_size(NICK_LEN + 1, &limits).is_err());
        assert!(CommandId::Info.check_size(0, &limits).is_ok());
        assert!(CommandId::Info.check_size(10, &limits).is_err());
        assert!(CommandId::LoadSavestate.check_size(9, &limits).is_err());
        assert!(CommandId::Sync.check_size(SYNC_FIXED_LEN - 1, &limits).is_err());
        assert!(CommandId::Ack.check_size(1, &limits).is_err());
    }

    #[test]
    fn unknown_ids_are_rejected() {
        assert_eq!(CommandId::from_u32(0x05), None);
        assert_eq!(CommandId::from_u32(0x60), Some(CommandId::FlipPlayers));
        assert_eq!(CommandId::FlipPlayers.as_u32(), 0x60);
    }

    #[test]
    fn nick_truncates_on_char_boundary() {
        let long = "é".repeat(20);
        let wire = nick_to_wire(&long);
        assert_eq!(wire[NICK_LEN - 1], 0);
        let back = nick_from_wire(&wire);
        assert_eq!(back.chars().count(), 15);
        assert_eq!(nick_from_wire(&nick_to_wire("abc")), "abc");
    }

    #[test]
    fn refused_reasons_map_unknown_to_other() {
        assert_eq!(ModeRefusedReason::from_u32(2), ModeRefusedReason::NoSlots);
        assert_eq!(ModeRefusedReason::from_u32(99), ModeRefusedReason::Other);
        assert_eq!(ModeRefusedReason::TooFast.as_u32(), 3);
    }

    #[test]
    fn handshake_header_is_six_words() {
        let header = HandshakeHeader {
            magic: crate::PROTOCOL_MAGIC,
            platform_magic: 0,
            compression: 1,
            salt: 0,
            protocol_version: crate::PROTOCOL_VERSION,
            impl_hash: 0,
        };
        let bytes = codec::encode(&header).unwrap();
        assert_eq!(bytes.len(), HandshakeHeader::LEN);
        assert_eq!(&bytes[..4], b"RANP");
    }
}
