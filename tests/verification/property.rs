//! Property-based tests.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use fortress_netplay::input::{merge, AnalogShare, DigitalShare};
use fortress_netplay::network::messages::{InputPayload, ModePayload, PayloadLimits};
use fortress_netplay::network::packet_buffer::RecvBuffer;
use fortress_netplay::{
    Command, Compression, DeltaRing, Frame, InputWords, MemoryStream, PlayerMask, ShareMode,
    StreamSocket, MAX_PLAYERS,
};
use proptest::prelude::*;

fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        (any::<u32>(), 0..MAX_PLAYERS as u32, any::<bool>(), any::<[u32; 3]>()).prop_map(
            |(frame, player, server, words)| {
                Command::Input(InputPayload {
                    frame: Frame::new(frame),
                    player: if server { player | 0x8000_0000 } else { player },
                    words,
                })
            }
        ),
        (any::<u32>(), any::<u32>()).prop_map(|(frame, crc)| Command::Crc {
            frame: Frame::new(frame),
            crc
        }),
        "[a-z]{1,20}".prop_map(Command::Pause),
        any::<u32>().prop_map(|frame| Command::Reset {
            frame: Frame::new(frame)
        }),
        (any::<u32>(), any::<bool>(), any::<bool>(), 0..MAX_PLAYERS as u16).prop_map(
            |(frame, you, playing, player)| Command::Mode(ModePayload {
                frame: Frame::new(frame),
                you,
                playing,
                slave: false,
                player,
            })
        ),
        Just(Command::Resume),
        Just(Command::RequestSavestate),
        Just(Command::Disconnect),
    ]
}

proptest! {
    /// Preparing frames in order succeeds exactly while the reconciled frame stays less
    /// than a ring length behind.
    #[test]
    fn ring_reuses_only_reconciled_slots(len in 1usize..32, lag in 0u32..40, frames in 1u32..200) {
        let mut ring = DeltaRing::new(len);
        for f in 0..frames {
            let frame = Frame::new(f);
            let other = Frame::new(f.saturating_sub(lag));
            let ready = ring.ready(frame, other);
            let expected = (f as usize) < len || (lag as usize) < len;
            prop_assert_eq!(ready, expected, "frame {} other {}", f, other);
            if !ready {
                break;
            }
            prop_assert!(ring.find(frame).is_some());
            // Everything still unreconciled is still there.
            for kept in other.as_u32()..=f {
                prop_assert!(ring.find(Frame::new(kept)).is_some());
            }
        }
    }

    /// However the stream is cut up, the receiver reassembles the same commands.
    #[test]
    fn commands_survive_arbitrary_fragmentation(
        commands in prop::collection::vec(command_strategy(), 1..20),
        cuts in prop::collection::vec(1usize..64, 1..50),
    ) {
        let mut bytes = Vec::new();
        for command in &commands {
            bytes.extend_from_slice(&command.to_bytes().unwrap());
        }

        let (mut tx, mut rx) = MemoryStream::pair();
        let mut recv = RecvBuffer::new();
        let limits = PayloadLimits::default();
        let mut received = Vec::new();
        let mut offset = 0;
        let mut cut = cuts.iter().cycle();
        while offset < bytes.len() {
            let end = (offset + cut.next().copied().unwrap_or(1)).min(bytes.len());
            tx.send(&bytes[offset..end]).unwrap();
            offset = end;
            recv.fill(&mut rx).unwrap();
            while let Some(command) = recv.next_command(&limits).unwrap() {
                received.push(command);
            }
        }
        prop_assert_eq!(received, commands);
        prop_assert_eq!(recv.buffered(), 0);
    }

    /// zlib output stays within the advertised bound and inflates back exactly.
    #[test]
    fn zlib_savestates_inflate_exactly(state in prop::collection::vec(any::<u8>(), 1..4096)) {
        let mut packed = Vec::new();
        Compression::Zlib.compress(&state, &mut packed).unwrap();
        prop_assert!(packed.len() <= Compression::max_compressed_len(state.len()));

        let mut unpacked = vec![0u8; state.len()];
        Compression::Zlib.decompress(&packed, &mut unpacked).unwrap();
        prop_assert_eq!(&unpacked, &state);

        let mut short = vec![0u8; state.len() + 1];
        prop_assert!(Compression::Zlib.decompress(&packed, &mut short).is_err());
    }

    /// A device fed by one player passes that player's input through untouched.
    #[test]
    fn merge_of_one_player_is_identity(words in any::<[u32; 3]>(), mode in 0u8..16) {
        let share = ShareMode::from_u8(mode);
        prop_assert_eq!(merge(share, &[words]), words);
    }

    /// XOR sharing cancels out a player holding what another holds.
    #[test]
    fn xor_share_cancels_pairs(a in any::<u32>(), b in any::<u32>()) {
        let share = ShareMode::new(DigitalShare::Xor, AnalogShare::Max);
        let inputs: [InputWords; 3] = [[a, 0, 0], [b, 0, 0], [b, 0, 0]];
        prop_assert_eq!(merge(share, &inputs)[0], a);
    }

    /// A voted button is down for a strict majority only.
    #[test]
    fn vote_share_needs_majority(a in any::<u32>(), b in any::<u32>()) {
        let share = ShareMode::new(DigitalShare::Vote, AnalogShare::Max);
        prop_assert_eq!(merge(share, &[[a, 0, 0], [a, 0, 0], [b, 0, 0]])[0], a);
        prop_assert_eq!(merge(share, &[[a, 0, 0], [b, 0, 0]])[0], a & b);
    }

    /// Masks hold exactly the slots put into them.
    #[test]
    fn player_mask_tracks_slots(slots in prop::collection::btree_set(0..MAX_PLAYERS, 0..MAX_PLAYERS)) {
        let mut mask = PlayerMask::default();
        for &slot in &slots {
            mask.insert(slot);
        }
        prop_assert_eq!(mask.len(), slots.len());
        prop_assert_eq!(mask.iter().collect::<Vec<_>>(), slots.iter().copied().collect::<Vec<_>>());
        for slot in 0..MAX_PLAYERS {
            prop_assert_eq!(mask.contains(slot), slots.contains(&slot));
        }
    }
}
