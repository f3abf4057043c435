//! Small PCG32 generator used for password salts.
//!
//! Not cryptographically secure. A salt only has to differ between connections so a
//! captured password hash cannot be replayed against a later one.

use std::cell::RefCell;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_DEFAULT_INCREMENT: u64 = 1442695040888963407;

/// PCG-XSH-RR with 64 bits of state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pcg32 {
    state: u64,
    inc: u64,
}

impl Pcg32 {
    pub(crate) const fn new(state: u64, stream: u64) -> Self {
        let inc = (stream << 1) | 1;
        let mut pcg = Self { state: 0, inc };
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg.state = pcg.state.wrapping_add(state);
        pcg.state = pcg.state.wrapping_mul(PCG_MULTIPLIER).wrapping_add(pcg.inc);
        pcg
    }

    pub(crate) const fn seed_from_u64(seed: u64) -> Self {
        Self::new(seed, PCG_DEFAULT_INCREMENT)
    }

    pub(crate) fn from_entropy() -> Self {
        Self::seed_from_u64(entropy_seed())
    }

    #[inline]
    pub(crate) fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(PCG_MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }
}

thread_local! {
    static SALT_RNG: RefCell<Pcg32> = RefCell::new(Pcg32::from_entropy());
}

/// A fresh, non-zero password salt.
pub(crate) fn salt() -> u32 {
    SALT_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        loop {
            let value = rng.next_u32();
            if value != 0 {
                return value;
            }
        }
    })
}

/// Wall-clock time, thread identity and the per-process random hasher keys.
fn entropy_seed() -> u64 {
    let mut hasher = RandomState::new().build_hasher();
    std::thread::current().id().hash(&mut hasher);
    if let Ok(since_epoch) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        since_epoch.as_nanos().hash(&mut hasher);
    }
    hasher.finish().wrapping_add(0x9e3779b97f4a7c15)
}
