//! 24-bit packet sequence numbers and the sources that produce them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, OnceLock};

/// Mask selecting the 24 bits a PSN occupies on the wire.
pub const PSN_MASK: u32 = 0x00ff_ffff;

/// A packet sequence number, always `< 2^24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Psn(u32);

impl Psn {
    /// Returns `None` if `value` does not fit in 24 bits.
    pub const fn new(value: u32) -> Option<Self> {
        if value & !PSN_MASK == 0 {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Keeps the low 24 bits of `value`.
    pub const fn truncate(value: u32) -> Self {
        Self(value & PSN_MASK)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Psn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:06x}", self.0)
    }
}

/// Produces initial send-side PSNs for newly created queue pairs.
pub trait PsnSource: Send + Sync {
    fn next_psn(&self) -> Psn;
}

/// PSNs drawn from a seeded `StdRng`.
///
/// [`RandomPsn::global`] is the process-wide source used by default; tests can
/// build a [`RandomPsn::seeded`] instance for reproducible values.
pub struct RandomPsn {
    rng: Mutex<StdRng>,
}

impl RandomPsn {
    /// The shared, OS-seeded source.
    pub fn global() -> &'static RandomPsn {
        static GLOBAL: OnceLock<RandomPsn> = OnceLock::new();
        GLOBAL.get_or_init(|| RandomPsn {
            rng: Mutex::new(StdRng::from_os_rng()),
        })
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl PsnSource for RandomPsn {
    fn next_psn(&self) -> Psn {
        // A poisoned lock still holds a usable generator.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        Psn::truncate(rng.random::<u32>())
    }
}

/// Always yields the same PSN.
#[derive(Debug, Clone, Copy)]
pub struct FixedPsn(pub Psn);

impl PsnSource for FixedPsn {
    fn next_psn(&self) -> Psn {
        self.0
    }
}
