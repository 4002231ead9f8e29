use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

const TOKEN_BYTES: usize = 32;

/// Issues opaque session tokens from a generator seeded once from the OS.
pub struct TokenIssuer {
    rng: Mutex<StdRng>,
}

impl TokenIssuer {
    pub fn from_os_rng() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    pub fn from_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// 32 random bytes, hex encoded.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}
