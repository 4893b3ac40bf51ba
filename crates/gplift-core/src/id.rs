//! Per-run upgrade identifier.
//!
//! An [`UpgradeId`] is 64 random bits rendered as unpadded URL-safe base64,
//! which always yields exactly 11 characters and is safe for file names.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;

/// Length of a rendered id.
pub const ID_LEN: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpgradeId(u64);

impl UpgradeId {
    /// Draws a fresh id from the operating system's random source.
    ///
    /// Renderings containing `--` are rejected and redrawn, because that
    /// sequence starts a comment in some downstream configuration lexers.
    ///
    /// # Panics
    ///
    /// Panics if the random source cannot be read. Nothing in an upgrade
    /// can proceed without an id.
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 8];
            if let Err(err) = getrandom::getrandom(&mut bytes) {
                panic!("unable to read from the system random source: {err}");
            }

            let id = UpgradeId(u64::from_le_bytes(bytes));
            if !id.to_string().contains("--") {
                return id;
            }
        }
    }

    pub const fn from_raw(raw: u64) -> Self {
        UpgradeId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0.to_le_bytes()))
    }
}

impl FromStr for UpgradeId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN {
            return Err(CoreError::InvalidId(s.to_string()));
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CoreError::InvalidId(s.to_string()))?;
        let bytes: [u8; 8] = decoded
            .try_into()
            .map_err(|_| CoreError::InvalidId(s.to_string()))?;

        Ok(UpgradeId(u64::from_le_bytes(bytes)))
    }
}

impl Serialize for UpgradeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UpgradeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
