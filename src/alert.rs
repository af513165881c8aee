use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CommandError;

/// Alert level shared by the smoother (sensing side) and the actuator (remote side).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Safe,
    Caution,
    Danger,
}

impl AlertLevel {
    /// Wire byte for this level.
    pub const fn command(self) -> u8 {
        match self {
            AlertLevel::Safe => b'S',
            AlertLevel::Caution => b'C',
            AlertLevel::Danger => b'D',
        }
    }

    pub const fn from_command(byte: u8) -> Option<Self> {
        match byte {
            b'S' => Some(AlertLevel::Safe),
            b'C' => Some(AlertLevel::Caution),
            b'D' => Some(AlertLevel::Danger),
            _ => None,
        }
    }

    /// Parse a full message payload. Exactly one byte, no framing.
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        match payload {
            [byte] => Self::from_command(*byte).ok_or(CommandError::Unknown(*byte)),
            other => Err(CommandError::Length(other.len())),
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AlertLevel::Safe => "SAFE",
            AlertLevel::Caution => "CAUTION",
            AlertLevel::Danger => "DANGER",
        })
    }
}
