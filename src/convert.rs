//! Turning raw register words into a floating point reading.
//!
//! A single 16bit register cannot carry an IEEE-754 single on its own, so the rule has to be
//! picked explicitly:
//!
//! | rule        | registers | `0x3F80` (then `0x0000`) |
//! |-------------|-----------|--------------------------|
//! | `Numeric`   | 1         | `16256.0`                |
//! | `HighWord`  | 1         | `1.0`                    |
//! | `WordPair`  | 2         | `1.0`                    |

use serde::{Deserialize, Serialize};
use crate::{Error, Reason, Result};

/// Conversion applied to the registers returned by one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversion {
    /// The register value as a number, `16256` becomes `16256.0`.
    #[default]
    Numeric,
    /// The register is the upper half of an `f32` bit pattern, the lower half is zero.
    HighWord,
    /// Two consecutive registers, high word first, reinterpreted as an `f32`.
    WordPair,
}

impl Conversion {
    /// Number of registers one read has to request.
    pub fn register_count(&self) -> u16 {
        match *self {
            Conversion::Numeric | Conversion::HighWord => 1,
            Conversion::WordPair => 2,
        }
    }

    /// Convert the leading registers of a reply. Trailing registers are ignored.
    pub fn apply(&self, registers: &[u16]) -> Result<f32> {
        if registers.len() < self.register_count() as usize {
            return Err(Error::InvalidData(Reason::NotEnoughRegisters));
        }
        let value = match *self {
            Conversion::Numeric => f32::from(registers[0]),
            Conversion::HighWord => f32::from_bits(u32::from(registers[0]) << 16),
            Conversion::WordPair => {
                f32::from_bits(u32::from(registers[0]) << 16 | u32::from(registers[1]))
            }
        };
        Ok(value)
    }
}

impl std::str::FromStr for Conversion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Conversion, String> {
        match s {
            "numeric" => Ok(Conversion::Numeric),
            "high_word" | "high-word" => Ok(Conversion::HighWord),
            "word_pair" | "word-pair" => Ok(Conversion::WordPair),
            _ => Err(format!("unknown conversion `{}`", s)),
        }
    }
}
