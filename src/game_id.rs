//! Game instance identifiers
//!
//! A [`GameId`] names the single authoritative record of one table. It keys
//! the notification channel and addresses every event on the wire. IDs are
//! five octal digits so they are easy to read out loud across the table.

use std::{fmt::Display, num::ParseIntError, ops::Range, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// Values that display as exactly five octal digits
const RANGE: Range<u16> = 0o10_000..0o100_000;

/// Reasons a string is not a game identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not an octal number that fits the identifier
    #[error("not an octal game id: {0}")]
    Malformed(#[from] ParseIntError),
    /// An octal number, but not five digits long
    #[error("game id must have five octal digits, got {0:o}")]
    OutOfRange(u16),
}

/// Identifier of a game instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct GameId(u16);

impl GameId {
    /// Picks a random identifier
    pub fn new() -> Self {
        Self(fastrand::u16(RANGE))
    }
}

impl Default for GameId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for GameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:05o}", self.0)
    }
}

impl FromStr for GameId {
    type Err = ParseError;

    /// Parses the five-digit octal form, surrounding whitespace allowed
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Malformed`] for anything that is not octal and
    /// [`ParseError::OutOfRange`] for octal numbers of the wrong length.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = u16::from_str_radix(s.trim(), 8)?;
        if RANGE.contains(&value) {
            Ok(Self(value))
        } else {
            Err(ParseError::OutOfRange(value))
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_new_displays_five_digits() {
        for _ in 0..100 {
            let id = GameId::new();
            assert_eq!(id.to_string().len(), 5);
            assert_eq!(id.to_string().parse(), Ok(id));
        }
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert_eq!("7".parse::<GameId>(), Err(ParseError::OutOfRange(7)));
        assert_eq!(
            "0777".parse::<GameId>(),
            Err(ParseError::OutOfRange(0o777))
        );
        assert!(matches!(
            "18000".parse::<GameId>(),
            Err(ParseError::Malformed(_))
        ));
        assert_eq!(" 12345\n".parse(), Ok(GameId(0o12345)));
    }

    #[test]
    fn test_serialized_as_string() {
        let id = GameId(0o12345);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"12345\"");
        assert_eq!(serde_json::from_str::<GameId>("\"12345\"").unwrap(), id);
        assert!(serde_json::from_str::<GameId>("12345").is_err());
        assert!(serde_json::from_str::<GameId>("\"00042\"").is_err());
    }
}
