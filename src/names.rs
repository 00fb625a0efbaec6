//! Player name validation and defaults
//!
//! Names are shown to every participant at the table, so they are trimmed,
//! bounded, filtered for inappropriate content and kept unique.

use std::collections::HashSet;

use rustrict::CensorStr;
use serde::Serialize;
use thiserror::Error;

use crate::constants::game::DEFAULT_NAME_PREFIX;

/// Errors that can occur during name validation
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested name is already in use by another player
    #[error("name already in-use")]
    Used,
    /// The name is empty or contains only whitespace
    #[error("name cannot be empty")]
    Empty,
    /// The name contains inappropriate content
    #[error("name is inappropriate")]
    Sinful,
    /// The name exceeds the maximum allowed length
    #[error("name is too long")]
    TooLong,
}

/// Cleans a requested name and checks it against the table
///
/// # Arguments
///
/// * `name` - The requested name (will be trimmed of whitespace)
/// * `max_length` - Maximum number of characters allowed
/// * `taken` - Names currently used by the other players
///
/// # Errors
///
/// * `Error::TooLong` - Name exceeds `max_length` characters
/// * `Error::Empty` - Name is empty after trimming whitespace
/// * `Error::Sinful` - Name contains inappropriate content
/// * `Error::Used` - Name is already taken by another player
pub fn validate<'a, I>(name: &str, max_length: usize, taken: I) -> Result<String, Error>
where
    I: IntoIterator<Item = &'a str>,
{
    let name = rustrict::trim_whitespace(name);
    if name.chars().count() > max_length {
        return Err(Error::TooLong);
    }
    if name.is_empty() {
        return Err(Error::Empty);
    }
    if name.is_inappropriate() {
        return Err(Error::Sinful);
    }
    if taken.into_iter().any(|other| other == name) {
        return Err(Error::Used);
    }
    Ok(name.to_owned())
}

/// Generated name for the player seated at `position` (0-indexed)
pub fn default_name(position: usize) -> String {
    format!("{DEFAULT_NAME_PREFIX} {}", position + 1)
}

/// Generates `count` default names that do not collide with `existing`
///
/// Numbering starts after the seats already taken, so growing a table of
/// four adds `Player 5` rather than reusing a number a renamed player freed.
pub fn fresh_defaults<'a, I>(existing: I, count: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: HashSet<&str> = existing.into_iter().collect();
    (taken.len()..)
        .map(default_name)
        .filter(|name| !taken.contains(name.as_str()))
        .take(count)
        .collect()
}
