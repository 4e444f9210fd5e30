//! Per-room pseudonymous identities.
//!
//! Identities are drawn from a bounded color × animal space, e.g.
//! `"🔵 Blue Fox"`. They are unique among the current participants of a
//! room, not globally.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

use veil_protocol::EXTERNAL_SENDER;

/// Colors as (emoji, name) pairs.
pub const COLORS: [(&str, &str); 8] = [
    ("🔵", "Blue"),
    ("🟢", "Green"),
    ("🟣", "Purple"),
    ("🟠", "Orange"),
    ("🔴", "Red"),
    ("🟡", "Yellow"),
    ("⚪", "White"),
    ("🟤", "Brown"),
];

/// Animal names.
pub const ANIMALS: [&str; 15] = [
    "Fox", "Wolf", "Bear", "Eagle", "Owl", "Hawk", "Deer", "Lion", "Tiger", "Panther", "Raven",
    "Falcon", "Otter", "Lynx", "Badger",
];

/// Number of distinct generated identities.
pub const IDENTITY_SPACE: usize = COLORS.len() * ANIMALS.len();

/// Maximum random draws per join, across every claim attempt.
pub const MAX_DRAWS: usize = 100;

/// Maximum length of a client-chosen identity, in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 64;

/// Draw one random identity.
#[must_use]
pub fn random_identity<R: Rng + ?Sized>(rng: &mut R) -> String {
    let (emoji, color) = COLORS.choose(rng).copied().unwrap_or(COLORS[0]);
    let animal = ANIMALS.choose(rng).copied().unwrap_or(ANIMALS[0]);
    format!("{emoji} {color} {animal}")
}

/// Draw an identity not in `taken` by rejection sampling.
///
/// Every draw, colliding or not, spends one unit of `budget`. Returns
/// `None` once the budget is spent without finding a free identity.
#[must_use]
pub fn draw_identity<R: Rng + ?Sized>(
    taken: &HashSet<String>,
    rng: &mut R,
    budget: &mut usize,
) -> Option<String> {
    while *budget > 0 {
        *budget -= 1;
        let candidate = random_identity(rng);
        if !taken.contains(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Whether a client-supplied identity may be used at all.
#[must_use]
pub fn is_acceptable(identity: &str) -> bool {
    let trimmed = identity.trim();
    !trimmed.is_empty()
        && identity.len() <= MAX_IDENTITY_LENGTH
        && identity != EXTERNAL_SENDER
        && !identity.starts_with("__")
        && !identity.chars().any(char::is_control)
}
