//! Human-readable transfer codes.
//!
//! A transfer code is 6 characters drawn uniformly from a 32-symbol
//! alphabet that omits visually ambiguous glyphs (`0`, `1`, `I`, `O`).
//! Codes are case-insensitive on input and canonicalized to upper-case.

use rand::Rng;

/// The 32-symbol transfer code alphabet (no `0`, `1`, `I`, `O`).
pub const ALPHABET: &[u8; 32] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Length of a transfer code in characters.
pub const CODE_LEN: usize = 6;

/// Error returned when a transfer code fails canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    /// The code is not exactly [`CODE_LEN`] characters long.
    #[error("transfer code must be {CODE_LEN} characters, got {0}")]
    WrongLength(usize),
    /// The code contains a character outside the alphabet.
    #[error("transfer code contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Generates a fresh 6-character transfer code.
#[must_use]
pub fn generate() -> String {
    generate_with(&mut rand::rng())
}

/// Generates a transfer code from the supplied RNG.
pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LEN)
        .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
        .collect()
}

/// Canonicalizes a user-supplied transfer code to upper-case.
///
/// # Errors
///
/// Returns [`CodeError::WrongLength`] for codes that are not 6 characters,
/// or [`CodeError::InvalidChar`] for characters outside the alphabet
/// (including the ambiguous glyphs `0`, `1`, `I`, `O`).
pub fn canonicalize(input: &str) -> Result<String, CodeError> {
    let trimmed = input.trim();
    if trimmed.chars().count() != CODE_LEN {
        return Err(CodeError::WrongLength(trimmed.chars().count()));
    }
    let mut out = String::with_capacity(CODE_LEN);
    for c in trimmed.chars() {
        let upper = c.to_ascii_uppercase();
        if !ALPHABET.contains(&(upper as u8)) || !upper.is_ascii() {
            return Err(CodeError::InvalidChar(c));
        }
        out.push(upper);
    }
    Ok(out)
}
