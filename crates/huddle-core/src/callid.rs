//! Call identifier generation and validation
//!
//! Call ids are short, human-typeable tokens drawn from a restricted
//! alphabet with visually ambiguous characters removed (no 0/O, 1/I/L,
//! 5/S and friends). A 6-character id over a 24-character alphabet gives
//! ~191M combinations, plenty for the expected call volume.

/// Length of a call id in characters
pub const CALL_ID_LENGTH: usize = 6;

/// Characters used in call ids (unambiguous set)
const CALL_ID_CHARS: &[u8] = b"2346789BCDFGHJKMPQRTVWXY";

/// Generate a random call id (e.g., "BQ72XD")
///
/// # Panics
/// Panics if the system random number generator fails (extremely rare).
/// Use `try_generate_call_id` if you need to handle this case.
pub fn generate_call_id() -> String {
    try_generate_call_id().expect("RNG failed - system entropy source unavailable")
}

/// Try to generate a random call id, returning an error if RNG fails
pub fn try_generate_call_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; CALL_ID_LENGTH];
    getrandom::fill(&mut bytes)?;

    Ok(bytes
        .iter()
        .map(|b| CALL_ID_CHARS[(*b as usize) % CALL_ID_CHARS.len()] as char)
        .collect())
}

/// Normalize a call id (strip whitespace, uppercase)
pub fn normalize_call_id(id: &str) -> String {
    id.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate a call id format
pub fn validate_call_id(id: &str) -> bool {
    let normalized = normalize_call_id(id);
    normalized.len() == CALL_ID_LENGTH && normalized.bytes().all(|b| CALL_ID_CHARS.contains(&b))
}
