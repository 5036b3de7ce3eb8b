//! Message identifiers.
//!
//! Identifiers are ULIDs rendered as 26 Crockford base32 characters: a
//! 48-bit millisecond timestamp followed by 80 random bits. A single
//! process-wide generator makes them monotonic, so an identifier minted later
//! in the same process always sorts after an earlier one, byte for byte.

use std::sync::{LazyLock, Mutex};

use ulid::{Generator, Ulid};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Mints a new message identifier.
pub fn generate() -> String {
    let ulid = GENERATOR
        .lock()
        .ok()
        .and_then(|mut generator| generator.generate().ok())
        // Poisoned lock or 2^80 ids in one millisecond: fall back to a fresh
        // random ULID, which still carries the current timestamp.
        .unwrap_or_else(Ulid::new);

    ulid.to_string()
}
