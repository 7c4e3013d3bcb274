//! Handshake secret generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a generated handshake secret, in characters.
pub const SECRET_LEN: usize = 32;

/// Generate a fresh, unguessable handshake secret.
///
/// The secret is alphanumeric so it can be embedded in the injected script
/// and in the `init:` handshake without escaping.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
