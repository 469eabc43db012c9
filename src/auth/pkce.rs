//! PKCE S256 challenge generation
//!
//! Implements the Proof Key for Code Exchange extension (RFC 7636) used by
//! the code-grant flow in [`super::oauth2`], plus the random `state` nonce
//! bound to every authorization request.
//!
//! 1. A high-entropy `code_verifier` is generated.
//! 2. Its SHA-256 digest, base64url-encoded, is the `code_challenge` sent to
//!    the authorize endpoint.
//! 3. The verifier itself is sent with the token exchange.

use base64::Engine as _;
use rand::RngCore as _;
use sha2::{Digest, Sha256};

/// A PKCE S256 verifier/challenge pair.
///
/// # Examples
///
/// ```
/// use smartfhir::auth::pkce::generate;
///
/// let challenge = generate();
/// assert_eq!(challenge.method, "S256");
/// assert_eq!(challenge.verifier.len(), 43);
/// ```
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// 32 random bytes, base64url without padding (43 characters).
    pub verifier: String,

    /// base64url(SHA-256(verifier)) without padding.
    pub challenge: String,

    /// Always `"S256"`.
    pub method: String,
}

/// Generates a fresh PKCE S256 challenge.
pub fn generate() -> PkceChallenge {
    let mut random_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut random_bytes);

    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    let challenge = challenge_for(&verifier);

    PkceChallenge {
        verifier,
        challenge,
        method: "S256".to_string(),
    }
}

/// Computes the S256 challenge for an existing verifier.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// Generates a random `state` nonce: 16 bytes, base64url without padding.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
