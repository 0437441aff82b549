//! Inbound webhook authentication.
//!
//! The source sends the `Authorization` header registered in the
//! subscription with every push. Both values are run through HMAC-SHA256
//! under a fixed key and the tags compared with the MAC library's
//! constant-time check, so timing does not leak how much of a guess matched.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const COMPARISON_KEY: &[u8] = b"fhir-bridge inbound authorization";

fn tag(value: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(COMPARISON_KEY).ok()?;
    mac.update(value);
    Some(mac.finalize().into_bytes().to_vec())
}

/// Returns `true` if `provided` equals `expected`, in constant time.
///
/// # Examples
///
/// ```
/// use fhir_bridge::server::auth::authorization_matches;
///
/// assert!(authorization_matches(b"Basic dXNlcjpwYXNz", "Basic dXNlcjpwYXNz"));
/// assert!(!authorization_matches(b"Basic b3RoZXI6b3RoZXI=", "Basic dXNlcjpwYXNz"));
/// ```
pub fn authorization_matches(provided: &[u8], expected: &str) -> bool {
    let Some(expected_tag) = tag(expected.as_bytes()) else {
        return false;
    };
    let mut mac = match HmacSha256::new_from_slice(COMPARISON_KEY) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(provided);
    mac.verify_slice(&expected_tag).is_ok()
}
