use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::config::CredentialStore;

pub const CHALLENGE: &str = "Basic realm=\"Proxy\"";

/// Decodes `Basic <base64(user:password)>`, splitting on the first colon.
pub fn decode(value: &str) -> Option<(String, String)> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }

    let raw = STANDARD.decode(token.trim()).ok()?;
    let text = String::from_utf8_lossy(&raw);
    let (user, password) = text.split_once(':')?;

    Some((user.to_string(), password.to_string()))
}

pub fn authenticate(value: Option<&str>, credentials: &CredentialStore) -> bool {
    match value.and_then(decode) {
        Some((user, password)) => {
            let ok = credentials.matches(&user, &password);
            tracing::debug!(%user, ok, "Basic authentication");
            ok
        }
        None => false,
    }
}
