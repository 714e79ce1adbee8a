//! NTLM proxy authentication.
//!
//! The proxy plays the server side of the handshake: it answers a Type 1
//! negotiate with a Type 2 challenge and verifies the client's Type 3
//! against the configured password. Only NTLMv2 responses are accepted;
//! LM, NTLMv1 and NTLM2 session responses never authenticate.

pub mod crypto;
pub mod message;

use std::time::SystemTime;

use thiserror::Error;

pub use message::{
    NtlmMessage, NtlmVersion, TargetInformation, Type1Message, Type2Message, Type3Message, flags,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NtlmError {
    #[error("NTLM message has an invalid signature")]
    InvalidSignature,

    #[error("NTLM message is truncated")]
    Truncated,

    #[error("unknown NTLM message type {0}")]
    UnknownType(u32),

    #[error("expected NTLM message type {expected}, got {actual}")]
    UnexpectedType { expected: u32, actual: u32 },

    #[error("NTLM {0} points outside the message")]
    BufferOutOfRange(&'static str),

    #[error("client negotiated neither Unicode nor OEM strings")]
    NoCharset,

    #[error("invalid base64 in NTLM token: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid HMAC key length")]
    InvalidKeyLength,
}

/// Version advertised in challenges.
pub const SERVER_VERSION: NtlmVersion = NtlmVersion {
    major: 0,
    minor: 5,
    build: 42,
};

/// Flags echoed back from the client's negotiate message when present.
const ECHOED_FLAGS: [u32; 7] = [
    flags::REQUEST_TARGET,
    flags::NEGOTIATE_NTLM,
    flags::NEGOTIATE_ALWAYS_SIGN,
    flags::NEGOTIATE_EXTENDED_SESSIONSECURITY,
    flags::NEGOTIATE_128,
    flags::NEGOTIATE_56,
    flags::NEGOTIATE_VERSION,
];

/// Answers a negotiate message with a fresh random challenge.
pub fn create_challenge(type1: &Type1Message, hostname: &str) -> Result<Type2Message, NtlmError> {
    build_challenge(type1, hostname, SystemTime::now(), rand::random::<[u8; 8]>())
}

pub(crate) fn build_challenge(
    type1: &Type1Message,
    hostname: &str,
    now: SystemTime,
    nonce: [u8; 8],
) -> Result<Type2Message, NtlmError> {
    let mut negotiated = if type1.flags & flags::NEGOTIATE_UNICODE != 0 {
        flags::NEGOTIATE_UNICODE
    } else if type1.flags & flags::NEGOTIATE_OEM != 0 {
        flags::NEGOTIATE_OEM
    } else {
        return Err(NtlmError::NoCharset);
    };

    for flag in ECHOED_FLAGS {
        negotiated |= type1.flags & flag;
    }
    negotiated |= flags::TARGET_TYPE_SERVER | flags::NEGOTIATE_TARGET_INFO;

    let info = TargetInformation {
        domain: Some(hostname.to_string()),
        server: Some(hostname.to_string()),
        dns_domain: Some(hostname.to_string()),
        dns_server: Some(hostname.to_string()),
        timestamp: Some(now),
    };

    let version = (negotiated & flags::NEGOTIATE_VERSION != 0).then_some(SERVER_VERSION);

    Ok(Type2Message::new(
        negotiated,
        nonce,
        hostname,
        Some(&info),
        version,
    ))
}

/// Checks a Type 3 message for `user` against the challenge it answers.
pub fn verify(
    type3: &Type3Message,
    challenge: &Type2Message,
    user: &str,
    password: &str,
) -> Result<bool, NtlmError> {
    if type3.username.is_empty() || user.to_uppercase() != type3.username.to_uppercase() {
        return Ok(false);
    }

    if type3.ntlm_response.len() <= 24 {
        tracing::debug!(user = %type3.username, "Rejecting non-NTLMv2 response");
        return Ok(false);
    }

    verify_v2(type3, challenge, password)
}

fn verify_v2(
    type3: &Type3Message,
    challenge: &Type2Message,
    password: &str,
) -> Result<bool, NtlmError> {
    let target_info_len = if challenge.flags & flags::NEGOTIATE_TARGET_INFO != 0 {
        challenge.target_info.as_ref().map_or(0, |t| t.len())
    } else {
        0
    };

    let response = &type3.ntlm_response;
    if response.len() < target_info_len + 48 {
        tracing::debug!(len = response.len(), "NTLMv2 response too short");
        return Ok(false);
    }

    let (proof, blob) = response.split_at(16);
    if blob[..4] != [0x01, 0x01, 0x00, 0x00] {
        tracing::debug!("NTLMv2 blob has wrong signature");
        return Ok(false);
    }

    let key = crypto::ntlmv2_hash(&crypto::ntlm_hash(password), &type3.username, &type3.domain)?;

    let mut data = Vec::with_capacity(8 + blob.len());
    data.extend_from_slice(&challenge.challenge);
    data.extend_from_slice(blob);

    crypto::verify_hmac_md5(&key, &data, proof)
}

/// First label of the local host name, uppercased, as used in challenges and
/// `Via` headers.
pub fn local_hostname() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|n| n.into_string().ok())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "localhost".to_string());

    name.split('.').next().unwrap_or("localhost").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn negotiate(flags: u32) -> Type1Message {
        Type1Message {
            flags,
            domain: None,
            hostname: None,
        }
    }

    /// Builds the client's NTLMv2 answer the way a real client would.
    fn v2_answer(challenge: &Type2Message, user: &str, domain: &str, password: &str) -> Type3Message {
        let key = crypto::ntlmv2_hash(&crypto::ntlm_hash(password), user, domain).unwrap();

        let mut blob = vec![0x01, 0x01, 0x00, 0x00, 0, 0, 0, 0];
        blob.extend_from_slice(&message::filetime(UNIX_EPOCH).to_le_bytes());
        blob.extend_from_slice(&[0xaa; 8]);
        blob.extend_from_slice(&[0, 0, 0, 0]);
        blob.extend_from_slice(challenge.target_info.as_deref().unwrap_or(&[]));
        blob.extend_from_slice(&[0, 0, 0, 0]);

        let mut data = challenge.challenge.to_vec();
        data.extend_from_slice(&blob);
        let mut response = crypto::hmac_md5(&key, &data).unwrap().to_vec();
        response.extend_from_slice(&blob);

        Type3Message {
            flags: flags::NEGOTIATE_UNICODE | flags::NEGOTIATE_NTLM,
            lm_response: vec![0; 24],
            ntlm_response: response,
            domain: domain.into(),
            username: user.into(),
            hostname: "WS".into(),
            session_key: None,
        }
    }

    fn challenge() -> Type2Message {
        build_challenge(
            &negotiate(flags::NEGOTIATE_UNICODE | flags::NEGOTIATE_NTLM | flags::NEGOTIATE_VERSION),
            "PROXY",
            UNIX_EPOCH + Duration::from_secs(1_000_000),
            [1, 2, 3, 4, 5, 6, 7, 8],
        )
        .unwrap()
    }

    #[test]
    fn challenge_flags_follow_negotiate() {
        let t2 = challenge();

        assert_ne!(t2.flags & flags::NEGOTIATE_UNICODE, 0);
        assert_eq!(t2.flags & flags::NEGOTIATE_OEM, 0);
        assert_ne!(t2.flags & flags::NEGOTIATE_NTLM, 0);
        assert_ne!(t2.flags & flags::TARGET_TYPE_SERVER, 0);
        assert_ne!(t2.flags & flags::NEGOTIATE_TARGET_INFO, 0);
        assert_eq!(t2.flags & flags::NEGOTIATE_56, 0);
        assert_eq!(t2.version, Some(SERVER_VERSION.to_bytes()));
        assert_eq!(t2.target_name, b"P\0R\0O\0X\0Y\0".to_vec());

        let info = TargetInformation::parse(t2.target_info.as_deref().unwrap(), true).unwrap();
        assert_eq!(info.server.as_deref(), Some("PROXY"));
        assert_eq!(info.dns_domain.as_deref(), Some("PROXY"));
    }

    #[test]
    fn oem_only_client_gets_oem_challenge() {
        let t2 = build_challenge(&negotiate(flags::NEGOTIATE_OEM), "PROXY", UNIX_EPOCH, [0; 8]).unwrap();
        assert_eq!(t2.flags & flags::NEGOTIATE_UNICODE, 0);
        assert_ne!(t2.flags & flags::NEGOTIATE_OEM, 0);
        assert_eq!(t2.target_name, b"PROXY".to_vec());
        assert_eq!(t2.version, None);
    }

    #[test]
    fn challenge_requires_a_charset() {
        assert_eq!(
            build_challenge(&negotiate(flags::NEGOTIATE_NTLM), "PROXY", UNIX_EPOCH, [0; 8]),
            Err(NtlmError::NoCharset)
        );
    }

    #[test]
    fn v2_answer_verifies() {
        let t2 = challenge();
        let t3 = v2_answer(&t2, "alice", "CORP", "secret");

        assert!(verify(&t3, &t2, "alice", "secret").unwrap());
        assert!(verify(&t3, &t2, "ALICE", "secret").unwrap());
    }

    #[test]
    fn v2_rejects_wrong_password_user_or_challenge() {
        let t2 = challenge();
        let t3 = v2_answer(&t2, "alice", "CORP", "secret");

        assert!(!verify(&t3, &t2, "alice", "Secret").unwrap());
        assert!(!verify(&t3, &t2, "bob", "secret").unwrap());

        let mut other = t2.clone();
        other.challenge = [8, 7, 6, 5, 4, 3, 2, 1];
        assert!(!verify(&t3, &other, "alice", "secret").unwrap());
    }

    #[test]
    fn v2_rejects_bad_blob_signature_and_short_response() {
        let t2 = challenge();

        let mut t3 = v2_answer(&t2, "alice", "CORP", "secret");
        t3.ntlm_response[16] = 0x02;
        assert!(!verify(&t3, &t2, "alice", "secret").unwrap());

        let mut t3 = v2_answer(&t2, "alice", "CORP", "secret");
        t3.ntlm_response.truncate(40);
        assert!(!verify(&t3, &t2, "alice", "secret").unwrap());
    }

    #[test]
    fn legacy_responses_never_authenticate() {
        let t2 = challenge();
        let nt_hash = crypto::ntlm_hash("secret");

        let v1 = Type3Message {
            flags: flags::NEGOTIATE_UNICODE,
            lm_response: crypto::lm_response(&crypto::lm_hash("secret"), &t2.challenge).to_vec(),
            ntlm_response: crypto::lm_response(&nt_hash, &t2.challenge).to_vec(),
            domain: "CORP".into(),
            username: "alice".into(),
            hostname: "WS".into(),
            session_key: None,
        };
        assert!(!verify(&v1, &t2, "alice", "secret").unwrap());

        let nonce = [9u8; 8];
        let mut lm = nonce.to_vec();
        lm.extend_from_slice(&[0u8; 16]);
        let session = Type3Message {
            flags: flags::NEGOTIATE_UNICODE | flags::NEGOTIATE_EXTENDED_SESSIONSECURITY,
            lm_response: lm,
            ntlm_response: crypto::ntlm2_session_response(&nt_hash, &t2.challenge, &nonce).to_vec(),
            ..v1.clone()
        };
        assert!(!verify(&session, &t2, "alice", "secret").unwrap());

        let lm_only = Type3Message {
            ntlm_response: Vec::new(),
            ..v1
        };
        assert!(!verify(&lm_only, &t2, "alice", "secret").unwrap());
    }

    #[test]
    fn hostname_is_single_uppercase_label() {
        let name = local_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
        assert_eq!(name, name.to_uppercase());
    }
}
