//! NTLM message codec.
//!
//! Every message starts with `NTLMSSP\0` and a little-endian type tag.
//! Variable-length fields are described by security buffers (u16 length,
//! u16 allocated length, u32 offset from the start of the message) and live
//! in a payload after the fixed header.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::NtlmError;

pub const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

/// Negotiation flags.
pub mod flags {
    pub const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
    pub const NEGOTIATE_OEM: u32 = 0x0000_0002;
    pub const REQUEST_TARGET: u32 = 0x0000_0004;
    pub const NEGOTIATE_NTLM: u32 = 0x0000_0200;
    pub const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
    pub const TARGET_TYPE_SERVER: u32 = 0x0002_0000;
    pub const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
    pub const NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;
    pub const NEGOTIATE_VERSION: u32 = 0x0200_0000;
    pub const NEGOTIATE_128: u32 = 0x2000_0000;
    pub const NEGOTIATE_56: u32 = 0x8000_0000;
}

const TARGET_INFO_END: u16 = 0;
const TARGET_INFO_SERVER: u16 = 1;
const TARGET_INFO_DOMAIN: u16 = 2;
const TARGET_INFO_SERVER_DNS: u16 = 3;
const TARGET_INFO_DOMAIN_DNS: u16 = 4;
const TARGET_INFO_TIMESTAMP: u16 = 7;

/// Milliseconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET_MS: u64 = 11_644_473_600_000;

/// A decoded NTLM message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NtlmMessage {
    Negotiate(Type1Message),
    Challenge(Type2Message),
    Authenticate(Type3Message),
}

impl NtlmMessage {
    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        match check_header(message)? {
            1 => Ok(NtlmMessage::Negotiate(Type1Message::parse(message)?)),
            2 => Ok(NtlmMessage::Challenge(Type2Message::parse(message)?)),
            3 => Ok(NtlmMessage::Authenticate(Type3Message::parse(message)?)),
            other => Err(NtlmError::UnknownType(other)),
        }
    }
}

/// Type 1: the client's negotiate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type1Message {
    pub flags: u32,
    pub domain: Option<String>,
    pub hostname: Option<String>,
}

impl Type1Message {
    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        expect_type(message, 1)?;

        let flags = read_u32(message, 12)?;

        // Domain and workstation buffers are optional trailing fields
        let domain = if message.len() >= 24 {
            non_empty(ascii(security_buffer(message, 16)?))
        } else {
            None
        };

        let hostname = if message.len() >= 32 {
            non_empty(ascii(security_buffer(message, 24)?))
        } else {
            None
        };

        Ok(Self {
            flags,
            domain,
            hostname,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let domain = self.domain.as_deref().unwrap_or("").as_bytes();
        let hostname = self.hostname.as_deref().unwrap_or("").as_bytes();

        let mut out = header(1);
        put_u32(&mut out, self.flags);

        let mut offset = 32;
        put_security_buffer(&mut out, domain.len(), offset);
        offset += domain.len();
        put_security_buffer(&mut out, hostname.len(), offset);

        out.extend_from_slice(domain);
        out.extend_from_slice(hostname);
        out
    }
}

/// Type 2: the server's challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type2Message {
    pub flags: u32,
    pub challenge: [u8; 8],
    /// Target name, already encoded in the negotiated charset.
    pub target_name: Vec<u8>,
    pub context: Option<[u8; 8]>,
    /// Serialized target information block.
    pub target_info: Option<Vec<u8>>,
    pub version: Option<[u8; 8]>,
}

impl Type2Message {
    /// Builds a challenge, encoding the target name and target information
    /// as UTF-16LE when `flags` negotiates Unicode and ASCII otherwise.
    pub fn new(
        flags: u32,
        challenge: [u8; 8],
        target_name: &str,
        target_info: Option<&TargetInformation>,
        version: Option<NtlmVersion>,
    ) -> Self {
        let unicode = flags & flags::NEGOTIATE_UNICODE != 0;

        Self {
            flags,
            challenge,
            target_name: encode_string(target_name, unicode),
            context: None,
            target_info: target_info.map(|info| info.to_bytes(unicode)),
            version: version.map(|v| v.to_bytes()),
        }
    }

    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        expect_type(message, 2)?;

        let target_offset = read_u32(message, 16)? as usize;
        let target_name = security_buffer(message, 12)?.to_vec();
        let flags = read_u32(message, 20)?;
        let challenge = read_array(message, 24)?;

        // Context and target info only exist when the payload starts after
        // the extended header
        let (context, target_info, version) = if message.len() > 48 && target_offset >= 48 {
            let version = if flags & flags::NEGOTIATE_VERSION != 0 && target_offset >= 56 {
                Some(read_array(message, 48)?)
            } else {
                None
            };

            (
                Some(read_array(message, 32)?),
                Some(security_buffer(message, 40)?.to_vec()),
                version,
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            flags,
            challenge,
            target_name,
            context,
            target_info,
            version,
        })
    }

    /// Serializes with the fixed header (32 bytes, or 48 with target
    /// information), then version, target name and target information in
    /// that order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut next_offset = if self.target_info.is_some() { 48 } else { 32 };

        let version_len = self.version.map_or(0, |v| v.len());
        next_offset += version_len;

        let target_offset = next_offset;
        next_offset += self.target_name.len();

        let target_info_offset = next_offset;
        let target_info_len = self.target_info.as_ref().map_or(0, |t| t.len());

        let mut out = header(2);
        put_security_buffer(&mut out, self.target_name.len(), target_offset);
        put_u32(&mut out, self.flags);
        out.extend_from_slice(&self.challenge);

        if self.target_info.is_some() {
            // Reserved context
            out.extend_from_slice(&self.context.unwrap_or([0u8; 8]));
            put_security_buffer(&mut out, target_info_len, target_info_offset);
        }

        if let Some(version) = &self.version {
            out.extend_from_slice(version);
        }

        out.extend_from_slice(&self.target_name);

        if let Some(target_info) = &self.target_info {
            out.extend_from_slice(target_info);
        }

        out
    }
}

/// Type 3: the client's authenticate message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type3Message {
    pub flags: u32,
    pub lm_response: Vec<u8>,
    pub ntlm_response: Vec<u8>,
    pub domain: String,
    pub username: String,
    pub hostname: String,
    pub session_key: Option<Vec<u8>>,
}

impl Type3Message {
    pub fn parse(message: &[u8]) -> Result<Self, NtlmError> {
        expect_type(message, 3)?;

        if message.len() < 64 {
            return Err(NtlmError::Truncated);
        }

        let flags = read_u32(message, 60)?;
        let unicode = flags & flags::NEGOTIATE_UNICODE != 0;

        let session_key = security_buffer(message, 52)?;

        Ok(Self {
            flags,
            lm_response: security_buffer(message, 12)?.to_vec(),
            ntlm_response: security_buffer(message, 20)?.to_vec(),
            domain: decode_string(security_buffer(message, 28)?, unicode),
            username: decode_string(security_buffer(message, 36)?, unicode),
            hostname: decode_string(security_buffer(message, 44)?, unicode),
            session_key: (!session_key.is_empty()).then(|| session_key.to_vec()),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let unicode = self.flags & flags::NEGOTIATE_UNICODE != 0;

        let domain = encode_string(&self.domain, unicode);
        let username = encode_string(&self.username, unicode);
        let hostname = encode_string(&self.hostname, unicode);
        let session_key = self.session_key.clone().unwrap_or_default();

        let fields: [&[u8]; 6] = [
            &self.lm_response,
            &self.ntlm_response,
            &domain,
            &username,
            &hostname,
            &session_key,
        ];

        let mut out = header(3);
        let mut offset = 64;
        for field in fields {
            put_security_buffer(&mut out, field.len(), offset);
            offset += field.len();
        }
        put_u32(&mut out, self.flags);

        for field in fields {
            out.extend_from_slice(field);
        }

        out
    }
}

/// Target information advertised in a challenge. Absent fields are omitted
/// from the serialized block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInformation {
    pub domain: Option<String>,
    pub server: Option<String>,
    pub dns_domain: Option<String>,
    pub dns_server: Option<String>,
    pub timestamp: Option<SystemTime>,
}

impl TargetInformation {
    pub fn to_bytes(&self, unicode: bool) -> Vec<u8> {
        let mut out = Vec::new();

        let names = [
            (TARGET_INFO_DOMAIN, &self.domain),
            (TARGET_INFO_SERVER, &self.server),
            (TARGET_INFO_DOMAIN_DNS, &self.dns_domain),
            (TARGET_INFO_SERVER_DNS, &self.dns_server),
        ];

        for (kind, name) in names {
            if let Some(name) = name {
                put_block(&mut out, kind, &encode_string(name, unicode));
            }
        }

        if let Some(timestamp) = self.timestamp {
            put_block(&mut out, TARGET_INFO_TIMESTAMP, &filetime(timestamp).to_le_bytes());
        }

        put_block(&mut out, TARGET_INFO_END, &[]);
        out
    }

    /// Decodes a target information block. Unknown block types are skipped;
    /// a missing terminator is tolerated at end of input.
    pub fn parse(bytes: &[u8], unicode: bool) -> Result<Self, NtlmError> {
        let mut info = TargetInformation::default();
        let mut pos = 0;

        while pos + 4 <= bytes.len() {
            let kind = read_u16(bytes, pos)?;
            let len = read_u16(bytes, pos + 2)? as usize;
            let value = bytes
                .get(pos + 4..pos + 4 + len)
                .ok_or(NtlmError::BufferOutOfRange("target information"))?;
            pos += 4 + len;

            match kind {
                TARGET_INFO_END => break,
                TARGET_INFO_DOMAIN => info.domain = Some(decode_string(value, unicode)),
                TARGET_INFO_SERVER => info.server = Some(decode_string(value, unicode)),
                TARGET_INFO_DOMAIN_DNS => info.dns_domain = Some(decode_string(value, unicode)),
                TARGET_INFO_SERVER_DNS => info.dns_server = Some(decode_string(value, unicode)),
                TARGET_INFO_TIMESTAMP => {
                    let raw: [u8; 8] = read_array(value, 0)?;
                    info.timestamp = Some(from_filetime(u64::from_le_bytes(raw)));
                }
                _ => {}
            }
        }

        Ok(info)
    }
}

/// OS version block carried in a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtlmVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u16,
}

impl NtlmVersion {
    /// NTLMSSP revision 15.
    const REVISION: u8 = 15;

    pub fn to_bytes(&self) -> [u8; 8] {
        let build = self.build.to_le_bytes();
        [self.major, self.minor, build[0], build[1], 0, 0, 0, Self::REVISION]
    }
}

/// Windows FILETIME: 100ns ticks since 1601-01-01, from millisecond
/// precision.
pub fn filetime(time: SystemTime) -> u64 {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    (millis + FILETIME_EPOCH_OFFSET_MS) * 10_000
}

fn from_filetime(ticks: u64) -> SystemTime {
    let millis = (ticks / 10_000).saturating_sub(FILETIME_EPOCH_OFFSET_MS);
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Validates the signature and returns the type tag.
pub fn check_header(message: &[u8]) -> Result<u32, NtlmError> {
    if message.len() < 12 {
        return Err(NtlmError::Truncated);
    }

    if &message[..8] != SIGNATURE {
        return Err(NtlmError::InvalidSignature);
    }

    read_u32(message, 8)
}

fn expect_type(message: &[u8], expected: u32) -> Result<(), NtlmError> {
    match check_header(message)? {
        t if t == expected => Ok(()),
        other => Err(NtlmError::UnexpectedType { expected, actual: other }),
    }
}

pub(crate) fn encode_string(s: &str, unicode: bool) -> Vec<u8> {
    if unicode {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    } else {
        s.bytes().map(|b| if b.is_ascii() { b } else { b'?' }).collect()
    }
}

fn decode_string(bytes: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        ascii(bytes)
    }
}

fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

fn read_u16(bytes: &[u8], pos: usize) -> Result<u16, NtlmError> {
    bytes
        .get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(NtlmError::Truncated)
}

fn read_u32(bytes: &[u8], pos: usize) -> Result<u32, NtlmError> {
    bytes
        .get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(NtlmError::Truncated)
}

fn read_array(bytes: &[u8], pos: usize) -> Result<[u8; 8], NtlmError> {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes.get(pos..pos + 8).ok_or(NtlmError::Truncated)?);
    Ok(out)
}

/// Resolves the security buffer descriptor at `pos`.
fn security_buffer(message: &[u8], pos: usize) -> Result<&[u8], NtlmError> {
    let len = read_u16(message, pos)? as usize;
    let offset = read_u32(message, pos + 4)? as usize;

    if len == 0 {
        return Ok(&[]);
    }

    message
        .get(offset..offset + len)
        .ok_or(NtlmError::BufferOutOfRange("security buffer"))
}

fn header(kind: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(SIGNATURE);
    put_u32(&mut out, kind);
    out
}

fn put_u16(out: &mut Vec<u8>, value: usize) {
    out.extend_from_slice(&(value as u16).to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_security_buffer(out: &mut Vec<u8>, len: usize, offset: usize) {
    put_u16(out, len);
    put_u16(out, len);
    put_u32(out, offset as u32);
}

fn put_block(out: &mut Vec<u8>, kind: u16, value: &[u8]) {
    put_u16(out, kind as usize);
    put_u16(out, value.len());
    out.extend_from_slice(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_type1() -> Vec<u8> {
        // Negotiate with Unicode, OEM, request-target, NTLM and always-sign
        let mut msg = Vec::new();
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&0x0000_8207u32.to_le_bytes());
        msg
    }

    #[test]
    fn parses_minimal_type1() {
        match NtlmMessage::parse(&sample_type1()).unwrap() {
            NtlmMessage::Negotiate(t1) => {
                assert_eq!(t1.flags, 0x0000_8207);
                assert_eq!(t1.domain, None);
                assert_eq!(t1.hostname, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn type1_with_domain_and_host_round_trips() {
        let t1 = Type1Message {
            flags: flags::NEGOTIATE_OEM,
            domain: Some("CORP".into()),
            hostname: Some("WS01".into()),
        };

        let bytes = t1.to_bytes();
        assert_eq!(&bytes[..8], SIGNATURE);
        assert_eq!(Type1Message::parse(&bytes).unwrap(), t1);
    }

    #[test]
    fn rejects_bad_signature_and_short_input() {
        assert_eq!(
            NtlmMessage::parse(b"NTLMSSX\0\x01\x00\x00\x00"),
            Err(NtlmError::InvalidSignature)
        );
        assert_eq!(NtlmMessage::parse(b"NTLM"), Err(NtlmError::Truncated));

        let mut unknown = b"NTLMSSP\0".to_vec();
        unknown.extend_from_slice(&9u32.to_le_bytes());
        assert_eq!(NtlmMessage::parse(&unknown), Err(NtlmError::UnknownType(9)));
    }

    #[test]
    fn type2_layout_matches_offsets() {
        let info = TargetInformation {
            domain: Some("HOST".into()),
            ..Default::default()
        };
        let flags = flags::NEGOTIATE_UNICODE | flags::NEGOTIATE_TARGET_INFO | flags::NEGOTIATE_VERSION;
        let version = NtlmVersion {
            major: 0,
            minor: 5,
            build: 42,
        };
        let t2 = Type2Message::new(flags, [1, 2, 3, 4, 5, 6, 7, 8], "HOST", Some(&info), Some(version));
        let bytes = t2.to_bytes();

        // target name: 8 bytes UTF-16LE right after header (48) and version (8)
        assert_eq!(&bytes[12..14], &8u16.to_le_bytes());
        assert_eq!(&bytes[16..20], &56u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &flags.to_le_bytes());
        assert_eq!(&bytes[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[32..40], &[0u8; 8]);
        assert_eq!(&bytes[48..56], &[0, 5, 42, 0, 0, 0, 0, 15]);
        assert_eq!(&bytes[56..64], b"H\0O\0S\0T\0");

        // target info: domain block + terminator
        let info_len = 4 + 8 + 4;
        assert_eq!(&bytes[40..42], &(info_len as u16).to_le_bytes());
        assert_eq!(&bytes[44..48], &64u32.to_le_bytes());
        assert_eq!(bytes.len(), 64 + info_len);
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);

        let parsed = Type2Message::parse(&bytes).unwrap();
        assert_eq!(parsed, Type2Message { context: Some([0u8; 8]), ..t2 });
    }

    #[test]
    fn type2_without_target_info_uses_short_header() {
        let t2 = Type2Message::new(flags::NEGOTIATE_OEM, [9; 8], "HOST", None, None);
        let bytes = t2.to_bytes();

        assert_eq!(bytes.len(), 32 + 4);
        assert_eq!(&bytes[16..20], &32u32.to_le_bytes());
        assert_eq!(&bytes[32..], b"HOST");

        let parsed = Type2Message::parse(&bytes).unwrap();
        assert_eq!(parsed.target_info, None);
        assert_eq!(parsed.target_name, b"HOST".to_vec());
    }

    #[test]
    fn target_info_blocks_are_ordered_and_terminated() {
        let when = UNIX_EPOCH + Duration::from_millis(1_000);
        let info = TargetInformation {
            domain: Some("D".into()),
            server: Some("S".into()),
            dns_domain: Some("DD".into()),
            dns_server: Some("DS".into()),
            timestamp: Some(when),
        };

        let bytes = info.to_bytes(false);
        let kinds: Vec<u16> = {
            let mut kinds = Vec::new();
            let mut pos = 0;
            while pos + 4 <= bytes.len() {
                kinds.push(read_u16(&bytes, pos).unwrap());
                pos += 4 + read_u16(&bytes, pos + 2).unwrap() as usize;
            }
            kinds
        };
        assert_eq!(kinds, vec![2, 1, 4, 3, 7, 0]);

        assert_eq!(TargetInformation::parse(&bytes, false).unwrap(), info);
    }

    #[test]
    fn filetime_matches_windows_epoch() {
        assert_eq!(filetime(UNIX_EPOCH), 116_444_736_000_000_000);
    }

    #[test]
    fn type3_round_trips_unicode_strings() {
        let t3 = Type3Message {
            flags: flags::NEGOTIATE_UNICODE | flags::NEGOTIATE_NTLM,
            lm_response: vec![0; 24],
            ntlm_response: vec![7; 60],
            domain: "Domain".into(),
            username: "User".into(),
            hostname: "Workstation".into(),
            session_key: None,
        };

        let bytes = t3.to_bytes();
        assert_eq!(&bytes[60..64], &t3.flags.to_le_bytes());
        assert_eq!(&bytes[12..14], &24u16.to_le_bytes());
        assert_eq!(&bytes[16..20], &64u32.to_le_bytes());

        assert_eq!(Type3Message::parse(&bytes).unwrap(), t3);
    }

    #[test]
    fn type3_with_buffer_past_end_is_rejected() {
        let t3 = Type3Message {
            flags: 0,
            lm_response: vec![1; 24],
            ntlm_response: vec![2; 24],
            domain: "D".into(),
            username: "U".into(),
            hostname: "H".into(),
            session_key: None,
        };

        let mut bytes = t3.to_bytes();
        bytes.truncate(bytes.len() - 2);

        assert!(matches!(
            Type3Message::parse(&bytes),
            Err(NtlmError::BufferOutOfRange(_))
        ));
    }
}
