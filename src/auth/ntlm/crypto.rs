//! Hash and response primitives for NTLM.

use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;

use super::NtlmError;
use super::message::encode_string;

type HmacMd5 = Hmac<Md5>;

const LM_MAGIC: &[u8; 8] = b"KGS!@#$%";

/// MD4 of the UTF-16LE password.
pub fn ntlm_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(encode_string(password, true));

    let mut out = [0u8; 16];
    out.copy_from_slice(&digest);
    out
}

/// NTLMv2 key: HMAC-MD5 keyed by the NTLM hash over the uppercased user
/// name followed by the uppercased domain, UTF-16LE encoded.
pub fn ntlmv2_hash(ntlm_hash: &[u8; 16], user: &str, domain: &str) -> Result<[u8; 16], NtlmError> {
    let identity = format!("{}{}", user.to_uppercase(), domain.to_uppercase());
    hmac_md5(ntlm_hash, &encode_string(&identity, true))
}

pub fn hmac_md5(key: &[u8], data: &[u8]) -> Result<[u8; 16], NtlmError> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(|_| NtlmError::InvalidKeyLength)?;
    mac.update(data);

    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// Constant-time check of an HMAC-MD5 tag.
pub fn verify_hmac_md5(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool, NtlmError> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).map_err(|_| NtlmError::InvalidKeyLength)?;
    mac.update(data);
    Ok(mac.verify_slice(tag).is_ok())
}

/// LAN Manager hash of the uppercased, 14-byte padded ASCII password.
pub fn lm_hash(password: &str) -> [u8; 16] {
    let mut padded = [0u8; 14];
    for (dst, src) in padded
        .iter_mut()
        .zip(password.to_ascii_uppercase().bytes())
    {
        *dst = src;
    }

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&des_encrypt(&padded[..7], LM_MAGIC));
    out[8..].copy_from_slice(&des_encrypt(&padded[7..], LM_MAGIC));
    out
}

/// The 24-byte challenge response shared by LM and NTLMv1: the hash is
/// zero-padded to 21 bytes and split into three DES keys.
pub fn lm_response(hash: &[u8; 16], challenge: &[u8; 8]) -> [u8; 24] {
    let mut key = [0u8; 21];
    key[..16].copy_from_slice(hash);

    let mut out = [0u8; 24];
    for (i, part) in key.chunks_exact(7).enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&des_encrypt(part, challenge));
    }
    out
}

/// NTLM2 session response: the v1 response computed over the first eight
/// bytes of MD5(server challenge ++ client nonce).
pub fn ntlm2_session_response(
    ntlm_hash: &[u8; 16],
    challenge: &[u8; 8],
    client_nonce: &[u8; 8],
) -> [u8; 24] {
    let mut hasher = Md5::new();
    hasher.update(challenge);
    hasher.update(client_nonce);
    let digest = hasher.finalize();

    let mut session = [0u8; 8];
    session.copy_from_slice(&digest[..8]);

    lm_response(ntlm_hash, &session)
}

/// Spreads 56 key bits over 8 bytes, seven bits each, with odd parity in
/// the low bit.
pub fn des_key(bytes: &[u8]) -> [u8; 8] {
    let b = |i: usize| bytes.get(i).copied().unwrap_or(0);

    let mut key = [
        b(0),
        (b(0) << 7) | (b(1) >> 1),
        (b(1) << 6) | (b(2) >> 2),
        (b(2) << 5) | (b(3) >> 3),
        (b(3) << 4) | (b(4) >> 4),
        (b(4) << 3) | (b(5) >> 5),
        (b(5) << 2) | (b(6) >> 6),
        b(6) << 1,
    ];

    for byte in key.iter_mut() {
        let even = (*byte >> 1).count_ones() % 2 == 0;
        *byte = (*byte & 0xfe) | u8::from(even);
    }

    key
}

fn des_encrypt(key_material: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let cipher = Des::new(&GenericArray::from(des_key(key_material)));

    let mut block = GenericArray::from(*data);
    cipher.encrypt_block(&mut block);

    let mut out = [0u8; 8];
    out.copy_from_slice(&block);
    out
}
