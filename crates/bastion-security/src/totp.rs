//! ---
//! bastion_section: "05-second-factor"
//! bastion_subsection: "module"
//! bastion_type: "source"
//! bastion_scope: "code"
//! bastion_description: "Time-based one-time passwords and MFA enrollment."
//! bastion_version: "v0.0.0-prealpha"
//! bastion_owner: "tbd"
//! ---
//! RFC 6238 time-based one-time passwords (HMAC-SHA1, 30 second steps, 6 digits).
//!
//! Secrets travel as unpadded RFC 4648 Base32. Decoding is tolerant: lowercase input
//! is accepted and characters outside the alphabet (spaces, dashes, padding) are
//! skipped, so decoding never fails.

use chrono::{DateTime, Utc};
use hmac::digest::Key;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::{Choice, ConstantTimeEq};
use url::form_urlencoded;

type HmacSha1 = Hmac<Sha1>;

/// Length of one time step in seconds.
pub const STEP_SECONDS: i64 = 30;
/// Number of digits in a code.
pub const DIGITS: usize = 6;
/// Random secret length in bytes (160 bits).
pub const SECRET_BYTES: usize = 20;

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const CODE_MODULUS: u32 = 1_000_000;

/// Encode bytes as unpadded Base32.
pub fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Decode Base32, skipping anything outside the alphabet.
pub fn base32_decode(encoded: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for ch in encoded.chars() {
        let value = match ch.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u32 - 'A' as u32,
            c @ '2'..='7' => c as u32 - '2' as u32 + 26,
            _ => continue,
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    out
}

/// Fresh 160-bit secret from the thread CSPRNG, Base32 encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32_encode(&bytes)
}

/// Time step containing `timestamp`.
pub fn time_step(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp().div_euclid(STEP_SECONDS)
}

/// HMAC key block: keys longer than the SHA-1 block are hashed first, then zero-padded.
fn key_block(key: &[u8]) -> Key<HmacSha1> {
    let mut block = Key::<HmacSha1>::default();
    if key.len() > block.len() {
        let hashed = Sha1::digest(key);
        block[..hashed.len()].copy_from_slice(&hashed);
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    block
}

fn code_at_step(key: &[u8], step: i64) -> String {
    let mut mac = <HmacSha1 as Mac>::new(&key_block(key));
    mac.update(&(step as u64).to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]) & 0x7fff_ffff;
    format!("{:0width$}", binary % CODE_MODULUS, width = DIGITS)
}

/// Code for the step containing `timestamp`.
pub fn generate_code(secret: &str, timestamp: DateTime<Utc>) -> String {
    code_at_step(&base32_decode(secret), time_step(timestamp))
}

/// Accept `candidate` if it equals the code of any step within `tolerance_steps` of
/// `timestamp`. Every step in the window is compared in constant time.
pub fn verify_code(
    secret: &str,
    candidate: &str,
    timestamp: DateTime<Utc>,
    tolerance_steps: u32,
) -> bool {
    let candidate = candidate.trim();
    if candidate.len() != DIGITS || !candidate.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let key = base32_decode(secret);
    let current = time_step(timestamp);
    let tolerance = i64::from(tolerance_steps);
    let mut accepted = Choice::from(0);
    for step in current - tolerance..=current + tolerance {
        accepted |= code_at_step(&key, step)
            .as_bytes()
            .ct_eq(candidate.as_bytes());
    }
    accepted.into()
}

/// `otpauth://` URI understood by authenticator apps.
pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> String {
    let label: String =
        form_urlencoded::byte_serialize(format!("{issuer}:{account}").as_bytes()).collect();
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("secret", secret)
        .append_pair("issuer", issuer)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &DIGITS.to_string())
        .append_pair("period", &STEP_SECONDS.to_string())
        .finish();
    format!("otpauth://totp/{}?{query}", label.replace('+', "%20"))
}
