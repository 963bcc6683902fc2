// Copyright (C) 2024-2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tidings.
//
// tidings is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tidings is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tidings.  If not,
// see <http://www.gnu.org/licenses/>.

//! # Password hashing
//!
//! Stored passwords look like
//!
//! ```text
//! base64(base64(salt) ":" base64(timestamp) ":" derived)
//! ```
//!
//! where `derived` is the base64 encoding of `scrypt(password, salt ":" timestamp)`. Every new hash
//! is produced that way.
//!
//! Older records were produced by an iterated SHA-256 scheme:
//!
//! ```text
//! derived = base64(sha256(sha256(sha256(password + salt) + timestamp) + "passwd"))
//! ```
//!
//! (each digest hex-encoded before being fed to the next). Those are still accepted on login: a
//! derived value that decodes to a 64 character hex string can only have come from the legacy
//! scheme.
//!
//! Hashing with production parameters is deliberately expensive (32MiB of memory & on the order of
//! 100ms), so the async entry points push the work onto the blocking thread pool.

use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};
use tap::Pipe;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Stored password was not valid base64: {source}"))]
    Base64 {
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("The password hashing task failed: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Stored password was not in salt:timestamp:derived form"))]
    Malformed { backtrace: Backtrace },
    #[snafu(display("Invalid scrypt parameters: {source}"))]
    Params {
        source: scrypt::errors::InvalidParams,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid scrypt output length: {source}"))]
    OutputLen {
        source: scrypt::errors::InvalidOutputLen,
        backtrace: Backtrace,
    },
    #[snafu(display("Stored password was not UTF-8: {source}"))]
    Utf8 {
        source: std::string::FromUtf8Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// scrypt parameters, plus the length of the salt we generate
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Params {
    /// log2 of the scrypt cost parameter N
    #[serde(rename = "log-n")]
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    /// Length, in bytes, of the derived key
    #[serde(rename = "key-len")]
    pub key_len: usize,
    /// Length, in characters, of the generated salt
    #[serde(rename = "salt-len")]
    pub salt_len: usize,
}

impl Default for Params {
    fn default() -> Self {
        // N = 32768
        Params {
            log_n: 15,
            r: 8,
            p: 1,
            key_len: 256,
            salt_len: 256,
        }
    }
}

impl Params {
    /// Parameters cheap enough for tests; never use these in production
    pub fn insecure() -> Params {
        Params {
            log_n: 4,
            r: 8,
            p: 1,
            key_len: 64,
            salt_len: 16,
        }
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn legacy_derive(password: &str, salt: &str, timestamp: &str) -> String {
    let first = sha256_hex(&format!("{}{}", password, salt));
    let second = sha256_hex(&format!("{}{}", first, timestamp));
    sha256_hex(&format!("{}passwd", second))
}

fn scrypt_derive(
    params: &Params,
    password: &str,
    salt: &str,
    timestamp: &str,
    len: usize,
) -> Result<Vec<u8>> {
    // The `len` parameter to `scrypt::Params` only matters to the PHC string API; the output buffer
    // is what determines the length of the derived key.
    let scrypt_params = scrypt::Params::new(
        params.log_n,
        params.r,
        params.p,
        scrypt::Params::RECOMMENDED_LEN,
    )
    .context(ParamsSnafu)?;
    let mut out = vec![0u8; len];
    scrypt::scrypt(
        password.as_bytes(),
        format!("{}:{}", salt, timestamp).as_bytes(),
        &scrypt_params,
        &mut out,
    )
    .context(OutputLenSnafu)?;
    Ok(out)
}

fn encode(salt: &str, timestamp: &str, derived: &[u8]) -> String {
    BASE64_STANDARD.encode(format!(
        "{}:{}:{}",
        BASE64_STANDARD.encode(salt),
        BASE64_STANDARD.encode(timestamp),
        BASE64_STANDARD.encode(derived)
    ))
}

fn decode_text(text: &str) -> Result<String> {
    BASE64_STANDARD
        .decode(text)
        .context(Base64Snafu)?
        .pipe(String::from_utf8)
        .context(Utf8Snafu)
}

fn is_legacy(derived: &[u8]) -> bool {
    derived.len() == 64 && derived.iter().all(|b| b.is_ascii_hexdigit())
}

fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    lhs.len() == rhs.len() && lhs.iter().zip(rhs).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// Hash `password` with a fresh salt
pub fn hash(params: &Params, password: &SecretString) -> Result<String> {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(params.salt_len)
        .map(char::from)
        .collect();
    let timestamp = Utc::now().timestamp_micros().to_string();
    let derived = scrypt_derive(
        params,
        password.expose_secret(),
        &salt,
        &timestamp,
        params.key_len,
    )?;
    Ok(encode(&salt, &timestamp, &derived))
}

/// Hash `password` using the legacy algorithm; only used to exercise the verifier
#[cfg(test)]
fn hash_legacy(password: &str, salt: &str, timestamp: &str) -> String {
    encode(
        salt,
        timestamp,
        legacy_derive(password, salt, timestamp).as_bytes(),
    )
}

/// Check `password` against the stored hash `stored`
///
/// The scrypt cost parameters are deployment-wide; the key length is taken from the stored hash.
pub fn verify(params: &Params, password: &SecretString, stored: &str) -> Result<bool> {
    let outer = decode_text(stored)?;
    let mut parts = outer.splitn(3, ':');
    let (salt, timestamp, derived) = match (parts.next(), parts.next(), parts.next()) {
        (Some(salt), Some(timestamp), Some(derived)) => (
            decode_text(salt)?,
            decode_text(timestamp)?,
            BASE64_STANDARD.decode(derived).context(Base64Snafu)?,
        ),
        _ => return MalformedSnafu.fail(),
    };
    let candidate = if is_legacy(&derived) {
        legacy_derive(password.expose_secret(), &salt, &timestamp).into_bytes()
    } else {
        scrypt_derive(
            params,
            password.expose_secret(),
            &salt,
            &timestamp,
            derived.len(),
        )?
    };
    Ok(constant_time_eq(&candidate, &derived))
}

/// [hash], on the blocking thread pool
pub async fn hash_async(params: Params, password: SecretString) -> Result<String> {
    tokio::task::spawn_blocking(move || hash(&params, &password))
        .await
        .context(JoinSnafu)?
}

/// [verify], on the blocking thread pool
pub async fn verify_async(params: Params, password: SecretString, stored: String) -> Result<bool> {
    tokio::task::spawn_blocking(move || verify(&params, &password, &stored))
        .await
        .context(JoinSnafu)?
}

#[cfg(test)]
mod test {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_owned())
    }

    #[test]
    fn scrypt_round_trip() {
        let params = Params::insecure();
        let stored = hash(&params, &secret("p4ssword!")).unwrap();
        assert!(verify(&params, &secret("p4ssword!"), &stored).unwrap());
        assert!(!verify(&params, &secret("password!"), &stored).unwrap());
        // Same password, fresh salt:
        assert_ne!(stored, hash(&params, &secret("p4ssword!")).unwrap());
    }

    #[test]
    fn legacy_hashes_still_verify() {
        let stored = hash_legacy("p4ssword!", "somesalt", "1431172800");
        let params = Params::insecure();
        assert!(verify(&params, &secret("p4ssword!"), &stored).unwrap());
        assert!(!verify(&params, &secret("nope"), &stored).unwrap());
    }

    #[test]
    fn legacy_derivation() {
        // Each stage feeds the hex digest of the previous one into the next
        let first = hex::encode(Sha256::digest(b"pwsalt"));
        let second = hex::encode(Sha256::digest(format!("{}ts", first).as_bytes()));
        let third = hex::encode(Sha256::digest(format!("{}passwd", second).as_bytes()));
        assert_eq!(legacy_derive("pw", "salt", "ts"), third);
    }

    #[test]
    fn garbage_is_an_error() {
        let params = Params::insecure();
        assert!(verify(&params, &secret("x"), "not base64!").is_err());
        let no_colons = BASE64_STANDARD.encode("abc");
        assert!(matches!(
            verify(&params, &secret("x"), &no_colons),
            Err(Error::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn async_variants() {
        let params = Params::insecure();
        let stored = hash_async(params, secret("hunter2")).await.unwrap();
        assert!(verify_async(params, secret("hunter2"), stored).await.unwrap());
    }
}
