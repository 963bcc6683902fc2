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

//! # Opaque credentials
//!
//! Every credential tidings hands out is a run of random bytes, base64-encoded with the URL-safe
//! alphabet (and no padding). The byte counts are chosen to produce the documented lengths:
//! application tokens are 32 characters, backend tokens 44 & session tokens 40.

use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use rand::RngCore;

/// The length of an application token
pub const APPLICATION_TOKEN_LEN: usize = 32;
/// The length of a backend token
pub const BACKEND_TOKEN_LEN: usize = 44;

fn random_token(num_bytes: usize) -> String {
    let mut buf = vec![0u8; num_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    BASE64_URL_SAFE_NO_PAD.encode(buf)
}

/// A fresh session token (40 characters)
pub fn session_token() -> String {
    random_token(30)
}

/// A fresh application token (32 characters)
pub fn application_token() -> String {
    random_token(24)
}

/// A fresh backend token (44 characters)
pub fn backend_token() -> String {
    random_token(33)
}

/// A fresh organization authentication token (32 random bytes)
pub fn organization_token() -> String {
    random_token(32)
}

#[cfg(test)]
mod test {
    use super::*;

    fn url_safe(s: &str) -> bool {
        s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn lengths() {
        let s = session_token();
        assert_eq!(s.len(), 40);
        assert!(url_safe(&s));
        assert_eq!(application_token().len(), APPLICATION_TOKEN_LEN);
        assert_eq!(backend_token().len(), BACKEND_TOKEN_LEN);
        assert_eq!(organization_token().len(), 43);
        assert_ne!(session_token(), session_token());
    }
}
