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

//! Plumbing shared by the tidings integration test programs.

use std::env;

use futures::future::BoxFuture;
use libtest_mimic::Failed;
use reqwest::Url;
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tracing::Level;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to parse {pth}: {source}"))]
    De {
        pth: String,
        source: toml::de::Error,
    },
    #[snafu(display("Failed to read {pth}: {source}"))]
    Read { pth: String, source: std::io::Error },
}

type Result<T> = std::result::Result<T, Error>;

/// Common test configuration
///
/// Read from the TOML file named by `TIDINGS_TEST_CONFIG`, if that's set; every field has a
/// default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Log to stdout while the tests run
    pub logging: bool,
    #[serde(rename = "log-level", deserialize_with = "level_serde::deserialize")]
    pub log_level: Level,
    /// Requests per window allowed a staging application
    #[serde(rename = "staging-limit")]
    pub staging_limit: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            logging: false,
            log_level: Level::INFO,
            staging_limit: 1000,
        }
    }
}

mod level_serde {
    use serde::{Deserialize, Deserializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Level::from_str(&text).map_err(serde::de::Error::custom)
    }
}

impl Configuration {
    pub fn new() -> Result<Configuration> {
        match env::var("TIDINGS_TEST_CONFIG") {
            Ok(pth) => match std::fs::read_to_string(&pth) {
                Ok(text) => toml::from_str(&text).map_err(|err| DeSnafu { pth }.into_error(err)),
                Err(err) => Err(ReadSnafu { pth }.into_error(err)),
            },
            Err(_) => Ok(Configuration::default()),
        }
    }
}

/// A single integration test
///
/// `test_fn` is handed the API root of the tidings instance under test.
pub struct Test {
    pub name: &'static str,
    pub test_fn: fn(Url) -> BoxFuture<'static, std::result::Result<(), Failed>>,
}

inventory::collect!(Test);
