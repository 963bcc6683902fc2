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

//! # Per-application rate limiting
//!
//! A fixed-window counter per bucket "hash" (in practice, the application token). The first request
//! in a window opens it with `max` permits; each request consumes one; once they're gone, requests
//! are refused until the window closes. The limiter is consulted on every authenticated request, so
//! if it can't be reached the request fails: we never fall back to letting traffic through.

use std::{collections::HashMap, sync::Arc, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use sqlx::{PgPool, Row};

use crate::entities::Application;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The rate limit window {window:?} is out of range"))]
    Window {
        window: Duration,
        source: chrono::OutOfRangeError,
        backtrace: Backtrace,
    },
    #[snafu(display("The rate limiter's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
    #[snafu(display("Failed to consult the rate limit table: {source}"))]
    Postgres {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Rate limits, by application kind
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Requests per window for applications in production
    pub production: u64,
    /// Requests per window for everyone else
    pub staging: u64,
    pub window: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            production: 10_000,
            staging: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl Limits {
    pub fn for_application(&self, app: &Application) -> u64 {
        if app.in_production {
            self.production
        } else {
            self.staging
        }
    }
}

/// The outcome of asking for a permit
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Grant {
    /// Whether this request may proceed
    pub granted: bool,
    /// Permits left in the current window, after this request
    pub remaining: u64,
    /// When the current window closes
    pub refresh_at: DateTime<Utc>,
}

#[async_trait]
pub trait Limiter {
    /// Ask for one permit from the bucket named `hash`, which holds `max` permits per `window`
    async fn request(&self, hash: &str, max: u64, window: Duration) -> Result<Grant>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           In-memory                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug)]
struct Bucket {
    remaining: u64,
    refresh_at: DateTime<Utc>,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct InMemory {
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: Clock,
}

impl Default for InMemory {
    fn default() -> Self {
        InMemory::new()
    }
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::with_clock(Arc::new(Utc::now))
    }
    /// Build a limiter that tells time by `clock`
    pub fn with_clock(clock: Clock) -> InMemory {
        InMemory {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl Limiter for InMemory {
    async fn request(&self, hash: &str, max: u64, window: Duration) -> Result<Grant> {
        let window = chrono::Duration::from_std(window).context(WindowSnafu { window })?;
        let now = (self.clock)();
        let mut buckets = self.buckets.lock().map_err(|_| PoisonedSnafu.build())?;
        let bucket = buckets
            .entry(hash.to_owned())
            .and_modify(|bucket| {
                if bucket.refresh_at <= now {
                    *bucket = Bucket {
                        remaining: max,
                        refresh_at: now + window,
                    };
                }
            })
            .or_insert(Bucket {
                remaining: max,
                refresh_at: now + window,
            });
        let granted = bucket.remaining > 0;
        if granted {
            bucket.remaining -= 1;
        }
        Ok(Grant {
            granted,
            remaining: bucket.remaining,
            refresh_at: bucket.refresh_at,
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Postgres                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [Limiter] backed by a single Postgres table
///
/// Each request is one upsert: open a fresh window if there's none (or the last one has closed),
/// otherwise take a permit. A `remaining` of -1 marks a request that arrived after the permits ran
/// out.
pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub async fn new(pool: PgPool) -> Result<Postgres> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_limits (
                 hash TEXT PRIMARY KEY,
                 remaining BIGINT NOT NULL,
                 refresh_at TIMESTAMPTZ NOT NULL)",
        )
        .execute(&pool)
        .await
        .context(PostgresSnafu)?;
        Ok(Postgres { pool })
    }
}

#[async_trait]
impl Limiter for Postgres {
    async fn request(&self, hash: &str, max: u64, window: Duration) -> Result<Grant> {
        let row = sqlx::query(
            "INSERT INTO rate_limits (hash, remaining, refresh_at)
                 VALUES ($1, $2 - 1, now() + make_interval(secs => $3))
             ON CONFLICT (hash) DO UPDATE SET
                 remaining = CASE WHEN rate_limits.refresh_at <= now() THEN $2 - 1
                                  ELSE GREATEST(rate_limits.remaining - 1, -1) END,
                 refresh_at = CASE WHEN rate_limits.refresh_at <= now() THEN EXCLUDED.refresh_at
                                   ELSE rate_limits.refresh_at END
             RETURNING remaining, refresh_at",
        )
        .bind(hash)
        .bind(max as i64)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .context(PostgresSnafu)?;
        let remaining: i64 = row.try_get("remaining").context(PostgresSnafu)?;
        let refresh_at: DateTime<Utc> = row.try_get("refresh_at").context(PostgresSnafu)?;
        Ok(Grant {
            granted: remaining >= 0,
            remaining: remaining.max(0) as u64,
            refresh_at,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicI64, Ordering};

    #[tokio::test]
    async fn fixed_window() {
        let start = Utc::now();
        let offset = Arc::new(AtomicI64::new(0));
        let clock_offset = offset.clone();
        let limiter = InMemory::with_clock(Arc::new(move || {
            start + chrono::Duration::seconds(clock_offset.load(Ordering::SeqCst))
        }));
        let window = Duration::from_secs(60);

        let mut last = u64::MAX;
        for i in 1..=10u64 {
            let grant = limiter.request("app", 10, window).await.unwrap();
            assert!(grant.granted);
            assert_eq!(grant.remaining, 10 - i);
            assert!(grant.remaining <= last);
            last = grant.remaining;
        }
        let grant = limiter.request("app", 10, window).await.unwrap();
        assert!(!grant.granted);
        assert_eq!(grant.remaining, 0);
        assert_eq!(grant.refresh_at, start + chrono::Duration::seconds(60));

        // Buckets are independent
        assert!(limiter.request("other", 10, window).await.unwrap().granted);

        offset.store(61, Ordering::SeqCst);
        let grant = limiter.request("app", 10, window).await.unwrap();
        assert!(grant.granted);
        assert_eq!(grant.remaining, 9);
    }

    #[test]
    fn limits_by_application() {
        let limits = Limits::default();
        let mut app = Application::default();
        assert_eq!(limits.for_application(&app), 100);
        app.in_production = true;
        assert_eq!(limits.for_application(&app), 10_000);
    }
}
