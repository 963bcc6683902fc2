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

//! # Flake identifiers
//!
//! Application users & events are identified by 64-bit "flake" ids: 41 bits of milliseconds since
//! 2015-05-01T00:00:00Z, ten bits of node id & twelve bits of sequence. Within one process, ids
//! handed out for the same `(application, kind)` sequence are strictly increasing; should the clock
//! step backwards, or should we exhaust the sequence space within a millisecond, we simply borrow
//! from the next millisecond.

use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, TimeZone, Utc};
use snafu::{prelude::*, Backtrace};

use crate::entities::{AppId, EventId, UserId};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Node id {node} is out of range (it must be less than 1024)"))]
    NodeId { node: u16, backtrace: Backtrace },
    #[snafu(display("The flake generator's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;

/// Milliseconds since the Unix epoch of 2015-05-01T00:00:00Z
const EPOCH_MILLIS: i64 = 1_430_438_400_000;

/// The sequences we mint ids for
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Kind {
    Users,
    Events,
}

/// Mint flake ids
#[derive(Debug)]
pub struct Flake {
    node: u64,
    // (application, kind) => (millis, sequence) of the last id handed out
    last: Mutex<HashMap<(AppId, Kind), (u64, u64)>>,
}

impl Flake {
    pub fn new(node: u16) -> Result<Flake> {
        ensure!(node <= MAX_NODE, NodeIdSnafu { node });
        Ok(Flake {
            node: node as u64,
            last: Mutex::new(HashMap::new()),
        })
    }
    fn next_at(&self, app: AppId, kind: Kind, now: DateTime<Utc>) -> Result<u64> {
        let now = (now.timestamp_millis() - EPOCH_MILLIS).max(0) as u64;
        let mut last = self.last.lock().map_err(|_| PoisonedSnafu.build())?;
        let (millis, seq) = match last.get(&(app, kind)) {
            Some((last_millis, last_seq)) if now <= *last_millis => {
                if *last_seq >= MAX_SEQUENCE {
                    (last_millis + 1, 0)
                } else {
                    (*last_millis, last_seq + 1)
                }
            }
            _ => (now, 0),
        };
        last.insert((app, kind), (millis, seq));
        Ok((millis << (NODE_BITS + SEQUENCE_BITS)) | (self.node << SEQUENCE_BITS) | seq)
    }
    pub fn next_user_id(&self, app: AppId) -> Result<UserId> {
        Ok(UserId::new(self.next_at(app, Kind::Users, Utc::now())?))
    }
    pub fn next_event_id(&self, app: AppId) -> Result<EventId> {
        Ok(EventId::new(self.next_at(app, Kind::Events, Utc::now())?))
    }
    /// Ids for organizations, members & applications; these share one sequence
    pub fn next_id(&self) -> Result<u64> {
        self.next_at(AppId::default(), Kind::Users, Utc::now())
    }
}

/// Recover the instant at which a flake id was minted
pub fn minted_at(id: u64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((id >> (NODE_BITS + SEQUENCE_BITS)) as i64 + EPOCH_MILLIS)
        .single()
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    #[test]
    fn strictly_increasing() {
        let flake = Flake::new(3).unwrap();
        let app = AppId::new(1);
        let now = Utc::now();
        let mut prev = 0;
        // Many ids in the same millisecond must overflow the sequence gracefully
        for _ in 0..10_000 {
            let id = flake.next_at(app, Kind::Events, now).unwrap();
            assert!(id > prev);
            prev = id;
        }
        // The clock going backwards mustn't produce a smaller id
        let id = flake
            .next_at(app, Kind::Events, now - Duration::seconds(5))
            .unwrap();
        assert!(id > prev);
    }

    #[test]
    fn sequences_are_independent() {
        let flake = Flake::new(0).unwrap();
        let now = Utc::now();
        let a = flake.next_at(AppId::new(1), Kind::Users, now).unwrap();
        let b = flake.next_at(AppId::new(2), Kind::Users, now).unwrap();
        assert_eq!(a, b);
        let c = flake.next_at(AppId::new(1), Kind::Events, now).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn layout() {
        assert!(Flake::new(1024).is_err());
        let flake = Flake::new(5).unwrap();
        let now = Utc::now();
        let id = flake.next_at(AppId::new(1), Kind::Users, now).unwrap();
        assert_eq!((id >> SEQUENCE_BITS) & MAX_NODE as u64, 5);
        assert_eq!(
            minted_at(id).unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
        assert!(id < (1 << 63));
    }
}
