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

//! # The ordered log
//!
//! Mutations don't go straight to the store; they're appended to a sharded, append-only log &
//! applied later by the [applier]. A record's shard is a stable function of its partition key, so
//! records sharing a key are read back in the order they were appended. Nothing is ever removed
//! from the log: each consumer keeps a cursor per shard & only moves it past a record once that
//! record has been applied. Delivery is therefore at-least-once.
//!
//! [applier]: crate::applier
//!
//! One physical shard carries many logical streams; each record is an [Envelope] naming its stream
//! & carrying its payload as base64-encoded JSON:
//!
//! ```json
//! {"stream_name": "connection.create", "message": "eyJvcmdfaWQiOjEsImFwcF9pZCI6Mn0="}
//! ```

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::{prelude::*, Backtrace};
use sqlx::{PgPool, Row};
use tracing::debug;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to base64-decode a log record: {source}"))]
    Base64 {
        source: base64::DecodeError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a {stream} record: {source}"))]
    De {
        stream: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The log's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
    #[snafu(display("Log operation failed: {source}"))]
    Postgres {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a {stream} record: {source}"))]
    Ser {
        stream: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("There is no shard {shard}"))]
    Shard { shard: u32, backtrace: Backtrace },
    #[snafu(display("A log must have at least one shard"))]
    NoShards { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A log record: a logical stream name & a base64-encoded JSON payload
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Envelope {
    pub stream_name: String,
    pub message: String,
}

impl Envelope {
    pub fn pack<T: Serialize>(stream_name: &str, payload: &T) -> Result<Envelope> {
        let json = serde_json::to_vec(payload).context(SerSnafu {
            stream: stream_name.to_owned(),
        })?;
        Ok(Envelope {
            stream_name: stream_name.to_owned(),
            message: STANDARD.encode(json),
        })
    }
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T> {
        let json = STANDARD.decode(&self.message).context(Base64Snafu)?;
        serde_json::from_slice(&json).context(DeSnafu {
            stream: self.stream_name.clone(),
        })
    }
}

/// Map a partition key to one of `shards` shards
pub fn shard_for(partition_key: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(partition_key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    prefix % shards.max(1)
}

/// A record, as read back from the log
#[derive(Clone, Debug, PartialEq)]
pub struct Entry {
    pub shard: u32,
    /// Position within the shard; strictly increasing
    pub seq: u64,
    pub partition_key: String,
    pub envelope: Envelope,
}

#[async_trait]
pub trait Log {
    /// The number of shards; fixed for the lifetime of the process
    fn shards(&self) -> u32;
    /// Durably append `envelope` to the shard owning `partition_key`
    async fn append(&self, partition_key: &str, envelope: &Envelope) -> Result<()>;
    /// Read up to `max` records from `shard` lying past `consumer`'s cursor, in order
    async fn read(&self, shard: u32, consumer: &str, max: usize) -> Result<Vec<Entry>>;
    /// Move `consumer`'s cursor on `shard` past `seq`
    async fn commit(&self, shard: u32, consumer: &str, seq: u64) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           In-memory                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct Shard {
    entries: Vec<Entry>,
    cursors: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct InMemory {
    shards: Mutex<Vec<Shard>>,
    count: u32,
}

impl InMemory {
    pub fn new(shards: u32) -> Result<InMemory> {
        ensure!(shards > 0, NoShardsSnafu);
        Ok(InMemory {
            shards: Mutex::new((0..shards).map(|_| Shard::default()).collect()),
            count: shards,
        })
    }
}

#[async_trait]
impl Log for InMemory {
    fn shards(&self) -> u32 {
        self.count
    }
    async fn append(&self, partition_key: &str, envelope: &Envelope) -> Result<()> {
        let shard = shard_for(partition_key, self.count);
        let mut shards = self.shards.lock().map_err(|_| PoisonedSnafu.build())?;
        let target = shards.get_mut(shard as usize).context(ShardSnafu { shard })?;
        let seq = target.entries.len() as u64 + 1;
        target.entries.push(Entry {
            shard,
            seq,
            partition_key: partition_key.to_owned(),
            envelope: envelope.clone(),
        });
        debug!("Appended {} to shard {} at {}", envelope.stream_name, shard, seq);
        Ok(())
    }
    async fn read(&self, shard: u32, consumer: &str, max: usize) -> Result<Vec<Entry>> {
        let shards = self.shards.lock().map_err(|_| PoisonedSnafu.build())?;
        let source = shards.get(shard as usize).context(ShardSnafu { shard })?;
        let cursor = source.cursors.get(consumer).copied().unwrap_or(0);
        // seq n lives at index n - 1
        Ok(source
            .entries
            .iter()
            .skip(cursor as usize)
            .take(max)
            .cloned()
            .collect())
    }
    async fn commit(&self, shard: u32, consumer: &str, seq: u64) -> Result<()> {
        let mut shards = self.shards.lock().map_err(|_| PoisonedSnafu.build())?;
        let target = shards.get_mut(shard as usize).context(ShardSnafu { shard })?;
        let cursor = target.cursors.entry(consumer.to_owned()).or_insert(0);
        *cursor = (*cursor).max(seq);
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Postgres                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A [Log] kept in two Postgres tables: `log_records` & `log_cursors`
pub struct Postgres {
    pool: PgPool,
    shards: u32,
}

impl Postgres {
    pub async fn new(pool: PgPool, shards: u32) -> Result<Postgres> {
        ensure!(shards > 0, NoShardsSnafu);
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS log_records (
                 shard INTEGER NOT NULL,
                 seq BIGINT NOT NULL,
                 partition_key TEXT NOT NULL,
                 stream_name TEXT NOT NULL,
                 message TEXT NOT NULL,
                 appended_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                 PRIMARY KEY (shard, seq))",
        )
        .execute(&pool)
        .await
        .context(PostgresSnafu)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS log_cursors (
                 shard INTEGER NOT NULL,
                 consumer TEXT NOT NULL,
                 position BIGINT NOT NULL,
                 PRIMARY KEY (shard, consumer))",
        )
        .execute(&pool)
        .await
        .context(PostgresSnafu)?;
        Ok(Postgres { pool, shards })
    }
}

#[async_trait]
impl Log for Postgres {
    fn shards(&self) -> u32 {
        self.shards
    }
    async fn append(&self, partition_key: &str, envelope: &Envelope) -> Result<()> {
        let shard = shard_for(partition_key, self.shards) as i32;
        let mut tx = self.pool.begin().await.context(PostgresSnafu)?;
        // Serialize appends per shard, so that sequence numbers commit in order
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(shard as i64)
            .execute(&mut *tx)
            .await
            .context(PostgresSnafu)?;
        sqlx::query(
            "INSERT INTO log_records (shard, seq, partition_key, stream_name, message)
             SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4 FROM log_records WHERE shard = $1",
        )
        .bind(shard)
        .bind(partition_key)
        .bind(&envelope.stream_name)
        .bind(&envelope.message)
        .execute(&mut *tx)
        .await
        .context(PostgresSnafu)?;
        tx.commit().await.context(PostgresSnafu)
    }
    async fn read(&self, shard: u32, consumer: &str, max: usize) -> Result<Vec<Entry>> {
        ensure!(shard < self.shards, ShardSnafu { shard });
        sqlx::query(
            "SELECT r.seq, r.partition_key, r.stream_name, r.message
             FROM log_records r
             WHERE r.shard = $1
               AND r.seq > COALESCE(
                     (SELECT position FROM log_cursors WHERE shard = $1 AND consumer = $2), 0)
             ORDER BY r.seq
             LIMIT $3",
        )
        .bind(shard as i32)
        .bind(consumer)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .context(PostgresSnafu)?
        .into_iter()
        .map(|row| {
            Ok(Entry {
                shard,
                seq: row.try_get::<i64, _>("seq").context(PostgresSnafu)? as u64,
                partition_key: row.try_get("partition_key").context(PostgresSnafu)?,
                envelope: Envelope {
                    stream_name: row.try_get("stream_name").context(PostgresSnafu)?,
                    message: row.try_get("message").context(PostgresSnafu)?,
                },
            })
        })
        .collect()
    }
    async fn commit(&self, shard: u32, consumer: &str, seq: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO log_cursors (shard, consumer, position) VALUES ($1, $2, $3)
             ON CONFLICT (shard, consumer)
             DO UPDATE SET position = GREATEST(log_cursors.position, EXCLUDED.position)",
        )
        .bind(shard as i32)
        .bind(consumer)
        .bind(seq as i64)
        .execute(&self.pool)
        .await
        .context(PostgresSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Payload {
        user_id: u64,
        note: String,
    }

    #[test]
    fn envelope_wire_form() {
        let payload = Payload {
            user_id: 100,
            note: "hi".to_owned(),
        };
        let envelope = Envelope::pack("event.create", &payload).unwrap();
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["stream_name"], "event.create");
        let decoded = STANDARD
            .decode(json["message"].as_str().unwrap())
            .unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&decoded).unwrap()["user_id"],
            100
        );
        assert_eq!(envelope.unpack::<Payload>().unwrap(), payload);

        let garbage = Envelope {
            stream_name: "event.create".to_owned(),
            message: "not base64!".to_owned(),
        };
        assert!(garbage.unpack::<Payload>().is_err());
    }

    #[test]
    fn shards_are_stable() {
        assert_eq!(shard_for("2-100", 4), shard_for("2-100", 4));
        assert!((0..100).all(|i| shard_for(&format!("2-{}", i), 4) < 4));
        assert_eq!(shard_for("anything", 1), 0);
    }

    #[tokio::test]
    async fn per_key_order_and_cursors() {
        let log = InMemory::new(4).unwrap();
        for i in 0..5 {
            let envelope = Envelope::pack("event.create", &i).unwrap();
            log.append("2-100", &envelope).await.unwrap();
        }
        let shard = shard_for("2-100", 4);
        let entries = log.read(shard, "applier", 3).await.unwrap();
        assert_eq!(
            entries
                .iter()
                .map(|e| e.envelope.unpack::<i32>().unwrap())
                .collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // Nothing moves until we commit
        assert_eq!(log.read(shard, "applier", 3).await.unwrap(), entries);
        log.commit(shard, "applier", entries[1].seq).await.unwrap();
        let entries = log.read(shard, "applier", 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].envelope.unpack::<i32>().unwrap(), 2);
        // Cursors never move backwards, & are per-consumer
        log.commit(shard, "applier", 1).await.unwrap();
        assert_eq!(log.read(shard, "applier", 10).await.unwrap().len(), 3);
        assert_eq!(log.read(shard, "other", 10).await.unwrap().len(), 5);
        assert!(log.read(4, "applier", 10).await.is_err());
    }
}
