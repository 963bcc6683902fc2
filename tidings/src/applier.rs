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

//! # The applier
//!
//! The applier drains the [ordered log], decoding each record & applying it to the [store]. It runs
//! one consumer task per shard; within a shard, records are applied strictly in order.
//!
//! [ordered log]: crate::ordered_log
//! [store]: crate::storage
//!
//! Delivery is at-least-once: a consumer only moves its cursor past a record after that record has
//! been applied, so a crash (or shutdown) between the two means the record is applied again on
//! restart. Every operation here is therefore idempotent: writes are upserts on the entity's
//! natural key & deletes just clear `enabled`.
//!
//! A record that fails to apply is retried with exponential backoff until a deadline passes. At that
//! point the consumer gives up on the rest of its batch *without* advancing its cursor, & starts
//! over on its next poll. A poison record will hence stall its shard (and be loudly logged, and
//! show up in the `applier.consecutive.failures` gauge) rather than be silently dropped.

use std::{future::Future, pin::Pin, sync::Arc, task::Poll, time::Duration};

use chrono::Utc;
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle, JoinSet},
    time::Instant,
};
use tower::retry::backoff::{Backoff, ExponentialBackoffMaker, MakeBackoff};
use tracing::{debug, error, info, warn};

use crate::{
    counter_add,
    dispatcher::{self, Mutation},
    entities::Namespace,
    gauge_setu,
    graph,
    identity_cache::IdentityCache,
    metrics::{self, Instruments, Sort},
    ordered_log::{self, Entry, Log},
    storage::{self, Key, Record, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid backoff parameters: {source}"))]
    Backoff {
        source: tower::retry::backoff::InvalidBackoff,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode a log record: {source}"))]
    Decode { source: dispatcher::Error },
    #[snafu(display("Failed to update the connection graph: {source}"))]
    Graph { source: graph::Error },
    #[snafu(display("Applier failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read or commit on shard {shard}: {source}"))]
    Log {
        shard: u32,
        source: ordered_log::Error,
    },
    #[snafu(display("Shut down while retrying a record"))]
    ShuttingDown,
    #[snafu(display("Timeout shutting-down the applier: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration parameters for the applier
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The name under which the applier's cursors are kept
    pub consumer: String,
    /// How long to wait before polling an empty shard again
    #[serde(rename = "poll-interval")]
    pub poll_interval: Duration,
    /// The most records to read from a shard at once
    #[serde(rename = "batch-size")]
    pub batch_size: usize,
    #[serde(rename = "backoff-min")]
    pub backoff_min: Duration,
    #[serde(rename = "backoff-max")]
    pub backoff_max: Duration,
    /// Jitter, in [0, 100)
    #[serde(rename = "backoff-jitter")]
    pub backoff_jitter: f64,
    /// How long to keep retrying one record before abandoning the batch
    pub deadline: Duration,
    /// Amount of time to wait for the consumers on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            consumer: "applier".to_owned(),
            poll_interval: Duration::from_millis(100),
            batch_size: 64,
            backoff_min: Duration::from_millis(50),
            backoff_max: Duration::from_secs(5),
            backoff_jitter: 0.5,
            deadline: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything [apply] needs
#[derive(Clone)]
pub struct Context {
    pub store: Store,
    pub cache: Arc<IdentityCache>,
    pub instruments: Arc<Instruments>,
}

inventory::submit! { metrics::Registration::new("applier.records.applied", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("applier.consecutive.failures", Sort::IntegralGauge) }

async fn tombstone_application(ctx: &Context, ns: Namespace) -> Result<()> {
    ctx.store
        .delete(Key::Application(ns.org_id, ns.app_id))
        .await
        .context(StorageSnafu)?;
    ctx.store
        .delete(Key::Namespace(ns))
        .await
        .context(StorageSnafu)?;
    ctx.cache.invalidate(ns.app_id).await;
    Ok(())
}

/// Apply one mutation to the store
pub async fn apply(ctx: &Context, mutation: Mutation) -> Result<()> {
    let store = &ctx.store;
    match mutation {
        Mutation::OrgUpdate(rec) => {
            let mut org = rec.organization;
            org.id = rec.org_id;
            store
                .put(Record::Organization(org))
                .await
                .context(StorageSnafu)
        }
        Mutation::OrgDelete(key) => {
            store
                .delete(Key::Organization(key.org_id))
                .await
                .context(StorageSnafu)?;
            for member in store.members(key.org_id).await.context(StorageSnafu)? {
                store
                    .delete(Key::Member(key.org_id, member.id))
                    .await
                    .context(StorageSnafu)?;
            }
            for app in store.applications(key.org_id).await.context(StorageSnafu)? {
                tombstone_application(ctx, app.namespace()).await?;
            }
            Ok(())
        }
        Mutation::MemberCreate(rec) | Mutation::MemberUpdate(rec) => {
            let mut member = rec.member;
            member.id = rec.member_id;
            member.org_id = rec.org_id;
            store.put(Record::Member(member)).await.context(StorageSnafu)
        }
        Mutation::MemberDelete(key) => store
            .delete(Key::Member(key.org_id, key.member_id))
            .await
            .context(StorageSnafu),
        Mutation::AppCreate(rec) | Mutation::AppUpdate(rec) => {
            let mut app = rec.application;
            app.id = rec.app_id;
            app.org_id = rec.org_id;
            store
                .put(Record::Application(app))
                .await
                .context(StorageSnafu)?;
            ctx.cache.invalidate(rec.app_id).await;
            Ok(())
        }
        Mutation::AppDelete(key) => {
            tombstone_application(ctx, Namespace::new(key.org_id, key.app_id)).await
        }
        Mutation::AppUserUpdate(rec) => {
            let ns = Namespace::new(rec.org_id, rec.app_id);
            store
                .put(Record::AppUser(ns, rec.user.without_derived()))
                .await
                .context(StorageSnafu)
        }
        Mutation::AppUserDelete(key) => {
            let ns = Namespace::new(key.org_id, key.app_id);
            store
                .delete(Key::AppUser(ns, key.user_id))
                .await
                .context(StorageSnafu)?;
            for session in store.sessions(ns, key.user_id).await.context(StorageSnafu)? {
                store
                    .delete(Key::Session(ns, session.session_token))
                    .await
                    .context(StorageSnafu)?;
            }
            Ok(())
        }
        Mutation::ConnectionCreate(rec) | Mutation::ConnectionUpdate(rec) => {
            let ns = rec.namespace();
            // Either end may have gone away since the request was checked
            if !graph::endpoints_hold(store, ns, &rec.connection)
                .await
                .context(GraphSnafu)?
            {
                warn!(
                    "Dropping the connection {} -> {} in {}; an endpoint no longer qualifies",
                    rec.connection.user_from_id, rec.connection.user_to_id, ns
                );
                return Ok(());
            }
            graph::put(store, ns, rec.connection)
                .await
                .context(GraphSnafu)
        }
        Mutation::ConnectionConfirm(rec) => {
            let c = &rec.connection;
            match graph::confirm(
                store,
                rec.namespace(),
                c.user_from_id,
                c.user_to_id,
                c.confirmed_at.unwrap_or(c.updated_at),
            )
            .await
            {
                Err(err @ graph::Error::NotFound { .. }) => {
                    warn!("Ignoring a confirmation of a missing connection: {}", err);
                    Ok(())
                }
                result => result.map(|_| ()).context(GraphSnafu),
            }
        }
        Mutation::ConnectionDelete(rec) => {
            let c = &rec.connection;
            graph::delete(
                store,
                rec.namespace(),
                c.user_from_id,
                c.user_to_id,
                c.updated_at,
            )
            .await
            .context(GraphSnafu)
        }
        Mutation::ConnectionAutoConnect(rec) => {
            let made = graph::auto_connect_social_friends(
                store,
                Namespace::new(rec.org_id, rec.app_id),
                rec.user_from_id,
                rec.kind,
                rec.state,
                &rec.targets,
                Utc::now(),
            )
            .await
            .context(GraphSnafu)?;
            debug!("Auto-connected {} to {} users", rec.user_from_id, made.len());
            Ok(())
        }
        Mutation::ConnectionSocialConnect(rec) => {
            let made = graph::social_connect(
                store,
                Namespace::new(rec.org_id, rec.app_id),
                rec.user_from_id,
                &rec.platform,
                &rec.social_ids,
                rec.kind,
                rec.state,
                Utc::now(),
            )
            .await
            .context(GraphSnafu)?;
            debug!(
                "Connected {} to {} users on {}",
                rec.user_from_id,
                made.len(),
                rec.platform
            );
            Ok(())
        }
        Mutation::EventCreate(rec) | Mutation::EventUpdate(rec) => store
            .put(Record::Event(rec.namespace(), rec.event))
            .await
            .context(StorageSnafu),
        Mutation::EventDelete(key) => store
            .delete(Key::Event(Namespace::new(key.org_id, key.app_id), key.event_id))
            .await
            .context(StorageSnafu),
    }
}

/// Apply `entry`, retrying with backoff until it succeeds or `config.deadline` passes
async fn apply_with_retry(
    ctx: &Context,
    entry: &Entry,
    config: &Config,
    failures: &mut u64,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = ExponentialBackoffMaker::new(
        config.backoff_min,
        config.backoff_max,
        config.backoff_jitter,
        tower::util::rng::HasherRng::new(),
    )
    .context(BackoffSnafu)?
    .make_backoff();
    let deadline = Instant::now() + config.deadline;
    let shard = [opentelemetry::KeyValue::new("shard", entry.shard as i64)];
    loop {
        let result = match Mutation::from_envelope(&entry.envelope) {
            Ok(mutation) => apply(ctx, mutation).await,
            Err(err) => Err(err).context(DecodeSnafu),
        };
        match result {
            Ok(()) => {
                *failures = 0;
                gauge_setu!(ctx.instruments, "applier.consecutive.failures", 0, &shard);
                return Ok(());
            }
            Err(err) => {
                *failures += 1;
                gauge_setu!(
                    ctx.instruments,
                    "applier.consecutive.failures",
                    *failures,
                    &shard
                );
                error!(
                    stream = %entry.envelope.stream_name,
                    shard = entry.shard,
                    seq = entry.seq,
                    failures = *failures,
                    "Failed to apply a record: {}",
                    err
                );
                if Instant::now() >= deadline {
                    return Err(err);
                }
            }
        }
        tokio::select! {
            _ = backoff.next_backoff() => (),
            _ = shutdown.changed() => return ShuttingDownSnafu.fail(),
        }
    }
}

/// Drain one shard until told to stop
async fn consume(
    log: Arc<dyn Log + Send + Sync>,
    shard: u32,
    ctx: Context,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut failures = 0;
    while !*shutdown.borrow() {
        let entries = match log.read(shard, &config.consumer, config.batch_size).await {
            Ok(entries) => entries,
            Err(err) => {
                error!("Failed to read shard {}: {}", shard, err);
                Vec::new()
            }
        };
        if entries.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => (),
                _ = shutdown.changed() => break,
            }
            continue;
        }
        for entry in entries {
            match apply_with_retry(&ctx, &entry, &config, &mut failures, &mut shutdown).await {
                Ok(()) => {
                    log.commit(shard, &config.consumer, entry.seq)
                        .await
                        .context(LogSnafu { shard })?;
                    counter_add!(ctx.instruments, "applier.records.applied", 1, &[]);
                }
                Err(Error::ShuttingDown) => return Ok(()),
                Err(err) => {
                    // Leave the cursor where it is; we'll see this record again on the next poll
                    error!(
                        "Abandoning the batch on shard {} at {}: {}",
                        shard, entry.seq, err
                    );
                    break;
                }
            }
        }
    }
    debug!("Consumer for shard {} exiting", shard);
    Ok(())
}

async fn process(
    log: Arc<dyn Log + Send + Sync>,
    ctx: Context,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut consumers = JoinSet::new();
    for shard in 0..log.shards() {
        consumers.spawn(consume(
            log.clone(),
            shard,
            ctx.clone(),
            config.clone(),
            shutdown.clone(),
        ));
    }
    info!("Applier started with {} consumers", log.shards());
    // An error here means the sender's gone, which is as good as a shutdown request
    let _ = shutdown.changed().await;
    let results = tokio::time::timeout(config.shutdown_timeout, consumers.join_all())
        .await
        .context(ShutdownTimeoutSnafu)?;
    results.into_iter().collect::<Result<Vec<()>>>()?;
    Ok(())
}

/// Handle on a running applier
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: watch::Sender<bool>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the consumers to stop, & wait up to `timeout` for them to do so
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        let _ = self.shutdown.send(true);
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, watch::Sender<bool>) {
        (self.processor, self.shutdown)
    }
}

/// Start applying records from `log`
pub fn new(log: Arc<dyn Log + Send + Sync>, ctx: Context, config: Config) -> Processor {
    let (shutdown, receiver) = watch::channel(false);
    let processor = tokio::spawn(process(log, ctx, config, receiver));
    Processor {
        processor,
        shutdown,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        dispatcher::{AppUserKey, ConnectionWithIds, Dispatcher, EventWithIds},
        entities::{
            AppId, AppUser, Connection, ConnectionType, Event, EventId, OrgId, Session, UserId,
            Visibility,
        },
        memory::InMemory,
        ordered_log::{self, Envelope},
        storage::Tombstones,
    };

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    fn context() -> Context {
        let store = Store::new(Arc::new(InMemory::new()));
        let instruments = Arc::new(Instruments::new("tidings"));
        Context {
            cache: Arc::new(IdentityCache::new(store.clone(), 8, instruments.clone())),
            store,
            instruments,
        }
    }

    fn fast() -> Config {
        Config {
            poll_interval: Duration::from_millis(5),
            backoff_min: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            deadline: Duration::from_millis(50),
            ..Default::default()
        }
    }

    async fn eventually<F, Fut>(f: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if f().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn redelivery_is_harmless() {
        let ctx = context();
        let user = |id: u64| AppUser {
            id: UserId::new(id),
            activated: true,
            enabled: true,
            ..Default::default()
        };
        ctx.store
            .put_all(&[Record::AppUser(ns(), user(100)), Record::AppUser(ns(), user(200))])
            .await
            .unwrap();
        let create = Mutation::ConnectionCreate(ConnectionWithIds::new(
            ns(),
            Connection {
                user_from_id: UserId::new(100),
                user_to_id: UserId::new(200),
                kind: ConnectionType::Friend,
                enabled: true,
                ..Default::default()
            },
        ));
        apply(&ctx, create.clone()).await.unwrap();
        apply(&ctx, create).await.unwrap();
        let mirror = ctx
            .store
            .connection(ns(), UserId::new(200), UserId::new(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mirror.kind, ConnectionType::Friend);

        let event = Mutation::EventCreate(EventWithIds::new(
            ns(),
            Event {
                id: EventId::new(7),
                user_id: UserId::new(100),
                kind: "like".to_owned(),
                visibility: Visibility::PUBLIC,
                enabled: true,
                ..Default::default()
            },
        ));
        apply(&ctx, event.clone()).await.unwrap();
        apply(&ctx, event).await.unwrap();
        assert!(ctx.store.event(ns(), EventId::new(7)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_connections_are_dropped() {
        let ctx = context();
        ctx.store
            .put_all(&[
                Record::AppUser(
                    ns(),
                    AppUser {
                        id: UserId::new(100),
                        activated: true,
                        enabled: true,
                        ..Default::default()
                    },
                ),
                // Deactivated between the request & its application
                Record::AppUser(
                    ns(),
                    AppUser {
                        id: UserId::new(200),
                        enabled: true,
                        ..Default::default()
                    },
                ),
            ])
            .await
            .unwrap();
        let connect = |to: u64| {
            Mutation::ConnectionCreate(ConnectionWithIds::new(
                ns(),
                Connection {
                    user_from_id: UserId::new(100),
                    user_to_id: UserId::new(to),
                    kind: ConnectionType::Follow,
                    enabled: true,
                    ..Default::default()
                },
            ))
        };
        apply(&ctx, connect(200)).await.unwrap();
        apply(&ctx, connect(300)).await.unwrap();
        apply(&ctx, connect(100)).await.unwrap();
        for to in [200, 300, 100] {
            assert!(ctx
                .store
                .connection(ns(), UserId::new(100), UserId::new(to))
                .await
                .unwrap()
                .is_none());
        }
    }

    #[tokio::test]
    async fn deleting_a_user_revokes_sessions() {
        let ctx = context();
        ctx.store
            .put_all(&[
                Record::AppUser(
                    ns(),
                    AppUser {
                        id: UserId::new(100),
                        enabled: true,
                        ..Default::default()
                    },
                ),
                Record::Session(
                    ns(),
                    Session {
                        user_id: UserId::new(100),
                        session_token: "t".repeat(40),
                        enabled: true,
                        ..Default::default()
                    },
                ),
            ])
            .await
            .unwrap();
        apply(
            &ctx,
            Mutation::AppUserDelete(AppUserKey {
                org_id: OrgId::new(1),
                app_id: AppId::new(2),
                user_id: UserId::new(100),
            }),
        )
        .await
        .unwrap();
        assert!(ctx.store.session(ns(), &"t".repeat(40)).await.unwrap().is_none());
        let row = ctx
            .store
            .backend()
            .read(&Key::AppUser(ns(), UserId::new(100)), Tombstones::Include)
            .await
            .unwrap()
            .unwrap()
            .into_app_user()
            .unwrap();
        assert_eq!(row.deleted, Some(true));
    }

    #[tokio::test]
    async fn processor_drains_the_log() {
        let ctx = context();
        let log = Arc::new(ordered_log::InMemory::new(2).unwrap());
        let dispatcher = Dispatcher::new(log.clone(), ctx.instruments.clone());
        for i in 1..=5 {
            dispatcher
                .dispatch(Mutation::EventCreate(EventWithIds::new(
                    ns(),
                    Event {
                        id: EventId::new(i),
                        user_id: UserId::new(i * 100),
                        kind: "like".to_owned(),
                        visibility: Visibility::PUBLIC,
                        enabled: true,
                        ..Default::default()
                    },
                )))
                .await
                .unwrap();
        }
        let processor = new(log.clone(), ctx.clone(), fast());
        let drained = log.clone();
        eventually(|| {
            let log = drained.clone();
            async move {
                log.read(0, "applier", 10).await.unwrap().is_empty()
                    && log.read(1, "applier", 10).await.unwrap().is_empty()
            }
        })
        .await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        for i in 1..=5 {
            assert!(ctx.store.event(ns(), EventId::new(i)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn poison_records_hold_the_cursor() {
        let ctx = context();
        let log = Arc::new(ordered_log::InMemory::new(1).unwrap());
        log.append("2-100", &Envelope::pack("event.frobnicate", &1).unwrap())
            .await
            .unwrap();
        let processor = new(log.clone(), ctx, fast());
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        // Never acknowledged, never dropped
        assert_eq!(log.read(0, "applier", 10).await.unwrap().len(), 1);
    }
}
