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

//! # The connection graph
//!
//! Application users are joined by directed [Connection]s of two kinds. `follow` edges are
//! asymmetric. `friend` edges are symmetric, & we represent that by always writing the edge *and*
//! its mirror image in the same batch; that way "who are my friends" is answerable from the edges
//! pointing *at* me, just as "who follows me" is.
//!
//! The preconditions for a new edge are checked in the request handler, so that the caller gets a
//! meaningful error. By the time the applier takes the mutation off the log either endpoint may
//! have gone away, so it re-checks the endpoints ([endpoints_hold]) & drops the edge if they no
//! longer qualify. It can't re-check for an existing edge: the applier may see a record more than
//! once, which is also why everything that writes here is idempotent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use snafu::prelude::*;
use tracing::{debug, instrument};

use crate::{
    entities::{
        AppUser, Connection, ConnectionState, ConnectionType, Namespace, Relation, UserId,
    },
    problems::{Code, Problem, Problems},
    storage::{self, ConnectionFilter, Record, Store, UserFilter, UNBOUNDED},
};

/// The most users (or edges) any list operation will return
pub const PAGE_LIMIT: usize = 200;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A connection between {from} & {to} already exists"))]
    AlreadyExists { from: UserId, to: UserId },
    #[snafu(display("User {user} has not been activated"))]
    NotActivated { user: UserId },
    #[snafu(display("No connection from {from} to {to}"))]
    NotFound { from: UserId, to: UserId },
    #[snafu(display("User {user} may not connect to themselves"))]
    SelfConnection { user: UserId },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
    #[snafu(display("No user {user}"))]
    UserNotFound { user: UserId },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for Problems {
    fn from(err: Error) -> Self {
        match err {
            Error::AlreadyExists { .. } => Code::ConnectionAlreadyExists.into(),
            Error::NotActivated { .. } => Code::UserNotActivated.into(),
            Error::NotFound { .. } => Code::ConnectionNotFound.into(),
            Error::SelfConnection { .. } => Code::ConnectionSelf.into(),
            Error::UserNotFound { .. } => Code::UserNotFound.into(),
            Error::Storage { source } => Problem::internal(Code::Internal, source).into(),
        }
    }
}

async fn activated_user(store: &Store, ns: Namespace, user: UserId) -> Result<AppUser> {
    let found = store
        .app_user(ns, user)
        .await
        .context(StorageSnafu)?
        .context(UserNotFoundSnafu { user })?;
    ensure!(found.activated, NotActivatedSnafu { user });
    Ok(found)
}

/// Check the preconditions for a new edge `from` → `to` & build it
///
/// If the edge exists but has been disabled, the returned edge re-enables it (keeping its creation
/// time); if it exists & is enabled, that's an error.
#[instrument(skip(store))]
pub async fn prepare(
    store: &Store,
    ns: Namespace,
    from: UserId,
    to: UserId,
    kind: ConnectionType,
    state: ConnectionState,
    now: DateTime<Utc>,
) -> Result<Connection> {
    ensure!(from != to, SelfConnectionSnafu { user: from });
    activated_user(store, ns, from).await?;
    activated_user(store, ns, to).await?;
    let existing = store
        .connection_row(ns, from, to)
        .await
        .context(StorageSnafu)?;
    if let Some(existing) = &existing {
        ensure!(!existing.enabled, AlreadyExistsSnafu { from, to });
    }
    Ok(Connection {
        user_from_id: from,
        user_to_id: to,
        kind,
        state,
        enabled: true,
        confirmed_at: (state == ConnectionState::Confirmed).then_some(now),
        created_at: existing.map(|c| c.created_at).unwrap_or(now),
        updated_at: now,
    })
}

/// Write `connection`, along with its mirror if it's a friendship
pub async fn put(store: &Store, ns: Namespace, connection: Connection) -> Result<()> {
    let mut records = Vec::with_capacity(2);
    if connection.kind == ConnectionType::Friend {
        records.push(Record::Connection(ns, connection.mirror()));
    }
    records.push(Record::Connection(ns, connection));
    store.put_all(&records).await.context(StorageSnafu)
}

/// Create the edge `from` → `to`
pub async fn create(
    store: &Store,
    ns: Namespace,
    from: UserId,
    to: UserId,
    kind: ConnectionType,
    state: ConnectionState,
    now: DateTime<Utc>,
) -> Result<Connection> {
    let connection = prepare(store, ns, from, to, kind, state, now).await?;
    put(store, ns, connection.clone()).await?;
    Ok(connection)
}

/// Modify the edge `from` → `to` by `f`, propagating the change to the mirror of a friendship
async fn modify<F: Fn(&mut Connection)>(
    store: &Store,
    ns: Namespace,
    from: UserId,
    to: UserId,
    f: F,
) -> Result<Option<Connection>> {
    let connection = store
        .connection_row(ns, from, to)
        .await
        .context(StorageSnafu)?;
    match connection {
        Some(mut connection) => {
            f(&mut connection);
            put(store, ns, connection.clone()).await?;
            Ok(Some(connection))
        }
        None => Ok(None),
    }
}

/// Confirm the edge `from` → `to`
#[instrument(skip(store))]
pub async fn confirm(
    store: &Store,
    ns: Namespace,
    from: UserId,
    to: UserId,
    now: DateTime<Utc>,
) -> Result<Connection> {
    modify(store, ns, from, to, |c| {
        c.enabled = true;
        c.state = ConnectionState::Confirmed;
        c.confirmed_at = Some(now);
        c.updated_at = now;
    })
    .await?
    .context(NotFoundSnafu { from, to })
}

/// Disable the edge `from` → `to`; deleting an edge that isn't there is not an error
#[instrument(skip(store))]
pub async fn delete(
    store: &Store,
    ns: Namespace,
    from: UserId,
    to: UserId,
    now: DateTime<Utc>,
) -> Result<()> {
    modify(store, ns, from, to, |c| {
        c.enabled = false;
        c.updated_at = now;
    })
    .await?;
    Ok(())
}

/// Look up `ids`, returning the users found in the order given
pub async fn users_in_order(store: &Store, ns: Namespace, ids: &[UserId]) -> Result<Vec<AppUser>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut found = store
        .app_users(ns, UserFilter::Ids(ids.to_vec()), PAGE_LIMIT)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .map(|user| (user.id, user))
        .collect::<HashMap<UserId, AppUser>>();
    Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
}

async fn edge_ends(
    store: &Store,
    ns: Namespace,
    filter: ConnectionFilter,
    kind: Option<ConnectionType>,
    outbound: bool,
    limit: usize,
) -> Result<Vec<UserId>> {
    Ok(store
        .connections(ns, filter, kind, limit)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .map(|c| if outbound { c.user_to_id } else { c.user_from_id })
        .collect())
}

/// The users `user` follows
pub async fn follows(store: &Store, ns: Namespace, user: UserId) -> Result<Vec<AppUser>> {
    let ids = edge_ends(
        store,
        ns,
        ConnectionFilter::From(user),
        Some(ConnectionType::Follow),
        true,
        PAGE_LIMIT,
    )
    .await?;
    users_in_order(store, ns, &ids).await
}

/// The users following `user`
pub async fn followers(store: &Store, ns: Namespace, user: UserId) -> Result<Vec<AppUser>> {
    let ids = edge_ends(
        store,
        ns,
        ConnectionFilter::To(user),
        Some(ConnectionType::Follow),
        false,
        PAGE_LIMIT,
    )
    .await?;
    users_in_order(store, ns, &ids).await
}

/// `user`'s friends
///
/// We query by the edges pointing *at* `user`; the mirror guarantees they're all there.
pub async fn friends(store: &Store, ns: Namespace, user: UserId) -> Result<Vec<AppUser>> {
    let ids = edge_ends(
        store,
        ns,
        ConnectionFilter::To(user),
        Some(ConnectionType::Friend),
        false,
        PAGE_LIMIT,
    )
    .await?;
    users_in_order(store, ns, &ids).await
}

/// Everyone reachable over an enabled edge out of `user`
///
/// Unlike the listings, this is not paged: feeds are built over the whole network.
pub async fn friends_and_following(
    store: &Store,
    ns: Namespace,
    user: UserId,
) -> Result<Vec<UserId>> {
    edge_ends(store, ns, ConnectionFilter::From(user), None, true, UNBOUNDED).await
}

/// `user`'s live connections in some state, split by direction
#[derive(Clone, Debug, Default)]
pub struct ByState {
    /// Edges pointing at `user`
    pub incoming: Vec<Connection>,
    /// Edges out of `user`
    pub outgoing: Vec<Connection>,
}

impl ByState {
    /// The users at the far end of each edge, each once, in edge order
    pub fn others(&self, user: UserId) -> Vec<UserId> {
        self.incoming
            .iter()
            .chain(self.outgoing.iter())
            .map(|c| if c.user_from_id == user { c.user_to_id } else { c.user_from_id })
            .unique()
            .collect()
    }
    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.outgoing.is_empty()
    }
}

/// `user`'s connections (in either direction) that are in `state`
#[instrument(skip(store))]
pub async fn by_state(
    store: &Store,
    ns: Namespace,
    user: UserId,
    state: ConnectionState,
) -> Result<ByState> {
    let (incoming, outgoing) = store
        .connections_in_state(ns, ConnectionFilter::Touching(user), state, PAGE_LIMIT)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .partition(|c| c.user_to_id == user);
    Ok(ByState { incoming, outgoing })
}

/// Whether both ends of `connection` may (still) be joined
///
/// The applier's re-check: distinct endpoints, both present & activated. An edge that already
/// exists is fine; this may be a redelivery.
pub async fn endpoints_hold(store: &Store, ns: Namespace, connection: &Connection) -> Result<bool> {
    if connection.user_from_id == connection.user_to_id {
        return Ok(false);
    }
    for user in [connection.user_from_id, connection.user_to_id] {
        match activated_user(store, ns, user).await {
            Ok(_) => (),
            Err(Error::NotActivated { .. } | Error::UserNotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

/// How `other` relates to `user`
pub async fn relation(store: &Store, ns: Namespace, user: UserId, other: UserId) -> Result<Relation> {
    Ok(store
        .connections(ns, ConnectionFilter::Between(user, other), None, PAGE_LIMIT)
        .await
        .context(StorageSnafu)?
        .into_iter()
        .fold(Relation::default(), |mut rel, c| {
            match c.kind {
                ConnectionType::Friend => rel.is_friend = true,
                ConnectionType::Follow if c.user_from_id == user => rel.is_followed = true,
                ConnectionType::Follow => rel.is_follower = true,
            }
            rel
        }))
}

/// Whether there's an enabled edge, in either direction, between `user` & `other`
pub async fn connected(store: &Store, ns: Namespace, user: UserId, other: UserId) -> Result<bool> {
    let rel = relation(store, ns, user, other).await?;
    Ok(rel.is_friend || rel.is_follower || rel.is_followed)
}

/// Annotate `user` with their friend, follower & followed counts
pub async fn with_counts(store: &Store, ns: Namespace, mut user: AppUser) -> Result<AppUser> {
    let friends = store
        .count_connections(ns, ConnectionFilter::To(user.id), Some(ConnectionType::Friend))
        .await
        .context(StorageSnafu)?;
    let followers = store
        .count_connections(ns, ConnectionFilter::To(user.id), Some(ConnectionType::Follow))
        .await
        .context(StorageSnafu)?;
    let followed = store
        .count_connections(ns, ConnectionFilter::From(user.id), Some(ConnectionType::Follow))
        .await
        .context(StorageSnafu)?;
    user.friend_count = Some(friends as u64);
    user.follower_count = Some(followers as u64);
    user.followed_count = Some(followed as u64);
    Ok(user)
}

/// Connect `from` to each of `targets`, skipping any that can't (or needn't) be connected
#[instrument(skip(store, targets))]
pub async fn auto_connect_social_friends(
    store: &Store,
    ns: Namespace,
    from: UserId,
    kind: ConnectionType,
    state: ConnectionState,
    targets: &[UserId],
    now: DateTime<Utc>,
) -> Result<Vec<Connection>> {
    let mut made = Vec::new();
    for to in targets {
        match create(store, ns, from, *to, kind, state, now).await {
            Ok(connection) => made.push(connection),
            Err(err @ Error::Storage { .. }) => return Err(err),
            Err(err) => debug!("Not connecting {} to {}: {}", from, to, err),
        }
    }
    Ok(made)
}

/// Connect `from` to every user whose id on `platform` is among `social_ids`
#[allow(clippy::too_many_arguments)]
#[instrument(skip(store, social_ids))]
pub async fn social_connect(
    store: &Store,
    ns: Namespace,
    from: UserId,
    platform: &str,
    social_ids: &[String],
    kind: ConnectionType,
    state: ConnectionState,
    now: DateTime<Utc>,
) -> Result<Vec<Connection>> {
    let targets = store
        .app_users(
            ns,
            UserFilter::Social {
                platform: platform.to_owned(),
                ids: social_ids.to_vec(),
            },
            PAGE_LIMIT,
        )
        .await
        .context(StorageSnafu)?
        .into_iter()
        .map(|user| user.id)
        .filter(|id| *id != from)
        .collect::<Vec<UserId>>();
    auto_connect_social_friends(store, ns, from, kind, state, &targets, now).await
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use crate::{
        entities::{AppId, OrgId},
        memory::InMemory,
    };

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    async fn fixture(ids: &[u64]) -> Store {
        let store = Store::new(Arc::new(InMemory::new()));
        for id in ids {
            let mut user = AppUser {
                id: UserId::new(*id),
                user_name: format!("user{}", id),
                email: format!("user{}@example.com", id),
                activated: true,
                enabled: true,
                ..Default::default()
            };
            user.social_ids
                .insert("facebook".to_owned(), format!("fb{}", id));
            store.put(Record::AppUser(ns(), user)).await.unwrap();
        }
        store
    }

    fn ids(users: &[AppUser]) -> Vec<u64> {
        users.iter().map(|u| u.id.as_u64()).collect()
    }

    #[tokio::test]
    async fn friends_are_mirrored() {
        let store = fixture(&[100, 200]).await;
        let (a, b) = (UserId::new(100), UserId::new(200));
        let now = Utc::now();
        create(&store, ns(), a, b, ConnectionType::Friend, ConnectionState::Confirmed, now)
            .await
            .unwrap();
        assert_eq!(ids(&friends(&store, ns(), b).await.unwrap()), vec![100]);
        assert_eq!(ids(&friends(&store, ns(), a).await.unwrap()), vec![200]);
        let mirror = store.connection(ns(), b, a).await.unwrap().unwrap();
        assert_eq!(mirror.confirmed_at, Some(now));
        assert!(relation(&store, ns(), a, b).await.unwrap().is_friend);

        // Deleting disables both halves...
        delete(&store, ns(), a, b, Utc::now()).await.unwrap();
        assert!(store.connection(ns(), b, a).await.unwrap().is_none());
        assert!(friends(&store, ns(), b).await.unwrap().is_empty());
        // ...& the edge may be re-created
        create(&store, ns(), a, b, ConnectionType::Friend, ConnectionState::Pending, Utc::now())
            .await
            .unwrap();
        assert!(store.connection(ns(), b, a).await.unwrap().unwrap().enabled);
    }

    #[tokio::test]
    async fn preconditions() {
        let store = fixture(&[100, 200]).await;
        let (a, b) = (UserId::new(100), UserId::new(200));
        let now = Utc::now();
        assert!(matches!(
            create(&store, ns(), a, a, ConnectionType::Follow, ConnectionState::Pending, now).await,
            Err(Error::SelfConnection { .. })
        ));
        assert!(matches!(
            create(&store, ns(), a, UserId::new(300), ConnectionType::Follow, ConnectionState::Pending, now).await,
            Err(Error::UserNotFound { .. })
        ));
        create(&store, ns(), a, b, ConnectionType::Follow, ConnectionState::Pending, now)
            .await
            .unwrap();
        assert!(matches!(
            create(&store, ns(), a, b, ConnectionType::Follow, ConnectionState::Pending, now).await,
            Err(Error::AlreadyExists { .. })
        ));
        let mut inactive = store.app_user(ns(), b).await.unwrap().unwrap();
        inactive.activated = false;
        store.put(Record::AppUser(ns(), inactive)).await.unwrap();
        assert!(matches!(
            create(&store, ns(), b, a, ConnectionType::Follow, ConnectionState::Pending, now).await,
            Err(Error::NotActivated { .. })
        ));
        assert!(matches!(
            confirm(&store, ns(), b, a, now).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn follows_and_followers() {
        let store = fixture(&[100, 200, 300, 400]).await;
        let now = Utc::now();
        for to in [300, 200, 400] {
            create(
                &store,
                ns(),
                UserId::new(100),
                UserId::new(to),
                ConnectionType::Follow,
                ConnectionState::Confirmed,
                now,
            )
            .await
            .unwrap();
        }
        // Edge insertion order, not id order
        assert_eq!(
            ids(&follows(&store, ns(), UserId::new(100)).await.unwrap()),
            vec![300, 200, 400]
        );
        assert_eq!(
            ids(&followers(&store, ns(), UserId::new(200)).await.unwrap()),
            vec![100]
        );
        let rel = relation(&store, ns(), UserId::new(100), UserId::new(200))
            .await
            .unwrap();
        assert!(rel.is_followed && !rel.is_follower && !rel.is_friend);
        let rel = relation(&store, ns(), UserId::new(200), UserId::new(100))
            .await
            .unwrap();
        assert!(rel.is_follower && !rel.is_followed);
        let user = store.app_user(ns(), UserId::new(100)).await.unwrap().unwrap();
        let user = with_counts(&store, ns(), user).await.unwrap();
        assert_eq!(user.followed_count, Some(3));
        assert_eq!(user.follower_count, Some(0));
    }

    #[tokio::test]
    async fn networks_are_not_paged() {
        let targets = (1..=250).map(|n| 1000 + n).collect::<Vec<u64>>();
        let mut everyone = vec![100];
        everyone.extend(&targets);
        let store = fixture(&everyone).await;
        let now = Utc::now();
        for to in &targets {
            create(
                &store,
                ns(),
                UserId::new(100),
                UserId::new(*to),
                ConnectionType::Follow,
                ConnectionState::Confirmed,
                now,
            )
            .await
            .unwrap();
        }
        let network = friends_and_following(&store, ns(), UserId::new(100))
            .await
            .unwrap();
        assert_eq!(network.len(), 250);
        assert_eq!(network.last(), Some(&UserId::new(1250)));
        // ...but listings are
        assert_eq!(
            follows(&store, ns(), UserId::new(100)).await.unwrap().len(),
            PAGE_LIMIT
        );
    }

    #[tokio::test]
    async fn listing_by_state() {
        let store = fixture(&[100, 200, 300, 400]).await;
        let (a, b, c, d) = (
            UserId::new(100),
            UserId::new(200),
            UserId::new(300),
            UserId::new(400),
        );
        let now = Utc::now();
        create(&store, ns(), a, b, ConnectionType::Follow, ConnectionState::Pending, now)
            .await
            .unwrap();
        create(&store, ns(), c, a, ConnectionType::Follow, ConnectionState::Pending, now)
            .await
            .unwrap();
        create(&store, ns(), d, a, ConnectionType::Follow, ConnectionState::Rejected, now)
            .await
            .unwrap();
        create(&store, ns(), b, c, ConnectionType::Follow, ConnectionState::Pending, now)
            .await
            .unwrap();

        let pending = by_state(&store, ns(), a, ConnectionState::Pending).await.unwrap();
        assert_eq!(pending.outgoing.len(), 1);
        assert_eq!(pending.outgoing[0].user_to_id, b);
        assert_eq!(pending.incoming.len(), 1);
        assert_eq!(pending.incoming[0].user_from_id, c);
        assert_eq!(pending.others(a), vec![c, b]);

        let rejected = by_state(&store, ns(), a, ConnectionState::Rejected).await.unwrap();
        assert!(rejected.outgoing.is_empty());
        assert_eq!(rejected.others(a), vec![d]);

        // Confirming moves the edge out of "pending"
        confirm(&store, ns(), a, b, now).await.unwrap();
        let pending = by_state(&store, ns(), a, ConnectionState::Pending).await.unwrap();
        assert!(pending.outgoing.is_empty());
        assert!(by_state(&store, ns(), d, ConnectionState::Confirmed)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn endpoints_are_rechecked() {
        let store = fixture(&[100, 200]).await;
        let (a, b) = (UserId::new(100), UserId::new(200));
        let now = Utc::now();
        let edge = create(&store, ns(), a, b, ConnectionType::Follow, ConnectionState::Pending, now)
            .await
            .unwrap();
        // An existing edge is a redelivery, not a failure
        assert!(endpoints_hold(&store, ns(), &edge).await.unwrap());
        let looped = Connection {
            user_to_id: a,
            ..edge.clone()
        };
        assert!(!endpoints_hold(&store, ns(), &looped).await.unwrap());
        store
            .delete(storage::Key::AppUser(ns(), b))
            .await
            .unwrap();
        assert!(!endpoints_hold(&store, ns(), &edge).await.unwrap());
    }

    #[tokio::test]
    async fn social() {
        let store = fixture(&[100, 200, 300]).await;
        let now = Utc::now();
        let a = UserId::new(100);
        create(&store, ns(), a, UserId::new(200), ConnectionType::Friend, ConnectionState::Confirmed, now)
            .await
            .unwrap();
        let made = social_connect(
            &store,
            ns(),
            a,
            "facebook",
            &["fb100".to_owned(), "fb200".to_owned(), "fb300".to_owned()],
            ConnectionType::Friend,
            ConnectionState::Confirmed,
            now,
        )
        .await
        .unwrap();
        // 100 is `a` itself, & 200 is already a friend
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].user_to_id, UserId::new(300));
        assert_eq!(
            ids(&friends(&store, ns(), UserId::new(300)).await.unwrap()),
            vec![100]
        );
    }
}
