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

//! # Feeds & event search
//!
//! A user's feed is assembled at read time from three sources:
//!
//! 1. events at visibility "connections" or "public" authored by anyone the user has an enabled
//!    edge to
//! 2. events at visibility "global" authored by anyone else
//! 3. events whose target is the user
//!
//! The geo, location & object searches apply the same rule & then narrow further.

use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::{
    entities::{AppUser, Event, Namespace, UserId, Visibility},
    graph::{self, PAGE_LIMIT},
    problems::{Code, Problem, Problems},
    storage::{self, EventOrder, EventPredicate, Store},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read the connection graph: {source}"))]
    Graph { source: graph::Error },
    #[snafu(display("Storage error: {source}"))]
    Storage { source: storage::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for Problems {
    fn from(err: Error) -> Self {
        match err {
            Error::Graph { source } => source.into(),
            Error::Storage { source } => Problem::internal(Code::Internal, source).into(),
        }
    }
}

/// The smallest search radius we'll accept, in meters
pub const MIN_RADIUS: f64 = 2.0;

/// A page of events, with the number of them `user` hasn't yet seen
#[derive(Clone, Debug, Default)]
pub struct Feed {
    pub events: Vec<Event>,
    pub unread_count: usize,
}

/// The predicate selecting the events that may appear in `user`'s feed, given the users to which
/// they have an outbound edge
pub fn feed_predicate(user: &AppUser, network: Vec<UserId>) -> EventPredicate {
    EventPredicate::Or(vec![
        EventPredicate::And(vec![
            EventPredicate::AuthorIn(network),
            EventPredicate::VisibilityIn(vec![Visibility::CONNECTIONS, Visibility::PUBLIC]),
        ]),
        EventPredicate::And(vec![
            EventPredicate::VisibilityIn(vec![Visibility::GLOBAL]),
            EventPredicate::AuthorIsNot(user.id),
        ]),
        EventPredicate::TargetId(user.id_string()),
    ])
}

async fn visible_to(store: &Store, ns: Namespace, user: &AppUser) -> Result<EventPredicate> {
    let network = graph::friends_and_following(store, ns, user.id)
        .await
        .context(GraphSnafu)?;
    Ok(feed_predicate(user, network))
}

fn unread(user: &AppUser, predicate: EventPredicate) -> EventPredicate {
    match user.last_read {
        Some(last_read) => {
            EventPredicate::And(vec![predicate, EventPredicate::CreatedAfter(last_read)])
        }
        None => predicate,
    }
}

async fn newest(store: &Store, ns: Namespace, predicate: EventPredicate) -> Result<Vec<Event>> {
    store
        .events(ns, predicate, EventOrder::CreatedDesc, PAGE_LIMIT)
        .await
        .context(StorageSnafu)
}

/// `user`'s feed, newest first
pub async fn user_feed(store: &Store, ns: Namespace, user: &AppUser) -> Result<Feed> {
    let events = newest(store, ns, visible_to(store, ns, user).await?).await?;
    let unread_count = events
        .iter()
        .filter(|e| user.last_read.map(|t| e.created_at > t).unwrap_or(true))
        .count();
    Ok(Feed {
        events,
        unread_count,
    })
}

/// The part of `user`'s feed they haven't yet seen
pub async fn unread_feed(store: &Store, ns: Namespace, user: &AppUser) -> Result<Feed> {
    let events = newest(store, ns, unread(user, visible_to(store, ns, user).await?)).await?;
    Ok(Feed {
        unread_count: events.len(),
        events,
    })
}

/// The number of events in [unread_feed]
pub async fn unread_feed_count(store: &Store, ns: Namespace, user: &AppUser) -> Result<usize> {
    store
        .count_events(ns, unread(user, visible_to(store, ns, user).await?), PAGE_LIMIT)
        .await
        .context(StorageSnafu)
}

/// A geographic event search
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeoQuery {
    /// Every event within `radius` meters, newest first
    Radius {
        latitude: f64,
        longitude: f64,
        radius: f64,
    },
    /// The `count` nearest events
    Nearest {
        latitude: f64,
        longitude: f64,
        count: usize,
    },
}

impl GeoQuery {
    /// Validate a search given as raw parameters; exactly one of `radius` & `nearest` must be given
    pub fn new(
        latitude: f64,
        longitude: f64,
        radius: Option<f64>,
        nearest: Option<i64>,
    ) -> std::result::Result<GeoQuery, Problems> {
        match (radius, nearest) {
            (Some(radius), None) => {
                if radius < MIN_RADIUS {
                    Err(Code::GeoRadiusTooSmall.into())
                } else {
                    Ok(GeoQuery::Radius {
                        latitude,
                        longitude,
                        radius,
                    })
                }
            }
            (None, Some(nearest)) => {
                if nearest < 1 || nearest > PAGE_LIMIT as i64 {
                    Err(Code::GeoNearestOutOfBounds.into())
                } else {
                    Ok(GeoQuery::Nearest {
                        latitude,
                        longitude,
                        count: nearest as usize,
                    })
                }
            }
            _ => Err(Code::GeoRadiusOrNearestMissing.into()),
        }
    }
}

pub async fn geo_search(
    store: &Store,
    ns: Namespace,
    user: &AppUser,
    query: GeoQuery,
) -> Result<Vec<Event>> {
    let visible = visible_to(store, ns, user).await?;
    match query {
        GeoQuery::Radius {
            latitude,
            longitude,
            radius,
        } => {
            newest(
                store,
                ns,
                EventPredicate::And(vec![
                    visible,
                    EventPredicate::Within {
                        latitude,
                        longitude,
                        radius,
                    },
                ]),
            )
            .await
        }
        GeoQuery::Nearest {
            latitude,
            longitude,
            count,
        } => store
            .events(
                ns,
                EventPredicate::And(vec![visible, EventPredicate::Geolocated]),
                EventOrder::Nearest {
                    latitude,
                    longitude,
                },
                count,
            )
            .await
            .context(StorageSnafu),
    }
}

/// Events tagged with `location`
pub async fn location_search(
    store: &Store,
    ns: Namespace,
    user: &AppUser,
    location: &str,
) -> Result<Vec<Event>> {
    let visible = visible_to(store, ns, user).await?;
    newest(
        store,
        ns,
        EventPredicate::And(vec![visible, EventPredicate::Location(location.to_owned())]),
    )
    .await
}

/// Events targeting the object `object_id`
pub async fn object_search(
    store: &Store,
    ns: Namespace,
    user: &AppUser,
    object_id: &str,
) -> Result<Vec<Event>> {
    let visible = visible_to(store, ns, user).await?;
    newest(
        store,
        ns,
        EventPredicate::And(vec![visible, EventPredicate::TargetId(object_id.to_owned())]),
    )
    .await
}

/// The events authored by `author`, as seen by `viewer`
///
/// Authors see everything they've posted; users connected to the author (in either direction) see
/// anything above private; everyone else sees public & global events only.
pub async fn list(
    store: &Store,
    ns: Namespace,
    author: UserId,
    viewer: UserId,
) -> Result<Vec<Event>> {
    let by_author = EventPredicate::AuthorIs(author);
    let predicate = if author == viewer {
        by_author
    } else if graph::connected(store, ns, viewer, author)
        .await
        .context(GraphSnafu)?
    {
        EventPredicate::And(vec![
            by_author,
            EventPredicate::VisibilityIn(vec![
                Visibility::CONNECTIONS,
                Visibility::PUBLIC,
                Visibility::GLOBAL,
            ]),
        ])
    } else {
        EventPredicate::And(vec![
            by_author,
            EventPredicate::VisibilityIn(vec![Visibility::PUBLIC, Visibility::GLOBAL]),
        ])
    };
    newest(store, ns, predicate).await
}

/// The (public profiles of the) authors of `events`, keyed by id
pub async fn authors(
    store: &Store,
    ns: Namespace,
    events: &[Event],
) -> Result<BTreeMap<String, AppUser>> {
    let mut ids = events.iter().map(|e| e.user_id).collect::<Vec<UserId>>();
    ids.sort();
    ids.dedup();
    Ok(graph::users_in_order(store, ns, &ids)
        .await
        .context(GraphSnafu)?
        .into_iter()
        .map(|user| (user.id_string(), user.public_profile()))
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use crate::{
        entities::{AppId, ConnectionState, ConnectionType, EventId, Object, OrgId},
        memory::InMemory,
        storage::Record,
    };

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    struct Fixture {
        store: Store,
        next: u64,
    }

    impl Fixture {
        async fn new() -> Fixture {
            let store = Store::new(Arc::new(InMemory::new()));
            for id in [100, 200, 300] {
                store
                    .put(Record::AppUser(
                        ns(),
                        AppUser {
                            id: UserId::new(id),
                            user_name: format!("user{}", id),
                            activated: true,
                            enabled: true,
                            ..Default::default()
                        },
                    ))
                    .await
                    .unwrap();
            }
            Fixture { store, next: 1 }
        }
        async fn post(&mut self, author: u64, visibility: Visibility, f: impl FnOnce(&mut Event)) -> EventId {
            let id = EventId::new(self.next);
            self.next += 1;
            let mut event = Event {
                id,
                user_id: UserId::new(author),
                kind: "like".to_owned(),
                visibility,
                enabled: true,
                created_at: Utc::now() + Duration::milliseconds(self.next as i64),
                ..Default::default()
            };
            f(&mut event);
            self.store.put(Record::Event(ns(), event)).await.unwrap();
            id
        }
        async fn user(&self, id: u64) -> AppUser {
            self.store.app_user(ns(), UserId::new(id)).await.unwrap().unwrap()
        }
    }

    fn ids(events: &[Event]) -> Vec<u64> {
        events.iter().map(|e| e.id.as_u64()).collect()
    }

    #[tokio::test]
    async fn feed_visibility() {
        let mut f = Fixture::new().await;
        graph::create(
            &f.store,
            ns(),
            UserId::new(100),
            UserId::new(200),
            ConnectionType::Follow,
            ConnectionState::Confirmed,
            Utc::now(),
        )
        .await
        .unwrap();
        let private = f.post(200, Visibility::PRIVATE, |_| ()).await;
        let connections = f.post(200, Visibility::CONNECTIONS, |_| ()).await;
        let stranger = f.post(300, Visibility::PUBLIC, |_| ()).await;
        let global = f.post(300, Visibility::GLOBAL, |_| ()).await;
        let own_global = f.post(100, Visibility::GLOBAL, |_| ()).await;
        let targeted = f
            .post(300, Visibility::PRIVATE, |e| {
                e.target = Some(Object {
                    id: "100".to_owned(),
                    kind: "user".to_owned(),
                    ..Default::default()
                })
            })
            .await;

        let feed = user_feed(&f.store, ns(), &f.user(100).await).await.unwrap();
        assert_eq!(
            ids(&feed.events),
            vec![targeted.as_u64(), global.as_u64(), connections.as_u64()]
        );
        assert_eq!(feed.unread_count, 3);
        let seen = ids(&feed.events);
        for id in [private, stranger, own_global] {
            assert!(!seen.contains(&id.as_u64()));
        }
    }

    #[tokio::test]
    async fn feeds_span_the_whole_network() {
        let mut f = Fixture::new().await;
        let now = Utc::now();
        for n in 1..=250u64 {
            let id = UserId::new(1000 + n);
            f.store
                .put(Record::AppUser(
                    ns(),
                    AppUser {
                        id,
                        user_name: format!("followed{}", n),
                        activated: true,
                        enabled: true,
                        ..Default::default()
                    },
                ))
                .await
                .unwrap();
            graph::create(
                &f.store,
                ns(),
                UserId::new(100),
                id,
                ConnectionType::Follow,
                ConnectionState::Confirmed,
                now,
            )
            .await
            .unwrap();
        }
        let last = f.post(1250, Visibility::PUBLIC, |_| ()).await;
        let me = f.user(100).await;

        let feed = user_feed(&f.store, ns(), &me).await.unwrap();
        assert_eq!(ids(&feed.events), vec![last.as_u64()]);
        let unread = unread_feed(&f.store, ns(), &me).await.unwrap();
        assert_eq!(ids(&unread.events), vec![last.as_u64()]);
        assert_eq!(unread_feed_count(&f.store, ns(), &me).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unread() {
        let mut f = Fixture::new().await;
        f.post(300, Visibility::GLOBAL, |_| ()).await;
        let mut user = f.user(100).await;
        user.last_read = Some(Utc::now() + Duration::seconds(1));
        f.post(300, Visibility::GLOBAL, |e| {
            e.created_at = Utc::now() + Duration::seconds(2)
        })
        .await;
        f.post(300, Visibility::GLOBAL, |e| {
            e.created_at = Utc::now() + Duration::seconds(3)
        })
        .await;
        let feed = unread_feed(&f.store, ns(), &user).await.unwrap();
        assert_eq!(feed.unread_count, 2);
        assert_eq!(unread_feed_count(&f.store, ns(), &user).await.unwrap(), 2);
        let feed = user_feed(&f.store, ns(), &user).await.unwrap();
        assert_eq!(feed.events.len(), 3);
        assert_eq!(feed.unread_count, 2);
    }

    #[tokio::test]
    async fn geo() {
        let mut f = Fixture::new().await;
        // Berlin, roughly; the query point is 52.5172, 13.3048
        let spots = [(52.5200, 13.3050), (52.5170, 13.3040), (52.6000, 13.5000), (48.8566, 2.3522)];
        let mut posted = Vec::new();
        for (lat, lon) in spots {
            posted.push(
                f.post(300, Visibility::GLOBAL, |e| {
                    e.latitude = Some(lat);
                    e.longitude = Some(lon);
                })
                .await,
            );
        }
        let user = f.user(100).await;
        let nearest = geo_search(
            &f.store,
            ns(),
            &user,
            GeoQuery::new(52.5172, 13.3048, None, Some(2)).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(ids(&nearest), vec![posted[1].as_u64(), posted[0].as_u64()]);

        let within = geo_search(
            &f.store,
            ns(),
            &user,
            GeoQuery::new(52.5172, 13.3048, Some(1000.0), None).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(ids(&within), vec![posted[1].as_u64(), posted[0].as_u64()]);

        assert!(GeoQuery::new(0.0, 0.0, None, None).is_err());
        assert!(GeoQuery::new(0.0, 0.0, Some(10.0), Some(2)).is_err());
        assert_eq!(
            GeoQuery::new(0.0, 0.0, Some(1.0), None).unwrap_err().codes(),
            vec![Code::GeoRadiusTooSmall]
        );
        assert_eq!(
            GeoQuery::new(0.0, 0.0, None, Some(201)).unwrap_err().codes(),
            vec![Code::GeoNearestOutOfBounds]
        );
    }

    #[tokio::test]
    async fn listing() {
        let mut f = Fixture::new().await;
        let private = f.post(100, Visibility::PRIVATE, |_| ()).await;
        let connections = f.post(100, Visibility::CONNECTIONS, |_| ()).await;
        let public = f.post(100, Visibility::PUBLIC, |_| ()).await;
        let (a, b, c) = (UserId::new(100), UserId::new(200), UserId::new(300));
        assert_eq!(
            ids(&list(&f.store, ns(), a, a).await.unwrap()),
            vec![public.as_u64(), connections.as_u64(), private.as_u64()]
        );
        assert_eq!(ids(&list(&f.store, ns(), a, c).await.unwrap()), vec![public.as_u64()]);
        // An edge in either direction will do
        graph::create(&f.store, ns(), a, b, ConnectionType::Follow, ConnectionState::Confirmed, Utc::now())
            .await
            .unwrap();
        assert_eq!(
            ids(&list(&f.store, ns(), a, b).await.unwrap()),
            vec![public.as_u64(), connections.as_u64()]
        );
        let events = list(&f.store, ns(), a, a).await.unwrap();
        let authors = authors(&f.store, ns(), &events).await.unwrap();
        assert_eq!(authors.len(), 1);
        assert!(authors.contains_key("100"));
    }
}
