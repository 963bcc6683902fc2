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

//! # storage
//!
//! Abstractions for the tidings storage layer.
//!
//! The store is the source of truth. Organizations, members & applications live in global tables;
//! each application then gets its own namespace holding `users`, `connections`, `events` &
//! `sessions`. Every row is a JSON document (the serde form of the corresponding [entity]) plus
//! whatever projections we need to index.
//!
//! [entity]: crate::entities
//!
//! Rather than a method per entity per operation, a [Backend] offers four operations (`read`,
//! `write`, `delete` & `search`, plus `count`) over tagged [Key]s, [Record]s & [Query]s. [Store]
//! wraps a [Backend] in a typed facade for the convenience of callers.
//!
//! Reads & searches skip tombstoned rows (`enabled = false`, and for users, `deleted = true`)
//! unless the caller asks for them with [Tombstones::Include]. Writes are upserts keyed on each
//! entity's natural key, and deletes only ever flip `enabled` (and `deleted`), so re-applying
//! either is harmless.

use std::{cmp::Ordering, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::entities::{
    AppId, AppUser, Application, Connection, ConnectionState, ConnectionType, Event, EventId, Member, MemberId,
    Namespace, OrgId, Organization, PublicId, Session, UserId, Visibility,
};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

/// Failures that aren't specific to any particular backend
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Fault {
    #[snafu(display("A storage lock was poisoned"))]
    Poisoned,
    #[snafu(display("Expected a {expected} record, got {got}"))]
    UnexpectedRecord {
        expected: &'static str,
        got: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     Keys, Records & Queries                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Whether reads should see logically deleted rows
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tombstones {
    Exclude,
    Include,
}

/// Identifies (at most) one stored record
#[derive(Clone, Debug, PartialEq)]
pub enum Key {
    Organization(OrgId),
    OrganizationByPublicId(PublicId),
    OrganizationByToken(String),
    Member(OrgId, MemberId),
    MemberByPublicId(OrgId, PublicId),
    MemberByEmail(OrgId, String),
    MemberByUsername(OrgId, String),
    MemberBySession(OrgId, String),
    /// A member, by email, in whatever organization they belong to (for login)
    MemberLoginByEmail(String),
    /// A member, by username, in whatever organization they belong to (for login)
    MemberLoginByUsername(String),
    Application(OrgId, AppId),
    ApplicationByPublicId(OrgId, PublicId),
    ApplicationByToken(String),
    ApplicationByBackendToken(String),
    AppUser(Namespace, UserId),
    AppUserByEmail(Namespace, String),
    AppUserByUsername(Namespace, String),
    Connection(Namespace, UserId, UserId),
    Event(Namespace, EventId),
    Session(Namespace, String),
    /// Everything an application owns; only meaningful to [Backend::delete]
    Namespace(Namespace),
}

/// A stored entity, tagged by type (and namespace, where it has one)
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    Organization(Organization),
    Member(Member),
    Application(Application),
    AppUser(Namespace, AppUser),
    Connection(Namespace, Connection),
    Event(Namespace, Event),
    Session(Namespace, Session),
}

macro_rules! global_accessor {
    ($fn_name:ident, $variant:ident, $typ:ty) => {
        pub fn $fn_name(self) -> Result<$typ> {
            match self {
                Record::$variant(x) => Ok(x),
                other => Err(Error::new(
                    UnexpectedRecordSnafu {
                        expected: stringify!($variant),
                        got: other.kind(),
                    }
                    .build(),
                )),
            }
        }
    };
}

macro_rules! namespaced_accessor {
    ($fn_name:ident, $variant:ident, $typ:ty) => {
        pub fn $fn_name(self) -> Result<$typ> {
            match self {
                Record::$variant(_, x) => Ok(x),
                other => Err(Error::new(
                    UnexpectedRecordSnafu {
                        expected: stringify!($variant),
                        got: other.kind(),
                    }
                    .build(),
                )),
            }
        }
    };
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Organization(_) => "Organization",
            Record::Member(_) => "Member",
            Record::Application(_) => "Application",
            Record::AppUser(_, _) => "AppUser",
            Record::Connection(_, _) => "Connection",
            Record::Event(_, _) => "Event",
            Record::Session(_, _) => "Session",
        }
    }
    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Record::Organization(x) => x.updated_at,
            Record::Member(x) => x.updated_at,
            Record::Application(x) => x.updated_at,
            Record::AppUser(_, x) => x.updated_at,
            Record::Connection(_, x) => x.updated_at,
            Record::Event(_, x) => x.updated_at,
            Record::Session(_, x) => x.updated_at,
        }
    }
    /// The primary key of this record
    pub fn key(&self) -> Key {
        match self {
            Record::Organization(x) => Key::Organization(x.id),
            Record::Member(x) => Key::Member(x.org_id, x.id),
            Record::Application(x) => Key::Application(x.org_id, x.id),
            Record::AppUser(ns, x) => Key::AppUser(*ns, x.id),
            Record::Connection(ns, x) => Key::Connection(*ns, x.user_from_id, x.user_to_id),
            Record::Event(ns, x) => Key::Event(*ns, x.id),
            Record::Session(ns, x) => Key::Session(*ns, x.session_token.clone()),
        }
    }
    global_accessor!(into_organization, Organization, Organization);
    global_accessor!(into_member, Member, Member);
    global_accessor!(into_application, Application, Application);
    namespaced_accessor!(into_app_user, AppUser, AppUser);
    namespaced_accessor!(into_connection, Connection, Connection);
    namespaced_accessor!(into_event, Event, Event);
    namespaced_accessor!(into_session, Session, Session);
}

#[derive(Clone, Debug, PartialEq)]
pub enum UserFilter {
    Ids(Vec<UserId>),
    /// Users whose `social_ids[platform]` is one of `ids`
    Social {
        platform: String,
        ids: Vec<String>,
    },
    /// Case-insensitive substring match on username, email, first & last name
    Search(String),
}

impl UserFilter {
    pub fn matches(&self, user: &AppUser) -> bool {
        match self {
            UserFilter::Ids(ids) => ids.contains(&user.id),
            UserFilter::Social { platform, ids } => user
                .social_ids
                .get(platform)
                .map(|id| ids.contains(id))
                .unwrap_or(false),
            UserFilter::Search(term) => {
                let term = term.to_lowercase();
                [
                    &user.user_name,
                    &user.email,
                    &user.first_name,
                    &user.last_name,
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&term))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionFilter {
    /// Edges out of this user
    From(UserId),
    /// Edges into this user
    To(UserId),
    /// Edges between these two users, in either direction
    Between(UserId, UserId),
    /// Edges into or out of this user
    Touching(UserId),
}

impl ConnectionFilter {
    pub fn matches(&self, c: &Connection) -> bool {
        match self {
            ConnectionFilter::From(u) => c.user_from_id == *u,
            ConnectionFilter::To(u) => c.user_to_id == *u,
            ConnectionFilter::Between(a, b) => {
                (c.user_from_id == *a && c.user_to_id == *b)
                    || (c.user_from_id == *b && c.user_to_id == *a)
            }
            ConnectionFilter::Touching(u) => c.user_from_id == *u || c.user_to_id == *u,
        }
    }
}

/// Mean radius of the Earth, in meters
pub const EARTH_RADIUS: f64 = 6_371_000.0;

/// The great-circle distance, in meters, between two points given in degrees (haversine)
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * a.sqrt().asin()
}

/// A filter over events
///
/// Backends are expected to translate this into their native query language; [matches] gives the
/// reference semantics.
///
/// [matches]: EventPredicate::matches
#[derive(Clone, Debug, PartialEq)]
pub enum EventPredicate {
    All,
    AuthorIn(Vec<UserId>),
    AuthorIs(UserId),
    AuthorIsNot(UserId),
    VisibilityIn(Vec<Visibility>),
    TargetId(String),
    Location(String),
    CreatedAfter(DateTime<Utc>),
    /// The event carries both a latitude & a longitude
    Geolocated,
    /// The event lies within `radius` meters of the given point
    Within {
        latitude: f64,
        longitude: f64,
        radius: f64,
    },
    And(Vec<EventPredicate>),
    Or(Vec<EventPredicate>),
}

impl EventPredicate {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventPredicate::All => true,
            EventPredicate::AuthorIn(users) => users.contains(&event.user_id),
            EventPredicate::AuthorIs(user) => event.user_id == *user,
            EventPredicate::AuthorIsNot(user) => event.user_id != *user,
            EventPredicate::VisibilityIn(levels) => levels.contains(&event.visibility),
            EventPredicate::TargetId(id) => event.target_id() == Some(id.as_str()),
            EventPredicate::Location(location) => event.location.as_deref() == Some(location),
            EventPredicate::CreatedAfter(instant) => event.created_at > *instant,
            EventPredicate::Geolocated => event.coordinates().is_some(),
            EventPredicate::Within {
                latitude,
                longitude,
                radius,
            } => event
                .coordinates()
                .map(|(lat, lon)| great_circle_distance(*latitude, *longitude, lat, lon) <= *radius)
                .unwrap_or(false),
            EventPredicate::And(preds) => preds.iter().all(|p| p.matches(event)),
            EventPredicate::Or(preds) => preds.iter().any(|p| p.matches(event)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum EventOrder {
    /// Newest first
    CreatedDesc,
    /// Closest to the given point first; ties go to the newer event
    Nearest { latitude: f64, longitude: f64 },
}

impl EventOrder {
    pub fn compare(&self, lhs: &Event, rhs: &Event) -> Ordering {
        let newest_first = rhs
            .created_at
            .cmp(&lhs.created_at)
            .then_with(|| rhs.id.cmp(&lhs.id));
        match self {
            EventOrder::CreatedDesc => newest_first,
            EventOrder::Nearest {
                latitude,
                longitude,
            } => {
                let distance = |e: &Event| {
                    e.coordinates()
                        .map(|(lat, lon)| great_circle_distance(*latitude, *longitude, lat, lon))
                        .unwrap_or(f64::INFINITY)
                };
                distance(lhs)
                    .total_cmp(&distance(rhs))
                    .then(newest_first)
            }
        }
    }
}

/// A search `limit` meaning "every match"
pub const UNBOUNDED: usize = usize::MAX;

/// Identifies a set of stored records
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    Members(OrgId),
    Applications(OrgId),
    AppUsers {
        namespace: Namespace,
        filter: UserFilter,
        limit: usize,
    },
    /// Connections, in the order in which they were first created
    Connections {
        namespace: Namespace,
        filter: ConnectionFilter,
        kind: Option<ConnectionType>,
        state: Option<ConnectionState>,
        limit: usize,
    },
    Events {
        namespace: Namespace,
        predicate: EventPredicate,
        order: EventOrder,
        limit: usize,
    },
    Sessions {
        namespace: Namespace,
        user: UserId,
    },
}

#[async_trait]
pub trait Backend {
    /// Read the record identified by `key`, if there is one
    async fn read(&self, key: &Key, tombstones: Tombstones) -> Result<Option<Record>>;
    /// Insert-or-update each of `records`, as a single logical transaction
    async fn write(&self, records: &[Record]) -> Result<()>;
    /// Logically delete the record (or records) identified by `key`
    async fn delete(&self, key: &Key) -> Result<()>;
    /// Retrieve the records matching `query`
    async fn search(&self, query: &Query, tombstones: Tombstones) -> Result<Vec<Record>>;
    /// Count the (live) records matching `query`; the query's limit, if any, caps the result
    async fn count(&self, query: &Query) -> Result<usize>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Store                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Typed access to a [Backend]
#[derive(Clone)]
pub struct Store(Arc<dyn Backend + Send + Sync>);

impl Store {
    pub fn new(backend: Arc<dyn Backend + Send + Sync>) -> Store {
        Store(backend)
    }
    pub fn backend(&self) -> &(dyn Backend + Send + Sync) {
        self.0.as_ref()
    }

    async fn one(&self, key: Key) -> Result<Option<Record>> {
        self.0.read(&key, Tombstones::Exclude).await
    }

    pub async fn put(&self, record: Record) -> Result<()> {
        self.0.write(&[record]).await
    }
    pub async fn put_all(&self, records: &[Record]) -> Result<()> {
        self.0.write(records).await
    }
    pub async fn delete(&self, key: Key) -> Result<()> {
        self.0.delete(&key).await
    }

    pub async fn organization(&self, id: OrgId) -> Result<Option<Organization>> {
        self.one(Key::Organization(id))
            .await?
            .map(Record::into_organization)
            .transpose()
    }
    pub async fn organization_by_public_id(&self, id: PublicId) -> Result<Option<Organization>> {
        self.one(Key::OrganizationByPublicId(id))
            .await?
            .map(Record::into_organization)
            .transpose()
    }
    pub async fn organization_by_token(&self, token: &str) -> Result<Option<Organization>> {
        self.one(Key::OrganizationByToken(token.to_owned()))
            .await?
            .map(Record::into_organization)
            .transpose()
    }

    pub async fn member(&self, org: OrgId, id: MemberId) -> Result<Option<Member>> {
        self.one(Key::Member(org, id))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_by_public_id(&self, org: OrgId, id: PublicId) -> Result<Option<Member>> {
        self.one(Key::MemberByPublicId(org, id))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_by_email(&self, org: OrgId, email: &str) -> Result<Option<Member>> {
        self.one(Key::MemberByEmail(org, email.to_owned()))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_by_username(&self, org: OrgId, name: &str) -> Result<Option<Member>> {
        self.one(Key::MemberByUsername(org, name.to_owned()))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_by_session(&self, org: OrgId, token: &str) -> Result<Option<Member>> {
        self.one(Key::MemberBySession(org, token.to_owned()))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_login_by_email(&self, email: &str) -> Result<Option<Member>> {
        self.one(Key::MemberLoginByEmail(email.to_owned()))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn member_login_by_username(&self, name: &str) -> Result<Option<Member>> {
        self.one(Key::MemberLoginByUsername(name.to_owned()))
            .await?
            .map(Record::into_member)
            .transpose()
    }
    pub async fn members(&self, org: OrgId) -> Result<Vec<Member>> {
        self.0
            .search(&Query::Members(org), Tombstones::Exclude)
            .await?
            .into_iter()
            .map(Record::into_member)
            .collect()
    }

    pub async fn application(&self, org: OrgId, id: AppId) -> Result<Option<Application>> {
        self.one(Key::Application(org, id))
            .await?
            .map(Record::into_application)
            .transpose()
    }
    pub async fn application_by_public_id(
        &self,
        org: OrgId,
        id: PublicId,
    ) -> Result<Option<Application>> {
        self.one(Key::ApplicationByPublicId(org, id))
            .await?
            .map(Record::into_application)
            .transpose()
    }
    pub async fn application_by_token(&self, token: &str) -> Result<Option<Application>> {
        self.one(Key::ApplicationByToken(token.to_owned()))
            .await?
            .map(Record::into_application)
            .transpose()
    }
    pub async fn application_by_backend_token(&self, token: &str) -> Result<Option<Application>> {
        self.one(Key::ApplicationByBackendToken(token.to_owned()))
            .await?
            .map(Record::into_application)
            .transpose()
    }
    pub async fn applications(&self, org: OrgId) -> Result<Vec<Application>> {
        self.0
            .search(&Query::Applications(org), Tombstones::Exclude)
            .await?
            .into_iter()
            .map(Record::into_application)
            .collect()
    }

    pub async fn app_user(&self, ns: Namespace, id: UserId) -> Result<Option<AppUser>> {
        self.one(Key::AppUser(ns, id))
            .await?
            .map(Record::into_app_user)
            .transpose()
    }
    pub async fn app_user_by_email(&self, ns: Namespace, email: &str) -> Result<Option<AppUser>> {
        self.one(Key::AppUserByEmail(ns, email.to_owned()))
            .await?
            .map(Record::into_app_user)
            .transpose()
    }
    pub async fn app_user_by_username(
        &self,
        ns: Namespace,
        name: &str,
    ) -> Result<Option<AppUser>> {
        self.one(Key::AppUserByUsername(ns, name.to_owned()))
            .await?
            .map(Record::into_app_user)
            .transpose()
    }
    pub async fn app_users(
        &self,
        ns: Namespace,
        filter: UserFilter,
        limit: usize,
    ) -> Result<Vec<AppUser>> {
        self.0
            .search(
                &Query::AppUsers {
                    namespace: ns,
                    filter,
                    limit,
                },
                Tombstones::Exclude,
            )
            .await?
            .into_iter()
            .map(Record::into_app_user)
            .collect()
    }

    /// Read a connection, *including* a disabled one
    pub async fn connection_row(
        &self,
        ns: Namespace,
        from: UserId,
        to: UserId,
    ) -> Result<Option<Connection>> {
        self.0
            .read(&Key::Connection(ns, from, to), Tombstones::Include)
            .await?
            .map(Record::into_connection)
            .transpose()
    }
    pub async fn connection(
        &self,
        ns: Namespace,
        from: UserId,
        to: UserId,
    ) -> Result<Option<Connection>> {
        self.one(Key::Connection(ns, from, to))
            .await?
            .map(Record::into_connection)
            .transpose()
    }
    pub async fn connections(
        &self,
        ns: Namespace,
        filter: ConnectionFilter,
        kind: Option<ConnectionType>,
        limit: usize,
    ) -> Result<Vec<Connection>> {
        self.search_connections(ns, filter, kind, None, limit).await
    }
    /// Live connections matching `filter` that are in `state`
    pub async fn connections_in_state(
        &self,
        ns: Namespace,
        filter: ConnectionFilter,
        state: ConnectionState,
        limit: usize,
    ) -> Result<Vec<Connection>> {
        self.search_connections(ns, filter, None, Some(state), limit)
            .await
    }
    async fn search_connections(
        &self,
        ns: Namespace,
        filter: ConnectionFilter,
        kind: Option<ConnectionType>,
        state: Option<ConnectionState>,
        limit: usize,
    ) -> Result<Vec<Connection>> {
        self.0
            .search(
                &Query::Connections {
                    namespace: ns,
                    filter,
                    kind,
                    state,
                    limit,
                },
                Tombstones::Exclude,
            )
            .await?
            .into_iter()
            .map(Record::into_connection)
            .collect()
    }
    pub async fn count_connections(
        &self,
        ns: Namespace,
        filter: ConnectionFilter,
        kind: Option<ConnectionType>,
    ) -> Result<usize> {
        self.0
            .count(&Query::Connections {
                namespace: ns,
                filter,
                kind,
                state: None,
                limit: UNBOUNDED,
            })
            .await
    }

    pub async fn event(&self, ns: Namespace, id: EventId) -> Result<Option<Event>> {
        self.one(Key::Event(ns, id))
            .await?
            .map(Record::into_event)
            .transpose()
    }
    pub async fn events(
        &self,
        ns: Namespace,
        predicate: EventPredicate,
        order: EventOrder,
        limit: usize,
    ) -> Result<Vec<Event>> {
        self.0
            .search(
                &Query::Events {
                    namespace: ns,
                    predicate,
                    order,
                    limit,
                },
                Tombstones::Exclude,
            )
            .await?
            .into_iter()
            .map(Record::into_event)
            .collect()
    }
    pub async fn count_events(
        &self,
        ns: Namespace,
        predicate: EventPredicate,
        limit: usize,
    ) -> Result<usize> {
        self.0
            .count(&Query::Events {
                namespace: ns,
                predicate,
                order: EventOrder::CreatedDesc,
                limit,
            })
            .await
    }

    pub async fn session(&self, ns: Namespace, token: &str) -> Result<Option<Session>> {
        self.one(Key::Session(ns, token.to_owned()))
            .await?
            .map(Record::into_session)
            .transpose()
    }
    pub async fn sessions(&self, ns: Namespace, user: UserId) -> Result<Vec<Session>> {
        self.0
            .search(
                &Query::Sessions {
                    namespace: ns,
                    user,
                },
                Tombstones::Exclude,
            )
            .await?
            .into_iter()
            .map(Record::into_session)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    use crate::entities::Object;

    fn event(id: u64, user: u64, vis: Visibility) -> Event {
        Event {
            id: EventId::new(id),
            user_id: UserId::new(user),
            kind: "like".to_owned(),
            visibility: vis,
            enabled: true,
            created_at: Utc::now() + Duration::seconds(id as i64),
            ..Default::default()
        }
    }

    #[test]
    fn distances() {
        // Brandenburger Tor to the Reichstag is a bit under 400m
        let d = great_circle_distance(52.516275, 13.377704, 52.518620, 13.376187);
        assert!(d > 250.0 && d < 400.0, "{}", d);
        assert!(great_circle_distance(52.5, 13.3, 52.5, 13.3).abs() < 1e-6);
    }

    #[test]
    fn predicates() {
        let mut e = event(1, 100, Visibility::CONNECTIONS);
        e.target = Some(Object {
            id: "200".to_owned(),
            kind: "user".to_owned(),
            ..Default::default()
        });
        let feed_for_200 = EventPredicate::Or(vec![
            EventPredicate::And(vec![
                EventPredicate::AuthorIn(vec![UserId::new(300)]),
                EventPredicate::VisibilityIn(vec![Visibility::CONNECTIONS, Visibility::PUBLIC]),
            ]),
            EventPredicate::And(vec![
                EventPredicate::VisibilityIn(vec![Visibility::GLOBAL]),
                EventPredicate::AuthorIsNot(UserId::new(200)),
            ]),
            EventPredicate::TargetId("200".to_owned()),
        ]);
        // Matches only by virtue of its target
        assert!(feed_for_200.matches(&e));
        e.target = None;
        assert!(!feed_for_200.matches(&e));
        e.user_id = UserId::new(300);
        assert!(feed_for_200.matches(&e));
        e.visibility = Visibility::PRIVATE;
        assert!(!feed_for_200.matches(&e));
        assert!(!EventPredicate::AuthorIn(vec![]).matches(&e));
        assert!(!EventPredicate::Geolocated.matches(&e));
    }

    #[test]
    fn nearest_order() {
        let mut a = event(1, 1, Visibility::PUBLIC);
        a.latitude = Some(52.52);
        a.longitude = Some(13.31);
        let mut b = event(2, 1, Visibility::PUBLIC);
        b.latitude = Some(52.6);
        b.longitude = Some(13.4);
        let mut c = event(3, 1, Visibility::PUBLIC);
        c.latitude = a.latitude;
        c.longitude = a.longitude;
        let mut v = [b.clone(), a.clone(), c.clone()];
        let order = EventOrder::Nearest {
            latitude: 52.5172,
            longitude: 13.3048,
        };
        v.sort_by(|l, r| order.compare(l, r));
        // `a` & `c` are equidistant; `c` is newer
        assert_eq!(
            v.iter().map(|e| e.id.as_u64()).collect::<Vec<_>>(),
            vec![3, 1, 2]
        );
        v.sort_by(|l, r| EventOrder::CreatedDesc.compare(l, r));
        assert_eq!(
            v.iter().map(|e| e.id.as_u64()).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn user_search_filter() {
        let user = AppUser {
            user_name: "dlsniper".to_owned(),
            email: "d@example.com".to_owned(),
            first_name: "Florin".to_owned(),
            ..Default::default()
        };
        assert!(UserFilter::Search("SNIP".to_owned()).matches(&user));
        assert!(UserFilter::Search("flor".to_owned()).matches(&user));
        assert!(!UserFilter::Search("xyz".to_owned()).matches(&user));
    }
}
