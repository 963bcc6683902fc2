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

//! # In-memory storage
//!
//! A [Backend] that keeps everything in process memory. It's what the unit & integration tests run
//! against, and it's handy for development, but nothing survives a restart.

use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    entities::{
        AppId, AppUser, Application, Connection, Event, EventId, Member, MemberId, Namespace,
        OrgId, Organization, Session, UserId,
    },
    storage::{
        Backend, Error, Key, PoisonedSnafu, Query, Record, Result, Tombstones,
    },
};

#[derive(Debug, Default)]
struct AppTables {
    users: BTreeMap<UserId, AppUser>,
    // Kept in creation order; `connection_index` maps (from, to) to a position in this vector
    connections: Vec<Connection>,
    connection_index: HashMap<(UserId, UserId), usize>,
    events: BTreeMap<EventId, Event>,
    sessions: HashMap<String, Session>,
}

#[derive(Debug, Default)]
struct Tables {
    organizations: BTreeMap<OrgId, Organization>,
    members: BTreeMap<(OrgId, MemberId), Member>,
    applications: BTreeMap<(OrgId, AppId), Application>,
    namespaces: HashMap<Namespace, AppTables>,
}

fn keep(tombstones: Tombstones, live: bool) -> bool {
    live || tombstones == Tombstones::Include
}

fn user_is_live(user: &AppUser) -> bool {
    user.enabled && !user.is_deleted()
}

impl Tables {
    fn read(&self, key: &Key, t: Tombstones) -> Option<Record> {
        match key {
            Key::Organization(id) => self
                .organizations
                .get(id)
                .filter(|o| keep(t, o.enabled))
                .cloned()
                .map(Record::Organization),
            Key::OrganizationByPublicId(id) => self
                .organizations
                .values()
                .find(|o| o.public_id == *id && keep(t, o.enabled))
                .cloned()
                .map(Record::Organization),
            Key::OrganizationByToken(token) => self
                .organizations
                .values()
                .find(|o| o.auth_token == *token && keep(t, o.enabled))
                .cloned()
                .map(Record::Organization),
            Key::Member(org, id) => self
                .members
                .get(&(*org, *id))
                .filter(|m| keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::MemberByPublicId(org, id) => self
                .members
                .values()
                .find(|m| m.org_id == *org && m.public_id == *id && keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::MemberByEmail(org, email) => self
                .members
                .values()
                .find(|m| m.org_id == *org && m.email == *email && keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::MemberByUsername(org, name) => self
                .members
                .values()
                .find(|m| m.org_id == *org && m.user_name == *name && keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::MemberBySession(org, token) => self
                .members
                .values()
                .find(|m| {
                    m.org_id == *org
                        && m.session_token.as_deref() == Some(token.as_str())
                        && keep(t, m.enabled)
                })
                .cloned()
                .map(Record::Member),
            Key::MemberLoginByEmail(email) => self
                .members
                .values()
                .find(|m| m.email == *email && keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::MemberLoginByUsername(name) => self
                .members
                .values()
                .find(|m| m.user_name == *name && keep(t, m.enabled))
                .cloned()
                .map(Record::Member),
            Key::Application(org, id) => self
                .applications
                .get(&(*org, *id))
                .filter(|a| keep(t, a.enabled))
                .cloned()
                .map(Record::Application),
            Key::ApplicationByPublicId(org, id) => self
                .applications
                .values()
                .find(|a| a.org_id == *org && a.public_id == *id && keep(t, a.enabled))
                .cloned()
                .map(Record::Application),
            Key::ApplicationByToken(token) => self
                .applications
                .values()
                .find(|a| a.token == *token && keep(t, a.enabled))
                .cloned()
                .map(Record::Application),
            Key::ApplicationByBackendToken(token) => self
                .applications
                .values()
                .find(|a| a.backend_token == *token && keep(t, a.enabled))
                .cloned()
                .map(Record::Application),
            Key::AppUser(ns, id) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .users
                    .get(id)
                    .filter(|u| keep(t, user_is_live(u)))
                    .cloned()
                    .map(|u| Record::AppUser(*ns, u))
            }),
            Key::AppUserByEmail(ns, email) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .users
                    .values()
                    .find(|u| u.email == *email && keep(t, user_is_live(u)))
                    .cloned()
                    .map(|u| Record::AppUser(*ns, u))
            }),
            Key::AppUserByUsername(ns, name) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .users
                    .values()
                    .find(|u| u.user_name == *name && keep(t, user_is_live(u)))
                    .cloned()
                    .map(|u| Record::AppUser(*ns, u))
            }),
            Key::Connection(ns, from, to) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .connection_index
                    .get(&(*from, *to))
                    .and_then(|idx| tables.connections.get(*idx))
                    .filter(|c| keep(t, c.enabled))
                    .cloned()
                    .map(|c| Record::Connection(*ns, c))
            }),
            Key::Event(ns, id) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .events
                    .get(id)
                    .filter(|e| keep(t, e.enabled))
                    .cloned()
                    .map(|e| Record::Event(*ns, e))
            }),
            Key::Session(ns, token) => self.namespaces.get(ns).and_then(|tables| {
                tables
                    .sessions
                    .get(token)
                    .filter(|s| keep(t, s.enabled))
                    .cloned()
                    .map(|s| Record::Session(*ns, s))
            }),
            Key::Namespace(_) => None,
        }
    }

    fn write(&mut self, record: &Record) {
        match record {
            Record::Organization(org) => {
                self.organizations.insert(org.id, org.clone());
            }
            Record::Member(member) => {
                self.members
                    .insert((member.org_id, member.id), member.clone());
            }
            Record::Application(app) => {
                self.applications.insert((app.org_id, app.id), app.clone());
                self.namespaces.entry(app.namespace()).or_default();
            }
            Record::AppUser(ns, user) => {
                self.namespaces
                    .entry(*ns)
                    .or_default()
                    .users
                    .insert(user.id, user.clone());
            }
            Record::Connection(ns, conn) => {
                let tables = self.namespaces.entry(*ns).or_default();
                let key = (conn.user_from_id, conn.user_to_id);
                match tables.connection_index.get(&key) {
                    Some(idx) => tables.connections[*idx] = conn.clone(),
                    None => {
                        tables
                            .connection_index
                            .insert(key, tables.connections.len());
                        tables.connections.push(conn.clone());
                    }
                }
            }
            Record::Event(ns, event) => {
                self.namespaces
                    .entry(*ns)
                    .or_default()
                    .events
                    .insert(event.id, event.clone());
            }
            Record::Session(ns, session) => {
                self.namespaces
                    .entry(*ns)
                    .or_default()
                    .sessions
                    .insert(session.session_token.clone(), session.clone());
            }
        }
    }

    fn delete(&mut self, key: &Key) {
        let now = Utc::now();
        match key {
            Key::Organization(id) => {
                if let Some(org) = self.organizations.get_mut(id) {
                    org.enabled = false;
                    org.updated_at = now;
                }
            }
            Key::Member(org, id) => {
                if let Some(member) = self.members.get_mut(&(*org, *id)) {
                    member.enabled = false;
                    member.session_token = None;
                    member.updated_at = now;
                }
            }
            Key::Application(org, id) => {
                if let Some(app) = self.applications.get_mut(&(*org, *id)) {
                    app.enabled = false;
                    app.updated_at = now;
                }
            }
            Key::AppUser(ns, id) => {
                if let Some(user) = self
                    .namespaces
                    .get_mut(ns)
                    .and_then(|tables| tables.users.get_mut(id))
                {
                    user.enabled = false;
                    user.deleted = Some(true);
                    user.updated_at = now;
                }
            }
            Key::Connection(ns, from, to) => {
                if let Some(tables) = self.namespaces.get_mut(ns) {
                    if let Some(idx) = tables.connection_index.get(&(*from, *to)) {
                        let conn = &mut tables.connections[*idx];
                        conn.enabled = false;
                        conn.updated_at = now;
                    }
                }
            }
            Key::Event(ns, id) => {
                if let Some(event) = self
                    .namespaces
                    .get_mut(ns)
                    .and_then(|tables| tables.events.get_mut(id))
                {
                    event.enabled = false;
                    event.updated_at = now;
                }
            }
            Key::Session(ns, token) => {
                if let Some(session) = self
                    .namespaces
                    .get_mut(ns)
                    .and_then(|tables| tables.sessions.get_mut(token))
                {
                    session.enabled = false;
                    session.updated_at = now;
                }
            }
            Key::Namespace(ns) => {
                if let Some(tables) = self.namespaces.get_mut(ns) {
                    tables.users.values_mut().for_each(|u| {
                        u.enabled = false;
                        u.deleted = Some(true);
                        u.updated_at = now;
                    });
                    tables.connections.iter_mut().for_each(|c| {
                        c.enabled = false;
                        c.updated_at = now;
                    });
                    tables.events.values_mut().for_each(|e| {
                        e.enabled = false;
                        e.updated_at = now;
                    });
                    tables.sessions.values_mut().for_each(|s| {
                        s.enabled = false;
                        s.updated_at = now;
                    });
                }
            }
            // Secondary keys are resolved to primary keys by the caller
            _ => (),
        }
    }

    fn search(&self, query: &Query, t: Tombstones) -> Vec<Record> {
        match query {
            Query::Members(org) => self
                .members
                .values()
                .filter(|m| m.org_id == *org && keep(t, m.enabled))
                .cloned()
                .map(Record::Member)
                .collect(),
            Query::Applications(org) => self
                .applications
                .values()
                .filter(|a| a.org_id == *org && keep(t, a.enabled))
                .cloned()
                .map(Record::Application)
                .collect(),
            Query::AppUsers {
                namespace,
                filter,
                limit,
            } => self
                .namespaces
                .get(namespace)
                .map(|tables| {
                    tables
                        .users
                        .values()
                        .filter(|u| keep(t, user_is_live(u)) && filter.matches(u))
                        .take(*limit)
                        .cloned()
                        .map(|u| Record::AppUser(*namespace, u))
                        .collect()
                })
                .unwrap_or_default(),
            Query::Connections {
                namespace,
                filter,
                kind,
                state,
                limit,
            } => self
                .namespaces
                .get(namespace)
                .map(|tables| {
                    tables
                        .connections
                        .iter()
                        .filter(|c| {
                            keep(t, c.enabled)
                                && filter.matches(c)
                                && kind.map(|k| k == c.kind).unwrap_or(true)
                                && state.map(|s| s == c.state).unwrap_or(true)
                        })
                        .take(*limit)
                        .cloned()
                        .map(|c| Record::Connection(*namespace, c))
                        .collect()
                })
                .unwrap_or_default(),
            Query::Events {
                namespace,
                predicate,
                order,
                limit,
            } => self
                .namespaces
                .get(namespace)
                .map(|tables| {
                    let mut events = tables
                        .events
                        .values()
                        .filter(|e| keep(t, e.enabled) && predicate.matches(e))
                        .cloned()
                        .collect::<Vec<Event>>();
                    events.sort_by(|lhs, rhs| order.compare(lhs, rhs));
                    events
                        .into_iter()
                        .take(*limit)
                        .map(|e| Record::Event(*namespace, e))
                        .collect()
                })
                .unwrap_or_default(),
            Query::Sessions { namespace, user } => self
                .namespaces
                .get(namespace)
                .map(|tables| {
                    tables
                        .sessions
                        .values()
                        .filter(|s| s.user_id == *user && keep(t, s.enabled))
                        .cloned()
                        .map(|s| Record::Session(*namespace, s))
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// A [Backend] living entirely in memory
#[derive(Debug, Default)]
pub struct InMemory {
    tables: RwLock<Tables>,
}

impl InMemory {
    pub fn new() -> InMemory {
        InMemory::default()
    }
}

fn poisoned() -> Error {
    Error::new(PoisonedSnafu.build())
}

#[async_trait]
impl Backend for InMemory {
    async fn read(&self, key: &Key, tombstones: Tombstones) -> Result<Option<Record>> {
        Ok(self.tables.read().map_err(|_| poisoned())?.read(key, tombstones))
    }
    async fn write(&self, records: &[Record]) -> Result<()> {
        // Holding the write lock across the batch makes it atomic
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        records.iter().for_each(|record| tables.write(record));
        Ok(())
    }
    async fn delete(&self, key: &Key) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let primary = match key {
            Key::OrganizationByPublicId(_)
            | Key::OrganizationByToken(_)
            | Key::MemberByPublicId(_, _)
            | Key::MemberByEmail(_, _)
            | Key::MemberByUsername(_, _)
            | Key::MemberBySession(_, _)
            | Key::MemberLoginByEmail(_)
            | Key::MemberLoginByUsername(_)
            | Key::ApplicationByPublicId(_, _)
            | Key::ApplicationByToken(_)
            | Key::ApplicationByBackendToken(_)
            | Key::AppUserByEmail(_, _)
            | Key::AppUserByUsername(_, _) => tables
                .read(key, Tombstones::Exclude)
                .map(|record| record.key()),
            _ => Some(key.clone()),
        };
        if let Some(primary) = primary {
            tables.delete(&primary);
        }
        Ok(())
    }
    async fn search(&self, query: &Query, tombstones: Tombstones) -> Result<Vec<Record>> {
        Ok(self
            .tables
            .read()
            .map_err(|_| poisoned())?
            .search(query, tombstones))
    }
    async fn count(&self, query: &Query) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .map_err(|_| poisoned())?
            .search(query, Tombstones::Exclude)
            .len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use chrono::Duration;

    use crate::{
        entities::{ConnectionType, Visibility},
        storage::{ConnectionFilter, EventOrder, EventPredicate, Store, UserFilter},
    };

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    fn user(id: u64, name: &str) -> AppUser {
        AppUser {
            id: UserId::new(id),
            user_name: name.to_owned(),
            email: format!("{}@example.com", name),
            activated: true,
            enabled: true,
            ..Default::default()
        }
    }

    fn store() -> Store {
        Store::new(Arc::new(InMemory::new()))
    }

    #[tokio::test]
    async fn users_and_tombstones() {
        let store = store();
        store
            .put_all(&[
                Record::AppUser(ns(), user(100, "alice")),
                Record::AppUser(ns(), user(200, "bob")),
            ])
            .await
            .unwrap();
        assert_eq!(
            store
                .app_user_by_email(ns(), "bob@example.com")
                .await
                .unwrap()
                .unwrap()
                .id,
            UserId::new(200)
        );
        store.delete(Key::AppUser(ns(), UserId::new(200))).await.unwrap();
        assert!(store.app_user(ns(), UserId::new(200)).await.unwrap().is_none());
        let row = store
            .backend()
            .read(&Key::AppUser(ns(), UserId::new(200)), Tombstones::Include)
            .await
            .unwrap()
            .unwrap()
            .into_app_user()
            .unwrap();
        assert!(!row.enabled);
        assert_eq!(row.deleted, Some(true));
        // Deleting twice is harmless
        store.delete(Key::AppUser(ns(), UserId::new(200))).await.unwrap();
        let found = store
            .app_users(ns(), UserFilter::Search("example".to_owned()), 200)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        // Other namespaces are isolated
        let other = Namespace::new(OrgId::new(1), AppId::new(3));
        assert!(store.app_user(other, UserId::new(100)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn connections_keep_creation_order() {
        let store = store();
        let edge = |from: u64, to: u64| Connection {
            user_from_id: UserId::new(from),
            user_to_id: UserId::new(to),
            kind: ConnectionType::Follow,
            enabled: true,
            ..Default::default()
        };
        for to in [300, 200, 400] {
            store
                .put(Record::Connection(ns(), edge(100, to)))
                .await
                .unwrap();
        }
        store.delete(Key::Connection(ns(), UserId::new(100), UserId::new(200))).await.unwrap();
        // Upserting an existing edge must not move it
        store
            .put(Record::Connection(ns(), edge(100, 300)))
            .await
            .unwrap();
        let tos = store
            .connections(ns(), ConnectionFilter::From(UserId::new(100)), None, 200)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.user_to_id.as_u64())
            .collect::<Vec<_>>();
        assert_eq!(tos, vec![300, 400]);
        assert!(store
            .connection_row(ns(), UserId::new(100), UserId::new(200))
            .await
            .unwrap()
            .is_some());
        assert!(store
            .connection(ns(), UserId::new(100), UserId::new(200))
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .count_connections(ns(), ConnectionFilter::To(UserId::new(400)), Some(ConnectionType::Follow))
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn events_order_and_cap() {
        let store = store();
        let now = Utc::now();
        let records = (1..=250)
            .map(|i| {
                Record::Event(
                    ns(),
                    Event {
                        id: EventId::new(i),
                        user_id: UserId::new(100),
                        kind: "like".to_owned(),
                        visibility: Visibility::PUBLIC,
                        enabled: true,
                        created_at: now + Duration::milliseconds(i as i64),
                        ..Default::default()
                    },
                )
            })
            .collect::<Vec<_>>();
        store.put_all(&records).await.unwrap();
        let events = store
            .events(ns(), EventPredicate::All, EventOrder::CreatedDesc, 200)
            .await
            .unwrap();
        assert_eq!(events.len(), 200);
        assert_eq!(events[0].id, EventId::new(250));
        assert!(events
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(
            store
                .count_events(ns(), EventPredicate::All, 200)
                .await
                .unwrap(),
            200
        );
    }

    #[tokio::test]
    async fn namespace_cascade() {
        let store = store();
        store
            .put(Record::AppUser(ns(), user(100, "alice")))
            .await
            .unwrap();
        store.delete(Key::Namespace(ns())).await.unwrap();
        assert!(store.app_user(ns(), UserId::new(100)).await.unwrap().is_none());
    }
}
