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

//! # Postgres storage
//!
//! A [Backend] built on [sqlx]. Organizations, members & applications live in three global
//! tables; each application gets a schema of its own, `app_<org>_<app>`, created the first time
//! anything touches it, holding `users`, `connections`, `events` & `sessions`.
//!
//! Every table keeps the serde form of its entity in a `json_data JSONB` column, alongside just
//! those columns we need to find rows: ids, email, username & tokens, plus (for events) author,
//! visibility, location, target & coordinates. Rows are written with `INSERT ... ON CONFLICT DO
//! UPDATE` on their natural key; "deletes" rewrite the row as a tombstone.

use std::{collections::HashSet, sync::Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{prelude::*, Backtrace};
use sqlx::{postgres::PgRow, PgPool, Postgres as Pg, QueryBuilder, Row, Transaction};
use tracing::{debug, info};

use crate::{
    entities::{
        AppId, AppUser, Application, Connection, Event, Member, MemberId, Namespace, OrgId,
        Organization, Session, UserId,
    },
    storage::{
        self, Backend, ConnectionFilter, EventOrder, EventPredicate, Key, Query, Record,
        Tombstones, UserFilter, EARTH_RADIUS,
    },
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to deserialize a stored {kind}: {source}"))]
    De {
        kind: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The namespace registry's lock was poisoned"))]
    Poisoned { backtrace: Backtrace },
    #[snafu(display("Postgres operation failed: {source}"))]
    Postgres {
        source: sqlx::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize a {kind}: {source}"))]
    Ser {
        kind: &'static str,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Advisory lock serializing DDL, so that two tasks creating the same namespace don't collide
const DDL_LOCK: i64 = 0x7469_6469_6e67_73;

const GLOBAL_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS organizations (
         id BIGINT PRIMARY KEY,
         public_id TEXT NOT NULL,
         auth_token TEXT NOT NULL,
         enabled BOOLEAN NOT NULL,
         json_data JSONB NOT NULL,
         updated_at TIMESTAMPTZ NOT NULL)",
    "CREATE INDEX IF NOT EXISTS organizations_public_id ON organizations (public_id)",
    "CREATE INDEX IF NOT EXISTS organizations_auth_token ON organizations (auth_token)",
    "CREATE TABLE IF NOT EXISTS members (
         org_id BIGINT NOT NULL,
         id BIGINT NOT NULL,
         public_id TEXT NOT NULL,
         email TEXT NOT NULL,
         user_name TEXT NOT NULL,
         session_token TEXT,
         enabled BOOLEAN NOT NULL,
         json_data JSONB NOT NULL,
         updated_at TIMESTAMPTZ NOT NULL,
         PRIMARY KEY (org_id, id))",
    "CREATE INDEX IF NOT EXISTS members_public_id ON members (public_id)",
    "CREATE INDEX IF NOT EXISTS members_email ON members (email)",
    "CREATE INDEX IF NOT EXISTS members_user_name ON members (user_name)",
    "CREATE INDEX IF NOT EXISTS members_session_token ON members (session_token)",
    "CREATE TABLE IF NOT EXISTS applications (
         org_id BIGINT NOT NULL,
         id BIGINT NOT NULL,
         public_id TEXT NOT NULL,
         token TEXT NOT NULL,
         backend_token TEXT NOT NULL,
         enabled BOOLEAN NOT NULL,
         json_data JSONB NOT NULL,
         updated_at TIMESTAMPTZ NOT NULL,
         PRIMARY KEY (org_id, id))",
    "CREATE INDEX IF NOT EXISTS applications_public_id ON applications (public_id)",
    "CREATE INDEX IF NOT EXISTS applications_token ON applications (token)",
    "CREATE INDEX IF NOT EXISTS applications_backend_token ON applications (backend_token)",
];

fn namespace_ddl(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.users (
                 id BIGINT PRIMARY KEY,
                 email TEXT NOT NULL,
                 user_name TEXT NOT NULL,
                 enabled BOOLEAN NOT NULL,
                 deleted BOOLEAN NOT NULL,
                 json_data JSONB NOT NULL)"
        ),
        format!("CREATE INDEX IF NOT EXISTS users_email ON {schema}.users (email)"),
        format!("CREATE INDEX IF NOT EXISTS users_user_name ON {schema}.users (user_name)"),
        format!(
            "CREATE INDEX IF NOT EXISTS users_social_ids ON {schema}.users
                 USING GIN ((json_data->'social_ids'))"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.connections (
                 seq BIGSERIAL,
                 user_from_id BIGINT NOT NULL,
                 user_to_id BIGINT NOT NULL,
                 kind TEXT NOT NULL,
                 enabled BOOLEAN NOT NULL,
                 json_data JSONB NOT NULL,
                 PRIMARY KEY (user_from_id, user_to_id))"
        ),
        format!("CREATE INDEX IF NOT EXISTS connections_to ON {schema}.connections (user_to_id)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.events (
                 id BIGINT PRIMARY KEY,
                 user_id BIGINT NOT NULL,
                 visibility SMALLINT NOT NULL,
                 location TEXT,
                 target_id TEXT,
                 latitude DOUBLE PRECISION,
                 longitude DOUBLE PRECISION,
                 enabled BOOLEAN NOT NULL,
                 created_at TIMESTAMPTZ NOT NULL,
                 json_data JSONB NOT NULL)"
        ),
        format!("CREATE INDEX IF NOT EXISTS events_user_id ON {schema}.events (user_id)"),
        format!("CREATE INDEX IF NOT EXISTS events_created_at ON {schema}.events (created_at)"),
        format!("CREATE INDEX IF NOT EXISTS events_location ON {schema}.events (location)"),
        format!("CREATE INDEX IF NOT EXISTS events_target_id ON {schema}.events (target_id)"),
        format!("CREATE INDEX IF NOT EXISTS events_geo ON {schema}.events (latitude, longitude)"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sessions (
                 session_token TEXT PRIMARY KEY,
                 user_id BIGINT NOT NULL,
                 enabled BOOLEAN NOT NULL,
                 json_data JSONB NOT NULL)"
        ),
        format!("CREATE INDEX IF NOT EXISTS sessions_user_id ON {schema}.sessions (user_id)"),
    ]
}

/// The table (& so the entity type) a statement addresses
#[derive(Clone, Copy, Debug, PartialEq)]
enum Table {
    Organizations,
    Members,
    Applications,
    Users(Namespace),
    Connections(Namespace),
    Events(Namespace),
    Sessions(Namespace),
}

impl Table {
    fn of_key(key: &Key) -> Option<Table> {
        Some(match key {
            Key::Organization(_) | Key::OrganizationByPublicId(_) | Key::OrganizationByToken(_) => {
                Table::Organizations
            }
            Key::Member(..)
            | Key::MemberByPublicId(..)
            | Key::MemberByEmail(..)
            | Key::MemberByUsername(..)
            | Key::MemberBySession(..)
            | Key::MemberLoginByEmail(_)
            | Key::MemberLoginByUsername(_) => Table::Members,
            Key::Application(..)
            | Key::ApplicationByPublicId(..)
            | Key::ApplicationByToken(_)
            | Key::ApplicationByBackendToken(_) => Table::Applications,
            Key::AppUser(ns, _) | Key::AppUserByEmail(ns, _) | Key::AppUserByUsername(ns, _) => {
                Table::Users(*ns)
            }
            Key::Connection(ns, _, _) => Table::Connections(*ns),
            Key::Event(ns, _) => Table::Events(*ns),
            Key::Session(ns, _) => Table::Sessions(*ns),
            Key::Namespace(_) => return None,
        })
    }
    fn of_query(query: &Query) -> Table {
        match query {
            Query::Members(_) => Table::Members,
            Query::Applications(_) => Table::Applications,
            Query::AppUsers { namespace, .. } => Table::Users(*namespace),
            Query::Connections { namespace, .. } => Table::Connections(*namespace),
            Query::Events { namespace, .. } => Table::Events(*namespace),
            Query::Sessions { namespace, .. } => Table::Sessions(*namespace),
        }
    }
    fn namespace(&self) -> Option<Namespace> {
        match self {
            Table::Organizations | Table::Members | Table::Applications => None,
            Table::Users(ns) | Table::Connections(ns) | Table::Events(ns) | Table::Sessions(ns) => {
                Some(*ns)
            }
        }
    }
    fn name(&self) -> String {
        match self {
            Table::Organizations => "organizations".to_owned(),
            Table::Members => "members".to_owned(),
            Table::Applications => "applications".to_owned(),
            Table::Users(ns) => format!("{}.users", ns.schema_name()),
            Table::Connections(ns) => format!("{}.connections", ns.schema_name()),
            Table::Events(ns) => format!("{}.events", ns.schema_name()),
            Table::Sessions(ns) => format!("{}.sessions", ns.schema_name()),
        }
    }
    /// Begin a `SELECT` against this table, leaving the `WHERE` clause open for further conditions
    fn select<'args>(&self, qb: &mut QueryBuilder<'args, Pg>, tombstones: Tombstones) {
        let columns = match self {
            Table::Organizations => "id, json_data",
            Table::Members | Table::Applications => "org_id, id, json_data",
            _ => "json_data",
        };
        qb.push(format!("SELECT {} FROM {} WHERE ", columns, self.name()));
        qb.push(match (tombstones, self) {
            (Tombstones::Include, _) => "TRUE",
            (Tombstones::Exclude, Table::Users(_)) => "enabled AND NOT deleted",
            (Tombstones::Exclude, _) => "enabled",
        });
    }
    fn decode(&self, row: &PgRow) -> Result<Record> {
        let json: serde_json::Value = row.try_get("json_data").context(PostgresSnafu)?;
        Ok(match self {
            Table::Organizations => {
                let mut org: Organization = from_json("Organization", json)?;
                org.id = OrgId::from_i64(row.try_get("id").context(PostgresSnafu)?);
                Record::Organization(org)
            }
            Table::Members => {
                let mut member: Member = from_json("Member", json)?;
                member.org_id = OrgId::from_i64(row.try_get("org_id").context(PostgresSnafu)?);
                member.id = MemberId::from_i64(row.try_get("id").context(PostgresSnafu)?);
                Record::Member(member)
            }
            Table::Applications => {
                let mut app: Application = from_json("Application", json)?;
                app.org_id = OrgId::from_i64(row.try_get("org_id").context(PostgresSnafu)?);
                app.id = AppId::from_i64(row.try_get("id").context(PostgresSnafu)?);
                Record::Application(app)
            }
            Table::Users(ns) => Record::AppUser(*ns, from_json::<AppUser>("AppUser", json)?),
            Table::Connections(ns) => {
                Record::Connection(*ns, from_json::<Connection>("Connection", json)?)
            }
            Table::Events(ns) => Record::Event(*ns, from_json::<Event>("Event", json)?),
            Table::Sessions(ns) => Record::Session(*ns, from_json::<Session>("Session", json)?),
        })
    }
}

fn from_json<T: DeserializeOwned>(kind: &'static str, json: serde_json::Value) -> Result<T> {
    serde_json::from_value(json).context(DeSnafu { kind })
}

fn to_json<T: Serialize>(kind: &'static str, value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).context(SerSnafu { kind })
}

fn user_ids(ids: &[UserId]) -> Vec<i64> {
    ids.iter().map(|id| id.as_i64()).collect()
}

/// Narrow a `SELECT` begun by [Table::select] to the row named by `key`
fn push_key<'args>(qb: &mut QueryBuilder<'args, Pg>, key: &Key) {
    match key {
        Key::Organization(id) => {
            qb.push(" AND id = ").push_bind(id.as_i64());
        }
        Key::OrganizationByPublicId(id) => {
            qb.push(" AND public_id = ").push_bind(id.to_string());
        }
        Key::OrganizationByToken(token) => {
            qb.push(" AND auth_token = ").push_bind(token.clone());
        }
        Key::Member(org, id) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND id = ")
                .push_bind(id.as_i64());
        }
        Key::MemberByPublicId(org, id) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND public_id = ")
                .push_bind(id.to_string());
        }
        Key::MemberByEmail(org, email) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND email = ")
                .push_bind(email.clone());
        }
        Key::MemberByUsername(org, name) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND user_name = ")
                .push_bind(name.clone());
        }
        Key::MemberBySession(org, token) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND session_token = ")
                .push_bind(token.clone());
        }
        Key::MemberLoginByEmail(email) => {
            qb.push(" AND email = ").push_bind(email.clone());
        }
        Key::MemberLoginByUsername(name) => {
            qb.push(" AND user_name = ").push_bind(name.clone());
        }
        Key::Application(org, id) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND id = ")
                .push_bind(id.as_i64());
        }
        Key::ApplicationByPublicId(org, id) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" AND public_id = ")
                .push_bind(id.to_string());
        }
        Key::ApplicationByToken(token) => {
            qb.push(" AND token = ").push_bind(token.clone());
        }
        Key::ApplicationByBackendToken(token) => {
            qb.push(" AND backend_token = ").push_bind(token.clone());
        }
        Key::AppUser(_, id) => {
            qb.push(" AND id = ").push_bind(id.as_i64());
        }
        Key::AppUserByEmail(_, email) => {
            qb.push(" AND email = ").push_bind(email.clone());
        }
        Key::AppUserByUsername(_, name) => {
            qb.push(" AND user_name = ").push_bind(name.clone());
        }
        Key::Connection(_, from, to) => {
            qb.push(" AND user_from_id = ")
                .push_bind(from.as_i64())
                .push(" AND user_to_id = ")
                .push_bind(to.as_i64());
        }
        Key::Event(_, id) => {
            qb.push(" AND id = ").push_bind(id.as_i64());
        }
        Key::Session(_, token) => {
            qb.push(" AND session_token = ").push_bind(token.clone());
        }
        Key::Namespace(_) => {
            qb.push(" AND FALSE");
        }
    }
}

/// The great-circle distance, in meters, from `(latitude, longitude)` to an event's coordinates
fn push_distance<'args>(qb: &mut QueryBuilder<'args, Pg>, latitude: f64, longitude: f64) {
    qb.push("2 * ")
        .push_bind(EARTH_RADIUS)
        .push(" * asin(least(1.0, sqrt(power(sin(radians(latitude - ")
        .push_bind(latitude)
        .push(") / 2), 2) + cos(radians(")
        .push_bind(latitude)
        .push(")) * cos(radians(latitude)) * power(sin(radians(longitude - ")
        .push_bind(longitude)
        .push(") / 2), 2))))");
}

fn push_predicate<'args>(qb: &mut QueryBuilder<'args, Pg>, predicate: &EventPredicate) {
    match predicate {
        EventPredicate::All => {
            qb.push("TRUE");
        }
        EventPredicate::AuthorIn(users) => {
            qb.push("user_id = ANY(").push_bind(user_ids(users)).push(")");
        }
        EventPredicate::AuthorIs(user) => {
            qb.push("user_id = ").push_bind(user.as_i64());
        }
        EventPredicate::AuthorIsNot(user) => {
            qb.push("user_id <> ").push_bind(user.as_i64());
        }
        EventPredicate::VisibilityIn(levels) => {
            qb.push("visibility = ANY(")
                .push_bind(
                    levels
                        .iter()
                        .map(|v| v.as_u16() as i16)
                        .collect::<Vec<i16>>(),
                )
                .push(")");
        }
        EventPredicate::TargetId(id) => {
            qb.push("target_id = ").push_bind(id.clone());
        }
        EventPredicate::Location(location) => {
            qb.push("location = ").push_bind(location.clone());
        }
        EventPredicate::CreatedAfter(instant) => {
            qb.push("created_at > ").push_bind(*instant);
        }
        EventPredicate::Geolocated => {
            qb.push("(latitude IS NOT NULL AND longitude IS NOT NULL)");
        }
        EventPredicate::Within {
            latitude,
            longitude,
            radius,
        } => {
            qb.push("(");
            push_distance(qb, *latitude, *longitude);
            qb.push(") <= ").push_bind(*radius);
        }
        EventPredicate::And(preds) => push_junction(qb, preds, " AND ", "TRUE"),
        EventPredicate::Or(preds) => push_junction(qb, preds, " OR ", "FALSE"),
    }
}

fn push_junction<'args>(
    qb: &mut QueryBuilder<'args, Pg>,
    preds: &[EventPredicate],
    separator: &str,
    empty: &str,
) {
    if preds.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, pred) in preds.iter().enumerate() {
        if i > 0 {
            qb.push(separator);
        }
        push_predicate(qb, pred);
    }
    qb.push(")");
}

/// Cap the rows `qb` returns; an [storage::UNBOUNDED] limit (or any that won't fit a `BIGINT`) adds nothing
fn push_limit(qb: &mut QueryBuilder<'_, Pg>, limit: usize) {
    if let Ok(limit) = i64::try_from(limit) {
        qb.push(" LIMIT ").push_bind(limit);
    }
}

/// Write the `SELECT` answering `query` into `qb`
fn push_query<'args>(qb: &mut QueryBuilder<'args, Pg>, query: &Query, tombstones: Tombstones) {
    Table::of_query(query).select(qb, tombstones);
    match query {
        Query::Members(org) | Query::Applications(org) => {
            qb.push(" AND org_id = ")
                .push_bind(org.as_i64())
                .push(" ORDER BY id");
        }
        Query::AppUsers { filter, limit, .. } => {
            match filter {
                UserFilter::Ids(ids) => {
                    qb.push(" AND id = ANY(").push_bind(user_ids(ids)).push(")");
                }
                UserFilter::Social { platform, ids } => {
                    qb.push(" AND json_data->'social_ids'->>")
                        .push_bind(platform.clone())
                        .push(" = ANY(")
                        .push_bind(ids.clone())
                        .push(")");
                }
                UserFilter::Search(term) => {
                    let term = term.to_lowercase();
                    qb.push(" AND (");
                    for (i, column) in [
                        "user_name",
                        "email",
                        "json_data->>'first_name'",
                        "json_data->>'last_name'",
                    ]
                    .iter()
                    .enumerate()
                    {
                        if i > 0 {
                            qb.push(" OR ");
                        }
                        qb.push(format!("strpos(lower({}), ", column))
                            .push_bind(term.clone())
                            .push(") > 0");
                    }
                    qb.push(")");
                }
            }
            qb.push(" ORDER BY id");
            push_limit(qb, *limit);
        }
        Query::Connections {
            filter,
            kind,
            state,
            limit,
            ..
        } => {
            match filter {
                ConnectionFilter::From(user) => {
                    qb.push(" AND user_from_id = ").push_bind(user.as_i64());
                }
                ConnectionFilter::To(user) => {
                    qb.push(" AND user_to_id = ").push_bind(user.as_i64());
                }
                ConnectionFilter::Between(a, b) => {
                    qb.push(" AND ((user_from_id = ")
                        .push_bind(a.as_i64())
                        .push(" AND user_to_id = ")
                        .push_bind(b.as_i64())
                        .push(") OR (user_from_id = ")
                        .push_bind(b.as_i64())
                        .push(" AND user_to_id = ")
                        .push_bind(a.as_i64())
                        .push("))");
                }
                ConnectionFilter::Touching(user) => {
                    qb.push(" AND (user_from_id = ")
                        .push_bind(user.as_i64())
                        .push(" OR user_to_id = ")
                        .push_bind(user.as_i64())
                        .push(")");
                }
            }
            if let Some(kind) = kind {
                qb.push(" AND kind = ").push_bind(kind.as_str());
            }
            if let Some(state) = state {
                qb.push(" AND json_data->>'state' = ").push_bind(state.as_str());
            }
            qb.push(" ORDER BY seq");
            push_limit(qb, *limit);
        }
        Query::Events {
            predicate,
            order,
            limit,
            ..
        } => {
            qb.push(" AND ");
            push_predicate(qb, predicate);
            match order {
                EventOrder::CreatedDesc => {
                    qb.push(" ORDER BY created_at DESC, id DESC");
                }
                EventOrder::Nearest {
                    latitude,
                    longitude,
                } => {
                    qb.push(" ORDER BY ");
                    push_distance(qb, *latitude, *longitude);
                    qb.push(" ASC NULLS LAST, created_at DESC, id DESC");
                }
            }
            push_limit(qb, *limit);
        }
        Query::Sessions { user, .. } => {
            qb.push(" AND user_id = ")
                .push_bind(user.as_i64())
                .push(" ORDER BY session_token");
        }
    }
}

/// Turn `record` into its own tombstone
fn tombstone(record: Record) -> Record {
    let now = Utc::now();
    match record {
        Record::Organization(mut org) => {
            org.enabled = false;
            org.updated_at = now;
            Record::Organization(org)
        }
        Record::Member(mut member) => {
            member.enabled = false;
            member.session_token = None;
            member.updated_at = now;
            Record::Member(member)
        }
        Record::Application(mut app) => {
            app.enabled = false;
            app.updated_at = now;
            Record::Application(app)
        }
        Record::AppUser(ns, mut user) => {
            user.enabled = false;
            user.deleted = Some(true);
            user.updated_at = now;
            Record::AppUser(ns, user)
        }
        Record::Connection(ns, mut conn) => {
            conn.enabled = false;
            conn.updated_at = now;
            Record::Connection(ns, conn)
        }
        Record::Event(ns, mut event) => {
            event.enabled = false;
            event.updated_at = now;
            Record::Event(ns, event)
        }
        Record::Session(ns, mut session) => {
            session.enabled = false;
            session.updated_at = now;
            Record::Session(ns, session)
        }
    }
}

async fn upsert(tx: &mut Transaction<'static, Pg>, record: &Record) -> Result<()> {
    let query = match record {
        Record::Organization(org) => sqlx::query(
            "INSERT INTO organizations (id, public_id, auth_token, enabled, json_data, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                 public_id = EXCLUDED.public_id, auth_token = EXCLUDED.auth_token,
                 enabled = EXCLUDED.enabled, json_data = EXCLUDED.json_data,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(org.id.as_i64())
        .bind(org.public_id.to_string())
        .bind(org.auth_token.clone())
        .bind(org.enabled)
        .bind(to_json("Organization", org)?)
        .bind(org.updated_at),
        Record::Member(member) => sqlx::query(
            "INSERT INTO members (org_id, id, public_id, email, user_name, session_token, enabled,
                                  json_data, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (org_id, id) DO UPDATE SET
                 public_id = EXCLUDED.public_id, email = EXCLUDED.email,
                 user_name = EXCLUDED.user_name, session_token = EXCLUDED.session_token,
                 enabled = EXCLUDED.enabled, json_data = EXCLUDED.json_data,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(member.org_id.as_i64())
        .bind(member.id.as_i64())
        .bind(member.public_id.to_string())
        .bind(member.email.clone())
        .bind(member.user_name.clone())
        .bind(member.session_token.clone())
        .bind(member.enabled)
        .bind(to_json("Member", member)?)
        .bind(member.updated_at),
        Record::Application(app) => sqlx::query(
            "INSERT INTO applications (org_id, id, public_id, token, backend_token, enabled,
                                       json_data, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (org_id, id) DO UPDATE SET
                 public_id = EXCLUDED.public_id, token = EXCLUDED.token,
                 backend_token = EXCLUDED.backend_token, enabled = EXCLUDED.enabled,
                 json_data = EXCLUDED.json_data, updated_at = EXCLUDED.updated_at",
        )
        .bind(app.org_id.as_i64())
        .bind(app.id.as_i64())
        .bind(app.public_id.to_string())
        .bind(app.token.clone())
        .bind(app.backend_token.clone())
        .bind(app.enabled)
        .bind(to_json("Application", app)?)
        .bind(app.updated_at),
        Record::AppUser(ns, user) => {
            let sql = format!(
                "INSERT INTO {}.users (id, email, user_name, enabled, deleted, json_data)
                     VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO UPDATE SET
                     email = EXCLUDED.email, user_name = EXCLUDED.user_name,
                     enabled = EXCLUDED.enabled, deleted = EXCLUDED.deleted,
                     json_data = EXCLUDED.json_data",
                ns.schema_name()
            );
            return sqlx::query(&sql)
                .bind(user.id.as_i64())
                .bind(user.email.clone())
                .bind(user.user_name.clone())
                .bind(user.enabled)
                .bind(user.is_deleted())
                .bind(to_json("AppUser", user)?)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .context(PostgresSnafu);
        }
        Record::Connection(ns, conn) => {
            let sql = format!(
                "INSERT INTO {}.connections (user_from_id, user_to_id, kind, enabled, json_data)
                     VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (user_from_id, user_to_id) DO UPDATE SET
                     kind = EXCLUDED.kind, enabled = EXCLUDED.enabled,
                     json_data = EXCLUDED.json_data",
                ns.schema_name()
            );
            return sqlx::query(&sql)
                .bind(conn.user_from_id.as_i64())
                .bind(conn.user_to_id.as_i64())
                .bind(conn.kind.as_str())
                .bind(conn.enabled)
                .bind(to_json("Connection", conn)?)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .context(PostgresSnafu);
        }
        Record::Event(ns, event) => {
            let sql = format!(
                "INSERT INTO {}.events (id, user_id, visibility, location, target_id, latitude,
                                        longitude, enabled, created_at, json_data)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (id) DO UPDATE SET
                     user_id = EXCLUDED.user_id, visibility = EXCLUDED.visibility,
                     location = EXCLUDED.location, target_id = EXCLUDED.target_id,
                     latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude,
                     enabled = EXCLUDED.enabled, created_at = EXCLUDED.created_at,
                     json_data = EXCLUDED.json_data",
                ns.schema_name()
            );
            return sqlx::query(&sql)
                .bind(event.id.as_i64())
                .bind(event.user_id.as_i64())
                .bind(event.visibility.as_u16() as i16)
                .bind(event.location.clone())
                .bind(event.target_id().map(str::to_owned))
                .bind(event.latitude)
                .bind(event.longitude)
                .bind(event.enabled)
                .bind(event.created_at)
                .bind(to_json("Event", event)?)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .context(PostgresSnafu);
        }
        Record::Session(ns, session) => {
            let sql = format!(
                "INSERT INTO {}.sessions (session_token, user_id, enabled, json_data)
                     VALUES ($1, $2, $3, $4)
                 ON CONFLICT (session_token) DO UPDATE SET
                     user_id = EXCLUDED.user_id, enabled = EXCLUDED.enabled,
                     json_data = EXCLUDED.json_data",
                ns.schema_name()
            );
            return sqlx::query(&sql)
                .bind(session.session_token.clone())
                .bind(session.user_id.as_i64())
                .bind(session.enabled)
                .bind(to_json("Session", session)?)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .context(PostgresSnafu);
        }
    };
    query
        .execute(&mut **tx)
        .await
        .map(|_| ())
        .context(PostgresSnafu)
}

fn record_namespace(record: &Record) -> Option<Namespace> {
    match record {
        Record::Organization(_) | Record::Member(_) => None,
        Record::Application(app) => Some(app.namespace()),
        Record::AppUser(ns, _)
        | Record::Connection(ns, _)
        | Record::Event(ns, _)
        | Record::Session(ns, _) => Some(*ns),
    }
}

/// A [Backend] on Postgres
pub struct Postgres {
    pool: PgPool,
    // Namespaces whose schema we know to exist
    ready: Mutex<HashSet<Namespace>>,
}

impl Postgres {
    /// Create the global tables, if need be
    pub async fn new(pool: PgPool) -> Result<Postgres> {
        for statement in GLOBAL_DDL {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context(PostgresSnafu)?;
        }
        info!("Postgres store ready");
        Ok(Postgres {
            pool,
            ready: Mutex::new(HashSet::new()),
        })
    }

    async fn ensure_namespace(&self, ns: Namespace) -> Result<()> {
        if self
            .ready
            .lock()
            .map_err(|_| PoisonedSnafu.build())?
            .contains(&ns)
        {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context(PostgresSnafu)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(DDL_LOCK)
            .execute(&mut *tx)
            .await
            .context(PostgresSnafu)?;
        for statement in namespace_ddl(&ns.schema_name()) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .context(PostgresSnafu)?;
        }
        tx.commit().await.context(PostgresSnafu)?;
        debug!("Schema {} is ready", ns.schema_name());
        self.ready
            .lock()
            .map_err(|_| PoisonedSnafu.build())?
            .insert(ns);
        Ok(())
    }

    async fn read_record(&self, key: &Key, tombstones: Tombstones) -> Result<Option<Record>> {
        let table = match Table::of_key(key) {
            Some(table) => table,
            None => return Ok(None),
        };
        if let Some(ns) = table.namespace() {
            self.ensure_namespace(ns).await?;
        }
        let mut qb = QueryBuilder::<Pg>::new("");
        table.select(&mut qb, tombstones);
        push_key(&mut qb, key);
        qb.push(" LIMIT 1");
        qb.build()
            .fetch_optional(&self.pool)
            .await
            .context(PostgresSnafu)?
            .map(|row| table.decode(&row))
            .transpose()
    }

    async fn write_records(&self, records: &[Record]) -> Result<()> {
        for ns in records.iter().filter_map(record_namespace) {
            self.ensure_namespace(ns).await?;
        }
        let mut tx = self.pool.begin().await.context(PostgresSnafu)?;
        for record in records {
            upsert(&mut tx, record).await?;
        }
        tx.commit().await.context(PostgresSnafu)
    }

    async fn delete_namespace(&self, ns: Namespace) -> Result<()> {
        self.ensure_namespace(ns).await?;
        let stamp = to_json("timestamp", &Utc::now())?;
        let schema = ns.schema_name();
        let mut tx = self.pool.begin().await.context(PostgresSnafu)?;
        let statements = [
            format!(
                "UPDATE {schema}.users SET enabled = FALSE, deleted = TRUE,
                     json_data = json_data || jsonb_build_object(
                         'enabled', FALSE, 'deleted', TRUE, 'updated_at', $1::jsonb)"
            ),
            format!(
                "UPDATE {schema}.connections SET enabled = FALSE,
                     json_data = json_data || jsonb_build_object(
                         'enabled', FALSE, 'updated_at', $1::jsonb)"
            ),
            format!(
                "UPDATE {schema}.events SET enabled = FALSE,
                     json_data = json_data || jsonb_build_object(
                         'enabled', FALSE, 'updated_at', $1::jsonb)"
            ),
            format!(
                "UPDATE {schema}.sessions SET enabled = FALSE,
                     json_data = json_data || jsonb_build_object(
                         'enabled', FALSE, 'updated_at', $1::jsonb)"
            ),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .bind(stamp.clone())
                .execute(&mut *tx)
                .await
                .context(PostgresSnafu)?;
        }
        tx.commit().await.context(PostgresSnafu)
    }

    async fn delete_record(&self, key: &Key) -> Result<()> {
        if let Key::Namespace(ns) = key {
            return self.delete_namespace(*ns).await;
        }
        // Secondary keys only ever name live rows; primary keys may name tombstones
        let tombstones = match key {
            Key::Organization(_)
            | Key::Member(..)
            | Key::Application(..)
            | Key::AppUser(..)
            | Key::Connection(..)
            | Key::Event(..)
            | Key::Session(..) => Tombstones::Include,
            _ => Tombstones::Exclude,
        };
        match self.read_record(key, tombstones).await? {
            Some(record) => self.write_records(&[tombstone(record)]).await,
            None => Ok(()),
        }
    }

    async fn search_records(&self, query: &Query, tombstones: Tombstones) -> Result<Vec<Record>> {
        let table = Table::of_query(query);
        if let Some(ns) = table.namespace() {
            self.ensure_namespace(ns).await?;
        }
        let mut qb = QueryBuilder::<Pg>::new("");
        push_query(&mut qb, query, tombstones);
        qb.build()
            .fetch_all(&self.pool)
            .await
            .context(PostgresSnafu)?
            .iter()
            .map(|row| table.decode(row))
            .collect()
    }

    async fn count_records(&self, query: &Query) -> Result<usize> {
        if let Some(ns) = Table::of_query(query).namespace() {
            self.ensure_namespace(ns).await?;
        }
        let mut qb = QueryBuilder::<Pg>::new("SELECT count(*) AS n FROM (");
        push_query(&mut qb, query, Tombstones::Exclude);
        qb.push(") AS matched");
        let n: i64 = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .context(PostgresSnafu)?
            .try_get("n")
            .context(PostgresSnafu)?;
        Ok(n as usize)
    }
}

#[async_trait]
impl Backend for Postgres {
    async fn read(&self, key: &Key, tombstones: Tombstones) -> storage::Result<Option<Record>> {
        self.read_record(key, tombstones)
            .await
            .map_err(storage::Error::new)
    }
    async fn write(&self, records: &[Record]) -> storage::Result<()> {
        self.write_records(records)
            .await
            .map_err(storage::Error::new)
    }
    async fn delete(&self, key: &Key) -> storage::Result<()> {
        self.delete_record(key).await.map_err(storage::Error::new)
    }
    async fn search(&self, query: &Query, tombstones: Tombstones) -> storage::Result<Vec<Record>> {
        self.search_records(query, tombstones)
            .await
            .map_err(storage::Error::new)
    }
    async fn count(&self, query: &Query) -> storage::Result<usize> {
        self.count_records(query)
            .await
            .map_err(storage::Error::new)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{
        entities::{ConnectionState, ConnectionType, Visibility},
        storage::UNBOUNDED,
    };

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    fn sql(query: &Query) -> String {
        let mut qb = QueryBuilder::<Pg>::new("");
        push_query(&mut qb, query, Tombstones::Exclude);
        qb.sql().to_owned()
    }

    #[test]
    fn keyed_selects() {
        let mut qb = QueryBuilder::<Pg>::new("");
        let key = Key::AppUserByEmail(ns(), "a@example.com".to_owned());
        let table = Table::of_key(&key).unwrap();
        table.select(&mut qb, Tombstones::Exclude);
        push_key(&mut qb, &key);
        assert_eq!(
            qb.sql(),
            "SELECT json_data FROM app_1_2.users WHERE enabled AND NOT deleted AND email = $1"
        );

        let mut qb = QueryBuilder::<Pg>::new("");
        let key = Key::MemberBySession(OrgId::new(1), "token".to_owned());
        Table::of_key(&key)
            .unwrap()
            .select(&mut qb, Tombstones::Include);
        push_key(&mut qb, &key);
        assert_eq!(
            qb.sql(),
            "SELECT org_id, id, json_data FROM members WHERE TRUE AND org_id = $1 AND session_token = $2"
        );
        assert_eq!(Table::of_key(&Key::Namespace(ns())), None);
    }

    #[test]
    fn event_predicates() {
        let query = Query::Events {
            namespace: ns(),
            predicate: EventPredicate::Or(vec![
                EventPredicate::And(vec![
                    EventPredicate::AuthorIn(vec![UserId::new(100)]),
                    EventPredicate::VisibilityIn(vec![Visibility::CONNECTIONS, Visibility::PUBLIC]),
                ]),
                EventPredicate::TargetId("100".to_owned()),
                EventPredicate::And(vec![]),
            ]),
            order: EventOrder::CreatedDesc,
            limit: 200,
        };
        assert_eq!(
            sql(&query),
            "SELECT json_data FROM app_1_2.events WHERE enabled AND \
             ((user_id = ANY($1) AND visibility = ANY($2)) OR target_id = $3 OR TRUE) \
             ORDER BY created_at DESC, id DESC LIMIT $4"
        );

        let query = Query::Events {
            namespace: ns(),
            predicate: EventPredicate::Geolocated,
            order: EventOrder::Nearest {
                latitude: 52.5,
                longitude: 13.3,
            },
            limit: 2,
        };
        let text = sql(&query);
        assert!(text.contains("(latitude IS NOT NULL AND longitude IS NOT NULL) ORDER BY 2 * $1"));
        assert!(text.ends_with("ASC NULLS LAST, created_at DESC, id DESC LIMIT $5"));
    }

    #[test]
    fn connection_and_user_queries() {
        let query = Query::Connections {
            namespace: ns(),
            filter: ConnectionFilter::To(UserId::new(200)),
            kind: Some(ConnectionType::Friend),
            state: None,
            limit: 200,
        };
        assert_eq!(
            sql(&query),
            "SELECT json_data FROM app_1_2.connections WHERE enabled AND user_to_id = $1 \
             AND kind = $2 ORDER BY seq LIMIT $3"
        );

        // A user's whole network, in one state
        let query = Query::Connections {
            namespace: ns(),
            filter: ConnectionFilter::Touching(UserId::new(100)),
            kind: None,
            state: Some(ConnectionState::Rejected),
            limit: UNBOUNDED,
        };
        assert_eq!(
            sql(&query),
            "SELECT json_data FROM app_1_2.connections WHERE enabled AND (user_from_id = $1 \
             OR user_to_id = $2) AND json_data->>'state' = $3 ORDER BY seq"
        );

        let query = Query::AppUsers {
            namespace: ns(),
            filter: UserFilter::Search("Ali".to_owned()),
            limit: 200,
        };
        let text = sql(&query);
        assert!(text.contains("strpos(lower(user_name), $1) > 0 OR strpos(lower(email), $2) > 0"));
        assert!(text.ends_with("ORDER BY id LIMIT $5"));
    }

    #[test]
    fn tombstones() {
        let user = AppUser {
            id: UserId::new(100),
            enabled: true,
            deleted: Some(false),
            ..Default::default()
        };
        match tombstone(Record::AppUser(ns(), user)) {
            Record::AppUser(_, user) => {
                assert!(!user.enabled);
                assert!(user.is_deleted());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
