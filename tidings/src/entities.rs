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

//! # tidings models
//!
//! ## Introduction
//!
//! I'm not fond of catch-all modules named "models" or "entities", but these types really are
//! foundational: every other module in the crate traffics in them.
//!
//! ## Identifiers
//!
//! Organizations, members & applications have an internal 64-bit id which never leaves the
//! process, and a public id (a v5 UUID derived from the internal id) which is what callers see.
//! Application users & events are identified by their (64-bit) [flake] ids directly.
//!
//! [flake]: crate::flake
//!
//! ## Serialization
//!
//! Every entity is stored as a JSON document (see [storage]); the serde representation of each type
//! below *is* that document. Internal identifiers are marked `#[serde(skip)]` since the store keeps
//! them in their own (key) columns, as do the log records that carry these types.
//!
//! [storage]: crate::storage

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use email_address::EmailAddress;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid identifier: {source}"))]
    BadId {
        text: String,
        source: std::num::ParseIntError,
        backtrace: Backtrace,
    },
    #[snafu(display("{text} is not a valid public identifier: {source}"))]
    BadPublicId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize an entity: {source}"))]
    Present {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// define_id!
///
/// Declare a newtype struct wrapping a `u64` to serve as an opaque identifier for some sort of
/// entity. I couldn't bring myself to use the same type to identify organizations, applications,
/// users & events all at the same time.
///
/// All of our ids fit in 63 bits (flake ids are 41 bits of timestamp, ten of node & twelve of
/// sequence), so the conversions to & from `i64` (which is what Postgres speaks) are lossless.
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            Default,
            Deserialize,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(u64);
        impl $type_name {
            pub const fn new(id: u64) -> $type_name {
                $type_name(id)
            }
            pub fn from_raw_string(s: &str) -> Result<$type_name> {
                s.parse::<u64>()
                    .map($type_name)
                    .context(BadIdSnafu { text: s.to_owned() })
            }
            pub fn to_raw_string(&self) -> String {
                self.0.to_string()
            }
            pub fn as_u64(&self) -> u64 {
                self.0
            }
            pub fn as_i64(&self) -> i64 {
                self.0 as i64
            }
            pub fn from_i64(id: i64) -> $type_name {
                $type_name(id as u64)
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl FromStr for $type_name {
            type Err = Error;
            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                $type_name::from_raw_string(s)
            }
        }
        impl From<u64> for $type_name {
            fn from(id: u64) -> Self {
                $type_name(id)
            }
        }
    };
}

define_id!(OrgId);
define_id!(MemberId);
define_id!(AppId);
define_id!(UserId);
define_id!(EventId);

// Arbitrary, but fixed forever: changing it would change every public id we've ever handed out.
const PUBLIC_ID_NAMESPACE: Uuid = Uuid::from_u128(0x3f0c_9a5e_51d2_4c7b_9d0e_7a61_b2c4_d8e1);

/// The externally visible identifier for an organization, member or application
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct PublicId(Uuid);

impl PublicId {
    /// Derive the public id for the entity of kind `kind` with internal id `id`
    pub fn derive(kind: &str, id: u64) -> PublicId {
        PublicId(Uuid::new_v5(
            &PUBLIC_ID_NAMESPACE,
            format!("{}:{}", kind, id).as_bytes(),
        ))
    }
    pub fn from_raw_string(s: &str) -> Result<PublicId> {
        Ok(PublicId(
            Uuid::parse_str(s).context(BadPublicIdSnafu { text: s.to_owned() })?,
        ))
    }
}

impl Display for PublicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl FromStr for PublicId {
    type Err = Error;
    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        PublicId::from_raw_string(s)
    }
}

/// Every application gets its own, isolated, set of users, connections, events & sessions
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Namespace {
    pub org_id: OrgId,
    pub app_id: AppId,
}

impl Namespace {
    pub fn new(org_id: OrgId, app_id: AppId) -> Namespace {
        Namespace { org_id, app_id }
    }
    /// The name of the Postgres schema holding this namespace's tables
    pub fn schema_name(&self) -> String {
        format!("app_{}_{}", self.org_id, self.app_id)
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org_id, self.app_id)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Presentation                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Entities whose numeric ids are also rendered as strings when returned to callers
///
/// Javascript clients can't represent a 64-bit integer exactly, so alongside each numeric id we
/// send its decimal string (`id_string`, `user_id_string` & so on).
pub trait Presentable: Serialize {
    fn id_strings(&self) -> Vec<(&'static str, String)>;
    fn present(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(self).context(PresentSnafu)?;
        if let serde_json::Value::Object(map) = &mut value {
            self.id_strings().into_iter().for_each(|(name, text)| {
                map.insert(name.to_owned(), serde_json::Value::String(text));
            });
        }
        Ok(value)
    }
}

pub fn is_valid_email(text: &str) -> bool {
    EmailAddress::is_valid(text)
}

pub fn is_valid_url(text: &str) -> bool {
    Url::parse(text).is_ok()
}

/// Check that `text` is between `min` & `max` characters in length (inclusive)
pub fn within(text: &str, min: usize, max: usize) -> bool {
    let n = text.chars().count();
    n >= min && n <= max
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Image {
    pub url: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   Organizations & Members                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Organization {
    #[serde(skip)]
    pub id: OrgId,
    #[serde(rename = "id")]
    pub public_id: PublicId,
    pub name: String,
    pub description: String,
    #[serde(rename = "token")]
    pub auth_token: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An organization-scoped human operator
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Member {
    #[serde(skip)]
    pub id: MemberId,
    #[serde(skip)]
    pub org_id: OrgId,
    #[serde(rename = "id")]
    pub public_id: PublicId,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    /// Strip the password hash (& session token) before handing this member back to a caller
    pub fn sanitized(mut self) -> Member {
        self.password = None;
        self.session_token = None;
        self
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Application {
    #[serde(skip)]
    pub id: AppId,
    #[serde(skip)]
    pub org_id: OrgId,
    #[serde(rename = "id")]
    pub public_id: PublicId,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub token: String,
    pub backend_token: String,
    pub in_production: bool,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.org_id, self.id)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       Application users                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct AppUser {
    pub id: UserId,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub social_ids: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub activated: bool,
    // Tri-state: `None` means the flag was never set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub friend_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follower_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followed_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_friend: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_follower: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_followed: Option<bool>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppUser {
    /// The user id as it appears in event targets (`target.id`)
    pub fn id_string(&self) -> String {
        self.id.to_raw_string()
    }
    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }
    /// Strip the password hash before handing this user back to a caller
    pub fn sanitized(mut self) -> AppUser {
        self.password = None;
        self
    }
    /// Remove the fields that are computed at read time (and so never stored)
    pub fn without_derived(mut self) -> AppUser {
        self.friend_count = None;
        self.follower_count = None;
        self.followed_count = None;
        self.is_friend = None;
        self.is_follower = None;
        self.is_followed = None;
        self
    }
    /// Strip everything but the public profile; used when a user appears in someone else's lists
    pub fn public_profile(self) -> AppUser {
        let mut user = self.sanitized().without_derived();
        user.session_token = None;
        user.social_ids.clear();
        user.last_read = None;
        user
    }
}

impl Presentable for AppUser {
    fn id_strings(&self) -> Vec<(&'static str, String)> {
        vec![("id_string", self.id.to_raw_string())]
    }
}

/// An issued session token for an application user
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Session {
    pub user_id: UserId,
    pub session_token: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Connections                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Follow,
    Friend,
}

impl ConnectionType {
    pub fn parse(text: &str) -> Option<ConnectionType> {
        match text {
            "follow" => Some(ConnectionType::Follow),
            "friend" => Some(ConnectionType::Friend),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Follow => "follow",
            ConnectionType::Friend => "friend",
        }
    }
}

impl Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Pending,
    Confirmed,
    Rejected,
}

impl ConnectionState {
    pub fn parse(text: &str) -> Option<ConnectionState> {
        match text {
            "pending" => Some(ConnectionState::Pending),
            "confirmed" => Some(ConnectionState::Confirmed),
            "rejected" => Some(ConnectionState::Rejected),
            _ => None,
        }
    }
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Confirmed => "confirmed",
            ConnectionState::Rejected => "rejected",
        }
    }
}

/// A directed edge between two application users
///
/// A `friend` edge is always accompanied by its mirror; see [Connection::mirror].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Connection {
    pub user_from_id: UserId,
    pub user_to_id: UserId,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub state: ConnectionState,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// The reciprocal edge; identical in every respect but direction
    pub fn mirror(&self) -> Connection {
        Connection {
            user_from_id: self.user_to_id,
            user_to_id: self.user_from_id,
            ..self.clone()
        }
    }
}

impl Presentable for Connection {
    fn id_strings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("user_from_id_string", self.user_from_id.to_raw_string()),
            ("user_to_id_string", self.user_to_id.to_raw_string()),
        ]
    }
}

/// How one user relates to another; derived from [Connection]s, never stored
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Relation {
    pub is_friend: bool,
    /// The other user follows this one
    pub is_follower: bool,
    /// This user follows the other one
    pub is_followed: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Events                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Event visibility
///
/// One of four discrete levels: private (10), connections (20), public (30) & global (40). Zero
/// means "not given" & is replaced with public on create. Anything else is rejected at validation
/// time, which is why this isn't an enum: we want to be able to deserialize a bad value so that we
/// can report it properly.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Visibility(u16);

impl Visibility {
    pub const UNSET: Visibility = Visibility(0);
    pub const PRIVATE: Visibility = Visibility(10);
    pub const CONNECTIONS: Visibility = Visibility(20);
    pub const PUBLIC: Visibility = Visibility(30);
    pub const GLOBAL: Visibility = Visibility(40);

    pub const fn new(level: u16) -> Visibility {
        Visibility(level)
    }
    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
    pub fn is_valid(&self) -> bool {
        matches!(self.0, 10 | 20 | 30 | 40)
    }
    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> StdResult<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
    }
    Ok(match Repr::deserialize(deserializer)? {
        Repr::Text(s) => s,
        Repr::Unsigned(u) => u.to_string(),
        Repr::Signed(i) => i.to_string(),
        Repr::Float(f) => f.to_string(),
    })
}

/// The thing an event is about (or directed at, or performed with)
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Object {
    // Callers are inconsistent about whether this is a string or a number
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub display_names: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct Event {
    pub id: EventId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub visibility: Visibility,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Object>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instrument: Option<Object>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub participant: Vec<Object>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<BTreeMap<String, Image>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    pub fn target_id(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.id.as_str())
    }
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

impl Presentable for Event {
    fn id_strings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("id_string", self.id.to_raw_string()),
            ("user_id_string", self.user_id.to_raw_string()),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn public_ids_are_stable() {
        let a = PublicId::derive("org", 17);
        assert_eq!(a, PublicId::derive("org", 17));
        assert_ne!(a, PublicId::derive("app", 17));
        assert_eq!(a, PublicId::from_raw_string(&a.to_string()).unwrap());
    }

    #[test]
    fn ids_parse() {
        assert_eq!(UserId::from_raw_string("200").unwrap(), UserId::new(200));
        assert!(UserId::from_raw_string("-1").is_err());
        assert!(EventId::from_raw_string("abc").is_err());
        assert_eq!(UserId::from_i64(UserId::new(1 << 62).as_i64()), UserId::new(1 << 62));
    }

    #[test]
    fn object_ids_may_be_numbers() {
        let obj: Object = serde_json::from_str(r#"{"id": 200, "type": "user"}"#).unwrap();
        assert_eq!(obj.id, "200");
        let obj: Object = serde_json::from_str(r#"{"id": "item-1", "type": "item"}"#).unwrap();
        assert_eq!(obj.id, "item-1");
    }

    #[test]
    fn presentation_carries_id_strings() {
        let event = Event {
            id: EventId::new(12),
            user_id: UserId::new(100),
            kind: "like".to_owned(),
            visibility: Visibility::PUBLIC,
            ..Default::default()
        };
        let value = event.present().unwrap();
        assert_eq!(value["id"], 12);
        assert_eq!(value["id_string"], "12");
        assert_eq!(value["user_id_string"], "100");
        assert_eq!(value["type"], "like");
        assert_eq!(value["visibility"], 30);
    }

    #[test]
    fn internal_ids_are_not_serialized() {
        let org = Organization {
            id: OrgId::new(5),
            public_id: PublicId::derive("org", 5),
            name: "acme".to_owned(),
            ..Default::default()
        };
        let value = serde_json::to_value(&org).unwrap();
        assert_eq!(value["id"], org.public_id.to_string());
        let back: Organization = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, OrgId::default());
        assert_eq!(back.public_id, org.public_id);
    }

    #[test]
    fn mirror() {
        let c = Connection {
            user_from_id: UserId::new(100),
            user_to_id: UserId::new(200),
            kind: ConnectionType::Friend,
            enabled: true,
            ..Default::default()
        };
        let m = c.mirror();
        assert_eq!(m.user_from_id, UserId::new(200));
        assert_eq!(m.user_to_id, UserId::new(100));
        assert_eq!(m.kind, ConnectionType::Friend);
        assert_eq!(m.mirror(), c);
    }

    #[test]
    fn visibility() {
        let e: Event = serde_json::from_str(r#"{"type": "like"}"#).unwrap();
        assert!(!e.visibility.is_set());
        let e: Event = serde_json::from_str(r#"{"type": "like", "visibility": 50}"#).unwrap();
        assert!(!e.visibility.is_valid());
        assert!(Visibility::GLOBAL.is_valid());
    }
}
