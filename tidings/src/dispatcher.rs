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

//! # The write dispatcher
//!
//! Most mutations are not applied to the store in the request that asks for them. Instead, the
//! handler validates the request, builds a [Mutation], and hands it to the [Dispatcher], which
//! serializes it onto the [ordered log] under a partition key chosen so that every mutation to the
//! same aggregate lands on the same shard (& so is applied in order). The handler then answers
//! immediately; the [applier] picks the record up later.
//!
//! [ordered log]: crate::ordered_log
//! [applier]: crate::applier
//!
//! Each logical stream has its own payload shape. Payloads always carry the ids of everything the
//! applier needs to locate the target rows; entity bodies are flattened alongside them, so that a
//! `connection.create` message, for instance, reads
//! `{"org_id":1,"app_id":2,"user_from_id":100,"user_to_id":200,"type":"friend",...}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, error};

use crate::{
    counter_add,
    entities::{
        AppId, AppUser, Application, Connection, ConnectionState, ConnectionType, Event, EventId,
        Member, MemberId, Namespace, OrgId, Organization, UserId,
    },
    metrics::{self, Instruments, Sort},
    ordered_log::{self, Envelope, Log},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to append a {stream} record: {source}"))]
    Append {
        stream: &'static str,
        source: ordered_log::Error,
    },
    #[snafu(display("Failed to pack a {stream} record: {source}"))]
    Pack {
        stream: &'static str,
        source: ordered_log::Error,
    },
    #[snafu(display("Failed to unpack a {stream} record: {source}"))]
    Unpack {
        stream: String,
        source: ordered_log::Error,
    },
    #[snafu(display("{stream} is not a known stream"))]
    UnknownStream { stream: String, backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Payloads                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrganizationRecord {
    pub org_id: OrgId,
    #[serde(flatten)]
    pub organization: Organization,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrganizationKey {
    pub org_id: OrgId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MemberRecord {
    pub org_id: OrgId,
    pub member_id: MemberId,
    #[serde(flatten)]
    pub member: Member,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MemberKey {
    pub org_id: OrgId,
    pub member_id: MemberId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApplicationRecord {
    pub org_id: OrgId,
    pub app_id: AppId,
    #[serde(flatten)]
    pub application: Application,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApplicationKey {
    pub org_id: OrgId,
    pub app_id: AppId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AppUserRecord {
    pub org_id: OrgId,
    pub app_id: AppId,
    #[serde(flatten)]
    pub user: AppUser,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AppUserKey {
    pub org_id: OrgId,
    pub app_id: AppId,
    pub user_id: UserId,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConnectionWithIds {
    pub org_id: OrgId,
    pub app_id: AppId,
    #[serde(flatten)]
    pub connection: Connection,
}

/// Connect `user_from_id` to each of `targets`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AutoConnect {
    pub org_id: OrgId,
    pub app_id: AppId,
    pub user_from_id: UserId,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub state: ConnectionState,
    pub targets: Vec<UserId>,
}

/// Connect `user_from_id` to every user whose id on `platform` is among `social_ids`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SocialConnect {
    pub org_id: OrgId,
    pub app_id: AppId,
    pub user_from_id: UserId,
    pub platform: String,
    pub social_ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: ConnectionType,
    pub state: ConnectionState,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventWithIds {
    pub org_id: OrgId,
    pub app_id: AppId,
    #[serde(flatten)]
    pub event: Event,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EventKey {
    pub org_id: OrgId,
    pub app_id: AppId,
    pub user_id: UserId,
    pub event_id: EventId,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Mutations                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! define_streams {
    ($($variant:ident = ($name:literal, $payload:ty)),* $(,)?) => {
        /// Every mutation that travels through the ordered log
        #[derive(Clone, Debug, PartialEq)]
        pub enum Mutation {
            $($variant($payload)),*
        }

        /// The name of every logical stream
        pub const STREAMS: &[&str] = &[$($name),*];

        impl Mutation {
            pub fn stream(&self) -> &'static str {
                match self {
                    $(Mutation::$variant(_) => $name),*
                }
            }
            pub fn to_envelope(&self) -> Result<Envelope> {
                let stream = self.stream();
                let packed = match self {
                    $(Mutation::$variant(payload) => Envelope::pack(stream, payload)),*
                };
                packed.context(PackSnafu { stream })
            }
            pub fn from_envelope(envelope: &Envelope) -> Result<Mutation> {
                match envelope.stream_name.as_str() {
                    $($name => Ok(Mutation::$variant(
                        envelope
                            .unpack::<$payload>()
                            .context(UnpackSnafu { stream: $name })?,
                    )),)*
                    other => UnknownStreamSnafu { stream: other }.fail(),
                }
            }
        }
    };
}

define_streams! {
    OrgUpdate = ("org.update", OrganizationRecord),
    OrgDelete = ("org.delete", OrganizationKey),
    MemberCreate = ("member.create", MemberRecord),
    MemberUpdate = ("member.update", MemberRecord),
    MemberDelete = ("member.delete", MemberKey),
    AppCreate = ("app.create", ApplicationRecord),
    AppUpdate = ("app.update", ApplicationRecord),
    AppDelete = ("app.delete", ApplicationKey),
    AppUserUpdate = ("appUser.update", AppUserRecord),
    AppUserDelete = ("appUser.delete", AppUserKey),
    ConnectionCreate = ("connection.create", ConnectionWithIds),
    ConnectionUpdate = ("connection.update", ConnectionWithIds),
    ConnectionConfirm = ("connection.confirm", ConnectionWithIds),
    ConnectionDelete = ("connection.delete", ConnectionWithIds),
    ConnectionAutoConnect = ("connection.autoConnect", AutoConnect),
    ConnectionSocialConnect = ("connection.socialConnect", SocialConnect),
    EventCreate = ("event.create", EventWithIds),
    EventUpdate = ("event.update", EventWithIds),
    EventDelete = ("event.delete", EventKey),
}

impl Mutation {
    /// The partition key for this mutation
    ///
    /// Organization & member mutations are keyed by organization, application mutations by
    /// organization & application, and everything inside an application by application & the
    /// user at the root of the aggregate (the author of an event, the "from" side of a connection).
    pub fn partition_key(&self) -> String {
        fn app_user(app: AppId, user: UserId) -> String {
            format!("{}-{}", app, user)
        }
        match self {
            Mutation::OrgUpdate(x) => x.org_id.to_string(),
            Mutation::OrgDelete(x) => x.org_id.to_string(),
            Mutation::MemberCreate(x) | Mutation::MemberUpdate(x) => x.org_id.to_string(),
            Mutation::MemberDelete(x) => x.org_id.to_string(),
            Mutation::AppCreate(x) | Mutation::AppUpdate(x) => format!("{}-{}", x.org_id, x.app_id),
            Mutation::AppDelete(x) => format!("{}-{}", x.org_id, x.app_id),
            Mutation::AppUserUpdate(x) => app_user(x.app_id, x.user.id),
            Mutation::AppUserDelete(x) => app_user(x.app_id, x.user_id),
            Mutation::ConnectionCreate(x)
            | Mutation::ConnectionUpdate(x)
            | Mutation::ConnectionConfirm(x)
            | Mutation::ConnectionDelete(x) => app_user(x.app_id, x.connection.user_from_id),
            Mutation::ConnectionAutoConnect(x) => app_user(x.app_id, x.user_from_id),
            Mutation::ConnectionSocialConnect(x) => app_user(x.app_id, x.user_from_id),
            Mutation::EventCreate(x) | Mutation::EventUpdate(x) => {
                app_user(x.app_id, x.event.user_id)
            }
            Mutation::EventDelete(x) => app_user(x.app_id, x.user_id),
        }
    }
}

impl ConnectionWithIds {
    pub fn new(ns: Namespace, connection: Connection) -> ConnectionWithIds {
        ConnectionWithIds {
            org_id: ns.org_id,
            app_id: ns.app_id,
            connection,
        }
    }
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.org_id, self.app_id)
    }
}

impl EventWithIds {
    pub fn new(ns: Namespace, event: Event) -> EventWithIds {
        EventWithIds {
            org_id: ns.org_id,
            app_id: ns.app_id,
            event,
        }
    }
    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.org_id, self.app_id)
    }
}

impl AppUserRecord {
    pub fn new(ns: Namespace, user: AppUser) -> AppUserRecord {
        AppUserRecord {
            org_id: ns.org_id,
            app_id: ns.app_id,
            user,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Dispatcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("dispatcher.appends", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("dispatcher.append.failures", Sort::IntegralCounter) }

/// Routes [Mutation]s onto the ordered log
#[derive(Clone)]
pub struct Dispatcher {
    log: Arc<dyn Log + Send + Sync>,
    instruments: Arc<Instruments>,
}

impl Dispatcher {
    pub fn new(log: Arc<dyn Log + Send + Sync>, instruments: Arc<Instruments>) -> Dispatcher {
        Dispatcher { log, instruments }
    }
    /// Append `mutation` to the log; once this returns `Ok`, the mutation will eventually be
    /// applied
    pub async fn dispatch(&self, mutation: Mutation) -> Result<()> {
        let stream = mutation.stream();
        let key = mutation.partition_key();
        let envelope = mutation.to_envelope()?;
        match self.log.append(&key, &envelope).await {
            Ok(()) => {
                debug!("Dispatched {} under {}", stream, key);
                counter_add!(self.instruments, "dispatcher.appends", 1, &[]);
                Ok(())
            }
            Err(err) => {
                error!("Failed to append {} under {}: {}", stream, key, err);
                counter_add!(self.instruments, "dispatcher.append.failures", 1, &[]);
                Err(err).context(AppendSnafu { stream })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::{entities::Visibility, ordered_log::shard_for};

    fn ns() -> Namespace {
        Namespace::new(OrgId::new(1), AppId::new(2))
    }

    #[test]
    fn connection_payloads_carry_ids() {
        let m = Mutation::ConnectionCreate(ConnectionWithIds::new(
            ns(),
            Connection {
                user_from_id: UserId::new(100),
                user_to_id: UserId::new(200),
                kind: ConnectionType::Friend,
                enabled: true,
                ..Default::default()
            },
        ));
        assert_eq!(m.stream(), "connection.create");
        assert_eq!(m.partition_key(), "2-100");
        let envelope = m.to_envelope().unwrap();
        let json = envelope.unpack::<serde_json::Value>().unwrap();
        assert_eq!(json["org_id"], 1);
        assert_eq!(json["app_id"], 2);
        assert_eq!(json["user_from_id"], 100);
        assert_eq!(json["user_to_id"], 200);
        assert_eq!(json["type"], "friend");
        assert_eq!(Mutation::from_envelope(&envelope).unwrap(), m);
    }

    #[test]
    fn internal_ids_survive_the_log() {
        let m = Mutation::AppCreate(ApplicationRecord {
            org_id: OrgId::new(1),
            app_id: AppId::new(2),
            application: Application {
                name: "app".to_owned(),
                ..Default::default()
            },
        });
        assert_eq!(m.partition_key(), "1-2");
        let back = Mutation::from_envelope(&m.to_envelope().unwrap()).unwrap();
        match back {
            Mutation::AppCreate(rec) => {
                assert_eq!(rec.org_id, OrgId::new(1));
                assert_eq!(rec.app_id, AppId::new(2));
                assert_eq!(rec.application.name, "app");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_streams_are_reported() {
        let envelope = Envelope::pack("user.frobnicate", &1).unwrap();
        assert!(matches!(
            Mutation::from_envelope(&envelope),
            Err(Error::UnknownStream { .. })
        ));
        assert_eq!(STREAMS.len(), 19);
    }

    #[tokio::test]
    async fn same_aggregate_same_shard() {
        let log = Arc::new(ordered_log::InMemory::new(4).unwrap());
        let dispatcher = Dispatcher::new(log.clone(), Arc::new(Instruments::new("tidings")));
        for i in 1..=3u64 {
            dispatcher
                .dispatch(Mutation::EventCreate(EventWithIds::new(
                    ns(),
                    Event {
                        id: EventId::new(i),
                        user_id: UserId::new(100),
                        kind: "like".to_owned(),
                        visibility: Visibility::PUBLIC,
                        ..Default::default()
                    },
                )))
                .await
                .unwrap();
        }
        let entries = log
            .read(shard_for("2-100", 4), "test", 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.envelope.stream_name == "event.create"));
    }
}
