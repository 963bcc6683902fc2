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

//! # The Connection API
//!
//! Connections are checked synchronously (so that a caller learns about a self-connection or a
//! duplicate edge in the response) but written asynchronously, through the [dispatcher]. The
//! lists of follows, followers & friends are read straight from the store.
//!
//! Any of the create routes accepts `?with_event=true`, in which case the new edge is also
//! announced as a private `tg_friend` or `tg_follow` event by the connecting user, targeting the
//! other user.
//!
//! [dispatcher]: crate::dispatcher

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    counter_add,
    dispatcher::{AppUserRecord, ConnectionWithIds, EventWithIds, Mutation, SocialConnect},
    entities::{
        AppUser, Connection, ConnectionState, ConnectionType, Event, EventId, Namespace, Object,
        UserId, Visibility,
    },
    graph::{self, PAGE_LIMIT},
    http::{self, dispatch_failure, present, storage_failure, Guard},
    metrics::{self, Sort},
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problems},
    storage::UserFilter,
    tidings::Tidings,
    users::{parse_user_id, user_list},
};

inventory::submit! { metrics::Registration::new("connections.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("connections.failures", Sort::IntegralCounter) }

/// A user id as it appears in a request body: callers send both numbers & strings
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum WireUserId {
    Number(u64),
    Text(String),
}

impl Default for WireUserId {
    fn default() -> Self {
        WireUserId::Number(0)
    }
}

impl WireUserId {
    fn user_id(&self) -> problems::Result<UserId> {
        match self {
            WireUserId::Number(0) => Err(Code::UserIdInvalid.into()),
            WireUserId::Number(n) => Ok(UserId::new(*n)),
            WireUserId::Text(text) => parse_user_id(text),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectionRequest {
    user_to_id: WireUserId,
    #[serde(rename = "type")]
    kind: Option<String>,
    state: Option<String>,
}

fn parse_type(text: Option<&str>) -> problems::Result<ConnectionType> {
    text.and_then(ConnectionType::parse)
        .ok_or_else(|| Code::ConnectionTypeInvalid.into())
}

/// An absent state means "pending"
fn parse_state(text: Option<&str>) -> problems::Result<ConnectionState> {
    match text {
        None | Some("") => Ok(ConnectionState::Pending),
        Some(text) => ConnectionState::parse(text).ok_or_else(|| Code::ConnectionStateInvalid.into()),
    }
}

/// True if the query string asks for the new connection to be announced
fn wants_event(query: Option<&str>) -> bool {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .any(|(name, value)| name == "with_event" && value == "true")
        })
        .unwrap_or(false)
}

/// The event announcing that `from` has connected to `to`
fn connection_event(
    from: UserId,
    to: UserId,
    kind: ConnectionType,
    id: EventId,
    now: DateTime<Utc>,
) -> Event {
    Event {
        id,
        user_id: from,
        kind: format!("tg_{}", kind.as_str()),
        visibility: Visibility::PRIVATE,
        target: Some(Object {
            id: to.to_raw_string(),
            kind: "tg_user".to_owned(),
            ..Default::default()
        }),
        enabled: true,
        created_at: now,
        updated_at: now,
        ..Default::default()
    }
}

/// Dispatch the announcement of a new edge; it shares the edge's partition so it lands after it
async fn announce(
    state: &Tidings,
    ns: Namespace,
    from: UserId,
    to: UserId,
    kind: ConnectionType,
) -> problems::Result<()> {
    let id = state
        .flake
        .next_event_id(ns.app_id)
        .map_err(Problems::server_error)?;
    state
        .dispatcher
        .dispatch(Mutation::EventCreate(EventWithIds::new(
            ns,
            connection_event(from, to, kind, id, Utc::now()),
        )))
        .await
        .map_err(dispatch_failure)
}

/// Create a connection from the current user; `forced` is the type implied by the route, if any
async fn create_connection(
    state: &Tidings,
    ctx: &RequestContext,
    body: &[u8],
    forced: Option<ConnectionType>,
    with_event: bool,
) -> problems::Result<Connection> {
    let ns = ctx.namespace()?;
    let me = ctx.user()?;
    let req: ConnectionRequest = parse_json(body)?;
    let kind = match forced {
        Some(kind) => Ok(kind),
        None => parse_type(req.kind.as_deref()),
    };
    let (to, kind, conn_state) = match (
        req.user_to_id.user_id(),
        kind,
        parse_state(req.state.as_deref()),
    ) {
        (Ok(to), Ok(kind), Ok(conn_state)) => (to, kind, conn_state),
        (to, kind, conn_state) => {
            let mut problems = Problems::new();
            [to.err(), kind.err(), conn_state.err()]
                .into_iter()
                .flatten()
                .for_each(|p| problems.extend(p));
            return Err(problems);
        }
    };
    let connection = graph::prepare(&state.store, ns, me.id, to, kind, conn_state, Utc::now()).await?;
    state
        .dispatcher
        .dispatch(Mutation::ConnectionCreate(ConnectionWithIds::new(
            ns,
            connection.clone(),
        )))
        .await
        .map_err(dispatch_failure)?;
    if with_event {
        announce(state, ns, me.id, to, kind).await?;
    }
    debug!("Connecting {} to {} ({})", me.id, to, kind);
    Ok(connection)
}

fn respond_created(
    state: &Tidings,
    ctx: &RequestContext,
    result: problems::Result<Connection>,
) -> Response {
    match result.and_then(|c| present(&c).map(|v| (v, c.updated_at))) {
        Ok((connection, stamp)) => {
            counter_add!(state.instruments, "connections.created", 1, &[]);
            pipeline::respond(ctx, StatusCode::CREATED, &connection, Some(stamp))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "connections.failures",
                1,
                &[KeyValue::new("code", problems.status().as_u16() as i64)]
            );
            problems.into_response()
        }
    }
}

async fn create(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let result =
        create_connection(&state, &ctx, &body, None, wants_event(query.as_deref())).await;
    respond_created(&state, &ctx, result)
}

async fn create_friend(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let result = create_connection(
        &state,
        &ctx,
        &body,
        Some(ConnectionType::Friend),
        wants_event(query.as_deref()),
    )
    .await;
    respond_created(&state, &ctx, result)
}

async fn create_follow(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let result = create_connection(
        &state,
        &ctx,
        &body,
        Some(ConnectionType::Follow),
        wants_event(query.as_deref()),
    )
    .await;
    respond_created(&state, &ctx, result)
}

/// Look up the live edge from the current user to `to_id`
async fn existing(
    state: &Tidings,
    ctx: &RequestContext,
    to_id: &str,
) -> problems::Result<Connection> {
    let to = parse_user_id(to_id)?;
    let connection = state
        .store
        .connection(ctx.namespace()?, ctx.user()?.id, to)
        .await
        .map_err(storage_failure)?;
    http::found(connection, Code::ConnectionNotFound)
}

async fn delete(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(to_id): Path<String>,
) -> Response {
    async fn delete1(state: &Tidings, ctx: &RequestContext, to_id: &str) -> problems::Result<()> {
        let mut connection = existing(state, ctx, to_id).await?;
        connection.enabled = false;
        connection.updated_at = Utc::now();
        state
            .dispatcher
            .dispatch(Mutation::ConnectionDelete(ConnectionWithIds::new(
                ctx.namespace()?,
                connection,
            )))
            .await
            .map_err(dispatch_failure)
    }

    match delete1(&state, &ctx, &to_id).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => problems.into_response(),
    }
}

async fn confirm(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(to_id): Path<String>,
) -> Response {
    async fn confirm1(
        state: &Tidings,
        ctx: &RequestContext,
        to_id: &str,
    ) -> problems::Result<Connection> {
        let mut connection = existing(state, ctx, to_id).await?;
        let now = Utc::now();
        connection.state = ConnectionState::Confirmed;
        connection.confirmed_at = Some(now);
        connection.updated_at = now;
        state
            .dispatcher
            .dispatch(Mutation::ConnectionConfirm(ConnectionWithIds::new(
                ctx.namespace()?,
                connection.clone(),
            )))
            .await
            .map_err(dispatch_failure)?;
        Ok(connection)
    }

    let result = confirm1(&state, &ctx, &to_id).await;
    respond_created(&state, &ctx, result)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct SocialRequest {
    platform: String,
    /// The current user's own id on `platform`, recorded on their profile if it's not already there
    platform_user_id: Option<String>,
    #[serde(alias = "platform_user_ids")]
    connection_ids: Vec<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    state: Option<String>,
}

#[derive(Serialize)]
struct SocialResponse {
    users: Vec<serde_json::Value>,
    users_count: usize,
}

/// Connect the current user to everyone whose id on some social platform they've supplied
///
/// The response lists the users that will be connected; the connections themselves are made by
/// the applier.
async fn social(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    async fn social1(
        state: &Tidings,
        ctx: &RequestContext,
        body: &[u8],
        with_event: bool,
    ) -> problems::Result<SocialResponse> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let req: SocialRequest = parse_json(body)?;
        let kind = parse_type(req.kind.as_deref())?;
        let conn_state = parse_state(req.state.as_deref())?;
        if req.platform.is_empty() {
            return Err(Code::SearchTermsMissing.into());
        }
        if let Some(own) = req.platform_user_id.filter(|id| !id.is_empty()) {
            if !me.social_ids.contains_key(&req.platform) {
                let mut user: AppUser = me.clone();
                user.social_ids.insert(req.platform.clone(), own);
                user.updated_at = Utc::now();
                state
                    .dispatcher
                    .dispatch(Mutation::AppUserUpdate(AppUserRecord::new(ns, user)))
                    .await
                    .map_err(dispatch_failure)?;
            }
        }
        let targets = if req.connection_ids.is_empty() {
            Vec::new()
        } else {
            state
                .store
                .app_users(
                    ns,
                    UserFilter::Social {
                        platform: req.platform.clone(),
                        ids: req.connection_ids.clone(),
                    },
                    PAGE_LIMIT,
                )
                .await
                .map_err(storage_failure)?
                .into_iter()
                .filter(|u| u.id != me.id)
                .collect::<Vec<AppUser>>()
        };
        state
            .dispatcher
            .dispatch(Mutation::ConnectionSocialConnect(SocialConnect {
                org_id: ns.org_id,
                app_id: ns.app_id,
                user_from_id: me.id,
                platform: req.platform,
                social_ids: req.connection_ids,
                kind,
                state: conn_state,
            }))
            .await
            .map_err(dispatch_failure)?;
        if with_event {
            for target in &targets {
                announce(state, ns, me.id, target.id, kind).await?;
            }
        }
        let users = targets
            .into_iter()
            .map(|u| present(&u.public_profile()))
            .collect::<problems::Result<Vec<_>>>()?;
        Ok(SocialResponse {
            users_count: users.len(),
            users,
        })
    }

    match social1(&state, &ctx, &body, wants_event(query.as_deref())).await {
        Ok(rsp) => pipeline::respond_now(&ctx, StatusCode::CREATED, &rsp),
        Err(problems) => problems.into_response(),
    }
}

/// `user_id` if given (it must name an existing user), else the current user
async fn subject(
    state: &Tidings,
    ctx: &RequestContext,
    user_id: Option<&str>,
) -> problems::Result<UserId> {
    match user_id {
        Some(text) => {
            let id = parse_user_id(text)?;
            let user = state
                .store
                .app_user(ctx.namespace()?, id)
                .await
                .map_err(storage_failure)?;
            Ok(http::found(user, Code::UserNotFound)?.id)
        }
        None => Ok(ctx.user()?.id),
    }
}

#[derive(Clone, Copy, Debug)]
enum Listing {
    Follows,
    Followers,
    Friends,
}

/// List the users `user_id` (or the current user, if `None`) follows, is followed by or is
/// friends with
async fn listing(
    state: &Tidings,
    ctx: &RequestContext,
    user_id: Option<&str>,
    which: Listing,
) -> problems::Result<Response> {
    let ns = ctx.namespace()?;
    let me = ctx.user()?.id;
    let subject = subject(state, ctx, user_id).await?;
    let users = match which {
        Listing::Follows => graph::follows(&state.store, ns, subject).await?,
        Listing::Followers => graph::followers(&state.store, ns, subject).await?,
        Listing::Friends => graph::friends(&state.store, ns, subject).await?,
    };
    user_list(&state.store, ctx, me, users).await
}

macro_rules! define_listing {
    ($mine:ident, $theirs:ident, $which:expr) => {
        async fn $mine(
            State(state): State<Arc<Tidings>>,
            Extension(ctx): Extension<RequestContext>,
        ) -> Response {
            listing(&state, &ctx, None, $which)
                .await
                .unwrap_or_else(|problems| problems.into_response())
        }
        async fn $theirs(
            State(state): State<Arc<Tidings>>,
            Extension(ctx): Extension<RequestContext>,
            Path(user_id): Path<String>,
        ) -> Response {
            listing(&state, &ctx, Some(&user_id), $which)
                .await
                .unwrap_or_else(|problems| problems.into_response())
        }
    };
}

define_listing!(my_follows, follows, Listing::Follows);
define_listing!(my_followers, followers, Listing::Followers);
define_listing!(my_friends, friends, Listing::Friends);

fn parse_listed_state(text: &str) -> problems::Result<ConnectionState> {
    ConnectionState::parse(text).ok_or_else(|| Problems::from(Code::ConnectionStateInvalid))
}

#[derive(Serialize)]
struct ByStateResponse {
    incoming: Vec<serde_json::Value>,
    outgoing: Vec<serde_json::Value>,
    users: Vec<serde_json::Value>,
    incoming_connections_count: usize,
    outgoing_connections_count: usize,
    users_count: usize,
}

/// List the edges touching a user that are pending, confirmed or rejected, along with the users
/// at their other ends
async fn listing_in_state(
    state: &Tidings,
    ctx: &RequestContext,
    user_id: Option<&str>,
    which: &str,
) -> problems::Result<Response> {
    let ns = ctx.namespace()?;
    let conn_state = parse_listed_state(which)?;
    let subject = subject(state, ctx, user_id).await?;
    let edges = graph::by_state(&state.store, ns, subject, conn_state).await?;
    if edges.is_empty() {
        return Ok(http::no_content(ctx));
    }
    let users = graph::users_in_order(&state.store, ns, &edges.others(subject))
        .await?
        .into_iter()
        .map(|u| present(&u.public_profile()))
        .collect::<problems::Result<Vec<_>>>()?;
    let stamps = edges
        .incoming
        .iter()
        .chain(edges.outgoing.iter())
        .map(|c| c.updated_at)
        .collect::<Vec<_>>();
    let incoming = edges
        .incoming
        .iter()
        .map(present)
        .collect::<problems::Result<Vec<_>>>()?;
    let outgoing = edges
        .outgoing
        .iter()
        .map(present)
        .collect::<problems::Result<Vec<_>>>()?;
    Ok(pipeline::respond(
        ctx,
        StatusCode::OK,
        &ByStateResponse {
            incoming_connections_count: incoming.len(),
            outgoing_connections_count: outgoing.len(),
            users_count: users.len(),
            incoming,
            outgoing,
            users,
        },
        stamps,
    ))
}

async fn my_in_state(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(which): Path<String>,
) -> Response {
    listing_in_state(&state, &ctx, None, &which)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

async fn in_state(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((user_id, which)): Path<(String, String)>,
) -> Response {
    listing_in_state(&state, &ctx, Some(&user_id), &which)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

/// Return a router for the Connection API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let user = Router::new()
        .route("/me/connections", put(create))
        .route("/me/friends", put(create_friend).get(my_friends))
        .route("/me/follow", put(create_follow))
        .route("/me/follows", get(my_follows))
        .route("/me/followers", get(my_followers))
        .route("/me/{connectionState}", get(my_in_state))
        .route("/me/connections/social", post(social))
        .route("/me/connections/{toID}", axum::routing::delete(delete))
        .route("/me/connections/{toID}/confirm", post(confirm))
        .route("/users/{userID}/follows", get(follows))
        .route("/users/{userID}/followers", get(followers))
        .route("/users/{userID}/friends", get(friends))
        .route("/users/{userID}/{connectionState}", get(in_state));
    Router::new()
        .merge(http::guard(user, &state, Guard::ApplicationUser))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_requests() {
        let req: ConnectionRequest =
            serde_json::from_str(r#"{"user_to_id": 200, "type": "friend"}"#).unwrap();
        assert_eq!(req.user_to_id.user_id().unwrap(), UserId::new(200));
        assert_eq!(
            parse_type(req.kind.as_deref()).unwrap(),
            ConnectionType::Friend
        );
        assert_eq!(
            parse_state(req.state.as_deref()).unwrap(),
            ConnectionState::Pending
        );

        let req: ConnectionRequest =
            serde_json::from_str(r#"{"user_to_id": "300", "type": "enemy", "state": "meh"}"#)
                .unwrap();
        assert_eq!(req.user_to_id.user_id().unwrap(), UserId::new(300));
        assert_eq!(
            parse_type(req.kind.as_deref()).unwrap_err().codes(),
            vec![Code::ConnectionTypeInvalid]
        );
        assert_eq!(
            parse_state(req.state.as_deref()).unwrap_err().codes(),
            vec![Code::ConnectionStateInvalid]
        );

        let req: ConnectionRequest = serde_json::from_str(r#"{"type": "follow"}"#).unwrap();
        assert_eq!(
            req.user_to_id.user_id().unwrap_err().codes(),
            vec![Code::UserIdInvalid]
        );
    }

    #[test]
    fn announcing_connections() {
        assert!(wants_event(Some("with_event=true")));
        assert!(wants_event(Some("foo=1&with_event=true")));
        assert!(!wants_event(Some("with_event=false")));
        assert!(!wants_event(Some("with_event")));
        assert!(!wants_event(None));

        let now = Utc::now();
        let event = connection_event(
            UserId::new(100),
            UserId::new(200),
            ConnectionType::Friend,
            EventId::new(7),
            now,
        );
        assert_eq!(event.kind, "tg_friend");
        assert_eq!(event.user_id, UserId::new(100));
        assert_eq!(event.visibility, Visibility::PRIVATE);
        assert_eq!(event.target_id(), Some("200"));
        assert_eq!(event.target.as_ref().map(|t| t.kind.as_str()), Some("tg_user"));
        assert!(event.enabled);
        assert_eq!(event.created_at, now);
    }

    #[test]
    fn listed_states() {
        assert_eq!(
            parse_listed_state("pending").unwrap(),
            ConnectionState::Pending
        );
        assert_eq!(
            parse_listed_state("rejected").unwrap(),
            ConnectionState::Rejected
        );
        assert_eq!(
            parse_listed_state("blocked").unwrap_err().codes(),
            vec![Code::ConnectionStateInvalid]
        );
    }

    #[test]
    fn social_requests() {
        let req: SocialRequest = serde_json::from_str(
            r#"{"platform": "facebook", "platform_user_ids": ["fb1", "fb2"], "type": "friend"}"#,
        )
        .unwrap();
        assert_eq!(req.connection_ids, vec!["fb1", "fb2"]);
        assert!(req.platform_user_id.is_none());
    }
}
