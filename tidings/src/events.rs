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

//! # The Event API
//!
//! Event writes go through the [dispatcher]; reads (single events, per-user lists, feeds & the
//! searches) come straight from the store via the [feed] engine.
//!
//! [dispatcher]: crate::dispatcher
//! [feed]: crate::feed

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    counter_add,
    dispatcher::{EventKey, EventWithIds, Mutation},
    entities::{self, Event, EventId, Namespace, UserId, Visibility},
    feed::{self, GeoQuery},
    http::{self, dispatch_failure, present, storage_failure, Guard},
    metrics::{self, Sort},
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problem, Problems},
    storage::Store,
    tidings::Tidings,
    users::parse_user_id,
};

inventory::submit! { metrics::Registration::new("events.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("events.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("feeds.served", Sort::IntegralCounter) }

fn validate(event: &Event) -> problems::Result<()> {
    let mut problems = Problems::new();
    problems.check(entities::within(&event.kind, 1, 30), Code::EventTypeSize);
    problems.check(event.visibility.is_valid(), Code::EventVisibilityInvalid);
    problems.into_result()
}

fn parse_event_id(text: &str) -> problems::Result<EventId> {
    EventId::from_raw_string(text).map_err(|err| Problem::internal(Code::EventIdInvalid, err).into())
}

/// Look up one of the current user's own events
async fn own_event(
    store: &Store,
    ns: Namespace,
    user: UserId,
    event_id: &str,
) -> problems::Result<Event> {
    let id = parse_event_id(event_id)?;
    let event = store
        .event(ns, id)
        .await
        .map_err(storage_failure)?
        .filter(|e| e.user_id == user);
    http::found(event, Code::EventNotFound)
}

#[derive(Debug, Default, Serialize)]
struct EventList {
    events: Vec<serde_json::Value>,
    events_count: usize,
    users: BTreeMap<String, serde_json::Value>,
    users_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    unread_events_count: Option<usize>,
}

/// Present `events` along with their authors, or answer "204 No Content" if there aren't any
async fn event_list(
    store: &Store,
    ctx: &RequestContext,
    events: Vec<Event>,
    unread: Option<usize>,
) -> problems::Result<Response> {
    if events.is_empty() {
        return Ok(http::no_content(ctx));
    }
    let authors = feed::authors(store, ctx.namespace()?, &events).await?;
    let stamps = events.iter().map(|e| e.updated_at).collect::<Vec<_>>();
    let events = events
        .iter()
        .map(present)
        .collect::<problems::Result<Vec<_>>>()?;
    let users = authors
        .iter()
        .map(|(id, user)| present(user).map(|u| (id.clone(), u)))
        .collect::<problems::Result<BTreeMap<_, _>>>()?;
    Ok(pipeline::respond(
        ctx,
        StatusCode::OK,
        &EventList {
            events_count: events.len(),
            events,
            users_count: users.len(),
            users,
            unread_events_count: unread,
        },
        stamps,
    ))
}

fn failure(state: &Tidings, op: &'static str, problems: Problems) -> Response {
    counter_add!(
        state.instruments,
        "events.failures",
        1,
        &[KeyValue::new("op", op)]
    );
    problems.into_response()
}

async fn create(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn create1(
        state: &Tidings,
        ctx: &RequestContext,
        body: &[u8],
    ) -> problems::Result<Event> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let mut event: Event = parse_json(body)?;
        if event.id != EventId::default() {
            return Err(Code::EventIdAlreadySet.into());
        }
        if !event.visibility.is_set() {
            event.visibility = Visibility::PUBLIC;
        }
        validate(&event)?;
        let now = Utc::now();
        let event = Event {
            id: state
                .flake
                .next_event_id(ns.app_id)
                .map_err(Problems::server_error)?,
            user_id: me.id,
            enabled: true,
            created_at: now,
            updated_at: now,
            ..event
        };
        state
            .dispatcher
            .dispatch(Mutation::EventCreate(EventWithIds::new(ns, event.clone())))
            .await
            .map_err(dispatch_failure)?;
        debug!("User {} posted event {}", me.id, event.id);
        Ok(event)
    }

    match create1(&state, &ctx, &body).await.and_then(|e| {
        present(&e).map(|v| (v, e.id, e.updated_at))
    }) {
        Ok((event, id, stamp)) => {
            counter_add!(state.instruments, "events.created", 1, &[]);
            let mut rsp = pipeline::respond(&ctx, StatusCode::CREATED, &event, Some(stamp));
            if let Ok(location) = HeaderValue::from_str(&state.event_location(id)) {
                rsp.headers_mut().insert(header::LOCATION, location);
            }
            rsp
        }
        Err(problems) => failure(&state, "create", problems),
    }
}

async fn read(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(event_id): Path<String>,
) -> Response {
    async fn read1(
        state: &Tidings,
        ctx: &RequestContext,
        event_id: &str,
    ) -> problems::Result<(serde_json::Value, DateTime<Utc>)> {
        let event = own_event(&state.store, ctx.namespace()?, ctx.user()?.id, event_id).await?;
        Ok((present(&event)?, event.updated_at))
    }

    match read1(&state, &ctx, &event_id).await {
        Ok((event, stamp)) => pipeline::respond(&ctx, StatusCode::OK, &event, Some(stamp)),
        Err(problems) => problems.into_response(),
    }
}

/// Fields of an [Event] that belong to the server
const SERVER_OWNED: &[&str] = &[
    "id",
    "id_string",
    "user_id",
    "user_id_string",
    "enabled",
    "created_at",
    "updated_at",
];

/// Apply the partial update `body` to `existing`; whatever `body` doesn't mention is kept
fn patched(existing: &Event, body: &[u8], now: DateTime<Utc>) -> problems::Result<Event> {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Claimed {
        id: EventId,
    }

    let claimed: Claimed = parse_json(body)?;
    if claimed.id != EventId::default() && claimed.id != existing.id {
        return Err(Code::EventIdAlreadySet.into());
    }
    let event: Event = pipeline::overlay(existing, body, SERVER_OWNED)?;
    validate(&event)?;
    Ok(Event {
        updated_at: now,
        ..event
    })
}

async fn update(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(event_id): Path<String>,
    body: Bytes,
) -> Response {
    async fn update1(
        state: &Tidings,
        ctx: &RequestContext,
        event_id: &str,
        body: &[u8],
    ) -> problems::Result<Event> {
        let ns = ctx.namespace()?;
        let existing = own_event(&state.store, ns, ctx.user()?.id, event_id).await?;
        let event = patched(&existing, body, Utc::now())?;
        state
            .dispatcher
            .dispatch(Mutation::EventUpdate(EventWithIds::new(ns, event.clone())))
            .await
            .map_err(dispatch_failure)?;
        Ok(event)
    }

    match update1(&state, &ctx, &event_id, &body)
        .await
        .and_then(|e| present(&e).map(|v| (v, e.updated_at)))
    {
        Ok((event, stamp)) => pipeline::respond(&ctx, StatusCode::CREATED, &event, Some(stamp)),
        Err(problems) => failure(&state, "update", problems),
    }
}

async fn delete(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(event_id): Path<String>,
) -> Response {
    async fn delete1(state: &Tidings, ctx: &RequestContext, event_id: &str) -> problems::Result<()> {
        let ns = ctx.namespace()?;
        let event = own_event(&state.store, ns, ctx.user()?.id, event_id).await?;
        state
            .dispatcher
            .dispatch(Mutation::EventDelete(EventKey {
                org_id: ns.org_id,
                app_id: ns.app_id,
                user_id: event.user_id,
                event_id: event.id,
            }))
            .await
            .map_err(dispatch_failure)
    }

    match delete1(&state, &ctx, &event_id).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => failure(&state, "delete", problems),
    }
}

/// The current user's own events
async fn list_mine(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn list_mine1(state: &Tidings, ctx: &RequestContext) -> problems::Result<Response> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?.id;
        let events = feed::list(&state.store, ns, me, me).await?;
        event_list(&state.store, ctx, events, None).await
    }

    list_mine1(&state, &ctx)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

/// Another user's events, as the current user is entitled to see them
async fn list(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
) -> Response {
    async fn list1(
        state: &Tidings,
        ctx: &RequestContext,
        user_id: &str,
    ) -> problems::Result<Response> {
        let ns = ctx.namespace()?;
        let author = parse_user_id(user_id)?;
        let found = state
            .store
            .app_user(ns, author)
            .await
            .map_err(storage_failure)?;
        http::found(found, Code::UserNotFound)?;
        let events = feed::list(&state.store, ns, author, ctx.user()?.id).await?;
        event_list(&state.store, ctx, events, None).await
    }

    list1(&state, &ctx, &user_id)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

/// The current user's feed; reading it advances their last-read mark
async fn user_feed(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn user_feed1(state: &Tidings, ctx: &RequestContext) -> problems::Result<Response> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let feed = feed::user_feed(&state.store, ns, me).await?;
        state.last_read.mark(ns, me.id, Utc::now());
        event_list(&state.store, ctx, feed.events, Some(feed.unread_count)).await
    }

    counter_add!(
        state.instruments,
        "feeds.served",
        1,
        &[KeyValue::new("feed", "all")]
    );
    user_feed1(&state, &ctx)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

async fn unread_feed(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn unread_feed1(state: &Tidings, ctx: &RequestContext) -> problems::Result<Response> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let feed = feed::unread_feed(&state.store, ns, me).await?;
        state.last_read.mark(ns, me.id, Utc::now());
        event_list(&state.store, ctx, feed.events, Some(feed.unread_count)).await
    }

    counter_add!(
        state.instruments,
        "feeds.served",
        1,
        &[KeyValue::new("feed", "unread")]
    );
    unread_feed1(&state, &ctx)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

#[derive(Serialize)]
struct UnreadCount {
    unread_events_count: usize,
}

async fn unread_feed_count(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn unread_feed_count1(
        state: &Tidings,
        ctx: &RequestContext,
    ) -> problems::Result<UnreadCount> {
        let count = feed::unread_feed_count(&state.store, ctx.namespace()?, ctx.user()?).await?;
        Ok(UnreadCount {
            unread_events_count: count,
        })
    }

    match unread_feed_count1(&state, &ctx).await {
        Ok(count) => pipeline::respond_now(&ctx, StatusCode::OK, &count),
        Err(problems) => problems.into_response(),
    }
}

/// The event searches supported by `GET /events`
#[derive(Clone, Debug, PartialEq)]
enum Search {
    Geo(GeoQuery),
    Location(String),
    Object(String),
}

fn parse_float(text: &str) -> problems::Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|err| Problem::internal(Code::FloatParse, err).into())
}

impl Search {
    /// Parse a search from a query string; coordinates take precedence over a location, which
    /// takes precedence over an object id
    fn parse(query: &str) -> problems::Result<Search> {
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect::<BTreeMap<String, String>>();
        let param = |name: &str| params.get(name).map(String::as_str).filter(|s| !s.is_empty());
        match (param("lat"), param("lon")) {
            (Some(lat), Some(lon)) => {
                let latitude = parse_float(lat)?;
                let longitude = parse_float(lon)?;
                let radius = param("rad").map(parse_float).transpose()?;
                let nearest = param("nearest")
                    .map(|n| {
                        n.trim()
                            .parse::<i64>()
                            .map_err(|err| Problems::from(Problem::internal(Code::FloatParse, err)))
                    })
                    .transpose()?;
                Ok(Search::Geo(GeoQuery::new(
                    latitude, longitude, radius, nearest,
                )?))
            }
            (Some(_), None) | (None, Some(_)) => Err(Code::FloatParse.into()),
            (None, None) => match (param("location"), param("object")) {
                (Some(location), _) => Ok(Search::Location(location.to_owned())),
                (None, Some(object)) => Ok(Search::Object(object.to_owned())),
                (None, None) => Err(Code::SearchTermsMissing.into()),
            },
        }
    }
}

async fn search(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    RawQuery(query): RawQuery,
) -> Response {
    async fn search1(
        state: &Tidings,
        ctx: &RequestContext,
        query: Option<String>,
    ) -> problems::Result<Response> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let events = match Search::parse(query.as_deref().unwrap_or_default())? {
            Search::Geo(query) => feed::geo_search(&state.store, ns, me, query).await?,
            Search::Location(location) => {
                feed::location_search(&state.store, ns, me, &location).await?
            }
            Search::Object(object) => feed::object_search(&state.store, ns, me, &object).await?,
        };
        event_list(&state.store, ctx, events, None).await
    }

    search1(&state, &ctx, query)
        .await
        .unwrap_or_else(|problems| problems.into_response())
}

/// Return a router for the Event API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let user = Router::new()
        .route("/me/events", get(list_mine).post(create))
        .route(
            "/me/events/{eventID}",
            get(read).put(update).delete(delete),
        )
        .route("/users/{userID}/events", get(list))
        .route("/me/feed", get(user_feed))
        .route("/me/feed/unread", get(unread_feed))
        .route("/me/feed/unread/count", get(unread_feed_count))
        .route("/events", get(search));
    Router::new()
        .merge(http::guard(user, &state, Guard::ApplicationUser))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_validation() {
        let mut event = Event {
            kind: "like".to_owned(),
            visibility: Visibility::PUBLIC,
            ..Default::default()
        };
        assert!(validate(&event).is_ok());
        event.kind = String::new();
        event.visibility = Visibility::new(25);
        assert_eq!(
            validate(&event).unwrap_err().codes(),
            vec![Code::EventTypeSize, Code::EventVisibilityInvalid]
        );
        event.kind = "x".repeat(31);
        event.visibility = Visibility::GLOBAL;
        assert_eq!(
            validate(&event).unwrap_err().codes(),
            vec![Code::EventTypeSize]
        );
    }

    #[test]
    fn searches() {
        assert_eq!(
            Search::parse("lat=52.5172&lon=13.3048&nearest=2").unwrap(),
            Search::Geo(GeoQuery::Nearest {
                latitude: 52.5172,
                longitude: 13.3048,
                count: 2
            })
        );
        assert_eq!(
            Search::parse("lat=52.5&lon=13.3&rad=1.5").unwrap_err().codes(),
            vec![Code::GeoRadiusTooSmall]
        );
        assert_eq!(
            Search::parse("lat=fifty&lon=13.3&rad=100").unwrap_err().codes(),
            vec![Code::FloatParse]
        );
        assert_eq!(
            Search::parse("lat=52.5&lon=13.3").unwrap_err().codes(),
            vec![Code::GeoRadiusOrNearestMissing]
        );
        assert_eq!(
            Search::parse("location=berlin").unwrap(),
            Search::Location("berlin".to_owned())
        );
        assert_eq!(
            Search::parse("object=ticket%2F42").unwrap(),
            Search::Object("ticket/42".to_owned())
        );
        assert_eq!(
            Search::parse("").unwrap_err().codes(),
            vec![Code::SearchTermsMissing]
        );
    }

    #[test]
    fn updates_are_partial() {
        let created = Utc::now() - chrono::Duration::hours(1);
        let existing = Event {
            id: EventId::new(7),
            user_id: UserId::new(100),
            kind: "checkin".to_owned(),
            location: Some("berlin".to_owned()),
            latitude: Some(52.52),
            longitude: Some(13.40),
            visibility: Visibility::new(20),
            object: Some(entities::Object {
                id: "42".to_owned(),
                kind: "venue".to_owned(),
                ..Default::default()
            }),
            metadata: Some(serde_json::json!({"rating": 5})),
            enabled: true,
            created_at: created,
            updated_at: created,
            ..Default::default()
        };
        let now = Utc::now();
        let event = patched(
            &existing,
            br#"{"type": "love", "user_id": 999, "created_at": "2001-01-01T00:00:00Z"}"#,
            now,
        )
        .unwrap();
        assert_eq!(event.kind, "love");
        assert_eq!(event.location.as_deref(), Some("berlin"));
        assert_eq!(event.coordinates(), Some((52.52, 13.40)));
        assert_eq!(event.visibility, Visibility::new(20));
        assert_eq!(event.object, existing.object);
        assert_eq!(event.metadata, existing.metadata);
        assert_eq!(event.user_id, UserId::new(100));
        assert_eq!(event.created_at, created);
        assert_eq!(event.updated_at, now);

        // Explicit nulls clear optional fields
        let event = patched(&existing, br#"{"location": null}"#, now).unwrap();
        assert_eq!(event.location, None);
        assert_eq!(event.object, existing.object);

        assert_eq!(
            patched(&existing, br#"{"id": 8}"#, now).unwrap_err().codes(),
            vec![Code::EventIdAlreadySet]
        );
        assert_eq!(
            patched(&existing, br#"{"visibility": 15}"#, now).unwrap_err().codes(),
            vec![Code::EventVisibilityInvalid]
        );
    }

    #[test]
    fn event_ids() {
        assert_eq!(parse_event_id("42").unwrap(), EventId::new(42));
        assert_eq!(
            parse_event_id("forty-two").unwrap_err().codes(),
            vec![Code::EventIdInvalid]
        );
    }
}
