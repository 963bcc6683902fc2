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

//! # The Application User API
//!
//! Application users are an application's end users. Signup & login are synchronous (the caller
//! needs an id & a session token in the response), as are session refresh & logout; updates &
//! deletes travel through the [dispatcher].
//!
//! Signing up with an email or username that's already taken is treated as a login attempt with
//! the same credentials.
//!
//! [dispatcher]: crate::dispatcher

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete as delete_route, get, post},
    Extension, Router,
};
use chrono::Utc;
use opentelemetry::KeyValue;
use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    counter_add,
    dispatcher::{AppUserKey, AppUserRecord, Mutation},
    entities::{self, AppUser, Namespace, Relation, Session, UserId},
    graph::{self, PAGE_LIMIT},
    http::{self, dispatch_failure, present, storage_failure, Guard},
    members::{SessionRequest, SessionResponse},
    metrics::{self, Sort},
    password,
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problem, Problems},
    storage::{Key, Record, Store, UserFilter},
    tidings::Tidings,
    tokens,
};

inventory::submit! { metrics::Registration::new("users.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("users.logins", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("users.failures", Sort::IntegralCounter) }

/// The minimum length of a user search term
pub const MIN_SEARCH_LEN: usize = 3;

/// Credentials for logging in; unlike members, application users may give both an email & a
/// username, in which case the email is tried first
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub user_name: String,
    pub password: String,
}

impl LoginRequest {
    fn check(&self) -> problems::Result<()> {
        let mut problems = Problems::new();
        problems.check(
            !(self.email.is_empty() && self.user_name.is_empty()),
            Code::AuthUsernameAndEmailMissing,
        );
        problems.check(!self.password.is_empty(), Code::AuthPasswordEmpty);
        problems.into_result()
    }
}

/// Field-level validation; `password` is the plaintext, when one's been supplied
fn validate(user: &AppUser, password: Option<&str>) -> problems::Result<()> {
    let mut problems = Problems::new();
    let within_or_empty = |text: &str| text.is_empty() || entities::within(text, 2, 40);
    problems.check(within_or_empty(&user.first_name), Code::UserFirstNameSize);
    problems.check(within_or_empty(&user.last_name), Code::UserLastNameSize);
    problems.check(within_or_empty(&user.user_name), Code::UserUsernameSize);
    problems.check(
        !(user.user_name.is_empty() && user.email.is_empty()),
        Code::UserUsernameAndEmailMissing,
    );
    if let Some(password) = password {
        problems.check(!password.is_empty(), Code::AuthPasswordEmpty);
    }
    problems.check(
        user.email.is_empty() || entities::is_valid_email(&user.email),
        Code::UserEmailInvalid,
    );
    if let Some(url) = &user.url {
        problems.check(entities::is_valid_url(url), Code::UserUrlInvalid);
    }
    problems.into_result()
}

/// Check that nobody else in `ns` is using `user`'s email or username
async fn check_unique(store: &Store, ns: Namespace, user: &AppUser) -> problems::Result<()> {
    let mut problems = Problems::new();
    if !user.email.is_empty() {
        if let Some(other) = store
            .app_user_by_email(ns, &user.email)
            .await
            .map_err(storage_failure)?
        {
            problems.check(other.id == user.id, Code::UserEmailInUse);
        }
    }
    if !user.user_name.is_empty() {
        if let Some(other) = store
            .app_user_by_username(ns, &user.user_name)
            .await
            .map_err(storage_failure)?
        {
            problems.check(other.id == user.id, Code::UserUsernameInUse);
        }
    }
    problems.into_result()
}

fn new_session(user: UserId) -> Session {
    let now = Utc::now();
    Session {
        user_id: user,
        session_token: tokens::session_token(),
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

/// `user` as they see themselves: no password, but their counts & current session
async fn own_profile(
    store: &Store,
    ns: Namespace,
    user: AppUser,
    session_token: Option<String>,
) -> problems::Result<AppUser> {
    let mut user = graph::with_counts(store, ns, user.sanitized().without_derived()).await?;
    user.session_token = session_token;
    Ok(user)
}

/// Parse a decimal user id out of a path
pub fn parse_user_id(text: &str) -> problems::Result<UserId> {
    UserId::from_raw_string(text).map_err(|err| Problem::internal(Code::UserIdInvalid, err).into())
}

/// Annotate `other` (as seen by `viewer`) with their relation to `viewer`
fn with_relation(mut other: AppUser, rel: Relation) -> AppUser {
    other.is_friend = Some(rel.is_friend);
    other.is_follower = Some(rel.is_follower);
    other.is_followed = Some(rel.is_followed);
    other
}

async fn login_user(state: &Tidings, ns: Namespace, req: LoginRequest) -> problems::Result<AppUser> {
    req.check()?;
    let mut user = None;
    if !req.email.is_empty() {
        user = state
            .store
            .app_user_by_email(ns, &req.email)
            .await
            .map_err(storage_failure)?;
    }
    if user.is_none() && !req.user_name.is_empty() {
        user = state
            .store
            .app_user_by_username(ns, &req.user_name)
            .await
            .map_err(storage_failure)?;
    }
    let mut user = http::found(user, Code::UserNotFound)?;
    let stored = user.password.clone().unwrap_or_default();
    let ok = password::verify_async(state.password, SecretString::from(req.password), stored)
        .await
        .map_err(|err| Problem::internal(Code::AuthPasswordMismatch, err))?;
    if !ok {
        return Err(Code::AuthPasswordMismatch.into());
    }
    let session = new_session(user.id);
    let now = Utc::now();
    user.last_login = Some(now);
    user.updated_at = now;
    state
        .store
        .put_all(&[
            Record::AppUser(ns, user.clone().without_derived()),
            Record::Session(ns, session.clone()),
        ])
        .await
        .map_err(storage_failure)?;
    debug!("User {} logged in", user.id);
    own_profile(&state.store, ns, user, Some(session.session_token)).await
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
    ) -> problems::Result<AppUser> {
        let app = ctx.application()?;
        let ns = app.namespace();
        let mut user: AppUser = parse_json(body)?;
        let password = user.password.take().unwrap_or_default();
        validate(&user, Some(&password))?;
        if let Err(problems) = check_unique(&state.store, ns, &user).await {
            return match problems.codes().first() {
                Some(Code::UserEmailInUse) | Some(Code::UserUsernameInUse) => {
                    debug!("Signup for an existing user; attempting a login");
                    login_user(state, ns, parse_json(body)?).await
                }
                _ => Err(problems),
            };
        }
        let now = Utc::now();
        let user = AppUser {
            id: state
                .flake
                .next_user_id(app.id)
                .map_err(Problems::server_error)?,
            password: Some(
                password::hash_async(state.password, SecretString::from(password))
                    .await
                    .map_err(Problems::server_error)?,
            ),
            session_token: None,
            activated: true,
            deleted: Some(false),
            enabled: true,
            last_login: Some(now),
            last_read: None,
            created_at: now,
            updated_at: now,
            ..user.without_derived()
        };
        let session = new_session(user.id);
        state
            .store
            .put_all(&[
                Record::AppUser(ns, user.clone()),
                Record::Session(ns, session.clone()),
            ])
            .await
            .map_err(storage_failure)?;
        info!("Created user {} in {}", user.id, ns);
        own_profile(&state.store, ns, user, Some(session.session_token)).await
    }

    match create1(&state, &ctx, &body).await.and_then(|u| {
        let stamp = u.updated_at;
        present(&u).map(|v| (v, stamp))
    }) {
        Ok((user, stamp)) => {
            counter_add!(state.instruments, "users.created", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &user, Some(stamp))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "users.failures",
                1,
                &[KeyValue::new("op", "create")]
            );
            problems.into_response()
        }
    }
}

async fn login(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn login1(
        state: &Tidings,
        ctx: &RequestContext,
        body: &[u8],
    ) -> problems::Result<serde_json::Value> {
        let user = login_user(state, ctx.namespace()?, parse_json(body)?).await?;
        present(&user)
    }

    match login1(&state, &ctx, &body).await {
        Ok(user) => {
            counter_add!(state.instruments, "users.logins", 1, &[]);
            pipeline::respond_now(&ctx, StatusCode::CREATED, &user)
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "users.failures",
                1,
                &[KeyValue::new("op", "login")]
            );
            problems.into_response()
        }
    }
}

async fn read_current(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn read_current1(
        state: &Tidings,
        ctx: &RequestContext,
    ) -> problems::Result<(serde_json::Value, chrono::DateTime<Utc>)> {
        let user = own_profile(&state.store, ctx.namespace()?, ctx.user()?.clone(), None).await?;
        Ok((present(&user)?, user.updated_at))
    }

    match read_current1(&state, &ctx).await {
        Ok((user, stamp)) => pipeline::respond(&ctx, StatusCode::OK, &user, Some(stamp)),
        Err(problems) => problems.into_response(),
    }
}

/// Fields of an [AppUser] that no client may set through `PUT /me`
const SERVER_OWNED: &[&str] = &[
    "id",
    "id_string",
    "session_token",
    "activated",
    "deleted",
    "enabled",
    "last_login",
    "last_read",
    "created_at",
    "updated_at",
    "friend_count",
    "follower_count",
    "followed_count",
    "is_friend",
    "is_follower",
    "is_followed",
];

/// Apply the partial update `body` to `user`
///
/// A new password, if one was given, comes back in plaintext; hashing it is up to the caller.
fn merge(user: &AppUser, body: &[u8]) -> problems::Result<AppUser> {
    let merged = pipeline::overlay(user, body, SERVER_OWNED)?;
    Ok(AppUser {
        session_token: None,
        ..merged.without_derived()
    })
}

async fn update_current(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn update_current1(
        state: &Tidings,
        ctx: &RequestContext,
        body: &[u8],
    ) -> problems::Result<(serde_json::Value, chrono::DateTime<Utc>)> {
        let ns = ctx.namespace()?;
        let current = ctx.user()?;
        let mut user = merge(current, body)?;
        // Only a password that differs from the stored hash is a new one
        let new_password = user.password.take().filter(|p| Some(p) != current.password.as_ref());
        validate(&user, new_password.as_deref())?;
        check_unique(&state.store, ns, &user).await?;
        user.password = match new_password {
            Some(password) => Some(
                password::hash_async(state.password, SecretString::from(password))
                    .await
                    .map_err(Problems::server_error)?,
            ),
            None => current.password.clone(),
        };
        user.updated_at = Utc::now();
        state
            .dispatcher
            .dispatch(Mutation::AppUserUpdate(AppUserRecord::new(ns, user.clone())))
            .await
            .map_err(dispatch_failure)?;
        let user = own_profile(&state.store, ns, user, None).await?;
        Ok((present(&user)?, user.updated_at))
    }

    match update_current1(&state, &ctx, &body).await {
        Ok((user, stamp)) => pipeline::respond(&ctx, StatusCode::CREATED, &user, Some(stamp)),
        Err(problems) => {
            counter_add!(
                state.instruments,
                "users.failures",
                1,
                &[KeyValue::new("op", "update")]
            );
            problems.into_response()
        }
    }
}

async fn delete_current(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn delete_current1(state: &Tidings, ctx: &RequestContext) -> problems::Result<()> {
        let ns = ctx.namespace()?;
        state
            .dispatcher
            .dispatch(Mutation::AppUserDelete(AppUserKey {
                org_id: ns.org_id,
                app_id: ns.app_id,
                user_id: ctx.user()?.id,
            }))
            .await
            .map_err(dispatch_failure)
    }

    match delete_current1(&state, &ctx).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => problems.into_response(),
    }
}

async fn read(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(user_id): Path<String>,
) -> Response {
    async fn read1(
        state: &Tidings,
        ctx: &RequestContext,
        user_id: &str,
    ) -> problems::Result<(serde_json::Value, chrono::DateTime<Utc>)> {
        let ns = ctx.namespace()?;
        let me = ctx.user()?;
        let id = parse_user_id(user_id)?;
        let user = state
            .store
            .app_user(ns, id)
            .await
            .map_err(storage_failure)?;
        let user = http::found(user, Code::UserNotFound)?;
        let stamp = user.updated_at;
        let rel = graph::relation(&state.store, ns, me.id, id).await?;
        let mut user = graph::with_counts(&state.store, ns, user.public_profile()).await?;
        user.deleted = None;
        Ok((present(&with_relation(user, rel))?, stamp))
    }

    match read1(&state, &ctx, &user_id).await {
        Ok((user, stamp)) => pipeline::respond(&ctx, StatusCode::OK, &user, Some(stamp)),
        Err(problems) => problems.into_response(),
    }
}

#[derive(Serialize)]
struct UserList {
    users: Vec<serde_json::Value>,
    users_count: usize,
}

/// Present `users` (as seen by `viewer`) in the customary `{"users": ..., "users_count": ...}`
/// envelope, or answer "204 No Content" if there aren't any
pub async fn user_list(
    store: &Store,
    ctx: &RequestContext,
    viewer: UserId,
    users: Vec<AppUser>,
) -> problems::Result<Response> {
    if users.is_empty() {
        return Ok(http::no_content(ctx));
    }
    let ns = ctx.namespace()?;
    let stamps = users.iter().map(|u| u.updated_at).collect::<Vec<_>>();
    let mut presented = Vec::with_capacity(users.len());
    for user in users.into_iter().take(PAGE_LIMIT) {
        let rel = graph::relation(store, ns, viewer, user.id).await?;
        presented.push(present(&with_relation(user.public_profile(), rel))?);
    }
    Ok(pipeline::respond(
        ctx,
        StatusCode::OK,
        &UserList {
            users_count: presented.len(),
            users: presented,
        },
        stamps,
    ))
}

/// User search
///
/// Either a free-text term `q` (at least three characters, matched against usernames, emails &
/// names), or a set of `socialid`s on `social_platform`, or a set of `email`s.
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
        let me = ctx.user()?.id;
        let params = url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .into_owned()
            .collect::<Vec<(String, String)>>();
        let all = |name: &str| {
            params
                .iter()
                .filter(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .collect::<Vec<String>>()
        };
        let term = all("q").into_iter().next().unwrap_or_default();
        let social_ids = all("socialid");
        let platform = all("social_platform").into_iter().next();
        let emails = all("email");
        let users = if !term.is_empty() {
            if term.chars().count() < MIN_SEARCH_LEN {
                return Err(Code::UserSearchTermTooShort.into());
            }
            state
                .store
                .app_users(ns, UserFilter::Search(term), PAGE_LIMIT)
                .await
                .map_err(storage_failure)?
        } else if let (Some(platform), false) = (platform, social_ids.is_empty()) {
            state
                .store
                .app_users(
                    ns,
                    UserFilter::Social {
                        platform,
                        ids: social_ids,
                    },
                    PAGE_LIMIT,
                )
                .await
                .map_err(storage_failure)?
        } else if !emails.is_empty() {
            let mut found = Vec::new();
            for email in emails.iter().take(PAGE_LIMIT) {
                if let Some(user) = state
                    .store
                    .app_user_by_email(ns, email)
                    .await
                    .map_err(storage_failure)?
                {
                    found.push(user);
                }
            }
            found
        } else {
            return Err(Code::SearchTermsMissing.into());
        };
        let users = users.into_iter().filter(|u| u.id != me).collect();
        user_list(&state.store, ctx, me, users).await
    }

    match search1(&state, &ctx, query).await {
        Ok(rsp) => rsp,
        Err(problems) => problems.into_response(),
    }
}

async fn refresh(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn refresh1(
        state: &Tidings,
        ctx: &RequestContext,
        body: &[u8],
    ) -> problems::Result<SessionResponse> {
        let ns = ctx.namespace()?;
        let req: SessionRequest = parse_json(body)?;
        let current = match &ctx.session_token {
            Some(token) if *token == req.session_token => token,
            _ => return Err(Code::AuthSessionTokenMismatch.into()),
        };
        let old = state
            .store
            .session(ns, current)
            .await
            .map_err(storage_failure)?;
        let mut old = http::found(old, Code::AuthSessionTokenMismatch)?;
        let session = new_session(ctx.user()?.id);
        old.enabled = false;
        old.updated_at = session.created_at;
        // The old session is revoked in the same write that creates the new one
        state
            .store
            .put_all(&[
                Record::Session(ns, old),
                Record::Session(ns, session.clone()),
            ])
            .await
            .map_err(storage_failure)?;
        Ok(SessionResponse {
            session_token: session.session_token,
        })
    }

    match refresh1(&state, &ctx, &body).await {
        Ok(rsp) => pipeline::respond_now(&ctx, StatusCode::CREATED, &rsp),
        Err(problems) => problems.into_response(),
    }
}

async fn logout(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    async fn logout1(state: &Tidings, ctx: &RequestContext) -> problems::Result<()> {
        let ns = ctx.namespace()?;
        match &ctx.session_token {
            Some(token) => state
                .store
                .delete(Key::Session(ns, token.clone()))
                .await
                .map_err(storage_failure),
            None => Err(Code::AuthSessionMissing.into()),
        }
    }

    match logout1(&state, &ctx).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => problems.into_response(),
    }
}

/// Return a router for the Application User API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let application = Router::new()
        .route("/users", post(create))
        .route("/users/login", post(login))
        .route("/me/login", post(login));
    let user = Router::new()
        .route(
            "/me",
            get(read_current).put(update_current).delete(delete_current),
        )
        .route("/me/refresh", post(refresh))
        .route("/me/logout", delete_route(logout))
        .route("/users/search", get(search))
        .route("/users/{userID}", get(read));
    Router::new()
        .merge(http::guard(application, &state, Guard::Application))
        .merge(http::guard(user, &state, Guard::ApplicationUser))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    #[test]
    fn validation() {
        let user = AppUser {
            first_name: "A".to_owned(),
            email: "nope".to_owned(),
            url: Some("::".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            validate(&user, Some("")).unwrap_err().codes(),
            vec![
                Code::UserFirstNameSize,
                Code::AuthPasswordEmpty,
                Code::UserEmailInvalid,
                Code::UserUrlInvalid
            ]
        );
        let user = AppUser::default();
        assert_eq!(
            validate(&user, None).unwrap_err().codes(),
            vec![Code::UserUsernameAndEmailMissing]
        );
        let user = AppUser {
            user_name: "dlsniper".to_owned(),
            email: "d@example.com".to_owned(),
            ..Default::default()
        };
        assert!(validate(&user, Some("p4ssword!")).is_ok());
    }

    #[test]
    fn merging_protects_server_fields() {
        let created = Utc::now() - Duration::days(3);
        let user = AppUser {
            id: UserId::new(100),
            user_name: "alice".to_owned(),
            first_name: "Alice".to_owned(),
            password: Some("hash".to_owned()),
            enabled: true,
            deleted: Some(false),
            created_at: created,
            updated_at: created,
            ..Default::default()
        };
        let merged = merge(
            &user,
            br#"{"id": 5, "first_name": "Alicia", "enabled": false, "activated": true,
                 "deleted": true, "last_read": "2020-01-01T00:00:00Z", "friend_count": 9}"#,
        )
        .unwrap();
        assert_eq!(merged.id, UserId::new(100));
        assert_eq!(merged.first_name, "Alicia");
        assert_eq!(merged.user_name, "alice");
        assert!(merged.enabled);
        assert!(!merged.activated);
        assert_eq!(merged.deleted, Some(false));
        assert_eq!(merged.last_read, None);
        assert_eq!(merged.friend_count, None);
        assert_eq!(merged.created_at, created);
        // The stored hash round-trips, & so isn't taken for a new password
        assert_eq!(merged.password.as_deref(), Some("hash"));
        assert!(merge(&user, b"[1, 2]").is_err());
    }

    #[test]
    fn user_ids() {
        assert_eq!(parse_user_id("200").unwrap(), UserId::new(200));
        assert_eq!(
            parse_user_id("two hundred").unwrap_err().codes(),
            vec![Code::UserIdInvalid]
        );
    }
}
