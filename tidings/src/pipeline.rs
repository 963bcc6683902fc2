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

//! # The request pipeline
//!
//! Every API request passes through a fixed series of [middleware] before it reaches its handler:
//!
//! 1. [deadline]: starts the clock on the request & bounds its duration
//! 2. [populate_application]: resolves the application (or backend) token in the Basic
//!    credentials; alternatively [populate_organization] for the organization API
//! 3. [populate_application_user]: resolves the session token (or, under a backend token, the user
//!    id) in the Basic credentials, for routes that act on behalf of a user; alternatively
//!    [populate_member]
//! 4. [rate_limit]: charges the request against its application's quota
//! 5. [validate]: request hygiene (`User-Agent`, & for writes `Content-Type`, `Content-Length` &
//!    the body itself)
//!
//! Each stage records what it learned in the [RequestContext], which rides along in the request's
//! extensions; handlers pick it up with the [Extension] extractor. Any stage may short-circuit the
//! request with an error envelope.
//!
//! [middleware]: https://docs.rs/axum/latest/axum/middleware/index.html
//! [Extension]: axum::Extension

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{
        header::{self, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT},
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use opentelemetry::KeyValue;
use serde::Serialize;
use snafu::prelude::*;
use tap::Pipe;
use tracing::{debug, error, info};

use crate::{
    counter_add,
    entities::{AppUser, Application, Member, Namespace, Organization},
    identity_cache::TokenKind,
    metrics::{self, Sort},
    problems::{self, Code, Problem, Problems},
    tidings::Tidings,
    tokens::{APPLICATION_TOKEN_LEN, BACKEND_TOKEN_LEN},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Basic credentials weren't valid base64: {source}"))]
    Base64 { source: base64::DecodeError },
    #[snafu(display("The Authorization header value wasn't valid text: {source}"))]
    HeaderText { source: header::ToStrError },
    #[snafu(display("More than one Authorization header was given"))]
    MultipleHeaders,
    #[snafu(display("Basic credentials didn't contain a ':'"))]
    NoColon,
    #[snafu(display("No Authorization header was given"))]
    NoHeader,
    #[snafu(display("Authorization scheme {scheme} isn't supported"))]
    Scheme { scheme: String },
    #[snafu(display("Basic credentials weren't valid UTF-8: {source}"))]
    Utf8 { source: std::string::FromUtf8Error },
}

type Result<T> = std::result::Result<T, Error>;

/// The largest request body we'll accept, in bytes
pub const MAX_BODY_LEN: usize = 2048;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Request context                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The kind of credential with which a request was made
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenType {
    Application,
    Backend,
    Organization,
}

impl From<TokenKind> for TokenType {
    fn from(kind: TokenKind) -> Self {
        match kind {
            TokenKind::Application => TokenType::Application,
            TokenKind::Backend => TokenType::Backend,
        }
    }
}

/// The state of an application's quota, as of this request
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimit {
    pub limit: u64,
    pub remaining: u64,
    pub reset: DateTime<Utc>,
}

impl RateLimit {
    fn stamp(&self, headers: &mut HeaderMap) {
        [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset.timestamp().to_string()),
        ]
        .into_iter()
        .for_each(|(name, value)| {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        });
    }
}

/// Everything the pipeline has learned about a request
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub started: DateTime<Utc>,
    pub organization: Option<Arc<Organization>>,
    pub member: Option<Member>,
    pub application: Option<Arc<Application>>,
    pub token_type: Option<TokenType>,
    pub user: Option<AppUser>,
    pub session_token: Option<String>,
    pub limits: Option<RateLimit>,
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext::new(Utc::now())
    }
}

impl RequestContext {
    pub fn new(started: DateTime<Utc>) -> RequestContext {
        RequestContext {
            started,
            organization: None,
            member: None,
            application: None,
            token_type: None,
            user: None,
            session_token: None,
            limits: None,
        }
    }
    fn of(request: &Request) -> RequestContext {
        request
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default()
    }
    // Reaching any of these without the corresponding middleware in place is a routing bug, hence
    // the internal errors.
    pub fn organization(&self) -> problems::Result<&Organization> {
        self.organization
            .as_deref()
            .ok_or_else(|| Problem::internal(Code::InvalidHandler, "no organization").into())
    }
    pub fn member(&self) -> problems::Result<&Member> {
        self.member
            .as_ref()
            .ok_or_else(|| Problem::internal(Code::InvalidHandler, "no member").into())
    }
    pub fn application(&self) -> problems::Result<&Application> {
        self.application
            .as_deref()
            .ok_or_else(|| Problem::internal(Code::InvalidHandler, "no application").into())
    }
    pub fn namespace(&self) -> problems::Result<Namespace> {
        Ok(self.application()?.namespace())
    }
    pub fn user(&self) -> problems::Result<&AppUser> {
        self.user
            .as_ref()
            .ok_or_else(|| Problem::internal(Code::InvalidHandler, "no application user").into())
    }
    /// The timestamp to send as `Last-Modified` for a response carrying entities last updated at
    /// `stamps`
    pub fn last_modified(&self, stamps: impl IntoIterator<Item = DateTime<Utc>>) -> DateTime<Utc> {
        stamps.into_iter().max().unwrap_or(self.started)
    }
}

/// Format `instant` per RFC 1123
pub fn http_date(instant: DateTime<Utc>) -> String {
    instant.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Render `body` with `status`, stamping `Last-Modified` from `stamps` (or, if there are none, the
/// start of the request)
pub fn respond<T: Serialize>(
    ctx: &RequestContext,
    status: StatusCode,
    body: &T,
    stamps: impl IntoIterator<Item = DateTime<Utc>>,
) -> Response {
    let mut rsp = (status, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&http_date(ctx.last_modified(stamps))) {
        rsp.headers_mut().insert(header::LAST_MODIFIED, value);
    }
    rsp
}

/// Render `body` with `status`, stamping `Last-Modified` with the start of the request
pub fn respond_now<T: Serialize>(ctx: &RequestContext, status: StatusCode, body: &T) -> Response {
    respond(ctx, status, body, Vec::<DateTime<Utc>>::new())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Credentials                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// HTTP Basic credentials
///
/// Every tidings credential travels this way: the "user" is an application, backend or
/// organization token & the "password" a session token (or, under a backend token, a user id).
/// The password may be empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    /// Parse the payload of a Basic Authorization header: base64(user ":" password)
    pub fn from_basic(payload: &str) -> Result<Credentials> {
        let (user, password) = BASE64_STANDARD
            .decode(payload)
            .context(Base64Snafu)?
            .pipe(String::from_utf8)
            .context(Utf8Snafu)?
            .split_once(':')
            .map(|(user, password)| (user.to_owned(), password.to_owned()))
            .context(NoColonSnafu)?;
        Ok(Credentials { user, password })
    }
    /// Pull credentials from the (single) Authorization header in `headers`
    pub fn from_headers(headers: &HeaderMap) -> Result<Credentials> {
        match headers
            .get_all(AUTHORIZATION)
            .into_iter()
            .at_most_one()
            .map_err(|_| Error::MultipleHeaders)?
        {
            Some(value) => Credentials::try_from(value),
            None => NoHeaderSnafu.fail(),
        }
    }
}

impl TryFrom<&HeaderValue> for Credentials {
    type Error = Error;

    fn try_from(value: &HeaderValue) -> Result<Self> {
        let text = value.to_str().context(HeaderTextSnafu)?;
        let mut parts = text.split_ascii_whitespace();
        match (parts.next(), parts.next()) {
            (Some(scheme), Some(payload)) if scheme.eq_ignore_ascii_case("basic") => {
                Credentials::from_basic(payload)
            }
            (Some(scheme), _) => SchemeSnafu { scheme }.fail(),
            (None, _) => NoHeaderSnafu.fail(),
        }
    }
}

/// Map a failure to parse credentials onto the problem reported for it
fn credential_problem(err: Error, code: Code) -> Problems {
    match err {
        Error::Scheme { .. } => Problem::internal(Code::AuthMethodUnsupported, err).into(),
        err => Problem::internal(code, err).into(),
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Middleware                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("auth.successes", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("auth.failures", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("rate_limit.rejections", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("requests.rejected", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("requests.timeouts", Sort::IntegralCounter) }

/// Run `authenticate` against `request`; on success, install the updated context & carry on
async fn run_stage<'a, F, Fut>(
    state: &'a Tidings,
    stage: &'static str,
    mut request: Request,
    next: Next,
    authenticate: F,
) -> Response
where
    F: FnOnce(&'a Tidings, HeaderMap, RequestContext) -> Fut,
    Fut: std::future::Future<Output = problems::Result<RequestContext>>,
{
    let ctx = RequestContext::of(&request);
    match authenticate(state, request.headers().clone(), ctx).await {
        Ok(ctx) => {
            counter_add!(
                state.instruments,
                "auth.successes",
                1,
                &[KeyValue::new("stage", stage)]
            );
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(problems) => {
            info!("{} rejected a request: {}", stage, problems);
            counter_add!(
                state.instruments,
                "auth.failures",
                1,
                &[KeyValue::new("stage", stage)]
            );
            problems.into_response()
        }
    }
}

/// Start the clock on a request & fail it should it run past the configured timeout
pub async fn deadline(
    State(state): State<Arc<Tidings>>,
    mut request: Request,
    next: Next,
) -> Response {
    request.extensions_mut().insert(RequestContext::default());
    match tokio::time::timeout(state.request_timeout, next.run(request)).await {
        Ok(rsp) => rsp,
        Err(elapsed) => {
            counter_add!(state.instruments, "requests.timeouts", 1, &[]);
            Problems::server_error(format!("request timed out: {}", elapsed)).into_response()
        }
    }
}

/// Resolve the application named by the Basic credentials
///
/// Application tokens are 32 characters & backend tokens 44; anything else can't be either.
pub async fn populate_application(
    State(state): State<Arc<Tidings>>,
    request: Request,
    next: Next,
) -> Response {
    async fn populate_application1(
        state: &Tidings,
        headers: HeaderMap,
        mut ctx: RequestContext,
    ) -> problems::Result<RequestContext> {
        let creds = Credentials::from_headers(&headers)
            .map_err(|err| credential_problem(err, Code::AuthInvalidAppCredentials))?;
        let kind = match creds.user.len() {
            APPLICATION_TOKEN_LEN => TokenKind::Application,
            BACKEND_TOKEN_LEN => TokenKind::Backend,
            n => {
                return Err(Problem::internal(
                    Code::AuthInvalidAppCredentials,
                    format!("unexpected token length {}", n),
                )
                .into())
            }
        };
        let app = state
            .cache
            .lookup(kind, &creds.user)
            .await
            .map_err(Problems::server_error)?
            .ok_or(Code::AuthInvalidAppCredentials)?;
        debug!("Request for application {}", app.public_id);
        ctx.application = Some(app);
        ctx.token_type = Some(kind.into());
        Ok(ctx)
    }

    run_stage(
        &state,
        "application",
        request,
        next,
        populate_application1,
    )
    .await
}

/// Resolve the application user on whose behalf the request is being made
///
/// Under an application token, the password is a session token; under a backend token, it's the
/// user's (decimal) id.
pub async fn populate_application_user(
    State(state): State<Arc<Tidings>>,
    request: Request,
    next: Next,
) -> Response {
    async fn populate_application_user1(
        state: &Tidings,
        headers: HeaderMap,
        mut ctx: RequestContext,
    ) -> problems::Result<RequestContext> {
        let ns = ctx.namespace()?;
        let creds = Credentials::from_headers(&headers)
            .map_err(|err| credential_problem(err, Code::AuthInvalidUserCredentials))?;
        match ctx.token_type {
            Some(TokenType::Application) => {
                if creds.password.is_empty() {
                    return Err(Code::AuthSessionMissing.into());
                }
                let session = state
                    .store
                    .session(ns, &creds.password)
                    .await
                    .map_err(Problems::server_error)?
                    .ok_or(Code::AuthInvalidUserCredentials)?;
                let user = state
                    .store
                    .app_user(ns, session.user_id)
                    .await
                    .map_err(Problems::server_error)?
                    .ok_or(Code::AuthInvalidUserCredentials)?;
                ctx.user = Some(user);
                ctx.session_token = Some(creds.password);
            }
            Some(TokenType::Backend) => {
                let id = creds
                    .password
                    .parse()
                    .map_err(|err| Problem::internal(Code::UserIdInvalid, err))?;
                let user = state
                    .store
                    .app_user(ns, id)
                    .await
                    .map_err(Problems::server_error)?
                    .ok_or(Code::UserNotFound)?;
                ctx.user = Some(user);
            }
            other => {
                return Err(Problems::server_error(format!(
                    "unexpected token type {:?}",
                    other
                )))
            }
        }
        Ok(ctx)
    }

    run_stage(
        &state,
        "application-user",
        request,
        next,
        populate_application_user1,
    )
    .await
}

/// Resolve the organization whose token is given as the Basic user
pub async fn populate_organization(
    State(state): State<Arc<Tidings>>,
    request: Request,
    next: Next,
) -> Response {
    async fn populate_organization1(
        state: &Tidings,
        headers: HeaderMap,
        mut ctx: RequestContext,
    ) -> problems::Result<RequestContext> {
        let creds = Credentials::from_headers(&headers)
            .map_err(|err| credential_problem(err, Code::AuthInvalidOrgCredentials))?;
        let org = state
            .store
            .organization_by_token(&creds.user)
            .await
            .map_err(Problems::server_error)?
            .ok_or(Code::AuthInvalidOrgCredentials)?;
        ctx.organization = Some(Arc::new(org));
        ctx.token_type = Some(TokenType::Organization);
        Ok(ctx)
    }

    run_stage(
        &state,
        "organization",
        request,
        next,
        populate_organization1,
    )
    .await
}

/// Resolve the member whose session token is given as the Basic password
pub async fn populate_member(
    State(state): State<Arc<Tidings>>,
    request: Request,
    next: Next,
) -> Response {
    async fn populate_member1(
        state: &Tidings,
        headers: HeaderMap,
        mut ctx: RequestContext,
    ) -> problems::Result<RequestContext> {
        let org = ctx.organization()?.id;
        let creds = Credentials::from_headers(&headers)
            .map_err(|err| credential_problem(err, Code::AuthInvalidMemberCredentials))?;
        if creds.password.is_empty() {
            return Err(Code::AuthSessionMissing.into());
        }
        let member = state
            .store
            .member_by_session(org, &creds.password)
            .await
            .map_err(Problems::server_error)?
            .ok_or(Code::AuthInvalidMemberCredentials)?;
        ctx.member = Some(member);
        ctx.session_token = Some(creds.password);
        Ok(ctx)
    }

    run_stage(&state, "member", request, next, populate_member1).await
}

/// Charge this request against its application's quota
///
/// Every response carries the `X-RateLimit-*` headers. Should the limiter itself fail, the request
/// fails with it: we never let traffic through unmetered.
pub async fn rate_limit(
    State(state): State<Arc<Tidings>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::of(&request);
    let app = match ctx.application.clone() {
        Some(app) => app,
        None => return Problems::server_error("rate limiting with no application").into_response(),
    };
    let limit = state.limits.for_application(&app);
    let grant = match state
        .limiter
        .request(&app.token, limit, state.limits.window)
        .await
    {
        Ok(grant) => grant,
        Err(err) => {
            error!("The rate limiter failed: {}", err);
            return Problems::server_error(err).into_response();
        }
    };
    let limits = RateLimit {
        limit,
        remaining: grant.remaining,
        reset: grant.refresh_at,
    };
    if !grant.granted {
        info!("Application {} is over its quota", app.public_id);
        counter_add!(state.instruments, "rate_limit.rejections", 1, &[]);
        let mut rsp = Problems::from(Code::RateLimitExceeded).into_response();
        limits.stamp(rsp.headers_mut());
        return rsp;
    }
    ctx.limits = Some(limits);
    request.extensions_mut().insert(ctx);
    let mut rsp = next.run(request).await;
    limits.stamp(rsp.headers_mut());
    rsp
}

fn is_json(content_type: &HeaderValue) -> bool {
    content_type
        .to_str()
        .map(|text| {
            text.eq_ignore_ascii_case("application/json")
                || text.eq_ignore_ascii_case("application/json; charset=UTF-8")
        })
        .unwrap_or(false)
}

/// Check the headers describing a request body, then read it; `None` means the body wasn't read
async fn check_body(headers: &HeaderMap, body: Body, problems: &mut Problems) -> Option<Body> {
    match headers.get(CONTENT_TYPE) {
        Some(content_type) => problems.check(is_json(content_type), Code::ContentTypeMismatch),
        None => problems.push(Code::ContentTypeMissing),
    }
    let declared = match headers.get(CONTENT_LENGTH) {
        Some(value) => match value.to_str().ok().and_then(|s| s.parse::<usize>().ok()) {
            Some(n) => Some(n),
            None => {
                problems.push(Code::ContentLengthInvalid);
                None
            }
        },
        None => {
            problems.push(Code::ContentLengthMissing);
            None
        }
    };
    if declared.map(|n| n > MAX_BODY_LEN).unwrap_or(false) {
        problems.push(Code::PayloadTooLarge);
        return None;
    }
    match axum::body::to_bytes(body, MAX_BODY_LEN).await {
        Ok(bytes) => {
            if let Some(n) = declared {
                problems.check(n == bytes.len(), Code::ContentLengthMismatch);
            }
            problems.check(!bytes.is_empty(), Code::EmptyBody);
            Some(Body::from(bytes))
        }
        Err(err) => {
            problems.push_internal(Code::PayloadTooLarge, err);
            None
        }
    }
}

/// Request hygiene
///
/// Every request must carry a `User-Agent`; writes must also carry a JSON body of at most
/// [MAX_BODY_LEN] bytes, correctly described by their `Content-Type` & `Content-Length` headers.
/// Every problem found is reported, not just the first.
pub async fn validate(
    State(state): State<Arc<Tidings>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let mut problems = Problems::new();
    problems.check(
        parts
            .headers
            .get(USER_AGENT)
            .map(|ua| !ua.is_empty())
            .unwrap_or(false),
        Code::UserAgentInvalid,
    );
    let body = if parts.method == Method::POST || parts.method == Method::PUT {
        check_body(&parts.headers, body, &mut problems).await
    } else {
        Some(body)
    };
    match (problems.is_empty(), body) {
        (true, Some(body)) => {
            if parts.extensions.get::<RequestContext>().is_none() {
                parts.extensions.insert(RequestContext::default());
            }
            next.run(Request::from_parts(parts, body)).await
        }
        _ => {
            counter_add!(state.instruments, "requests.rejected", 1, &[]);
            problems.into_response()
        }
    }
}

/// Parse a JSON request body, reporting failure as a "bad JSON" problem
pub fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> problems::Result<T> {
    serde_json::from_slice(body).map_err(|err| Problem::internal(Code::BadJson, err).into())
}

/// Overlay the JSON object `body` on `base`, as a partial update
///
/// Keys in `reserved` are dropped from `body` first: those fields are the server's to set, and
/// keep whatever value `base` had. Every field `body` doesn't mention is likewise untouched.
pub fn overlay<T>(base: &T, body: &[u8], reserved: &[&str]) -> problems::Result<T>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    let patch: serde_json::Value = parse_json(body)?;
    let mut merged = serde_json::to_value(base).map_err(Problems::server_error)?;
    match (&mut merged, patch) {
        (serde_json::Value::Object(fields), serde_json::Value::Object(mut patch)) => {
            patch.retain(|key, _| !reserved.contains(&key.as_str()));
            fields.extend(patch);
        }
        _ => return Err(Code::BadJson.into()),
    }
    serde_json::from_value(merged).map_err(|err| Problem::internal(Code::BadJson, err).into())
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::{middleware::from_fn_with_state, routing::get, Extension, Router};
    use chrono::Utc;
    use tower::ServiceExt;

    use crate::{
        entities::{AppId, OrgId, PublicId, Session, UserId},
        metrics::Instruments,
        rate_limit::Limits,
        storage::Record,
        tidings::{Config, Service},
    };

    const APP_TOKEN: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SESSION: &str = "ssssssssssssssssssssssssssssssssssssssss";

    fn basic(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{}:{}", user, password))
        )
    }

    async fn service(staging: u64) -> Service {
        let config = Config {
            rate_limits: Limits {
                staging,
                ..Default::default()
            },
            ..Default::default()
        };
        let service = Service::new(&config, Arc::new(Instruments::new("tidings")))
            .await
            .unwrap();
        let state = service.state();
        let app = Application {
            id: AppId::new(2),
            org_id: OrgId::new(1),
            public_id: PublicId::derive("app", 2),
            name: "test".to_owned(),
            token: APP_TOKEN.to_owned(),
            backend_token: "b".repeat(BACKEND_TOKEN_LEN),
            enabled: true,
            ..Default::default()
        };
        let ns = app.namespace();
        let now = Utc::now();
        state
            .store
            .put_all(&[
                Record::Application(app),
                Record::AppUser(
                    ns,
                    AppUser {
                        id: UserId::new(100),
                        user_name: "alice".to_owned(),
                        activated: true,
                        enabled: true,
                        created_at: now,
                        updated_at: now,
                        ..Default::default()
                    },
                ),
                Record::Session(
                    ns,
                    Session {
                        user_id: UserId::new(100),
                        session_token: SESSION.to_owned(),
                        enabled: true,
                        created_at: now,
                        updated_at: now,
                    },
                ),
            ])
            .await
            .unwrap();
        service
    }

    async fn whoami(Extension(ctx): Extension<RequestContext>) -> String {
        ctx.user().map(|u| u.user_name.clone()).unwrap_or_default()
    }

    fn router(state: Arc<Tidings>) -> Router {
        Router::new()
            .route("/me", get(whoami).post(whoami))
            .route_layer(from_fn_with_state(state.clone(), validate))
            .route_layer(from_fn_with_state(state.clone(), rate_limit))
            .route_layer(from_fn_with_state(state.clone(), populate_application_user))
            .route_layer(from_fn_with_state(state.clone(), populate_application))
            .with_state(state)
    }

    fn get_me(authorization: &str) -> Request {
        Request::builder()
            .uri("/me")
            .header(USER_AGENT, "pipeline-test")
            .header(AUTHORIZATION, authorization)
            .body(Body::empty())
            .unwrap()
    }

    async fn codes(rsp: Response) -> Vec<u16> {
        use http_body_util::BodyExt;
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice::<problems::Envelope>(&body)
            .unwrap()
            .errors
            .into_iter()
            .map(|e| e.code)
            .collect()
    }

    #[test]
    fn basic_credentials() {
        let creds = Credentials::try_from(
            &HeaderValue::from_str(&basic(APP_TOKEN, SESSION)).unwrap(),
        )
        .unwrap();
        assert_eq!(creds.user, APP_TOKEN);
        assert_eq!(creds.password, SESSION);
        let creds = Credentials::from_basic(&BASE64_STANDARD.encode("token:")).unwrap();
        assert!(creds.password.is_empty());
        assert!(matches!(
            Credentials::try_from(&HeaderValue::from_static("Bearer xyz")),
            Err(Error::Scheme { .. })
        ));
        assert!(matches!(
            Credentials::from_basic(&BASE64_STANDARD.encode("no-colon")),
            Err(Error::NoColon)
        ));
        assert!(matches!(
            Credentials::from_headers(&HeaderMap::new()),
            Err(Error::NoHeader)
        ));
    }

    #[tokio::test]
    async fn authentication() {
        let service = service(100).await;
        let app = router(service.state());

        let rsp = app
            .clone()
            .oneshot(get_me(&basic(APP_TOKEN, SESSION)))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        assert_eq!(
            rsp.headers().get("x-ratelimit-limit").unwrap(),
            &HeaderValue::from_static("100")
        );
        assert_eq!(
            rsp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("99")
        );

        let rsp = app
            .clone()
            .oneshot(get_me(&basic(&"b".repeat(BACKEND_TOKEN_LEN), "100")))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);

        let rsp = app
            .clone()
            .oneshot(get_me(&basic(APP_TOKEN, "")))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(codes(rsp).await, vec![4013]);

        let rsp = app
            .clone()
            .oneshot(get_me(&basic(&"x".repeat(APPLICATION_TOKEN_LEN), SESSION)))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(codes(rsp).await, vec![4006]);

        let rsp = app.oneshot(get_me("Bearer abc")).await.unwrap();
        assert_eq!(codes(rsp).await, vec![4009]);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn over_quota() {
        let service = service(2).await;
        let app = router(service.state());
        for _ in 0..2 {
            let rsp = app
                .clone()
                .oneshot(get_me(&basic(APP_TOKEN, SESSION)))
                .await
                .unwrap();
            assert_eq!(rsp.status(), StatusCode::OK);
        }
        let rsp = app
            .oneshot(get_me(&basic(APP_TOKEN, SESSION)))
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            rsp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("0")
        );
        assert_eq!(codes(rsp).await, vec![5013]);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn hygiene() {
        let service = service(100).await;
        let app = router(service.state());

        // No User-Agent, no Content-Type, no body
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/me")
                    .header(AUTHORIZATION, basic(APP_TOKEN, SESSION))
                    .header(CONTENT_LENGTH, "0")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(codes(rsp).await, vec![5002, 5007, 5012]);

        let big = "x".repeat(MAX_BODY_LEN + 1);
        let rsp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/me")
                    .header(USER_AGENT, "pipeline-test")
                    .header(AUTHORIZATION, basic(APP_TOKEN, SESSION))
                    .header(CONTENT_TYPE, "application/json")
                    .header(CONTENT_LENGTH, big.len().to_string())
                    .body(Body::from(big))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let rsp = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/me")
                    .header(USER_AGENT, "pipeline-test")
                    .header(AUTHORIZATION, basic(APP_TOKEN, SESSION))
                    .header(CONTENT_TYPE, "application/json; charset=UTF-8")
                    .header(CONTENT_LENGTH, "2")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        service.shutdown().await.unwrap();
    }

    #[test]
    fn last_modified_falls_back_to_the_start() {
        let ctx = RequestContext::default();
        assert_eq!(ctx.last_modified(Vec::<DateTime<Utc>>::new()), ctx.started);
        let later = ctx.started + chrono::Duration::seconds(5);
        assert_eq!(ctx.last_modified(vec![ctx.started, later]), later);
        assert!(http_date(later).ends_with(" GMT"));
    }
}
