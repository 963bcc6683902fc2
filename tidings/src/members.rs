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

//! # The Member API
//!
//! Members are the humans who administer an organization. They authenticate with their
//! organization's token as the Basic user & a member session token as the password; they get
//! that session token by logging in (the one unauthenticated route here) or on creation.
//!
//! Members carry at most one session at a time, on the member record itself, so login, refresh &
//! logout write the store directly. Create, update & delete travel through the [dispatcher].
//!
//! [dispatcher]: crate::dispatcher

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete as delete_route, get, post},
    Extension, Router,
};
use chrono::Utc;
use opentelemetry::KeyValue;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    counter_add,
    dispatcher::{MemberKey, MemberRecord, Mutation},
    entities::{self, Image, Member, MemberId, PublicId},
    http::{self, dispatch_failure, storage_failure, Guard},
    metrics::{self, Sort},
    organizations::{authorized_organization, check_body_id},
    password,
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problem, Problems},
    storage::{Record, Store},
    tidings::Tidings,
    tokens,
};

inventory::submit! { metrics::Registration::new("members.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("members.logins", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("members.failures", Sort::IntegralCounter) }

/// The member fields a caller may set
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MemberRequest {
    pub id: Option<String>,
    pub user_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub images: Option<BTreeMap<String, Image>>,
}

/// Credentials for logging in, by email or by username (but not both)
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub user_name: String,
    pub password: String,
}

/// Which account a [LoginRequest] names
#[derive(Clone, Debug, PartialEq)]
pub enum LoginName<'a> {
    Email(&'a str),
    Username(&'a str),
}

impl LoginRequest {
    pub fn name(&self) -> problems::Result<LoginName<'_>> {
        let mut problems = Problems::new();
        let name = match (self.email.is_empty(), self.user_name.is_empty()) {
            (false, false) => {
                problems.push(Code::AuthUsernameAndEmailGiven);
                None
            }
            (true, true) => {
                problems.push(Code::AuthUsernameAndEmailMissing);
                None
            }
            (false, true) => {
                problems.check(entities::is_valid_email(&self.email), Code::AuthEmailInvalid);
                Some(LoginName::Email(&self.email))
            }
            (true, false) => Some(LoginName::Username(&self.user_name)),
        };
        problems.check(!self.password.is_empty(), Code::AuthPasswordEmpty);
        problems.into_result()?;
        name.ok_or_else(|| Code::AuthGeneric.into())
    }
}

/// The body of a session refresh: the session being replaced
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionRequest {
    pub session_token: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionResponse {
    pub session_token: String,
}

/// A member, along with the credentials they need to make further requests
#[derive(Clone, Debug, Serialize)]
struct Credentialed {
    #[serde(flatten)]
    member: Member,
    account_token: String,
    session_token: String,
}

fn validate(member: &Member, password: Option<&str>) -> problems::Result<()> {
    let mut problems = Problems::new();
    problems.check(
        entities::within(&member.user_name, 2, 40),
        Code::MemberUsernameSize,
    );
    problems.check(
        entities::within(&member.first_name, 2, 40),
        Code::MemberFirstNameSize,
    );
    problems.check(
        entities::within(&member.last_name, 2, 40),
        Code::MemberLastNameSize,
    );
    problems.check(entities::is_valid_email(&member.email), Code::MemberEmailInvalid);
    if let Some(password) = password {
        problems.check(entities::within(password, 4, 60), Code::MemberPasswordSize);
    }
    problems.into_result()
}

/// Check that `member`'s email & username aren't already taken by someone else in its organization
async fn check_unique(store: &Store, member: &Member) -> problems::Result<()> {
    let mut problems = Problems::new();
    if let Some(other) = store
        .member_by_email(member.org_id, &member.email)
        .await
        .map_err(storage_failure)?
    {
        problems.check(other.id == member.id, Code::MemberEmailInUse);
    }
    if let Some(other) = store
        .member_by_username(member.org_id, &member.user_name)
        .await
        .map_err(storage_failure)?
    {
        problems.check(other.id == member.id, Code::MemberUsernameInUse);
    }
    problems.into_result()
}

async fn hash(state: &Tidings, password: String) -> problems::Result<String> {
    password::hash_async(state.password, SecretString::from(password))
        .await
        .map_err(Problems::server_error)
}

fn parse_member_id(text: &str) -> problems::Result<PublicId> {
    PublicId::from_raw_string(text)
        .map_err(|err| Problem::internal(Code::MemberNotFound, err).into())
}

/// The member in the path, provided it's the member making the request
fn authorized_member<'a>(
    ctx: &'a RequestContext,
    org_id: &str,
    member_id: &str,
) -> problems::Result<&'a Member> {
    authorized_organization(ctx, org_id)?;
    let me = ctx.member()?;
    if parse_member_id(member_id)? != me.public_id {
        return Err(Code::MemberMismatch.into());
    }
    Ok(me)
}

async fn create(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(org_id): Path<String>,
    body: Bytes,
) -> Response {
    async fn create1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        body: &[u8],
    ) -> problems::Result<Credentialed> {
        let org = authorized_organization(ctx, org_id)?;
        let req: MemberRequest = parse_json(body)?;
        let id = MemberId::new(state.flake.next_id().map_err(Problems::server_error)?);
        let now = Utc::now();
        let session_token = tokens::session_token();
        let mut member = Member {
            id,
            org_id: org.id,
            public_id: PublicId::derive("member", id.as_u64()),
            user_name: req.user_name.unwrap_or_default(),
            first_name: req.first_name.unwrap_or_default(),
            last_name: req.last_name.unwrap_or_default(),
            email: req.email.unwrap_or_default(),
            password: None,
            session_token: Some(session_token.clone()),
            last_login: None,
            enabled: true,
            images: req.images,
            created_at: now,
            updated_at: now,
        };
        let password = req.password.unwrap_or_default();
        validate(&member, Some(&password))?;
        check_unique(&state.store, &member).await?;
        member.password = Some(hash(state, password).await?);
        state
            .dispatcher
            .dispatch(Mutation::MemberCreate(MemberRecord {
                org_id: org.id,
                member_id: id,
                member: member.clone(),
            }))
            .await
            .map_err(dispatch_failure)?;
        Ok(Credentialed {
            member: member.sanitized(),
            account_token: org.auth_token.clone(),
            session_token,
        })
    }

    match create1(&state, &ctx, &org_id, &body).await {
        Ok(rsp) => {
            info!("Created member {}", rsp.member.public_id);
            counter_add!(state.instruments, "members.created", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &rsp, Some(rsp.member.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "members.failures",
                1,
                &[KeyValue::new("op", "create")]
            );
            problems.into_response()
        }
    }
}

#[derive(Serialize)]
struct MemberList {
    members: Vec<Member>,
}

async fn list(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(org_id): Path<String>,
) -> Response {
    async fn list1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
    ) -> problems::Result<Vec<Member>> {
        let org = authorized_organization(ctx, org_id)?;
        Ok(state
            .store
            .members(org.id)
            .await
            .map_err(storage_failure)?
            .into_iter()
            .map(Member::sanitized)
            .collect())
    }

    match list1(&state, &ctx, &org_id).await {
        Ok(members) if members.is_empty() => http::no_content(&ctx),
        Ok(members) => {
            let stamps = members.iter().map(|m| m.updated_at).collect::<Vec<_>>();
            pipeline::respond(&ctx, StatusCode::OK, &MemberList { members }, stamps)
        }
        Err(problems) => problems.into_response(),
    }
}

async fn read(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, member_id)): Path<(String, String)>,
) -> Response {
    async fn read1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        member_id: &str,
    ) -> problems::Result<Member> {
        let org = authorized_organization(ctx, org_id)?;
        let member = state
            .store
            .member_by_public_id(org.id, parse_member_id(member_id)?)
            .await
            .map_err(storage_failure)?;
        http::found(member, Code::MemberNotFound).map(Member::sanitized)
    }

    match read1(&state, &ctx, &org_id, &member_id).await {
        Ok(member) => pipeline::respond(&ctx, StatusCode::OK, &member, Some(member.updated_at)),
        Err(problems) => problems.into_response(),
    }
}

async fn update(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, member_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    async fn update1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        member_id: &str,
        body: &[u8],
    ) -> problems::Result<Member> {
        let mut member = authorized_member(ctx, org_id, member_id)?.clone();
        let req: MemberRequest = parse_json(body)?;
        check_body_id(req.id.as_deref(), member.public_id, Code::MemberMismatch)?;
        if let Some(user_name) = req.user_name {
            member.user_name = user_name;
        }
        if let Some(first_name) = req.first_name {
            member.first_name = first_name;
        }
        if let Some(last_name) = req.last_name {
            member.last_name = last_name;
        }
        if let Some(email) = req.email {
            member.email = email;
        }
        if req.images.is_some() {
            member.images = req.images;
        }
        validate(&member, req.password.as_deref())?;
        check_unique(&state.store, &member).await?;
        if let Some(password) = req.password {
            member.password = Some(hash(state, password).await?);
        }
        member.updated_at = Utc::now();
        state
            .dispatcher
            .dispatch(Mutation::MemberUpdate(MemberRecord {
                org_id: member.org_id,
                member_id: member.id,
                member: member.clone(),
            }))
            .await
            .map_err(dispatch_failure)?;
        Ok(member.sanitized())
    }

    match update1(&state, &ctx, &org_id, &member_id, &body).await {
        Ok(member) => {
            pipeline::respond(&ctx, StatusCode::CREATED, &member, Some(member.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "members.failures",
                1,
                &[KeyValue::new("op", "update")]
            );
            problems.into_response()
        }
    }
}

async fn delete(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, member_id)): Path<(String, String)>,
) -> Response {
    async fn delete1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        member_id: &str,
    ) -> problems::Result<()> {
        let org = authorized_organization(ctx, org_id)?;
        let member = state
            .store
            .member_by_public_id(org.id, parse_member_id(member_id)?)
            .await
            .map_err(storage_failure)?;
        let member = http::found(member, Code::MemberNotFound)?;
        state
            .dispatcher
            .dispatch(Mutation::MemberDelete(MemberKey {
                org_id: org.id,
                member_id: member.id,
            }))
            .await
            .map_err(dispatch_failure)
    }

    match delete1(&state, &ctx, &org_id, &member_id).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => problems.into_response(),
    }
}

async fn login(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn login1(state: &Tidings, body: &[u8]) -> problems::Result<Credentialed> {
        let req: LoginRequest = parse_json(body)?;
        let member = match req.name()? {
            LoginName::Email(email) => state.store.member_login_by_email(email).await,
            LoginName::Username(name) => state.store.member_login_by_username(name).await,
        }
        .map_err(storage_failure)?;
        let mut member = http::found(member, Code::MemberNotFound)?;
        let org = state
            .store
            .organization(member.org_id)
            .await
            .map_err(storage_failure)?;
        let org = http::found(org, Code::OrgNotFound)?;
        let stored = member.password.clone().unwrap_or_default();
        let ok = password::verify_async(state.password, SecretString::from(req.password), stored)
            .await
            .map_err(|err| Problem::internal(Code::AuthPasswordMismatch, err))?;
        if !ok {
            return Err(Code::AuthPasswordMismatch.into());
        }
        let session_token = tokens::session_token();
        let now = Utc::now();
        member.session_token = Some(session_token.clone());
        member.last_login = Some(now);
        member.updated_at = now;
        state
            .store
            .put(Record::Member(member.clone()))
            .await
            .map_err(storage_failure)?;
        debug!("Member {} logged in", member.public_id);
        Ok(Credentialed {
            member: member.sanitized(),
            account_token: org.auth_token,
            session_token,
        })
    }

    match login1(&state, &body).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "members.logins", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &rsp, Some(rsp.member.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "members.failures",
                1,
                &[KeyValue::new("op", "login")]
            );
            problems.into_response()
        }
    }
}

async fn refresh(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, member_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    async fn refresh1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        member_id: &str,
        body: &[u8],
    ) -> problems::Result<SessionResponse> {
        let mut member = authorized_member(ctx, org_id, member_id)?.clone();
        let req: SessionRequest = parse_json(body)?;
        if ctx.session_token.as_deref() != Some(req.session_token.as_str()) {
            return Err(Code::AuthSessionTokenMismatch.into());
        }
        let session_token = tokens::session_token();
        member.session_token = Some(session_token.clone());
        member.updated_at = Utc::now();
        state
            .store
            .put(Record::Member(member))
            .await
            .map_err(storage_failure)?;
        Ok(SessionResponse { session_token })
    }

    match refresh1(&state, &ctx, &org_id, &member_id, &body).await {
        Ok(rsp) => pipeline::respond_now(&ctx, StatusCode::CREATED, &rsp),
        Err(problems) => problems.into_response(),
    }
}

async fn logout(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, member_id)): Path<(String, String)>,
) -> Response {
    async fn logout1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        member_id: &str,
    ) -> problems::Result<()> {
        let mut member = authorized_member(ctx, org_id, member_id)?.clone();
        member.session_token = None;
        member.updated_at = Utc::now();
        state
            .store
            .put(Record::Member(member))
            .await
            .map_err(storage_failure)
    }

    match logout1(&state, &ctx, &org_id, &member_id).await {
        Ok(()) => http::no_content(&ctx),
        Err(problems) => problems.into_response(),
    }
}

/// Return a router for the Member API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let open = Router::new().route("/organizations/members/login", post(login));
    let organization = Router::new().route("/organizations/{orgID}/members", post(create));
    let member = Router::new()
        .route("/organizations/{orgID}/members", get(list))
        .route(
            "/organizations/{orgID}/members/{memberID}",
            get(read).put(update).delete(delete),
        )
        .route(
            "/organizations/{orgID}/members/{memberID}/refresh",
            post(refresh),
        )
        .route(
            "/organizations/{orgID}/members/{memberID}/logout",
            delete_route(logout),
        );
    Router::new()
        .merge(http::guard(open, &state, Guard::Open))
        .merge(http::guard(organization, &state, Guard::Organization))
        .merge(http::guard(member, &state, Guard::Member))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn login_names() {
        let req = LoginRequest {
            email: "d@example.com".to_owned(),
            password: "p4ssword!".to_owned(),
            ..Default::default()
        };
        assert_eq!(req.name().unwrap(), LoginName::Email("d@example.com"));
        let req = LoginRequest {
            email: "d@example.com".to_owned(),
            user_name: "dlsniper".to_owned(),
            password: String::new(),
        };
        assert_eq!(
            req.name().unwrap_err().codes(),
            vec![Code::AuthUsernameAndEmailGiven, Code::AuthPasswordEmpty]
        );
        let req = LoginRequest {
            password: "x".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            req.name().unwrap_err().codes(),
            vec![Code::AuthUsernameAndEmailMissing]
        );
    }

    #[test]
    fn validation() {
        let member = Member {
            user_name: "a".to_owned(),
            first_name: "Ann".to_owned(),
            last_name: "Lee".to_owned(),
            email: "not-an-email".to_owned(),
            ..Default::default()
        };
        assert_eq!(
            validate(&member, Some("abc")).unwrap_err().codes(),
            vec![
                Code::MemberUsernameSize,
                Code::MemberEmailInvalid,
                Code::MemberPasswordSize
            ]
        );
    }
}
