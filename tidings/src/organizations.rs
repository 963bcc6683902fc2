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

//! # The Organization API
//!
//! Organizations are the top-level tenants. Creating one is the only unauthenticated write in the
//! API: it's synchronous, since the caller needs the authentication token it mints. Everything
//! else here authenticates with that token & goes through the [dispatcher].
//!
//! [dispatcher]: crate::dispatcher

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Deserialize;
use tracing::info;

use crate::{
    counter_add,
    dispatcher::{Mutation, OrganizationKey, OrganizationRecord},
    entities::{self, Image, OrgId, Organization, PublicId},
    http::{self, dispatch_failure, storage_failure, Guard},
    metrics::{self, Sort},
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problems},
    storage::Record,
    tidings::Tidings,
    tokens,
};

inventory::submit! { metrics::Registration::new("organizations.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("organizations.updated", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("organizations.deleted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("organizations.failures", Sort::IntegralCounter) }

/// The organization fields a caller may set
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OrganizationRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub images: Option<BTreeMap<String, Image>>,
    pub metadata: Option<serde_json::Value>,
}

fn validate(org: &Organization) -> problems::Result<()> {
    let mut problems = Problems::new();
    problems.check(entities::within(&org.name, 3, 40), Code::OrgNameSize);
    problems.check(
        entities::within(&org.description, 0, 100),
        Code::OrgDescriptionSize,
    );
    problems.into_result()
}

/// Check that the organization named in the path is the one whose credentials were presented
pub fn authorized_organization<'a>(
    ctx: &'a RequestContext,
    org_id: &str,
) -> problems::Result<&'a Organization> {
    let org = ctx.organization()?;
    match PublicId::from_raw_string(org_id) {
        Ok(id) if id == org.public_id => Ok(org),
        Ok(_) => Err(Code::AuthInvalidOrgCredentials.into()),
        Err(_) => Err(Code::OrgNotFound.into()),
    }
}

/// Check a public id given in a request body against the one in the path
pub fn check_body_id(body_id: Option<&str>, expected: PublicId, code: Code) -> problems::Result<()> {
    match body_id {
        Some(id) if PublicId::from_raw_string(id).ok() != Some(expected) => Err(code.into()),
        _ => Ok(()),
    }
}

async fn create(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    async fn create1(state: &Tidings, body: &[u8]) -> problems::Result<Organization> {
        let req: OrganizationRequest = parse_json(body)?;
        let id = OrgId::new(state.flake.next_id().map_err(Problems::server_error)?);
        let now = Utc::now();
        let org = Organization {
            id,
            public_id: PublicId::derive("org", id.as_u64()),
            name: req.name.unwrap_or_default(),
            description: req.description.unwrap_or_default(),
            auth_token: tokens::organization_token(),
            enabled: true,
            images: req.images,
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        validate(&org)?;
        state
            .store
            .put(Record::Organization(org.clone()))
            .await
            .map_err(storage_failure)?;
        Ok(org)
    }

    match create1(&state, &body).await {
        Ok(org) => {
            info!("Created organization {} ({})", org.name, org.public_id);
            counter_add!(state.instruments, "organizations.created", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &org, Some(org.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "organizations.failures",
                1,
                &[KeyValue::new("op", "create")]
            );
            problems.into_response()
        }
    }
}

async fn read(
    Extension(ctx): Extension<RequestContext>,
    Path(org_id): Path<String>,
) -> Response {
    match authorized_organization(&ctx, &org_id) {
        Ok(org) => pipeline::respond(&ctx, StatusCode::OK, org, Some(org.updated_at)),
        Err(problems) => problems.into_response(),
    }
}

async fn update(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path(org_id): Path<String>,
    body: Bytes,
) -> Response {
    async fn update1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        body: &[u8],
    ) -> problems::Result<Organization> {
        let mut org = authorized_organization(ctx, org_id)?.clone();
        let req: OrganizationRequest = parse_json(body)?;
        check_body_id(req.id.as_deref(), org.public_id, Code::OrgMismatch)?;
        if let Some(name) = req.name {
            org.name = name;
        }
        if let Some(description) = req.description {
            org.description = description;
        }
        if req.images.is_some() {
            org.images = req.images;
        }
        if req.metadata.is_some() {
            org.metadata = req.metadata;
        }
        validate(&org)?;
        org.updated_at = Utc::now();
        state
            .dispatcher
            .dispatch(Mutation::OrgUpdate(OrganizationRecord {
                org_id: org.id,
                organization: org.clone(),
            }))
            .await
            .map_err(dispatch_failure)?;
        Ok(org)
    }

    match update1(&state, &ctx, &org_id, &body).await {
        Ok(org) => {
            counter_add!(state.instruments, "organizations.updated", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &org, Some(org.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "organizations.failures",
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
    Path(org_id): Path<String>,
) -> Response {
    async fn delete1(state: &Tidings, ctx: &RequestContext, org_id: &str) -> problems::Result<()> {
        let org = authorized_organization(ctx, org_id)?;
        state
            .dispatcher
            .dispatch(Mutation::OrgDelete(OrganizationKey { org_id: org.id }))
            .await
            .map_err(dispatch_failure)
    }

    match delete1(&state, &ctx, &org_id).await {
        Ok(()) => {
            counter_add!(state.instruments, "organizations.deleted", 1, &[]);
            http::no_content(&ctx)
        }
        Err(problems) => problems.into_response(),
    }
}

/// Return a router for the Organization API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let open = Router::new().route("/organizations", post(create));
    let authenticated = Router::new().route(
        "/organizations/{orgID}",
        get(read).put(update).delete(delete),
    );
    Router::new()
        .merge(http::guard(open, &state, Guard::Open))
        .merge(http::guard(authenticated, &state, Guard::Organization))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_ids() {
        let id = PublicId::derive("org", 1);
        assert!(check_body_id(None, id, Code::OrgMismatch).is_ok());
        assert!(check_body_id(Some(&id.to_string()), id, Code::OrgMismatch).is_ok());
        let err = check_body_id(
            Some(&PublicId::derive("org", 2).to_string()),
            id,
            Code::OrgMismatch,
        )
        .unwrap_err();
        assert_eq!(err.codes(), vec![Code::OrgMismatch]);
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn validation() {
        let org = Organization {
            name: "ab".to_owned(),
            description: "x".repeat(101),
            ..Default::default()
        };
        assert_eq!(
            validate(&org).unwrap_err().codes(),
            vec![Code::OrgNameSize, Code::OrgDescriptionSize]
        );
    }

    #[test]
    fn path_must_name_the_authenticated_organization() {
        let org = Organization {
            public_id: PublicId::derive("org", 1),
            ..Default::default()
        };
        let mut ctx = RequestContext::default();
        ctx.organization = Some(Arc::new(org.clone()));
        assert!(authorized_organization(&ctx, &org.public_id.to_string()).is_ok());
        assert_eq!(
            authorized_organization(&ctx, &PublicId::derive("org", 2).to_string())
                .unwrap_err()
                .codes(),
            vec![Code::AuthInvalidOrgCredentials]
        );
        assert_eq!(
            authorized_organization(&ctx, "not-a-uuid").unwrap_err().codes(),
            vec![Code::OrgNotFound]
        );
    }
}
