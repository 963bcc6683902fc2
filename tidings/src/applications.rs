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

//! # The Application API
//!
//! Applications belong to an organization & are administered by its members. Every mutation
//! travels through the [dispatcher]; creating an application mints both of its tokens, which are
//! returned to the caller (& never change thereafter).
//!
//! [dispatcher]: crate::dispatcher

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    counter_add,
    dispatcher::{ApplicationKey, ApplicationRecord, Mutation},
    entities::{self, AppId, Application, Image, OrgId, PublicId},
    http::{self, dispatch_failure, storage_failure, Guard},
    metrics::{self, Sort},
    organizations::{authorized_organization, check_body_id},
    pipeline::{self, parse_json, RequestContext},
    problems::{self, Code, Problem, Problems},
    tidings::Tidings,
    tokens,
};

inventory::submit! { metrics::Registration::new("applications.created", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("applications.deleted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("applications.failures", Sort::IntegralCounter) }

/// The application fields a caller may set
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ApplicationRequest {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub in_production: Option<bool>,
    pub images: Option<BTreeMap<String, Image>>,
}

#[derive(Serialize)]
struct ApplicationList {
    applications: Vec<Application>,
}

fn validate(app: &Application) -> problems::Result<()> {
    let mut problems = Problems::new();
    problems.check(entities::within(&app.name, 2, 40), Code::AppNameSize);
    problems.check(
        entities::within(&app.description, 0, 100),
        Code::AppDescriptionSize,
    );
    if let Some(url) = &app.url {
        problems.check(entities::is_valid_url(url), Code::AppUrlInvalid);
    }
    problems.into_result()
}

/// Look up the application named in the path, within the organization named in the path
async fn lookup(
    state: &Tidings,
    ctx: &RequestContext,
    org_id: &str,
    app_id: &str,
) -> problems::Result<Application> {
    let org = authorized_organization(ctx, org_id)?;
    let app_id = PublicId::from_raw_string(app_id)
        .map_err(|err| Problem::internal(Code::AppIdInvalid, err))?;
    let app = state
        .store
        .application_by_public_id(org.id, app_id)
        .await
        .map_err(storage_failure)?;
    http::found(app, Code::AppNotFound)
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
    ) -> problems::Result<Application> {
        let org_id: OrgId = authorized_organization(ctx, org_id)?.id;
        let req: ApplicationRequest = parse_json(body)?;
        let id = AppId::new(state.flake.next_id().map_err(Problems::server_error)?);
        let now = Utc::now();
        let app = Application {
            id,
            org_id,
            public_id: PublicId::derive("app", id.as_u64()),
            name: req.name.unwrap_or_default(),
            description: req.description.unwrap_or_default(),
            url: req.url,
            token: tokens::application_token(),
            backend_token: tokens::backend_token(),
            in_production: req.in_production.unwrap_or(false),
            enabled: true,
            images: req.images,
            created_at: now,
            updated_at: now,
        };
        validate(&app)?;
        state
            .dispatcher
            .dispatch(Mutation::AppCreate(ApplicationRecord {
                org_id,
                app_id: id,
                application: app.clone(),
            }))
            .await
            .map_err(dispatch_failure)?;
        Ok(app)
    }

    match create1(&state, &ctx, &org_id, &body).await {
        Ok(app) => {
            info!("Created application {} ({})", app.name, app.public_id);
            counter_add!(state.instruments, "applications.created", 1, &[]);
            pipeline::respond(&ctx, StatusCode::CREATED, &app, Some(app.updated_at))
        }
        Err(problems) => {
            counter_add!(
                state.instruments,
                "applications.failures",
                1,
                &[KeyValue::new("op", "create")]
            );
            problems.into_response()
        }
    }
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
    ) -> problems::Result<Vec<Application>> {
        let org = authorized_organization(ctx, org_id)?;
        state
            .store
            .applications(org.id)
            .await
            .map_err(storage_failure)
    }

    match list1(&state, &ctx, &org_id).await {
        Ok(applications) if applications.is_empty() => http::no_content(&ctx),
        Ok(applications) => {
            let stamps = applications
                .iter()
                .map(|a| a.updated_at)
                .collect::<Vec<_>>();
            pipeline::respond(
                &ctx,
                StatusCode::OK,
                &ApplicationList { applications },
                stamps,
            )
        }
        Err(problems) => problems.into_response(),
    }
}

async fn read(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, app_id)): Path<(String, String)>,
) -> Response {
    match lookup(&state, &ctx, &org_id, &app_id).await {
        Ok(app) => pipeline::respond(&ctx, StatusCode::OK, &app, Some(app.updated_at)),
        Err(problems) => problems.into_response(),
    }
}

async fn update(
    State(state): State<Arc<Tidings>>,
    Extension(ctx): Extension<RequestContext>,
    Path((org_id, app_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    async fn update1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        app_id: &str,
        body: &[u8],
    ) -> problems::Result<Application> {
        let mut app = lookup(state, ctx, org_id, app_id).await?;
        let req: ApplicationRequest = parse_json(body)?;
        check_body_id(req.id.as_deref(), app.public_id, Code::AppMismatch)?;
        if let Some(name) = req.name {
            app.name = name;
        }
        if let Some(description) = req.description {
            app.description = description;
        }
        if req.url.is_some() {
            app.url = req.url;
        }
        if let Some(in_production) = req.in_production {
            app.in_production = in_production;
        }
        if req.images.is_some() {
            app.images = req.images;
        }
        validate(&app)?;
        app.updated_at = Utc::now();
        state
            .dispatcher
            .dispatch(Mutation::AppUpdate(ApplicationRecord {
                org_id: app.org_id,
                app_id: app.id,
                application: app.clone(),
            }))
            .await
            .map_err(dispatch_failure)?;
        Ok(app)
    }

    match update1(&state, &ctx, &org_id, &app_id, &body).await {
        Ok(app) => pipeline::respond(&ctx, StatusCode::CREATED, &app, Some(app.updated_at)),
        Err(problems) => {
            counter_add!(
                state.instruments,
                "applications.failures",
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
    Path((org_id, app_id)): Path<(String, String)>,
) -> Response {
    async fn delete1(
        state: &Tidings,
        ctx: &RequestContext,
        org_id: &str,
        app_id: &str,
    ) -> problems::Result<()> {
        let app = lookup(state, ctx, org_id, app_id).await?;
        state
            .dispatcher
            .dispatch(Mutation::AppDelete(ApplicationKey {
                org_id: app.org_id,
                app_id: app.id,
            }))
            .await
            .map_err(dispatch_failure)
    }

    match delete1(&state, &ctx, &org_id, &app_id).await {
        Ok(()) => {
            counter_add!(state.instruments, "applications.deleted", 1, &[]);
            http::no_content(&ctx)
        }
        Err(problems) => problems.into_response(),
    }
}

/// Return a router for the Application API
pub fn make_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    let member = Router::new()
        .route(
            "/organizations/{orgID}/applications",
            get(list).post(create),
        )
        .route(
            "/organizations/{orgID}/applications/{appID}",
            get(read).put(update).delete(delete),
        );
    Router::new()
        .merge(http::guard(member, &state, Guard::Member))
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn validation() {
        let app = Application {
            name: "x".to_owned(),
            url: Some("not a url".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            validate(&app).unwrap_err().codes(),
            vec![Code::AppNameSize, Code::AppUrlInvalid]
        );
        let app = Application {
            name: "Gallery".to_owned(),
            description: "Photos, with friends".to_owned(),
            url: Some("https://gallery.example.com".to_owned()),
            ..Default::default()
        };
        assert!(validate(&app).is_ok());
    }
}
