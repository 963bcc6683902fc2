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

//! # HTTP router assembly
//!
//! Each handler module contributes a [Router] for its resources; this module stitches them together
//! under the API version prefix, wraps each group of routes in the [pipeline] stages its
//! credentials call for (see [Guard]), and puts the whole thing behind the request id, tracing &
//! metrics layers.
//!
//! [pipeline]: crate::pipeline

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use axum::{
    extract::MatchedPath,
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use opentelemetry::KeyValue;
use tap::Pipe;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{
    applications, connections, counter_add,
    entities::Presentable,
    events, histogram_observe, members,
    metrics::{self, Sort},
    organizations,
    pipeline::{self, RequestContext},
    problems::{Code, Problem, Problems},
    tidings::Tidings,
    users,
};

/// The credentials a group of routes demands
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Guard {
    /// None at all (organization signup & member login)
    Open,
    /// An organization token
    Organization,
    /// An organization token & a member session
    Member,
    /// An application (or backend) token
    Application,
    /// An application token & a session, or a backend token & a user id
    ApplicationUser,
}

/// Wrap `routes` in the pipeline stages demanded by `guard`
///
/// Layers added by [Router::route_layer] run outermost-last, so the stages are listed here in the
/// reverse of the order in which they see a request.
pub fn guard(
    routes: Router<Arc<Tidings>>,
    state: &Arc<Tidings>,
    guard: Guard,
) -> Router<Arc<Tidings>> {
    let routes = routes.route_layer(from_fn_with_state(state.clone(), pipeline::validate));
    match guard {
        Guard::Open => routes,
        Guard::Organization => routes.route_layer(from_fn_with_state(
            state.clone(),
            pipeline::populate_organization,
        )),
        Guard::Member => routes
            .route_layer(from_fn_with_state(state.clone(), pipeline::populate_member))
            .route_layer(from_fn_with_state(
                state.clone(),
                pipeline::populate_organization,
            )),
        Guard::Application => routes
            .route_layer(from_fn_with_state(state.clone(), pipeline::rate_limit))
            .route_layer(from_fn_with_state(
                state.clone(),
                pipeline::populate_application,
            )),
        Guard::ApplicationUser => routes
            .route_layer(from_fn_with_state(state.clone(), pipeline::rate_limit))
            .route_layer(from_fn_with_state(
                state.clone(),
                pipeline::populate_application_user,
            ))
            .route_layer(from_fn_with_state(
                state.clone(),
                pipeline::populate_application,
            )),
    }
}

/// Answer "204 No Content"
pub fn no_content(ctx: &RequestContext) -> Response {
    let mut rsp = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&pipeline::http_date(ctx.started)) {
        rsp.headers_mut()
            .insert(axum::http::header::LAST_MODIFIED, value);
    }
    rsp
}

/// Reject a handler result that isn't there; `Err` carries `code`
pub fn found<T>(value: Option<T>, code: Code) -> Result<T, Problems> {
    value.ok_or_else(|| code.into())
}

/// Map a storage failure onto an internal error
pub fn storage_failure(err: crate::storage::Error) -> Problems {
    Problem::internal(Code::Internal, err).into()
}

/// Render `entity` for a caller, numeric ids & all
pub fn present<T: Presentable>(entity: &T) -> Result<serde_json::Value, Problems> {
    entity.present().map_err(Problems::server_error)
}

/// Map a failure to enqueue a mutation onto an internal error
pub fn dispatch_failure(err: crate::dispatcher::Error) -> Problems {
    Problem::internal(Code::Internal, err).into()
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the router                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Request ids are just a process-wide sequence number
///
/// Easier to grep for in the logs than a UUID, and the latest one says roughly how many requests
/// this instance has served.
#[derive(Clone, Debug, Default)]
struct Sequential(Arc<AtomicU64>);

impl MakeRequestId for Sequential {
    fn make_request_id<B>(&mut self, _request: &axum::extract::Request<B>) -> Option<RequestId> {
        let next = self.0.fetch_add(1, Ordering::Relaxed);
        HeaderValue::from(next).pipe(RequestId::new).pipe(Some)
    }
}

inventory::submit! { metrics::Registration::new("http.server.requests", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("http.server.duration", Sort::Histogram) }

/// Count each request & time it, labelled by method, route template & status
///
/// The route template (not the raw path) keeps attribute cardinality bounded.
async fn otel_middleware(
    axum::extract::State(state): axum::extract::State<Arc<Tidings>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().as_str().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(request).await;
    let attrs = [
        KeyValue::new("method", method),
        KeyValue::new("route", route),
        KeyValue::new("status", response.status().as_u16() as i64),
    ];
    counter_add!(state.instruments, "http.server.requests", 1, &attrs);
    histogram_observe!(
        state.instruments,
        "http.server.duration",
        start.elapsed().as_secs_f64(),
        &attrs
    );
    response
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

/// Every API route, less the ambient layers
fn make_api_router(state: Arc<Tidings>) -> Router<Arc<Tidings>> {
    Router::new()
        .merge(organizations::make_router(state.clone()))
        .merge(members::make_router(state.clone()))
        .merge(applications::make_router(state.clone()))
        .merge(users::make_router(state.clone()))
        .merge(connections::make_router(state.clone()))
        .merge(events::make_router(state.clone()))
        // The deadline is outermost: it also starts the clock for `Last-Modified`
        .layer(from_fn_with_state(state.clone(), pipeline::deadline))
        // Every response is JSON (unless a handler says otherwise)
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=UTF-8"),
        ))
        .layer(CorsLayer::permissive())
}

/// Make the [Router] that will be accessible to the world
pub fn make_router(state: Arc<Tidings>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .nest(
            &format!("/{}", state.api_version),
            make_api_router(state.clone()),
        )
        // Outermost first: the id is assigned before anything else sees the request, so both the
        // metrics & the trace span can carry it
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(Sequential::default()))
                .layer(from_fn_with_state(state.clone(), otel_middleware))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().include_headers(true))
                        .on_response(DefaultOnResponse::new().include_headers(true)),
                )
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;

    use axum::{body::Body, extract::Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::{
        metrics::Instruments,
        tidings::{Config, Service},
    };

    #[tokio::test]
    async fn healthcheck_and_request_ids() {
        let service = Service::new(&Config::default(), Arc::new(Instruments::new("tidings")))
            .await
            .unwrap();
        let router = service.router();
        let rsp = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/healthcheck")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::OK);
        assert!(rsp.headers().contains_key("x-request-id"));
        let body = rsp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"GOOD");

        // Unauthenticated API requests get the error envelope
        let rsp = router
            .oneshot(
                Request::builder()
                    .uri("/0.4/me")
                    .header("user-agent", "http-test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            rsp.headers().get(CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("application/json; charset=UTF-8")
        );
        service.shutdown().await.unwrap();
    }
}
