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

//! # The tidings Integration Tests
//!
//! # Introduction
//!
//! The Rust unit & integration testing framework is oriented toward testing *libraries*, not
//! services: there's no notion of a fixture shared across tests. Rather than reach for a cargo
//! plugin, we swap out the default test harness. In Cargo.toml:
//!
//! ```toml
//! [[test]]
//! name = "in-memory"
//! harness = false
//! ```
//!
//! `cargo test` will then build `tests/in-memory.rs` as an ordinary program with a `main()`, which
//! is expected to exit with status zero if all tests passed & non-zero else. We use
//! [libtest-mimic] to honor the customary command-line arguments.
//!
//! [libtest-mimic]: https://docs.rs/libtest-mimic/latest/libtest_mimic/index.html
//!
//! # Project Structure
//!
//! This crate produces a library (this one) & one integration test program per fixture. Test
//! logic that doesn't care how the service under test was deployed belongs here, as `async`
//! functions taking the base [Url] of the API & returning `Result<(), Failed>`. Fixture programs
//! (in `tests/`) stand up a tidings instance, register the tests they want to run with
//! `inventory`, & hand them to libtest-mimic.
//!
//! Every test provisions its own organization, member & application (see [Tenant]), so tests
//! don't interfere with one another's data or rate limits.
use std::time::Duration;

use libtest_mimic::Failed;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};

pub mod connections;
pub mod events;
pub mod hygiene;
pub mod users;

/// The `User-Agent` with which our test clients identify themselves
pub const USER_AGENT: &str = "tidings-test/0.1";

/// How long we'll wait for an asynchronous write to become visible
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hit the tidings healthcheck endpoint; fail on anything other than success.
pub async fn test_healthcheck(url: Url) -> Result<(), Failed> {
    let text = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()?
        .get(url.join("/healthcheck")?)
        .send()
        .await?
        .text()
        .await?;
    assert_eq!("GOOD", text);
    Ok(())
}

/// A thin wrapper around [reqwest::Client] that knows where the API lives
#[derive(Clone, Debug)]
pub struct Client {
    client: reqwest::Client,
    /// The API root, including the version prefix (e.g. `http://localhost:20680/0.4/`)
    api: Url,
}

impl Client {
    pub fn new(api: Url) -> Result<Client, Failed> {
        Ok(Client {
            client: reqwest::Client::builder().user_agent(USER_AGENT).build()?,
            api,
        })
    }
    /// Build a request for `path` (relative to the API root) with Basic credentials `user:password`
    pub fn request(
        &self,
        method: Method,
        path: &str,
        user: &str,
        password: &str,
    ) -> Result<RequestBuilder, Failed> {
        Ok(self
            .client
            .request(method, self.api.join(path)?)
            .basic_auth(user, Some(password)))
    }
    pub fn api(&self) -> &Url {
        &self.api
    }
}

/// One organization, one of its members & one application
///
/// Each test makes its own, so that its data & its application's quota are its own.
#[derive(Clone, Debug)]
pub struct Tenant {
    pub client: Client,
    pub org_id: String,
    pub org_token: String,
    pub member_session: String,
    pub app_id: String,
    pub app_token: String,
    pub backend_token: String,
}

/// An application user, together with a live session
#[derive(Clone, Debug)]
pub struct User {
    pub id: u64,
    pub user_name: String,
    pub session: String,
}

impl Tenant {
    /// Provision an organization named `name`, a member for it & an application
    pub async fn new(api: Url, name: &str) -> Result<Tenant, Failed> {
        let client = Client::new(api)?;

        let rsp = client
            .client
            .post(client.api.join("organizations")?)
            .json(&json!({"name": name, "description": "integration tests"}))
            .send()
            .await?;
        assert_eq!(StatusCode::CREATED, rsp.status());
        let org = rsp.json::<Value>().await?;
        let org_id = string_field(&org, "id")?;
        let org_token = string_field(&org, "token")?;

        let rsp = client
            .request(
                Method::POST,
                &format!("organizations/{}/members", org_id),
                &org_token,
                "",
            )?
            .json(&json!({
                "user_name": format!("{}-admin", name),
                "first_name": "Test",
                "last_name": "Admin",
                "email": format!("admin@{}.example.com", name),
                "password": "s3cr3t!"
            }))
            .send()
            .await?;
        assert_eq!(StatusCode::CREATED, rsp.status());
        let member_session = string_field(&rsp.json::<Value>().await?, "session_token")?;

        let rsp = client
            .request(
                Method::POST,
                &format!("organizations/{}/applications", org_id),
                &org_token,
                &member_session,
            )?
            .json(&json!({"name": format!("{}-app", name), "description": "test app"}))
            .send()
            .await?;
        assert_eq!(StatusCode::CREATED, rsp.status());
        let app = rsp.json::<Value>().await?;

        Ok(Tenant {
            org_id,
            org_token,
            member_session,
            app_id: string_field(&app, "id")?,
            app_token: string_field(&app, "token")?,
            backend_token: string_field(&app, "backend_token")?,
            client,
        })
    }
    /// A request made with the application token alone
    pub fn as_app(&self, method: Method, path: &str) -> Result<RequestBuilder, Failed> {
        self.client.request(method, path, &self.app_token, "")
    }
    /// A request made on behalf of `user`
    pub fn as_user(&self, user: &User, method: Method, path: &str) -> Result<RequestBuilder, Failed> {
        self.client.request(method, path, &self.app_token, &user.session)
    }
    /// Sign-up a new application user named `user_name`
    pub async fn sign_up(&self, user_name: &str) -> Result<User, Failed> {
        let rsp = self
            .as_app(Method::POST, "users")?
            .json(&json!({
                "user_name": user_name,
                "email": format!("{}@example.com", user_name),
                "password": "p4ssword!"
            }))
            .send()
            .await?;
        assert_eq!(StatusCode::CREATED, rsp.status());
        let body = rsp.json::<Value>().await?;
        Ok(User {
            id: body["id"].as_u64().ok_or("no user id in the signup response")?,
            user_name: user_name.to_owned(),
            session: string_field(&body, "session_token")?,
        })
    }
}

pub fn string_field(value: &Value, name: &str) -> Result<String, Failed> {
    value[name]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| format!("no string field {} in {}", name, value).into())
}

/// The error codes in a response's error envelope
pub async fn error_codes(rsp: Response) -> Result<Vec<u64>, Failed> {
    Ok(rsp.json::<Value>().await?["errors"]
        .as_array()
        .ok_or("no errors in the envelope")?
        .iter()
        .filter_map(|e| e["code"].as_u64())
        .collect())
}

/// Writes to connections & events are applied asynchronously; poll `check` until it returns
/// `Some`, or give up
pub async fn eventually<T, F, Fut>(mut check: F) -> Result<T, Failed>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Option<T>, Failed>>,
{
    let deadline = tokio::time::Instant::now() + CONVERGENCE_TIMEOUT;
    loop {
        if let Some(t) = check().await? {
            return Ok(t);
        }
        if tokio::time::Instant::now() > deadline {
            return Err("timed out waiting for a write to become visible".into());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// GET `path` as `user`, polling until the response status is `status`; returns the body
pub async fn await_status(
    tenant: &Tenant,
    user: &User,
    path: &str,
    status: StatusCode,
) -> Result<Option<Value>, Failed> {
    eventually(|| async move {
        let rsp = tenant.as_user(user, Method::GET, path)?.send().await?;
        if rsp.status() != status {
            return Ok(None);
        }
        if status == StatusCode::NO_CONTENT {
            Ok(Some(None))
        } else {
            Ok(Some(Some(rsp.json::<Value>().await?)))
        }
    })
    .await
}
