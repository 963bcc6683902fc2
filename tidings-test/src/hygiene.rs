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

//! Integration tests for request hygiene, authentication & rate limiting.

use libtest_mimic::Failed;
use reqwest::{header, Method, StatusCode, Url};
use serde_json::json;

use crate::{error_codes, Tenant};

/// Every response carries a request id & is JSON
pub async fn request_ids(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "requestids").await?;
    let user = tenant.sign_up("identified").await?;

    let rsp = tenant.as_user(&user, Method::GET, "me")?.send().await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert!(rsp.headers().contains_key("x-request-id"));
    assert_eq!(
        "application/json; charset=UTF-8",
        rsp.headers()
            .get(header::CONTENT_TYPE)
            .ok_or("no Content-Type")?
            .to_str()?
    );

    // A request id supplied by the caller is echoed back
    let rsp = tenant
        .as_user(&user, Method::GET, "me")?
        .header("x-request-id", "tidings-test-1")
        .send()
        .await?;
    assert_eq!(
        "tidings-test-1",
        rsp.headers()
            .get("x-request-id")
            .ok_or("no request id")?
            .to_str()?
    );

    Ok(())
}

/// Unknown or malformed credentials are refused
pub async fn bad_credentials(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "badcreds").await?;

    let rsp = tenant
        .client
        .request(Method::GET, "me", "x".repeat(32).as_str(), "whatever")?
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4006], error_codes(rsp).await?);

    let rsp = tenant
        .client
        .request(Method::GET, "me", "short", "")?
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());

    // The application is fine, but there's no session
    let rsp = tenant.as_app(Method::GET, "me")?.send().await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4013], error_codes(rsp).await?);

    // A backend token names the user directly
    let user = tenant.sign_up("backended").await?;
    let rsp = tenant
        .client
        .request(
            Method::GET,
            "me",
            &tenant.backend_token,
            &user.id.to_string(),
        )?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!("backended", rsp.json::<serde_json::Value>().await?["user_name"]);

    // Organization routes want an organization token
    let rsp = tenant
        .client
        .request(
            Method::GET,
            &format!("organizations/{}", tenant.org_id),
            &tenant.app_token,
            "",
        )?
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4004], error_codes(rsp).await?);

    Ok(())
}

/// Requests must identify their user agent; writes must carry a modest JSON body
pub async fn request_validation(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "hygiene").await?;
    let user = tenant.sign_up("hygienic").await?;
    let me = tenant.client.api().join("me")?;

    // No User-Agent
    let rsp = reqwest::Client::new()
        .get(me.clone())
        .basic_auth(&tenant.app_token, Some(&user.session))
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5002], error_codes(rsp).await?);

    // Not JSON
    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .header(header::CONTENT_TYPE, "text/plain")
        .body(r#"{"first_name": "Tidy"}"#)
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5006], error_codes(rsp).await?);

    // No Content-Type at all
    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .body(r#"{"first_name": "Tidy"}"#)
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5007], error_codes(rsp).await?);

    // Nothing to say
    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, "0")
        .body("")
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5012], error_codes(rsp).await?);

    // Too much to say
    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .json(&json!({"first_name": "x".repeat(4096)}))
        .send()
        .await?;
    assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, rsp.status());
    assert_eq!(vec![5011], error_codes(rsp).await?);

    // Not making sense
    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .header(header::CONTENT_TYPE, "application/json")
        .body("{first_name: Tidy")
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5001], error_codes(rsp).await?);

    Ok(())
}

/// Exhaust a staging application's quota
///
/// The fixture sets the staging limit to 1000 requests per window. Signing-up costs one of them,
/// so we get 999 `GET /me`s before we're cut off.
pub async fn rate_limit(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "ratelimit").await?;
    let user = tenant.sign_up("greedy").await?;

    let mut granted = 0;
    let rejected = loop {
        let rsp = tenant.as_user(&user, Method::GET, "me")?.send().await?;
        if rsp.status() != StatusCode::OK {
            break rsp;
        }
        granted += 1;
        let remaining = rsp
            .headers()
            .get("x-ratelimit-remaining")
            .ok_or("no X-RateLimit-Remaining")?
            .to_str()?
            .parse::<u64>()?;
        assert_eq!(999 - granted, remaining);
        assert_eq!(
            "1000",
            rsp.headers()
                .get("x-ratelimit-limit")
                .ok_or("no X-RateLimit-Limit")?
                .to_str()?
        );
        if granted > 1000 {
            return Err("the rate limit was never enforced".into());
        }
    };

    assert_eq!(999, granted);
    assert_eq!(StatusCode::TOO_MANY_REQUESTS, rejected.status());
    assert_eq!(
        "0",
        rejected
            .headers()
            .get("x-ratelimit-remaining")
            .ok_or("no X-RateLimit-Remaining")?
            .to_str()?
    );
    assert!(rejected.headers().contains_key("x-ratelimit-reset"));
    assert_eq!(vec![5013], error_codes(rejected).await?);

    Ok(())
}
