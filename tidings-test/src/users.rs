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

//! Integration tests for the application user API.

use libtest_mimic::Failed;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};

use crate::{await_status, error_codes, eventually, string_field, Tenant};

/// Sign-up, then log back in with the same credentials: we should get a fresh session
pub async fn register_and_login(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "register").await?;

    let rsp = tenant
        .as_app(Method::POST, "users")?
        .json(&json!({"user_name":"dlsniper","password":"p4ssword!","email":"d@example.com"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let created = rsp.json::<Value>().await?;
    let first = string_field(&created, "session_token")?;
    assert!(created.get("password").is_none());

    let rsp = tenant
        .as_app(Method::POST, "me/login")?
        .json(&json!({"email":"d@example.com","password":"p4ssword!"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let second = string_field(&rsp.json::<Value>().await?, "session_token")?;
    assert_ne!(first, second);

    // Both sessions remain good
    for session in [&first, &second] {
        let rsp = tenant
            .client
            .request(Method::GET, "me", &tenant.app_token, session)?
            .send()
            .await?;
        assert_eq!(StatusCode::OK, rsp.status());
    }

    // ...but a bad password gets us nowhere
    let rsp = tenant
        .as_app(Method::POST, "me/login")?
        .json(&json!({"email":"d@example.com","password":"not my password"}))
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4011], error_codes(rsp).await?);

    Ok(())
}

/// Create a user, login, then `GET /me`: we should see the same user, sans password
pub async fn login_round_trip(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "roundtrip").await?;
    let user = tenant.sign_up("roundtrip").await?;

    let rsp = tenant
        .as_app(Method::POST, "users/login")?
        .json(&json!({"user_name": "roundtrip", "password": "p4ssword!"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let login = rsp.json::<Value>().await?;
    let session = string_field(&login, "session_token")?;

    let rsp = tenant
        .client
        .request(Method::GET, "me", &tenant.app_token, &session)?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert!(rsp.headers().contains_key("last-modified"));
    let me = rsp.json::<Value>().await?;

    assert_eq!(Some(user.id), me["id"].as_u64());
    assert_eq!(user.id.to_string(), string_field(&me, "id_string")?);
    assert_eq!("roundtrip", me["user_name"]);
    assert_eq!("roundtrip@example.com", me["email"]);
    assert_eq!(login["user_name"], me["user_name"]);
    assert_eq!(login["created_at"], me["created_at"]);
    assert!(me.get("password").is_none());

    Ok(())
}

/// Signing-up twice with the same credentials logs the caller in; signing-up under a claimed
/// username with the wrong password is refused
pub async fn duplicate_signup(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "duplicates").await?;
    let user = tenant.sign_up("twice").await?;
    let again = tenant.sign_up("twice").await?;
    assert_eq!(user.id, again.id);
    assert_ne!(user.session, again.session);

    let rsp = tenant
        .as_app(Method::POST, "users")?
        .json(&json!({"user_name":"twice","password":"another password","email":"other@example.com"}))
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4011], error_codes(rsp).await?);

    Ok(())
}

/// Refresh a session, then log out of the new one
pub async fn refresh_and_logout(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "sessions").await?;
    let user = tenant.sign_up("refresher").await?;

    // The token in the body must match the one we're using
    let rsp = tenant
        .as_user(&user, Method::POST, "me/refresh")?
        .json(&json!({"session_token": "not the session token"}))
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4012], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&user, Method::POST, "me/refresh")?
        .json(&json!({"session_token": user.session}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let fresh = string_field(&rsp.json::<Value>().await?, "session_token")?;
    assert_ne!(user.session, fresh);

    // The old session is gone
    let rsp = tenant.as_user(&user, Method::GET, "me")?.send().await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());

    let rsp = tenant
        .client
        .request(Method::DELETE, "me/logout", &tenant.app_token, &fresh)?
        .send()
        .await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    let rsp = tenant
        .client
        .request(Method::GET, "me", &tenant.app_token, &fresh)?
        .send()
        .await?;
    assert_eq!(StatusCode::UNAUTHORIZED, rsp.status());
    assert_eq!(vec![4007], error_codes(rsp).await?);

    Ok(())
}

/// Search by term & by email; the searcher never sees themselves
pub async fn user_search(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "search").await?;
    let alice = tenant.sign_up("alice-smith").await?;
    let bob = tenant.sign_up("bob-smith").await?;
    tenant.sign_up("carol-jones").await?;

    let rsp = tenant
        .as_user(&alice, Method::GET, "users/search?q=smith")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    let found = rsp.json::<Value>().await?;
    assert_eq!(Some(1), found["users_count"].as_u64());
    assert_eq!(Some(bob.id), found["users"][0]["id"].as_u64());
    // Other people's lists carry only public profiles
    assert!(found["users"][0].get("session_token").is_none());

    let rsp = tenant
        .as_user(&alice, Method::GET, "users/search?email=carol-jones@example.com")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!("carol-jones", rsp.json::<Value>().await?["users"][0]["user_name"]);

    let rsp = tenant
        .as_user(&alice, Method::GET, "users/search?q=zz")?
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![1009], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&alice, Method::GET, "users/search")?
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5009], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&alice, Method::GET, "users/search?q=nobody")?
        .send()
        .await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    Ok(())
}

/// Update our own profile, then delete ourselves
pub async fn update_and_delete(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "profile").await?;
    let user = tenant.sign_up("changeling").await?;

    let rsp = tenant
        .as_user(&user, Method::PUT, "me")?
        .json(&json!({"first_name": "Chang", "last_name": "Eling", "id": 1}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let updated = rsp.json::<Value>().await?;
    // We can't change our id
    assert_eq!(Some(user.id), updated["id"].as_u64());

    let (tenant_ref, user_ref) = (&tenant, &user);
    let me = eventually(|| async move {
        let me = tenant_ref
            .as_user(user_ref, Method::GET, "me")?
            .send()
            .await?
            .json::<Value>()
            .await?;
        Ok((me["first_name"] == "Chang").then_some(me))
    })
    .await?;
    assert_eq!("Eling", me["last_name"]);

    let rsp = tenant.as_user(&user, Method::DELETE, "me")?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    let other = tenant.sign_up("observer").await?;
    await_status(
        &tenant,
        &other,
        &format!("users/{}", user.id),
        StatusCode::NOT_FOUND,
    )
    .await?;

    Ok(())
}
