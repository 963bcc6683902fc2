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

//! Integration tests for the connection API.

use libtest_mimic::Failed;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};

use crate::{await_status, error_codes, Tenant, User};

/// The ids of the users in a `{users, users_count}` listing
fn listed(body: &Value) -> Vec<u64> {
    body["users"]
        .as_array()
        .map(|users| users.iter().filter_map(|u| u["id"].as_u64()).collect())
        .unwrap_or_default()
}

async fn befriend(tenant: &Tenant, from: &User, to: &User) -> Result<Value, Failed> {
    let rsp = tenant
        .as_user(from, Method::PUT, "me/friends")?
        .json(&json!({"user_to_id": to.id, "type": "friend"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    Ok(rsp.json::<Value>().await?)
}

/// A friends with B; B should see A among their friends (& vice versa)
pub async fn friend_mirror(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "mirror").await?;
    let a = tenant.sign_up("mirror-a").await?;
    let b = tenant.sign_up("mirror-b").await?;

    let connection = befriend(&tenant, &a, &b).await?;
    assert_eq!(Some(a.id), connection["user_from_id"].as_u64());
    assert_eq!(Some(b.id), connection["user_to_id"].as_u64());
    assert_eq!("friend", connection["type"]);

    let theirs = await_status(
        &tenant,
        &b,
        &format!("users/{}/friends", b.id),
        StatusCode::OK,
    )
    .await?
    .ok_or("no friends list")?;
    assert_eq!(vec![a.id], listed(&theirs));
    assert_eq!(Some(1), theirs["users_count"].as_u64());

    let mine = await_status(&tenant, &a, "me/friends", StatusCode::OK)
        .await?
        .ok_or("no friends list")?;
    assert_eq!(vec![b.id], listed(&mine));

    // Each sees the other as a friend on their profile
    let rsp = tenant
        .as_user(&b, Method::GET, &format!("users/{}", a.id))?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    let profile = rsp.json::<Value>().await?;
    assert_eq!(Some(true), profile["is_friend"].as_bool());
    assert_eq!(Some(1), profile["friend_count"].as_u64());

    // Once is enough
    let rsp = tenant
        .as_user(&a, Method::PUT, "me/friends")?
        .json(&json!({"user_to_id": b.id, "type": "friend"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CONFLICT, rsp.status());
    assert_eq!(vec![2000], error_codes(rsp).await?);

    Ok(())
}

/// Connect, disconnect, reconnect: the last is a re-enablement, not a conflict
pub async fn reconnect(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "reconnect").await?;
    let a = tenant.sign_up("reconnect-a").await?;
    let b = tenant.sign_up("reconnect-b").await?;

    let first = befriend(&tenant, &a, &b).await?;
    await_status(&tenant, &a, "me/friends", StatusCode::OK).await?;

    let rsp = tenant
        .as_user(&a, Method::DELETE, &format!("me/connections/{}", b.id))?
        .send()
        .await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());
    // The mirror goes too
    await_status(&tenant, &b, "me/friends", StatusCode::NO_CONTENT).await?;

    let second = befriend(&tenant, &a, &b).await?;
    assert_eq!(first["created_at"], second["created_at"]);
    let theirs = await_status(&tenant, &b, "me/friends", StatusCode::OK)
        .await?
        .ok_or("no friends list")?;
    assert_eq!(vec![a.id], listed(&theirs));

    // Nothing to delete
    let rsp = tenant
        .as_user(&b, Method::DELETE, &format!("me/connections/{}", b.id + 1))?
        .send()
        .await?;
    assert_eq!(StatusCode::NOT_FOUND, rsp.status());

    Ok(())
}

/// Follow someone; they acquire a follower & we a followee
pub async fn follow(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "follow").await?;
    let fan = tenant.sign_up("the-fan").await?;
    let star = tenant.sign_up("the-star").await?;

    let rsp = tenant
        .as_user(&fan, Method::PUT, "me/follow")?
        .json(&json!({"user_to_id": star.id.to_string(), "state": "confirmed"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let connection = rsp.json::<Value>().await?;
    assert_eq!("follow", connection["type"]);
    assert_eq!("confirmed", connection["state"]);

    let follows = await_status(&tenant, &fan, "me/follows", StatusCode::OK)
        .await?
        .ok_or("no follows list")?;
    assert_eq!(vec![star.id], listed(&follows));
    let followers = await_status(&tenant, &star, "me/followers", StatusCode::OK)
        .await?
        .ok_or("no followers list")?;
    assert_eq!(vec![fan.id], listed(&followers));
    // Following isn't mutual
    let rsp = tenant.as_user(&star, Method::GET, "me/follows")?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    Ok(())
}

/// Bad connection requests are refused, with every problem reported at once
pub async fn invalid_connections(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "badconns").await?;
    let me = tenant.sign_up("lonely").await?;

    let rsp = tenant
        .as_user(&me, Method::PUT, "me/connections")?
        .json(&json!({"user_to_id": me.id, "type": "friend"}))
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![2003], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&me, Method::PUT, "me/connections")?
        .json(&json!({"user_to_id": me.id + 1, "type": "enemy", "state": "bitter"}))
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![2002, 2005], error_codes(rsp).await?);

    Ok(())
}

/// Register social ids, then connect to everyone we know on that platform
pub async fn social_connect(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "social").await?;
    let friend = tenant.sign_up("social-friend").await?;
    let me = tenant.sign_up("social-me").await?;

    let rsp = tenant
        .as_user(&friend, Method::PUT, "me")?
        .json(&json!({"social_ids": {"facebook": "fb-friend"}}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    // Searches never show the searcher, so look on our own behalf
    let (tenant_ref, me_ref) = (&tenant, &me);
    crate::eventually(|| async move {
        let rsp = tenant_ref
            .as_user(
                me_ref,
                Method::GET,
                "users/search?social_platform=facebook&socialid=fb-friend",
            )?
            .send()
            .await?;
        Ok((rsp.status() == StatusCode::OK).then_some(()))
    })
    .await?;

    let rsp = tenant
        .as_user(&me, Method::POST, "me/connections/social")?
        .json(&json!({
            "platform": "facebook",
            "platform_user_id": "fb-me",
            "connection_ids": ["fb-friend", "fb-stranger"],
            "type": "friend"
        }))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    assert_eq!(vec![friend.id], listed(&rsp.json::<Value>().await?));

    let friends = await_status(&tenant, &friend, "me/friends", StatusCode::OK)
        .await?
        .ok_or("no friends list")?;
    assert_eq!(vec![me.id], listed(&friends));

    Ok(())
}

/// Edges by state: pending friendships show up on both sides, rejections on the rejected side
pub async fn connections_by_state(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "bystate").await?;
    let a = tenant.sign_up("bystate-a").await?;
    let b = tenant.sign_up("bystate-b").await?;
    let c = tenant.sign_up("bystate-c").await?;

    befriend(&tenant, &a, &b).await?;
    let rsp = tenant
        .as_user(&c, Method::PUT, "me/follow")?
        .json(&json!({"user_to_id": a.id, "state": "rejected"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());

    let pending = await_status(&tenant, &a, "me/pending", StatusCode::OK)
        .await?
        .ok_or("nothing pending")?;
    assert_eq!(Some(1), pending["incoming_connections_count"].as_u64());
    assert_eq!(Some(1), pending["outgoing_connections_count"].as_u64());
    assert_eq!(Some(b.id), pending["outgoing"][0]["user_to_id"].as_u64());
    assert_eq!(vec![b.id], listed(&pending));

    let rejected = await_status(
        &tenant,
        &b,
        &format!("users/{}/rejected", a.id),
        StatusCode::OK,
    )
    .await?
    .ok_or("nothing rejected")?;
    assert_eq!(Some(1), rejected["incoming_connections_count"].as_u64());
    assert_eq!(Some(0), rejected["outgoing_connections_count"].as_u64());
    assert_eq!(Some(c.id), rejected["incoming"][0]["user_from_id"].as_u64());
    assert_eq!(vec![c.id], listed(&rejected));

    let rsp = tenant.as_user(&b, Method::GET, "me/confirmed")?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    let rsp = tenant.as_user(&b, Method::GET, "me/blocked")?.send().await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![2005], error_codes(rsp).await?);

    Ok(())
}

/// `with_event` announces the new edge as a private event by the connecting user
pub async fn connection_events(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "announce").await?;
    let fan = tenant.sign_up("announce-fan").await?;
    let star = tenant.sign_up("announce-star").await?;

    let rsp = tenant
        .as_user(&fan, Method::PUT, "me/follow?with_event=true")?
        .json(&json!({"user_to_id": star.id}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());

    let mine = await_status(&tenant, &fan, "me/events", StatusCode::OK)
        .await?
        .ok_or("no events")?;
    assert_eq!(Some(1), mine["events_count"].as_u64());
    let event = &mine["events"][0];
    assert_eq!("tg_follow", event["type"]);
    assert_eq!(Some(10), event["visibility"].as_u64());
    assert_eq!(star.id.to_string(), event["target"]["id"]);
    assert_eq!("tg_user", event["target"]["type"]);

    // Without the flag, nothing is announced
    let other = tenant.sign_up("announce-other").await?;
    let rsp = tenant
        .as_user(&other, Method::PUT, "me/follow")?
        .json(&json!({"user_to_id": star.id}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    await_status(&tenant, &star, "me/followers", StatusCode::OK).await?;
    let rsp = tenant.as_user(&other, Method::GET, "me/events")?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    Ok(())
}
