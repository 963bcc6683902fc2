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

//! Integration tests for the event, feed & search APIs.

use libtest_mimic::Failed;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};

use crate::{await_status, error_codes, eventually, Tenant, User};

/// The ids of the events in an event listing, in order
fn listed(body: &Value) -> Vec<u64> {
    body["events"]
        .as_array()
        .map(|events| events.iter().filter_map(|e| e["id"].as_u64()).collect())
        .unwrap_or_default()
}

async fn post(tenant: &Tenant, user: &User, event: Value) -> Result<u64, Failed> {
    let rsp = tenant
        .as_user(user, Method::POST, "me/events")?
        .json(&event)
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let body = rsp.json::<Value>().await?;
    Ok(body["id"].as_u64().ok_or("no event id")?)
}

/// GET `path` as `user` until the listing holds exactly `count` events
async fn await_events(
    tenant: &Tenant,
    user: &User,
    path: &str,
    count: usize,
) -> Result<Value, Failed> {
    eventually(|| async move {
        let rsp = tenant.as_user(user, Method::GET, path)?.send().await?;
        if rsp.status() != StatusCode::OK {
            return Ok(None);
        }
        let body = rsp.json::<Value>().await?;
        Ok((listed(&body).len() == count).then_some(body))
    })
    .await
}

/// Create, read, update & delete an event of our own
pub async fn event_lifecycle(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "lifecycle").await?;
    let me = tenant.sign_up("poster").await?;

    let rsp = tenant
        .as_user(&me, Method::POST, "me/events")?
        .json(&json!({"type": "like", "object": {"id": 42, "type": "post"}}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let location = rsp
        .headers()
        .get("location")
        .ok_or("no Location header")?
        .to_str()?
        .to_owned();
    let created = rsp.json::<Value>().await?;
    let id = created["id"].as_u64().ok_or("no event id")?;
    assert!(location.ends_with(&format!("/me/events/{}", id)));
    assert_eq!(Some(me.id), created["user_id"].as_u64());
    // Unset visibility means public
    assert_eq!(Some(30), created["visibility"].as_u64());
    assert_eq!("42", created["object"]["id"]);

    let path = format!("me/events/{}", id);
    let read = await_status(&tenant, &me, &path, StatusCode::OK)
        .await?
        .ok_or("no event")?;
    assert_eq!("like", read["type"]);

    let rsp = tenant
        .as_user(&me, Method::PUT, &path)?
        .json(&json!({"type": "love", "visibility": 20}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    let updated = rsp.json::<Value>().await?;
    assert_eq!("love", updated["type"]);
    // Fields the update didn't mention are kept
    assert_eq!("42", updated["object"]["id"]);
    let path_ref = path.as_str();
    let (tenant_ref, me_ref) = (&tenant, &me);
    eventually(|| async move {
        let body = tenant_ref
            .as_user(me_ref, Method::GET, path_ref)?
            .send()
            .await?
            .json::<Value>()
            .await?;
        Ok((body["type"] == "love" && body["visibility"] == 20 && body["object"]["id"] == "42")
            .then_some(()))
    })
    .await?;

    let rsp = tenant.as_user(&me, Method::DELETE, &path)?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());
    await_status(&tenant, &me, &path, StatusCode::NOT_FOUND).await?;

    // Servers assign ids
    let rsp = tenant
        .as_user(&me, Method::POST, "me/events")?
        .json(&json!({"id": 7, "type": "like"}))
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![3003], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&me, Method::POST, "me/events")?
        .json(&json!({"type": "", "visibility": 15}))
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![3008, 3004], error_codes(rsp).await?);

    Ok(())
}

/// A private event is invisible to a stranger; a public one isn't
pub async fn event_visibility(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "visibility").await?;
    let a = tenant.sign_up("private-a").await?;
    let b = tenant.sign_up("stranger-b").await?;

    let private = post(&tenant, &a, json!({"type": "like", "visibility": 10})).await?;
    let mine = await_events(&tenant, &a, "me/events", 1).await?;
    assert_eq!(vec![private], listed(&mine));

    let theirs = format!("users/{}/events", a.id);
    let rsp = tenant.as_user(&b, Method::GET, &theirs)?.send().await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    let public = post(&tenant, &a, json!({"type": "like", "visibility": 30})).await?;
    let seen = await_events(&tenant, &b, &theirs, 1).await?;
    assert_eq!(vec![public], listed(&seen));
    // Listings carry their authors
    assert_eq!(Some(1), seen["users_count"].as_u64());
    assert_eq!("private-a", seen["users"][a.id.to_string()]["user_name"]);

    Ok(())
}

/// The `nearest` geo search returns the closest events, closest first
pub async fn geo_nearest(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "geo").await?;
    let searcher = tenant.sign_up("searcher").await?;
    let poster = tenant.sign_up("traveller").await?;

    let mut ids = Vec::new();
    for (lat, lon) in [
        (52.5300, 13.3500), // across town
        (52.5170, 13.3050), // next door
        (48.8566, 2.3522),  // Paris
        (52.5200, 13.3100), // down the road
    ] {
        ids.push(
            post(
                &tenant,
                &poster,
                json!({"type": "checkin", "visibility": 40, "latitude": lat, "longitude": lon}),
            )
            .await?,
        );
    }
    await_events(&tenant, &searcher, &format!("users/{}/events", poster.id), 4).await?;

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?lat=52.5172&lon=13.3048&nearest=2")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    let found = rsp.json::<Value>().await?;
    assert_eq!(vec![ids[1], ids[3]], listed(&found));
    assert_eq!(Some(2), found["events_count"].as_u64());

    // A radius search, by contrast, is newest-first
    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?lat=52.5172&lon=13.3048&rad=5000")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(vec![ids[3], ids[1], ids[0]], listed(&rsp.json::<Value>().await?));

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?lat=52.5172")?
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5010], error_codes(rsp).await?);

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?lat=52.5172&lon=13.3048")?
        .send()
        .await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![3000], error_codes(rsp).await?);

    Ok(())
}

/// Location & object searches
pub async fn event_searches(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "searches").await?;
    let searcher = tenant.sign_up("looker").await?;
    let poster = tenant.sign_up("doer").await?;

    let in_berlin = post(
        &tenant,
        &poster,
        json!({"type": "checkin", "visibility": 40, "location": "berlin"}),
    )
    .await?;
    let on_target = post(
        &tenant,
        &poster,
        json!({"type": "like", "visibility": 40, "target": {"id": "track-9", "type": "track"}}),
    )
    .await?;
    await_events(&tenant, &searcher, &format!("users/{}/events", poster.id), 2).await?;

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?location=berlin")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(vec![in_berlin], listed(&rsp.json::<Value>().await?));

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?object=track-9")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(vec![on_target], listed(&rsp.json::<Value>().await?));

    let rsp = tenant
        .as_user(&searcher, Method::GET, "events?location=paris")?
        .send()
        .await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());

    let rsp = tenant.as_user(&searcher, Method::GET, "events")?.send().await?;
    assert_eq!(StatusCode::BAD_REQUEST, rsp.status());
    assert_eq!(vec![5009], error_codes(rsp).await?);

    Ok(())
}

/// The feed shows friends' connection-visible events, but not strangers'
pub async fn user_feed(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "feed").await?;
    let reader = tenant.sign_up("reader").await?;
    let friend = tenant.sign_up("pal").await?;
    let stranger = tenant.sign_up("stranger").await?;

    let rsp = tenant
        .as_user(&reader, Method::PUT, "me/friends")?
        .json(&json!({"user_to_id": friend.id, "state": "confirmed"}))
        .send()
        .await?;
    assert_eq!(StatusCode::CREATED, rsp.status());
    await_status(&tenant, &friend, "me/friends", StatusCode::OK).await?;

    let shared = post(&tenant, &friend, json!({"type": "like", "visibility": 20})).await?;
    post(&tenant, &stranger, json!({"type": "like", "visibility": 20})).await?;
    let addressed = post(
        &tenant,
        &stranger,
        json!({
            "type": "mention",
            "visibility": 10,
            "target": {"id": reader.id.to_string(), "type": "user"}
        }),
    )
    .await?;
    await_events(&tenant, &stranger, "me/events", 2).await?;

    let feed = await_events(&tenant, &reader, "me/feed", 2).await?;
    assert_eq!(vec![addressed, shared], listed(&feed));
    assert_eq!(Some(2), feed["users_count"].as_u64());

    Ok(())
}

/// Two events arrive after we last read our feed: the unread feed shows both, once
pub async fn unread_feed(url: Url) -> Result<(), Failed> {
    let tenant = Tenant::new(url, "unread").await?;
    let reader = tenant.sign_up("catching-up").await?;
    let poster = tenant.sign_up("chatterbox").await?;

    // Reading the (empty) feed sets our last-read mark...
    let rsp = tenant
        .as_user(&reader, Method::GET, "me/feed/unread")?
        .send()
        .await?;
    assert_eq!(StatusCode::NO_CONTENT, rsp.status());
    let (tenant_ref, reader_ref) = (&tenant, &reader);
    eventually(|| async move {
        let me = tenant_ref
            .as_user(reader_ref, Method::GET, "me")?
            .send()
            .await?
            .json::<Value>()
            .await?;
        Ok(me.get("last_read").map(|_| ()))
    })
    .await?;

    // ...after which two events arrive
    let first = post(&tenant, &poster, json!({"type": "post", "visibility": 40})).await?;
    let second = post(&tenant, &poster, json!({"type": "post", "visibility": 40})).await?;
    await_events(&tenant, &poster, "me/events", 2).await?;

    let rsp = tenant
        .as_user(&reader, Method::GET, "me/feed/unread/count")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    assert_eq!(
        Some(2),
        rsp.json::<Value>().await?["unread_events_count"].as_u64()
    );

    let rsp = tenant
        .as_user(&reader, Method::GET, "me/feed/unread")?
        .send()
        .await?;
    assert_eq!(StatusCode::OK, rsp.status());
    let unread = rsp.json::<Value>().await?;
    assert_eq!(vec![second, first], listed(&unread));
    assert_eq!(Some(2), unread["unread_events_count"].as_u64());

    // Having read them, they're no longer unread
    await_status(&tenant, &reader, "me/feed/unread", StatusCode::NO_CONTENT).await?;

    Ok(())
}
