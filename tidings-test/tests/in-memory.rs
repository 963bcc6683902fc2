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

//! # in-memory
//!
//! Integration tests run against a tidings instance configured with the in-memory store, log &
//! rate limiter, served in-process on an ephemeral port.

use std::{io, net::SocketAddr, process::ExitCode, sync::Arc};

use futures::future::FutureExt;
use itertools::Itertools;
use libtest_mimic::{Arguments, Trial};
use reqwest::Url;
use snafu::{prelude::*, Snafu};
use tokio::{net::TcpListener, runtime::Runtime};
use tracing::{debug, error};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use tidings::{
    metrics::Instruments,
    password::Params,
    rate_limit::Limits,
    tidings::{Config, Service},
};
use tidings_test::{connections, events, hygiene, test_healthcheck, users};

use common::{Configuration, Test};

mod common;

#[derive(Snafu)]
enum Error {
    #[snafu(display("Failed to bind a listener: {source}"))]
    Bind { source: std::io::Error },
    #[snafu(display("Error obtaining test configuration: {source}"))]
    Configuration { source: common::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    Filter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to build a tokio runtime: {source}"))]
    Runtime { source: std::io::Error },
    #[snafu(display("Failed to start tidings: {source}"))]
    Service { source: tidings::tidings::Error },
    #[snafu(display("Failed to set the global tracing subscriber: {source}"))]
    SetGlobalDefault {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to form the API URL: {source}"))]
    Url { source: url::ParseError },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Start tidings on an ephemeral port; return the service & the address at which it's listening
async fn start(cfg: &Configuration) -> Result<(Service, SocketAddr)> {
    let config = Config {
        rate_limits: Limits {
            staging: cfg.staging_limit,
            ..Limits::default()
        },
        // Hashing passwords properly would dominate the test run
        password: Params::insecure(),
        ..Config::default()
    };
    let service = Service::new(&config, Arc::new(Instruments::new("tidings")))
        .await
        .context(ServiceSnafu)?;
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context(BindSnafu)?;
    let addr = listener.local_addr().context(BindSnafu)?;
    let router = service.router();
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            error!("The test server failed: {}", err);
        }
    });
    Ok((service, addr))
}

inventory::submit!(Test {
    name: "000healthcheck",
    test_fn: |url| test_healthcheck(url).boxed(),
});

inventory::submit!(Test {
    name: "010register_and_login",
    test_fn: |url| users::register_and_login(url).boxed(),
});

inventory::submit!(Test {
    name: "011login_round_trip",
    test_fn: |url| users::login_round_trip(url).boxed(),
});

inventory::submit!(Test {
    name: "012duplicate_signup",
    test_fn: |url| users::duplicate_signup(url).boxed(),
});

inventory::submit!(Test {
    name: "013refresh_and_logout",
    test_fn: |url| users::refresh_and_logout(url).boxed(),
});

inventory::submit!(Test {
    name: "014user_search",
    test_fn: |url| users::user_search(url).boxed(),
});

inventory::submit!(Test {
    name: "015update_and_delete",
    test_fn: |url| users::update_and_delete(url).boxed(),
});

inventory::submit!(Test {
    name: "020friend_mirror",
    test_fn: |url| connections::friend_mirror(url).boxed(),
});

inventory::submit!(Test {
    name: "021reconnect",
    test_fn: |url| connections::reconnect(url).boxed(),
});

inventory::submit!(Test {
    name: "022follow",
    test_fn: |url| connections::follow(url).boxed(),
});

inventory::submit!(Test {
    name: "023invalid_connections",
    test_fn: |url| connections::invalid_connections(url).boxed(),
});

inventory::submit!(Test {
    name: "024social_connect",
    test_fn: |url| connections::social_connect(url).boxed(),
});

inventory::submit!(Test {
    name: "025connections_by_state",
    test_fn: |url| connections::connections_by_state(url).boxed(),
});

inventory::submit!(Test {
    name: "026connection_events",
    test_fn: |url| connections::connection_events(url).boxed(),
});

inventory::submit!(Test {
    name: "030event_lifecycle",
    test_fn: |url| events::event_lifecycle(url).boxed(),
});

inventory::submit!(Test {
    name: "031event_visibility",
    test_fn: |url| events::event_visibility(url).boxed(),
});

inventory::submit!(Test {
    name: "032geo_nearest",
    test_fn: |url| events::geo_nearest(url).boxed(),
});

inventory::submit!(Test {
    name: "033event_searches",
    test_fn: |url| events::event_searches(url).boxed(),
});

inventory::submit!(Test {
    name: "034user_feed",
    test_fn: |url| events::user_feed(url).boxed(),
});

inventory::submit!(Test {
    name: "035unread_feed",
    test_fn: |url| events::unread_feed(url).boxed(),
});

inventory::submit!(Test {
    name: "040request_ids",
    test_fn: |url| hygiene::request_ids(url).boxed(),
});

inventory::submit!(Test {
    name: "041bad_credentials",
    test_fn: |url| hygiene::bad_credentials(url).boxed(),
});

inventory::submit!(Test {
    name: "042request_validation",
    test_fn: |url| hygiene::request_validation(url).boxed(),
});

inventory::submit!(Test {
    name: "043rate_limit",
    test_fn: |url| hygiene::rate_limit(url).boxed(),
});

// Exits with status zero on test success, 101 on test failure & 1 on error (e.g. failing to start
// the server).
fn main() -> Result<ExitCode> {
    let config = Configuration::new().context(ConfigurationSnafu)?;

    if config.logging {
        let filter = EnvFilter::builder()
            .with_default_directive(config.log_level.into())
            .from_env()
            .context(FilterSnafu)?;
        tracing::subscriber::set_global_default(
            Registry::default()
                .with(fmt::Layer::default().compact().with_writer(io::stdout))
                .with(filter),
        )
        .context(SetGlobalDefaultSnafu)?;
    }

    let rt = Arc::new(Runtime::new().context(RuntimeSnafu)?);
    let (service, addr) = rt.block_on(start(&config))?;
    let api = Url::parse(&format!("http://{}/{}/", addr, service.state().api_version))
        .context(UrlSnafu)?;
    debug!("tidings is listening at {}", api);

    // Every test provisions its own tenant, so they may run concurrently
    let args = Arguments::from_args();
    let conclusion = libtest_mimic::run(
        &args,
        inventory::iter::<Test>
            .into_iter()
            .sorted_by_key(|t| t.name)
            .map(|test| {
                let rt = rt.clone();
                let api = api.clone();
                Trial::test(test.name, move || rt.block_on((test.test_fn)(api)))
            })
            .collect(),
    );

    if let Err(err) = rt.block_on(service.shutdown()) {
        error!("Failed to shut down tidings cleanly: {}", err);
    }

    Ok(conclusion.exit_code())
}
