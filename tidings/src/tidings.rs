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

//! # The tidings service
//!
//! [Tidings] is the application state every handler & middleware shares: the [store], the
//! [identity cache], the [rate limiter], the [dispatcher] & so on. It is built once, at startup,
//! from a [Config], and handed to axum as router state; there are no process-wide singletons.
//!
//! [Service] owns the state along with the background work that goes with it (the [applier] & the
//! [last-read] worker), so that whoever boots tidings (the daemon, or the integration tests) can
//! shut it all down again in an orderly way.
//!
//! [store]: crate::storage
//! [identity cache]: crate::identity_cache
//! [rate limiter]: crate::rate_limit
//! [dispatcher]: crate::dispatcher
//! [applier]: crate::applier
//! [last-read]: crate::last_read

use std::{sync::Arc, time::Duration};

use axum::Router;
use serde::Deserialize;
use snafu::prelude::*;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    applier,
    dispatcher::Dispatcher,
    flake::{self, Flake},
    http::make_router,
    identity_cache::IdentityCache,
    last_read::LastRead,
    memory,
    metrics::Instruments,
    ordered_log::{self, Log},
    password, postgres,
    rate_limit::{self, Limiter, Limits},
    storage::Store,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to shut down the applier: {source}"))]
    Applier { source: applier::Error },
    #[snafu(display("Failed to connect to {url}: {source}"))]
    Connect { url: String, source: sqlx::Error },
    #[snafu(display("Failed to build the id generator: {source}"))]
    Flake { source: flake::Error },
    #[snafu(display("Failed to set up the ordered log: {source}"))]
    Log { source: ordered_log::Error },
    #[snafu(display("Failed to set up the rate limiter: {source}"))]
    RateLimiter { source: rate_limit::Error },
    #[snafu(display("Failed to set up the Postgres store: {source}"))]
    Store { source: postgres::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn default_max_connections() -> u32 {
    16
}

fn default_shards() -> u32 {
    4
}

/// Where entities (& the rate limiter's buckets) live
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageConfig {
    /// In process; nothing survives a restart
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(rename = "max-connections", default = "default_max_connections")]
        max_connections: u32,
    },
}

/// Where the ordered log lives
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogConfig {
    Memory {
        #[serde(default = "default_shards")]
        shards: u32,
    },
    Postgres {
        url: String,
        #[serde(default = "default_shards")]
        shards: u32,
    },
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::Memory {
            shards: default_shards(),
        }
    }
}

/// Service configuration; every field has a default
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The path prefix for every API route
    #[serde(rename = "api-version")]
    pub api_version: String,
    /// This instance's flake node id, in [0, 1024)
    #[serde(rename = "node-id")]
    pub node_id: u16,
    pub storage: StorageConfig,
    pub log: LogConfig,
    #[serde(rename = "rate-limits")]
    pub rate_limits: Limits,
    pub password: password::Params,
    pub applier: applier::Config,
    #[serde(rename = "identity-cache-size")]
    pub identity_cache_size: usize,
    #[serde(rename = "last-read-queue-depth")]
    pub last_read_queue_depth: usize,
    /// How long a request may take before we give up on it
    #[serde(rename = "request-timeout")]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_version: "0.4".to_owned(),
            node_id: 0,
            storage: StorageConfig::default(),
            log: LogConfig::default(),
            rate_limits: Limits::default(),
            password: password::Params::default(),
            applier: applier::Config::default(),
            identity_cache_size: 1024,
            last_read_queue_depth: 1024,
            request_timeout: Duration::from_secs(30),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        Application state                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Tidings {
    pub api_version: String,
    pub store: Store,
    pub cache: Arc<IdentityCache>,
    pub limiter: Arc<dyn Limiter + Send + Sync>,
    pub limits: Limits,
    pub dispatcher: Dispatcher,
    pub flake: Flake,
    pub password: password::Params,
    pub last_read: LastRead,
    pub request_timeout: Duration,
    pub instruments: Arc<Instruments>,
}

impl Tidings {
    /// The path at which the current user's event `id` may be found
    pub fn event_location(&self, id: impl std::fmt::Display) -> String {
        format!("/{}/me/events/{}", self.api_version, id)
    }
}

async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context(ConnectSnafu {
            url: url.to_owned(),
        })
}

/// Select the store & limiter backends; they share a connection pool when both are in Postgres
async fn select_storage(
    config: &StorageConfig,
) -> Result<(Store, Arc<dyn Limiter + Send + Sync>)> {
    match config {
        StorageConfig::Memory => Ok((
            Store::new(Arc::new(memory::InMemory::new())),
            Arc::new(rate_limit::InMemory::new()),
        )),
        StorageConfig::Postgres {
            url,
            max_connections,
        } => {
            let pool = connect(url, *max_connections).await?;
            let store = postgres::Postgres::new(pool.clone())
                .await
                .context(StoreSnafu)?;
            let limiter = rate_limit::Postgres::new(pool)
                .await
                .context(RateLimiterSnafu)?;
            Ok((Store::new(Arc::new(store)), Arc::new(limiter)))
        }
    }
}

async fn select_log(config: &LogConfig) -> Result<Arc<dyn Log + Send + Sync>> {
    match config {
        LogConfig::Memory { shards } => Ok(Arc::new(
            ordered_log::InMemory::new(*shards).context(LogSnafu)?,
        )),
        LogConfig::Postgres { url, shards } => {
            let pool = connect(url, default_max_connections()).await?;
            Ok(Arc::new(
                ordered_log::Postgres::new(pool, *shards)
                    .await
                    .context(LogSnafu)?,
            ))
        }
    }
}

/// A running tidings instance, less its HTTP listener
pub struct Service {
    state: Arc<Tidings>,
    applier: applier::Processor,
    last_read: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl Service {
    /// Build the application state described by `config` & start its background work
    pub async fn new(config: &Config, instruments: Arc<Instruments>) -> Result<Service> {
        let (store, limiter) = select_storage(&config.storage).await?;
        let log = select_log(&config.log).await?;
        let cache = Arc::new(IdentityCache::new(
            store.clone(),
            config.identity_cache_size,
            instruments.clone(),
        ));
        let (last_read, last_read_worker) = LastRead::spawn(
            store.clone(),
            config.last_read_queue_depth,
            instruments.clone(),
        );
        let applier = applier::new(
            log.clone(),
            applier::Context {
                store: store.clone(),
                cache: cache.clone(),
                instruments: instruments.clone(),
            },
            config.applier.clone(),
        );
        let state = Arc::new(Tidings {
            api_version: config.api_version.clone(),
            store,
            cache,
            limiter,
            limits: config.rate_limits.clone(),
            dispatcher: Dispatcher::new(log, instruments.clone()),
            flake: Flake::new(config.node_id).context(FlakeSnafu)?,
            password: config.password,
            last_read,
            request_timeout: config.request_timeout,
            instruments,
        });
        info!(
            "tidings {} is up with {} log shards",
            config.api_version,
            match &config.log {
                LogConfig::Memory { shards } | LogConfig::Postgres { shards, .. } => *shards,
            }
        );
        Ok(Service {
            state,
            applier,
            last_read: last_read_worker,
            shutdown_timeout: config.applier.shutdown_timeout,
        })
    }
    pub fn state(&self) -> Arc<Tidings> {
        self.state.clone()
    }
    /// The complete HTTP interface
    pub fn router(&self) -> Router {
        make_router(self.state.clone())
    }
    /// Stop the applier (waiting for its consumers to finish) & the last-read worker
    pub async fn shutdown(self) -> Result<()> {
        self.last_read.abort();
        self.applier
            .shutdown(self.shutdown_timeout)
            .await
            .context(ApplierSnafu)
    }
}
