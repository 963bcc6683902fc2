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

//! # tidingsd
//!
//! The tidings daemon.
//!
//! `tidingsd` reads a (TOML) configuration file, builds the store, log, limiter & applier it
//! describes, and serves the tidings HTTP API until it receives `SIGTERM` or `SIGINT`. At that
//! point it stops accepting requests, lets the applier drain & exits.
//!
//! It does not fork itself into the background; run it under a supervisor.
//!
//! ## Configuration
//!
//! ```toml
//! version = "1"
//! public-address = "0.0.0.0:20680"
//! api-version = "0.4"
//!
//! [storage.postgres]
//! url = "postgres://tidings@localhost/tidings"
//!
//! [otlp-export]
//! endpoint = "http://localhost:4318/v1/metrics"
//! ```
//!
//! Every key has a default, and a missing configuration file (at the default location) simply
//! means "run on defaults".

use std::{fmt::Display, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, ArgMatches, Command};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use serde::Deserialize;
use snafu::{prelude::*, IntoError};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};
use url::Url;

use tidings::{
    metrics::Instruments,
    tidings::{Config as ServiceConfig, Service},
};

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Unable to read {}: {source}", path.display()))]
    ConfigNotFound {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("{} is not a valid tidingsd configuration: {source}", path.display()))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("RUST_LOG could not be parsed: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Couldn't build the OTLP metrics exporter: {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("The HTTP server failed: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to start tidings: {source}"))]
    Service { source: tidings::tidings::Error },
    #[snafu(display("Failed to shut down tidings cleanly: {source}"))]
    Shutdown { source: tidings::tidings::Error },
    #[snafu(display("Couldn't install a {signal} handler: {source}"))]
    Signal {
        signal: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("A global tracing subscriber was already installed: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("No Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

// `main` returns `Result<(), Error>`, and an `Err` is printed with `Debug` on the way out; make
// that readable.
impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

const DEFAULT_CONFIG: &str = "/etc/tidings.toml";

/// What the command line (or environment) told us
struct Options {
    config: Option<PathBuf>,
    public_address: Option<SocketAddr>,
    plain: bool,
    level: Level,
}

impl From<&ArgMatches> for Options {
    fn from(matches: &ArgMatches) -> Options {
        // Most verbose wins
        let level = [
            ("debug", Level::TRACE),
            ("verbose", Level::DEBUG),
            ("quiet", Level::ERROR),
        ]
        .into_iter()
        .find_map(|(flag, level)| matches.get_flag(flag).then_some(level))
        .unwrap_or(Level::INFO);
        Options {
            config: matches.get_one::<PathBuf>("config").cloned(),
            public_address: matches.get_one::<SocketAddr>("public-address").copied(),
            plain: matches.get_flag("plain"),
            level,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpExport {
    /// Collector endpoint accepting OTLP over HTTP
    endpoint: Url,
    /// Push interval; the SDK default (sixty seconds) if not given
    #[serde(default)]
    interval: Option<Duration>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct ConfigV1 {
    public_address: SocketAddr,
    otlp_export: Option<OtlpExport>,
    #[serde(flatten)]
    service: ServiceConfig,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            public_address: SocketAddr::from(([0, 0, 0, 0], 20680)),
            otlp_export: None,
            service: ServiceConfig::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Read the configuration file
///
/// An explicitly named file must exist. The default location may be absent, in which case we run
/// on defaults.
fn load_config(named: Option<&PathBuf>) -> Result<ConfigV1> {
    let path = named
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if named.is_none() && err.kind() == io::ErrorKind::NotFound => {
            return Ok(ConfigV1::default())
        }
        Err(err) => return Err(ConfigNotFoundSnafu { path }.into_error(err)),
    };
    toml::from_str::<Configuration>(&text)
        .map(|Configuration::V1(cfg)| cfg)
        .context(ConfigParseSnafu { path })
}

/// Install the global tracing subscriber: JSON lines by default, compact text with `--plain`
fn init_logging(opts: &Options) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
        fmt::layer().compact().with_writer(io::stdout).boxed()
    } else {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(io::stdout)
            .boxed()
    };
    tracing::subscriber::set_global_default(Registry::default().with(layer).with(filter))
        .context(SubscriberSnafu)
}

/// Install the global meter provider, pushing to `export` if configured
///
/// Must run inside the Tokio runtime (the periodic reader spawns a task) & before
/// [Instruments::new].
fn init_metrics(export: Option<&OtlpExport>) -> Result<()> {
    let resource = opentelemetry_sdk::Resource::builder_empty()
        .with_attribute(KeyValue::new("service.name", "tidings"))
        .with_attribute(KeyValue::new("service.version", crate_version!()))
        .build();
    let mut builder = SdkMeterProvider::builder().with_resource(resource);
    if let Some(export) = export {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .with_endpoint(export.endpoint.as_str())
            .build()
            .context(OtlpExporterSnafu)?;
        let reader = match export.interval {
            Some(interval) => PeriodicReader::builder(exporter).with_interval(interval),
            None => PeriodicReader::builder(exporter),
        };
        builder = builder.with_reader(reader.build());
        info!("Exporting metrics to {}", export.endpoint);
    }
    global::set_meter_provider(builder.build());
    Ok(())
}

/// Serve the tidings API until SIGTERM or SIGINT
async fn serve(cfg: ConfigV1) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu {
        signal: "SIGTERM",
    })?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu { signal: "SIGINT" })?;

    init_metrics(cfg.otlp_export.as_ref())?;
    let service = Service::new(&cfg.service, Arc::new(Instruments::new("tidings")))
        .await
        .context(ServiceSnafu)?;

    let listener = TcpListener::bind(cfg.public_address)
        .await
        .context(BindSnafu {
            addr: cfg.public_address,
        })?;
    info!("Listening on {}", cfg.public_address);

    axum::serve(listener, service.router())
        .with_graceful_shutdown(async move {
            let which = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            info!("Received {which}; shutting down.");
        })
        .await
        .context(ServeSnafu)?;

    debug!("HTTP server stopped; draining the applier.");
    service.shutdown().await.context(ShutdownSnafu)
}

async fn run(opts: Options) -> Result<()> {
    let mut cfg = load_config(opts.config.as_ref())?;
    if let Some(addr) = opts.public_address {
        cfg.public_address = addr;
    }
    init_logging(&opts)?;
    info!("tidingsd {} starting.", crate_version!());
    serve(cfg)
        .await
        .inspect(|_| info!("tidingsd exiting."))
        .inspect_err(|err| error!("{err}"))
}

/// A boolean switch with an environment variable fallback
fn flag(name: &'static str, short: char, env: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .short(short)
        .long(name)
        .action(ArgAction::SetTrue)
        .env(env)
        .help(help)
}

fn cli() -> Command {
    Command::new("tidingsd")
        .version(crate_version!())
        .author(crate_authors!())
        .about("A multi-tenant social activity backend")
        .long_about(
            "tidingsd serves the tidings API: organizations & their applications, each \
             application's users, the connections between them & the events they post. Most \
             settings live in the configuration file; the options here say where to find it \
             & how to log.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .env("TIDINGS_CONFIG")
                .help(format!("configuration file (default {DEFAULT_CONFIG})")),
        )
        .arg(
            Arg::new("public-address")
                .short('a')
                .long("public-address")
                .value_parser(value_parser!(SocketAddr))
                .env("TIDINGS_PUBLIC_ADDRESS")
                .help("address:port on which to listen, overriding the configuration file"),
        )
        .arg(flag("debug", 'D', "TIDINGS_DEBUG", "log everything"))
        .arg(flag("verbose", 'v', "TIDINGS_VERBOSE", "log at debug level"))
        .arg(flag("quiet", 'q', "TIDINGS_QUIET", "log errors only"))
        .arg(flag("plain", 'p', "TIDINGS_PLAIN", "log plain text rather than JSON"))
}

fn main() -> Result<()> {
    let opts = Options::from(&cli().get_matches());
    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(run(opts))
}
