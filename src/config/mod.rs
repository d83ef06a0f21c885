//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, time::Duration};

use axum::http::HeaderName;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagefront";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:3000";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 600;
const DEFAULT_CACHE_MIN_HITS: u32 = 2;
const DEFAULT_CACHE_WINDOW_SECS: u64 = 120;
const DEFAULT_CACHE_NAMESPACE: &str = "page_cache";
const DEFAULT_CACHE_CONTENT_ID_PARAM: &str = "p";
const DEFAULT_CACHE_GENLOCK_TTL_SECS: u64 = 10;
const DEFAULT_CACHE_EXPIRY_SLACK_SECS: u64 = 30;
const DEFAULT_CACHE_VARY_TTL_SLACK_SECS: u64 = 10;
const DEFAULT_CACHE_MAX_BODY_BYTES: u64 = 8 * 1024 * 1024;
const DEFAULT_NEVER_PERSIST_HEADERS: &[&str] = &["transfer-encoding"];

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: Url,
    pub timeout: Duration,
}

/// Validated `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_age_seconds: u64,
    pub send_to_remote_store: bool,
    pub min_hits: u32,
    pub window_seconds: u64,
    pub store_namespace: String,
    pub cache_redirects: bool,
    pub never_persist_headers: Vec<String>,
    pub debug_annotations: bool,
    pub send_validator_headers: bool,
    pub exempt_cookies: Vec<String>,
    pub bypass_cookies: Vec<String>,
    pub bypass_cookie_prefixes: Vec<String>,
    pub always_send_headers: BTreeMap<String, Vec<String>>,
    pub content_id_param: String,
    pub genlock_ttl_seconds: u64,
    pub expiry_slack_seconds: u64,
    pub vary_ttl_slack_seconds: u64,
    pub max_body_bytes: usize,
    /// Request headers that each become a vary dimension.
    pub vary_headers: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PAGEFRONT").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.listen_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.listen_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.url = Some(url.clone());
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(seconds) = overrides.cache_max_age_seconds {
            self.cache.max_age_seconds = Some(seconds);
        }
        if let Some(hits) = overrides.cache_min_hits {
            self.cache.min_hits = Some(hits);
        }
        if let Some(seconds) = overrides.cache_window_seconds {
            self.cache.window_seconds = Some(seconds);
        }
        if let Some(namespace) = overrides.cache_namespace.as_ref() {
            self.cache.store_namespace = Some(namespace.clone());
        }
        if let Some(enabled) = overrides.cache_redirects {
            self.cache.cache_redirects = Some(enabled);
        }
        if let Some(enabled) = overrides.cache_debug_annotations {
            self.cache.debug_annotations = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            upstream,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let listen_addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.listen_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        listen_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .url
        .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .map_err(|err| LoadError::invalid("upstream.url", format!("failed to parse: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = upstream
        .timeout_seconds
        .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let store_namespace = cache
        .store_namespace
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_CACHE_NAMESPACE.to_string());
    if store_namespace.is_empty() {
        return Err(LoadError::invalid(
            "cache.store_namespace",
            "must not be empty",
        ));
    }

    let content_id_param = cache
        .content_id_param
        .unwrap_or_else(|| DEFAULT_CACHE_CONTENT_ID_PARAM.to_string());
    if content_id_param.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.content_id_param",
            "must not be empty",
        ));
    }

    let genlock_ttl_seconds = cache
        .genlock_ttl_seconds
        .unwrap_or(DEFAULT_CACHE_GENLOCK_TTL_SECS);
    if genlock_ttl_seconds == 0 {
        return Err(LoadError::invalid(
            "cache.genlock_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let max_body_bytes_value = cache
        .max_body_bytes
        .unwrap_or(DEFAULT_CACHE_MAX_BODY_BYTES);
    if max_body_bytes_value == 0 {
        return Err(LoadError::invalid(
            "cache.max_body_bytes",
            "must be greater than zero",
        ));
    }
    let max_body_bytes = usize::try_from(max_body_bytes_value).map_err(|_| {
        LoadError::invalid(
            "cache.max_body_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let never_persist_headers = cache
        .never_persist_headers
        .unwrap_or_else(|| {
            DEFAULT_NEVER_PERSIST_HEADERS
                .iter()
                .map(|name| name.to_string())
                .collect()
        })
        .into_iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    validate_header_names("cache.never_persist_headers", never_persist_headers.iter())?;

    let always_send_headers = cache.always_send_headers.unwrap_or_default();
    validate_header_names("cache.always_send_headers", always_send_headers.keys())?;

    let vary_headers = cache
        .vary_headers
        .unwrap_or_default()
        .into_iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .collect::<Vec<_>>();
    validate_header_names("cache.vary_headers", vary_headers.iter())?;

    Ok(CacheSettings {
        max_age_seconds: cache.max_age_seconds.unwrap_or(DEFAULT_CACHE_MAX_AGE_SECS),
        send_to_remote_store: cache.send_to_remote_store.unwrap_or(true),
        min_hits: cache.min_hits.unwrap_or(DEFAULT_CACHE_MIN_HITS),
        window_seconds: cache.window_seconds.unwrap_or(DEFAULT_CACHE_WINDOW_SECS),
        store_namespace,
        cache_redirects: cache.cache_redirects.unwrap_or(false),
        never_persist_headers,
        debug_annotations: cache.debug_annotations.unwrap_or(false),
        send_validator_headers: cache.send_validator_headers.unwrap_or(true),
        exempt_cookies: cache.exempt_cookies.unwrap_or_default(),
        bypass_cookies: cache.bypass_cookies.unwrap_or_default(),
        bypass_cookie_prefixes: cache.bypass_cookie_prefixes.unwrap_or_default(),
        always_send_headers,
        content_id_param,
        genlock_ttl_seconds,
        expiry_slack_seconds: cache
            .expiry_slack_seconds
            .unwrap_or(DEFAULT_CACHE_EXPIRY_SLACK_SECS),
        vary_ttl_slack_seconds: cache
            .vary_ttl_slack_seconds
            .unwrap_or(DEFAULT_CACHE_VARY_TTL_SLACK_SECS),
        max_body_bytes,
        vary_headers,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_age_seconds: Option<u64>,
    send_to_remote_store: Option<bool>,
    min_hits: Option<u32>,
    window_seconds: Option<u64>,
    store_namespace: Option<String>,
    cache_redirects: Option<bool>,
    never_persist_headers: Option<Vec<String>>,
    debug_annotations: Option<bool>,
    send_validator_headers: Option<bool>,
    exempt_cookies: Option<Vec<String>>,
    bypass_cookies: Option<Vec<String>>,
    bypass_cookie_prefixes: Option<Vec<String>>,
    always_send_headers: Option<BTreeMap<String, Vec<String>>>,
    content_id_param: Option<String>,
    genlock_ttl_seconds: Option<u64>,
    expiry_slack_seconds: Option<u64>,
    vary_ttl_slack_seconds: Option<u64>,
    max_body_bytes: Option<u64>,
    vary_headers: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn validate_header_names<'a>(
    key: &'static str,
    names: impl Iterator<Item = &'a String>,
) -> Result<(), LoadError> {
    for name in names {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| LoadError::invalid(key, format!("`{name}` is not a valid header name")))?;
    }
    Ok(())
}
