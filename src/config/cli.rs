use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the pagefront binary.
#[derive(Debug, Parser)]
#[command(
    name = "pagefront",
    version,
    about = "Full-page HTTP cache in front of an application server"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGEFRONT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching reverse proxy.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "listen-host", value_name = "HOST")]
    pub listen_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "listen-port", value_name = "PORT")]
    pub listen_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base URL of the application being cached.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long pages are served from the cache (0 disables caching).
    #[arg(long = "cache-max-age-seconds", value_name = "SECONDS")]
    pub cache_max_age_seconds: Option<u64>,

    /// Override the number of requests a page needs before it is cached.
    #[arg(long = "cache-min-hits", value_name = "COUNT")]
    pub cache_min_hits: Option<u32>,

    /// Override the admission sampling window.
    #[arg(long = "cache-window-seconds", value_name = "SECONDS")]
    pub cache_window_seconds: Option<u64>,

    /// Override the store namespace.
    #[arg(long = "cache-namespace", value_name = "NAME")]
    pub cache_namespace: Option<String>,

    /// Toggle caching of upstream redirects.
    #[arg(
        long = "cache-redirects",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_redirects: Option<bool>,

    /// Toggle HTML debug comments.
    #[arg(
        long = "cache-debug-annotations",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_debug_annotations: Option<bool>,
}
