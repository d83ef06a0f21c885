use std::{process, sync::Arc, time::Duration};

use axum::{Router, middleware::from_fn_with_state};
use pagefront::{
    cache::{CacheConfig, PageCache, PageCacheState, VaryFunction, page_cache_layer},
    config,
    error::AppError,
    infra::{
        error::InfraError,
        memory_store::MemoryStore,
        telemetry,
        upstream::{Upstream, proxy_handler},
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = Arc::new(MemoryStore::default());
    let cache = build_page_cache(&settings.cache, store.clone())?;
    let upstream = Upstream::new(&settings.upstream)?;

    info!(
        listen = %settings.server.listen_addr,
        upstream = %upstream.base_url(),
        enabled = cache.config().is_enabled(),
        max_age_seconds = cache.config().max_age_seconds,
        min_hits = cache.config().min_hits,
        "starting page cache"
    );

    let purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                info!(purged, "purged expired cache values");
            }
        }
    });

    let router = Router::new()
        .fallback(proxy_handler)
        .with_state(upstream)
        .layer(from_fn_with_state(
            PageCacheState::new(cache),
            page_cache_layer,
        ));

    let result = serve_http(&settings, router).await;

    purge_handle.abort();
    let _ = purge_handle.await;

    result
}

fn build_page_cache(
    settings: &config::CacheSettings,
    store: Arc<MemoryStore>,
) -> Result<PageCache, AppError> {
    let mut builder = PageCache::builder(CacheConfig::from(settings), store);
    for header in &settings.vary_headers {
        builder = builder.vary(VaryFunction::header(header)?)?;
    }
    Ok(builder.build())
}

async fn serve_http(settings: &config::Settings, router: Router) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let grace = settings.server.graceful_shutdown;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!(grace_seconds = grace.as_secs(), "shutdown requested");

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!("graceful shutdown timed out");
        process::exit(1);
    });
}
