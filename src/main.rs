mod broker;
mod cache;
mod cli;
mod config;
mod dispatch;
mod error;
mod models;
mod player;

use std::{process::ExitCode, sync::Arc};

use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    broker::Backoff,
    cache::{HttpFetcher, PlaylistCache},
    config::Config,
    dispatch::Dispatcher,
    error::{DaemonError, Result},
    player::{MpvPlayer, Player},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match cli::parse(std::env::args().skip(1)) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            println!("{}", cli::USAGE);
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}\n\n{}", cli::USAGE);
            return ExitCode::from(e.exit_code());
        }
    };

    init_tracing(cli.debug);

    match run(cli).await {
        Ok(()) => {
            info!("stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("caught fatal error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// RUST_LOG wins; `--debug` only changes the default.
fn default_log_directives(debug: bool) -> &'static str {
    if debug {
        "rpimusicd=debug,lapin=info"
    } else {
        "rpimusicd=info,lapin=warn"
    }
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_log_directives(debug).into());
    let json = std::env::var("RPIMUSIC_LOG_FORMAT").is_ok_and(|v| v == "json");

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();

    if debug {
        info!("Loglevel defaults to DEBUG");
    }
}

async fn run(cli: cli::Cli) -> Result<()> {
    // ── Config ───────────────────────────────────────────────────────────────
    let config = Arc::new(Config::load(&cli.config)?);
    info!("fallback url set to {}", config.fallback_playlist_url);
    info!(
        "trying to load last URL from {}",
        config.url_cache_file.display()
    );

    // ── Startup playback ─────────────────────────────────────────────────────
    let cache = PlaylistCache::new(
        config.url_cache_file.clone(),
        config.fallback_playlist_url.clone(),
    );
    let mut dispatcher = Dispatcher::new(MpvPlayer::from_config(&config), cache);
    let fetcher = HttpFetcher::new(config.fallback_fetch_timeout())?;
    dispatcher.start(&fetcher).await;

    // ── Consume until signalled or unrecoverable ─────────────────────────────
    let outcome = tokio::select! {
        r = serve(&config, &mut dispatcher) => r,
        () = shutdown_signal() => {
            info!("stopping...");
            Ok(())
        }
    };

    dispatcher.shutdown().await;
    outcome
}

/// Connect, then dispatch messages forever, reconnecting with backoff when
/// the broker goes away. Only returns on an unrecoverable error; until then
/// the last known playlist keeps playing while the broker is unreachable.
async fn serve<P: Player>(config: &Config, dispatcher: &mut Dispatcher<P>) -> Result<()> {
    let mut backoff = Backoff::from_config(config);

    loop {
        let mut inbox = dispatcher
            .connect(&mut backoff, || broker::connect(config))
            .await?;

        let outcome = dispatcher.run(&mut inbox).await;
        inbox.close().await;
        match outcome {
            Ok(()) => warn!("lost rabbitmq connection: consumer closed"),
            Err(e @ DaemonError::Broker(_)) => warn!("lost rabbitmq connection: {e}"),
            Err(e) => return Err(e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
