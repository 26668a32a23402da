use dotenvy::dotenv;
use salvo::prelude::*;
use tracing::{info, warn};

use crate::config::{Config, DecodeMode};
use crate::handlers;
use crate::relay::{RelayOptions, StreamRelay};
use crate::state::{set_app_state, AppState, ConnectionRegistry, RateLimiter};
use crate::upstream::UpstreamClient;
use crate::utils::init_tracing;

pub async fn run() {
    let _ = dotenv();
    let config = load_config_or_exit();
    init_tracing(&config.log_level);
    warn_if_key_missing(&config);

    let upstream = build_upstream_or_exit(config.clone());
    let relay = StreamRelay::new(upstream.clone(), RelayOptions::from_config(&config));
    set_app_state(AppState {
        config: config.clone(),
        upstream,
        relay,
        connections: ConnectionRegistry::new(),
        rate_limiter: RateLimiter::new(
            config.rate_limit_max_messages,
            config.rate_limit_window_secs,
            config.rate_limit_cleanup_interval_secs,
        ),
    });

    info!(
        "Chat gateway ({} mode, model {}) starting on {}:{}",
        config.decode_mode_name(),
        config.model,
        config.host,
        config.port
    );

    let acceptor = TcpListener::new((config.host.as_str(), config.port)).bind().await;
    Server::new(acceptor).serve(handlers::router()).await;
}

fn load_config_or_exit() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Configuration Error: {error}");
            std::process::exit(1);
        }
    }
}

fn warn_if_key_missing(config: &Config) {
    if config.decode_mode == DecodeMode::Sse && config.upstream_api_key.is_none() {
        warn!("UPSTREAM_API_KEY not set. Requests to the OpenAI-compatible backend will be sent unauthenticated.");
    }
}

fn build_upstream_or_exit(config: Config) -> UpstreamClient {
    match UpstreamClient::new(config) {
        Ok(upstream) => upstream,
        Err(error) => {
            eprintln!("Initialization Error: {error}");
            std::process::exit(1);
        }
    }
}
