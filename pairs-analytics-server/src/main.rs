use crate::{
    config::ServerConfig,
    feed::{Backoff, trade_frames},
    outbound::{ServerMessage, publish, start_websocket_server},
};
use pairs_analytics::{
    EngineConfig, PairKey, PairsService, ingest::spawn_ingest, store::SqliteSeriesStore,
};
use smol_str::SmolStr;
use std::sync::Arc;
use tokio::{sync::broadcast, time::interval};
use tracing::{debug, error, info, warn};

mod config;
mod feed;
mod outbound;

#[tokio::main]
async fn main() {
    init_logging();

    info!("Starting pairs-analytics server");

    let config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    if !engine_config.intervals.contains(&config.analytics_interval) {
        warn!(
            interval = %config.analytics_interval,
            "analytics interval is not aggregated, snapshots will never be ready"
        );
    }
    info!(?config, "server configuration");

    let store = match SqliteSeriesStore::open(&config.db_path) {
        Ok(store) => store,
        Err(error) => {
            error!(path = %config.db_path.display(), %error, "failed to open series store");
            return;
        }
    };
    let service = Arc::new(PairsService::new(engine_config, Arc::new(store)));

    // Downstream WebSocket broadcast
    info!("WebSocket broadcast buffer size: {}", config.broadcast_buffer);
    let (tx, _rx) = broadcast::channel::<String>(config.broadcast_buffer.max(1));
    let tx = Arc::new(tx);

    let server_addr = config.listen_addr;
    let server_tx = Arc::clone(&tx);
    tokio::spawn(async move {
        if let Err(error) = start_websocket_server(server_addr, server_tx).await {
            error!(%server_addr, %error, "WebSocket server stopped");
        }
    });
    info!("WebSocket server listening on ws://{}", server_addr);

    // One ingestion task per upstream symbol stream
    for symbol in &config.symbols {
        let url = config.feed_url_for(symbol);
        let frames = trade_frames(
            url,
            config.frame_buffer,
            Backoff::new(config.reconnect_initial, config.reconnect_max),
        );
        spawn_ingest(Arc::clone(&service), symbol.clone(), frames);
    }

    tokio::spawn(forward_bars(Arc::clone(&service), Arc::clone(&tx)));
    tokio::spawn(refresh_loop(
        Arc::clone(&service),
        Arc::clone(&tx),
        config.clone(),
    ));
    tokio::spawn(status_loop(Arc::clone(&service), Arc::clone(&tx), config));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(error) => error!(%error, "failed to listen for shutdown signal"),
    }

    let flushed = service.flush();
    let pending = service.retry_pending_writes();
    let health = service.health();
    info!(
        flushed = flushed.len(),
        retried = pending,
        pending_bars = health.pending_bars,
        dropped_bars = health.dropped_bars,
        deferred_late_ticks = health.deferred_late_ticks,
        "Flushed open bars, shutting down"
    );
}

/// Relay every sealed or corrected bar to downstream clients.
async fn forward_bars(service: Arc<PairsService>, tx: Arc<broadcast::Sender<String>>) {
    let mut bars = service.aggregator().subscribe();
    loop {
        match bars.recv().await {
            Ok(bar) => {
                debug!(series = %bar.key(), bucket_start = %bar.bucket_start, "bar published");
                publish(&tx, &ServerMessage::Bar { bar: &bar });
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "bar listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Recompute every configured pair on a fixed cadence and broadcast the results.
async fn refresh_loop(
    service: Arc<PairsService>,
    tx: Arc<broadcast::Sender<String>>,
    config: ServerConfig,
) {
    let mut timer = interval(config.refresh_interval);
    loop {
        timer.tick().await;

        for (symbol_x, symbol_y) in &config.pairs {
            refresh_pair(&service, &tx, &config, symbol_x, symbol_y).await;
        }
    }
}

async fn refresh_pair(
    service: &PairsService,
    tx: &broadcast::Sender<String>,
    config: &ServerConfig,
    symbol_x: &SmolStr,
    symbol_y: &SmolStr,
) {
    let interval = config.analytics_interval;
    match service
        .snapshot(symbol_x, symbol_y, interval, config.window_len)
        .await
    {
        Ok(snapshot) => {
            debug!(
                pair = %snapshot.key,
                hedge_ratio = snapshot.regression.hedge_ratio,
                is_valid = snapshot.regression.is_valid,
                latest_z = ?snapshot.latest_z,
                "refreshed snapshot"
            );
            publish(tx, &ServerMessage::Snapshot { snapshot: &snapshot });

            if let Some(alert) = &snapshot.alert {
                info!(
                    pair = %snapshot.key,
                    z = alert.z,
                    direction = ?alert.direction,
                    "spread alert"
                );
                publish(
                    tx,
                    &ServerMessage::Alert {
                        pair: &snapshot.key,
                        alert,
                    },
                );
            }
        }
        Err(error) => {
            let window_len = match config.window_len {
                0 => service.config().default_window,
                window_len => window_len,
            };
            let pair = PairKey::new(symbol_x.clone(), symbol_y.clone(), interval, window_len);
            publish(tx, &ServerMessage::not_ready(&pair, &error));
        }
    }
}

/// Periodically retry pending writes and report ingestion health.
async fn status_loop(
    service: Arc<PairsService>,
    tx: Arc<broadcast::Sender<String>>,
    config: ServerConfig,
) {
    let mut timer = interval(config.status_interval);
    loop {
        timer.tick().await;

        let task_service = Arc::clone(&service);
        let retried = tokio::task::spawn_blocking(move || task_service.retry_pending_writes())
            .await
            .unwrap_or_else(|error| {
                error!(%error, "pending write retry failed");
                0
            });
        let health = service.health();

        for symbol in health.symbols.iter().filter(|symbol| !symbol.has_recent_ticks) {
            warn!(
                symbol = %symbol.symbol,
                last_received_at = ?symbol.last_received_at,
                "no recent ticks"
            );
        }
        info!(
            symbols = health.symbols.len(),
            retried,
            pending_bars = health.pending_bars,
            dropped_bars = health.dropped_bars,
            rejected_events = health.rejected_events,
            late_corrected = health.late_corrected,
            late_dropped = health.late_dropped,
            deferred_late_ticks = health.deferred_late_ticks,
            cached_snapshots = health.cached_snapshots,
            clients = tx.receiver_count(),
            "status"
        );
        publish(&tx, &ServerMessage::Health { health: &health });
    }
}

/// Initialize logging, `LOG_FORMAT=json` switches to JSON output.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
