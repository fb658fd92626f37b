use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use teltonika_parser_service::broker::{LapinPublisher, Publisher};
use teltonika_parser_service::command::{CommandSender, NoReplySweeper, PgCommandStore, ResponseHandler};
use teltonika_parser_service::config::{Config, DataTransferMode};
use teltonika_parser_service::connection::{ConnectionConfig, ConnectionDeps};
use teltonika_parser_service::csv_sink::CsvSink;
use teltonika_parser_service::directory::DeviceDirectory;
use teltonika_parser_service::enrich::RecordEnricher;
use teltonika_parser_service::health::{self, HealthState};
use teltonika_parser_service::listener::{Listener, ListenerConfig};
use teltonika_parser_service::load_reporter::{Counters, LoadReporter};
use teltonika_parser_service::location::PostgisLocationReference;
use teltonika_parser_service::mapping::{DbMappingSource, MappingCache, MappingSource};
use teltonika_parser_service::shutdown::Shutdown;

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let config_path =
        std::env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: failed to load configuration from {config_path}: {e}");
            return std::process::ExitCode::from(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    info!("starting teltonika parser service, node_id={}", config.system.node_id);

    if let Err(e) = run(config).await {
        error!("fatal error: {e}");
        return std::process::ExitCode::from(2);
    }

    std::process::ExitCode::SUCCESS
}

async fn run(config: Config) -> teltonika_parser_service::error::Result<()> {
    let shutdown = Shutdown::new();

    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.pool_size + config.database.pool_overflow)
        .connect(&config.database.connection_url())
        .await?;

    let mapping_source: Box<dyn MappingSource> = match &config.unit_io_mapping.csv_fixture_path {
        Some(path) => Box::new(teltonika_parser_service::mapping::CsvMappingSource::load(path)?),
        None => Box::new(DbMappingSource::new(db_pool.clone())),
    };
    let mapping_cache = Arc::new(MappingCache::new(
        mapping_source,
        (&config.unit_io_mapping).into(),
    ));

    let location = Arc::new(PostgisLocationReference::new(db_pool.clone()));
    let enricher = Arc::new(RecordEnricher::new(
        Some(location),
        config.location.max_distance_km,
    ));

    let directory = DeviceDirectory::new();

    let publisher: Arc<dyn Publisher> = match config.data_transfer_mode.mode {
        DataTransferMode::Rabbitmq => {
            let publisher = Arc::new(LapinPublisher::new(
                config.rabbitmq.amqp_url(),
                config.rabbitmq.exchange.clone(),
                config.system.node_id.clone(),
                Duration::from_secs(config.rabbitmq.publish_timeout_secs),
                Duration::from_secs(config.rabbitmq.reconnect_timeout_secs),
                Duration::from_secs(config.rabbitmq.startup_backoff_cap_secs),
            ));
            publisher.connect_with_backoff().await?;
            publisher
        }
        DataTransferMode::Logs => Arc::new(CsvSink::new(".")),
    };

    let command_store = PgCommandStore::new(db_pool.clone());
    let response_handler = Arc::new(ResponseHandler::new(
        command_store,
        chrono::Duration::seconds(config.command.unsolicited_grace_secs as i64),
    ));

    let conn_config = Arc::new(ConnectionConfig {
        read_timeout: Duration::from_secs(config.teltonika_protocol.read_timeout_secs),
        max_packet_size: config.tcp_server.max_packet_size,
        tcp_keepalive_idle: Duration::from_secs(config.teltonika_protocol.tcp_keepalive_idle_secs),
        tcp_keepalive_interval: Duration::from_secs(
            config.teltonika_protocol.tcp_keepalive_interval_secs,
        ),
        tcp_keepalive_count: config.teltonika_protocol.tcp_keepalive_count,
    });

    let counters = Arc::new(Counters::default());

    let deps = ConnectionDeps {
        mapping: mapping_cache,
        enricher,
        publisher,
        directory: directory.clone(),
        command_responses: response_handler,
        config: conn_config,
        shutdown: shutdown.token(),
        counters: counters.clone(),
    };

    let health_state = HealthState::new(
        directory.clone(),
        Duration::from_secs(config.monitor.broker_disconnect_grace_secs),
    );
    let health_router = health::router(health_state.clone());
    let health_listener =
        tokio::net::TcpListener::bind((config.server.ip.as_str(), config.server.health_port)).await?;

    let tracker = shutdown.tracker();

    tracker.spawn(async move {
        if let Err(e) = axum::serve(health_listener, health_router).await {
            warn!("health server exited: {e}");
        }
    });

    {
        let token = shutdown.token();
        let publisher = publisher.clone();
        let health_state = health_state.clone();
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        health_state.set_broker_connected(publisher.is_connected().await);
                    }
                }
            }
        });
    }

    if let Some(metrics_url) = config.monitor.metrics_url.clone() {
        let reporter = LoadReporter::new(
            metrics_url,
            config.system.node_id.clone(),
            directory.clone(),
            counters.clone(),
        );
        let token = shutdown.token();
        let interval = Duration::from_secs(config.monitor.report_interval_secs);
        tracker.spawn(async move { reporter.run(interval, token).await });
    }

    let command_sender = CommandSender::new(PgCommandStore::new(db_pool.clone()), directory.clone());
    let sweeper = NoReplySweeper::new(
        PgCommandStore::new(db_pool.clone()),
        chrono::Duration::seconds(config.command.no_reply_threshold_secs as i64),
    );
    {
        let token = shutdown.token();
        let poll_interval = Duration::from_secs(config.command.poll_interval_secs);
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = command_sender.poll_once().await {
                            warn!("command poll failed: {e}");
                        }
                    }
                }
            }
        });
    }
    {
        let token = shutdown.token();
        let sweep_interval = Duration::from_secs(config.command.sweep_interval_secs);
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.sweep().await {
                            warn!("no-reply sweep failed: {e}");
                        }
                    }
                }
            }
        });
    }

    let listener = Listener::new(ListenerConfig {
        bind_addr: format!("{}:{}", config.server.ip, config.server.tcp_port),
        max_concurrent_connections: config.tcp_server.max_concurrent_connections,
        connection_reject_timeout: Duration::from_secs_f64(
            config.tcp_server.connection_reject_timeout_secs,
        ),
    });

    let accept_task = {
        let deps = deps.clone();
        let tracker = tracker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(deps, tracker).await {
                error!("listener stopped with error: {e}");
            }
            shutdown.signal();
        })
    };

    shutdown.wait_for_signal().await;
    info!("shutdown signal received, draining connections");
    accept_task.abort();
    shutdown
        .drain(Duration::from_secs_f64(config.shutdown.task_completion_timeout_secs))
        .await;
    db_pool.close().await;

    Ok(())
}
