use pgllsr_lib::{load_config_from_env, Operation, PositionCheckpoint, Stream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Stream change events from a logical replication slot and log them
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    tracing::info!("Starting PostgreSQL logical stream reader");

    let config = load_config_from_env()?;

    let checkpoint = match &config.checkpoint_file {
        Some(path) => Some(
            PositionCheckpoint::open(path, config.slot_name.clone(), config.start_position).await?,
        ),
        None => None,
    };
    let start_position = checkpoint
        .as_ref()
        .map(|c| c.position())
        .unwrap_or(config.start_position);

    let mut stream = Stream::with_options(
        config.connection,
        config.slot_name,
        start_position,
        config.options,
    );
    stream.start()?;

    let shutdown_token = CancellationToken::new();
    tokio::spawn(setup_shutdown_handler(shutdown_token.clone()));

    let mut stop_sent = false;
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled(), if !stop_sent => {
                stream.stop();
                stop_sent = true;
            }
            event = stream.data().recv() => match event {
                Some(event) => {
                    tracing::info!(
                        "{} {} ({} columns) at {}",
                        event.operation,
                        event.table_name(),
                        event.columns.len(),
                        event.position
                    );
                    // Only whole transactions are safe resume points
                    if event.operation == Operation::Commit {
                        if let Some(checkpoint) = &checkpoint {
                            checkpoint.record(event.position);
                        }
                    }
                }
                None => break,
            },
        }
    }

    let outcome = stream.finished().await;

    if let Some(checkpoint) = &checkpoint {
        if let Err(e) = checkpoint.persist().await {
            tracing::warn!("Failed to persist checkpoint: {}", e);
        } else {
            tracing::info!("Checkpoint saved at {}", checkpoint.position());
        }
    }

    match outcome {
        Ok(()) => {
            tracing::info!("Stream stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Stream failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}

/// Initialize logging configuration
///
/// The log level can be controlled via the `RUST_LOG` environment variable.
/// If it is not set, defaults to `pgllsr=debug,pgllsr_lib=debug`.
pub fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pgllsr=debug,pgllsr_lib=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized with level filtering");
}

/// Cancel `shutdown_token` on SIGTERM/SIGINT (Ctrl+C on Windows)
async fn setup_shutdown_handler(shutdown_token: CancellationToken) {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                return;
            }
        };
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Failed to install SIGINT handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
        shutdown_token.cancel();
    }

    #[cfg(windows)]
    {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        shutdown_token.cancel();
    }
}
