use clap::Parser;
use klb::config::{Cli, Commands};
use klb::{Result, daemon};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let cancel = tokio_util::sync::CancellationToken::new();
    match cli.command {
        Commands::Daemon(args) => {
            let mut daemon_handle = tokio::spawn(daemon::start(args, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut daemon_handle => exit("daemon", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    if let Err(e) = daemon_handle.await {
                        error!("daemon exited with error: {}", e.to_string());
                    }
                },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "klb=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
