//! MazeWar server entry point: argument parsing, logging setup, the accept
//! loop, and the signal driven graceful shutdown.

mod config;
mod maze;
mod player;
mod registry;
mod session;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::maze::Maze;
use crate::state::ServerState;

/// Multi-player maze combat over TCP.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Port to listen on.
    #[arg(short, long)]
    port: u16,

    /// JSON maze template file, replacing the built-in maze.
    #[arg(short, long)]
    maze: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=debug", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
        Err(help) => {
            let _ = help.print();
            return ExitCode::SUCCESS;
        }
    };
    if args.port == 0 {
        tracing::error!("port must be greater than zero");
        return ExitCode::FAILURE;
    }

    let template = match config::load_template(args.maze.as_deref()).await {
        Ok(template) => template,
        Err(err) => {
            tracing::error!(%err, "could not load the maze template");
            return ExitCode::FAILURE;
        }
    };
    let maze = match Maze::new(&template) {
        Ok(maze) => maze,
        Err(err) => {
            tracing::error!(%err, "invalid maze template");
            return ExitCode::FAILURE;
        }
    };

    let state = Arc::new(ServerState::new(maze));

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, port = args.port, "could not bind the listening socket");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(port = args.port, "MazeWar server listening");

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            tracing::error!(%err, "could not install the termination signal handler");
            return ExitCode::FAILURE;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("termination signal received");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    tracing::info!(%addr, "client connected");
                    let state = state.clone();
                    tokio::spawn(async move {
                        session::serve_connection(socket, state).await;
                    });
                }
                // Accept failures are transient, the loop keeps serving.
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                }
            }
        }
    }

    drop(listener);
    state.registry.shutdown_all();
    state.registry.wait_empty().await;
    tracing::info!("MazeWar server terminating");
    ExitCode::SUCCESS
}
