//! parley: peer-to-peer terminal chat.

mod cli;
mod console;

use clap::Parser;
use cli::Cli;
use parley_bus::EventBus;
use parley_kernel::config::load_config;
use parley_kernel::{ChatKernel, KernelResult};
use parley_types::config::ChatConfig;
use parley_types::event::FrontendEvent;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // The config decides the log level, so loading it logs through a
    // temporary subscriber.
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("info"))
        .with_writer(std::io::stderr)
        .finish();
    let mut config =
        tracing::subscriber::with_default(bootstrap, || load_config(Some(&cli.config)));
    cli.apply_overrides(&mut config);

    init_tracing_stderr(&config.log_level);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(config));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "parley failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ChatConfig) -> KernelResult<()> {
    let bus = EventBus::new();
    let _console = console::attach(&bus);
    let (_frontend_sub, mut frontend) = bus.subscribe_channel::<FrontendEvent>();

    let name = config.name.clone();
    let kernel = ChatKernel::boot_with_bus(config, Arc::clone(&bus)).await?;
    console::banner(&name, kernel.local_addr());

    let input = tokio::spawn(console::read_stdin(Arc::clone(&bus)));

    let reason = tokio::select! {
        _ = terminate_requested(&mut frontend) => "terminate requested",
        _ = shutdown_signal() => "signal received",
    };
    info!(reason, "Stopping");

    input.abort();
    kernel.shutdown().await;
    Ok(())
}

/// Resolves on the first `Terminate` event, or when the bus goes away.
async fn terminate_requested(frontend: &mut mpsc::UnboundedReceiver<FrontendEvent>) {
    while let Some(event) = frontend.recv().await {
        if event == FrontendEvent::Terminate {
            return;
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
