use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use generic_cdi_plugin::cdi::CdiSpec;
use generic_cdi_plugin::config::Cli;
use generic_cdi_plugin::logging;
use generic_cdi_plugin::registry::CdiPluginRegistry;
use generic_cdi_plugin::server::PluginServer;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Cancels `token` once SIGTERM or SIGINT arrives.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
            }
            token.cancel();
        });
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    logging::init();

    tracing::info!(
        "Starting generic CDI device plugin {}",
        env!("CARGO_PKG_VERSION")
    );

    let spec = CdiSpec::from_file(&cli.spec_path).map_err(|e| anyhow::anyhow!("{e:?}"))?;
    tracing::info!(
        vendor = %spec.vendor(),
        class = %spec.class(),
        devices = spec.devices.len(),
        "loaded CDI specification"
    );

    let registry = CdiPluginRegistry::new(spec, cli.plugin_settings());
    let server = PluginServer::new(registry, cli.server_settings());

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    server
        .run(token)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;

    tracing::info!("Device plugin exited cleanly");
    Ok(())
}
