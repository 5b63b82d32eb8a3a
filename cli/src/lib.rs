mod cli;

use std::sync::Arc;

use anyhow::Context;
pub use cli::Cli;
use conductor_core::conductor::Conductor;
use conductor_core::conductor::ConductorPlanes;
use conductor_core::config::Config;
use conductor_core::config::ConfigOverrides;
use tracing_subscriber::EnvFilter;

/// Run the conductor and return the exit code to report: always the wrapped
/// child's.
pub async fn run_main(cli: Cli) -> anyhow::Result<i32> {
    let Cli {
        config,
        enabled,
        no_gateway,
        command,
    } = cli;

    // Diagnostics go to stderr; stdout belongs to the wrapped terminal.
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let overrides = ConfigOverrides {
        enabled: enabled.then_some(true),
        wrapped_command: (!command.is_empty()).then_some(command),
        gateway: no_gateway.then_some(false),
    };
    let config = Config::load(config.as_deref(), overrides)?;

    if !config.enabled {
        return run_passthrough(&config);
    }

    // External messaging and browser adapters attach in-process through the
    // library API; the standalone binary runs with the built-in stubs.
    let conductor = Arc::new(Conductor::spawn(
        config.clone(),
        ConductorPlanes::default(),
        true,
    )?);

    if let Some(socket_path) = config.gateway_socket_path.clone() {
        let gateway = Arc::clone(&conductor);
        tokio::spawn(async move {
            if let Err(e) = conductor_gateway::serve(gateway, &socket_path).await {
                tracing::warn!("gateway terminated: {e}");
            }
        });
    }

    // Ctrl-C requests a graceful stop; the exit code still comes from the
    // child once it is gone.
    tokio::spawn({
        let conductor = Arc::clone(&conductor);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                conductor.stop();
            }
        }
    });

    Ok(conductor.wait().await)
}

/// With the loop disabled the conductor must be indistinguishable from no
/// conductor: inherited stdio, no buffering, the child's own exit status.
fn run_passthrough(config: &Config) -> anyhow::Result<i32> {
    let status = std::process::Command::new(&config.wrapped_command)
        .args(&config.wrapped_args)
        .status()
        .with_context(|| format!("failed to spawn `{}`", config.wrapped_command))?;
    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(&status) {
        return 128 + signal;
    }
    -1
}
