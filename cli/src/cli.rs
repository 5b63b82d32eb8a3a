use clap::Parser;
use std::path::PathBuf;

/// Closed-loop authorization mediator wrapping an autonomous coding agent.
#[derive(Parser, Debug)]
#[command(name = "aether-conductor", version)]
pub struct Cli {
    /// Path to conductor.toml (defaults to $AETHER_HOME/conductor.toml).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable the authorization loop even when the config leaves it off.
    #[arg(long, default_value_t = false)]
    pub enabled: bool,

    /// Do not serve the gateway RPC socket.
    #[arg(long = "no-gateway", default_value_t = false)]
    pub no_gateway: bool,

    /// Worker command and arguments, overriding the configured wrapped
    /// command. Everything after `--` is passed through verbatim.
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn trailing_command_is_captured_verbatim() {
        let cli = Cli::try_parse_from([
            "aether-conductor",
            "--enabled",
            "--",
            "claude",
            "--model",
            "opus",
        ])
        .unwrap();
        assert!(cli.enabled);
        assert_eq!(cli.command, vec!["claude", "--model", "opus"]);
    }
}
