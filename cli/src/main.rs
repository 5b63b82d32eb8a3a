//! Entry-point for the `aether-conductor` binary.

use clap::Parser;
use conductor_cli::Cli;
use conductor_cli::run_main;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let code = runtime.block_on(run_main(cli))?;
    // The conductor exits with the wrapped child's exit code.
    std::process::exit(code);
}
