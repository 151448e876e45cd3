use clap::Parser;
use kiln::{logging, Cli};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.global.verbose, cli.global.quiet);
    cli.run().await
}
