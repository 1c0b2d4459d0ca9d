use std::process::ExitCode;

use clap::Parser;
use render_probe::{cli, logs};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    if let Err(e) = logs::init(cli.log_file.as_deref()) {
        eprintln!("error: {e:#}");
        return ExitCode::from(2);
    }

    cli::execute(cli).await
}
