//! Debug proxy - exposes managed code running in a browser sandbox to an
//! inspector front end as debuggable scripts

use clap::Parser;
use debugproxy::{cli, commands::Commands};

#[derive(Parser)]
#[command(name = "debug-proxy", about = "Inspector-protocol proxy for managed code in the browser")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
