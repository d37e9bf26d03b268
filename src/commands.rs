//! CLI command definitions
//!
//! Defines the clap commands for the proxy binary.

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy between a front end and the browser
    Serve {
        /// Address to accept front-end connections on
        #[arg(long)]
        listen: Option<String>,

        /// Browser remote-debugging endpoint, e.g. http://127.0.0.1:9222
        #[arg(long)]
        browser: Option<String>,
    },

    /// Load modules and print the documents and methods their symbols describe
    Symbols {
        /// Module urls or paths; symbol files listed alongside are paired by name
        #[arg(required = true)]
        urls: Vec<String>,

        /// Also list sequence points
        #[arg(long)]
        points: bool,
    },
}
