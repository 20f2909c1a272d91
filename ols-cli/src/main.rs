//! OLS: serves the services of a mirrored repository.
//!
//! # Usage
//!
//! ```text
//! ols serve [--listen <addr>]
//! ols status [--url <url>] --key <key>
//! ols update [--url <url>] --key <key>
//! ols config [--json]
//! ols resolve <path> [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    config::ConfigArgs,
    remote::{RemoteArgs, RemoteCall},
    resolve::ResolveArgs,
    serve::ServeArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "ols",
    version,
    about = "Serve per-directory services from a mirrored git branch",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the router in the foreground.
    Serve(ServeArgs),

    /// Query a running instance through its internal api.
    Status(RemoteArgs),

    /// Ask a running instance to check upstream now.
    Update(RemoteArgs),

    /// Print the configuration resolved from the environment.
    Config(ConfigArgs),

    /// Show which service directory a request path maps to.
    Resolve(ResolveArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => args.run(),
        Commands::Status(args) => args.run(RemoteCall::Status),
        Commands::Update(args) => args.run(RemoteCall::Update),
        Commands::Config(args) => args.run(),
        Commands::Resolve(args) => args.run(),
    }
}
