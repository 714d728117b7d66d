//! Kubext CLI entry point.

use clap::Parser;

use kubext::cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Controller(args) => {
            kubext::cli::commands::controller::execute(args, cli.config, cli.json).await
        }
        Commands::Lint(args) => kubext::cli::commands::lint::execute(args, cli.json).await,
    };

    if let Err(err) = result {
        kubext::cli::handle_error(err, cli.json);
    }
}
