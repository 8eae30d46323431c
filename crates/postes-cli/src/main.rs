mod cli;

use anyhow::Result;
use clap::Parser;
use cli::commands::{self, App};
use cli::{Cli, Commands};

fn init_tracing(verbose: bool) {
    // Logs go to stderr so --json output on stdout stays parseable.
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let app = App::open().await?;

    match &cli.command {
        Commands::Login { username } => commands::login(&app, username.as_deref(), cli.json).await?,
        Commands::Logout => commands::logout(&app, cli.json).await?,
        Commands::Cities => commands::cities(&app, cli.json).await?,
        Commands::Bairros { city_id } => commands::neighborhoods(&app, *city_id, cli.json).await?,
        Commands::Add(args) => commands::add(&app, args, cli.json).await?,
        Commands::Pending => commands::list_pending(&app, cli.json).await?,
        Commands::Failed => commands::list_failed(&app, cli.json).await?,
        Commands::Requeue { id } => commands::requeue(&app, *id, cli.json).await?,
        Commands::Status => commands::status(&app, cli.json).await?,
        Commands::Sync => commands::sync(&app, cli.json).await?,
        Commands::Remote(remote_cmd) => commands::remote(&app, remote_cmd, cli.json).await?,
    }

    Ok(())
}
