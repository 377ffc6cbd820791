//! tallyd — the tally ingest worker daemon.

use tally_config::Config;

mod migrate_cmd;
mod worker_cmd;

#[derive(Debug, clap::Parser)]
#[command(name = "tallyd", version, about = "Commerce analytics ingest worker")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// Run the ingest worker (the default when no subcommand is given)
    Worker,
    /// Apply warehouse migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() {
    if let Err(err) = main_inner().await {
        // Manually print the error so we can control the format.
        eprintln!("Exiting with error: {}", error_with_causes(&err));
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    monitoring::logging::init();

    let args: Args = clap::Parser::parse();
    let config = Config::load().map_err(Error::Config)?;

    match args.command.unwrap_or(Command::Worker) {
        Command::Worker => worker_cmd::run(config).await,
        Command::Migrate => migrate_cmd::run(config).await,
    }
}

/// Fatal startup errors. Anything per-run is handled inside the dispatcher
/// and never tears the process down.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("configuration error")]
    Config(#[source] tally_config::ConfigError),

    #[error("failed to bind the operational listener")]
    Bind(#[source] std::io::Error),

    #[error("warehouse database unavailable")]
    Db(#[source] warehouse_db::Error),

    #[error("migrations failed")]
    Migrate(#[source] warehouse_db::Error),
}

fn error_with_causes(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    rendered
}
