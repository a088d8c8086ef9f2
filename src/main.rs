use clap::Parser as _;
use neopool_bridge::commands;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Entities(commands::entities::Args),
    Setup(commands::setup::Args),
    Options(commands::options::Args),
    Migrate(commands::migrate::Args),
    Run(commands::run::Args),
    Command(commands::command::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description =
        std::env::var("NEOPOOL_BRIDGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: NEOPOOL_BRIDGE_LOG is not a valid filter: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Entities(args) => end(commands::entities::run(args)),
        Commands::Setup(args) => end(commands::setup::run(args)),
        Commands::Options(args) => end(commands::options::run(args)),
        Commands::Migrate(args) => end(commands::migrate::run(args)),
        Commands::Run(args) => end(commands::run::run(args)),
        Commands::Command(args) => end(commands::command::run(args)),
    }
}
