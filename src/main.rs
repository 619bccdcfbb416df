//! Maestro CLI entry point

use maestro::cli::{handle_command, Cli};
use maestro::core::{config, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let cfg = match config::load_config().await {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: failed to load configuration: {}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = logging::init(&cfg.logging.level, cli.verbose) {
        eprintln!("error: failed to initialize logging: {}", err);
    }

    let code = handle_command(cli.command, cfg).await;
    std::process::exit(code);
}
