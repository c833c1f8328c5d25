use clap::Parser;
use snapsend::cli::Cli;
use snapsend::streaming::EXIT_FAILURE_CODE;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snapsend: {:#}", e);
            std::process::exit(EXIT_FAILURE_CODE);
        }
    };
    init_tracing(&config.log_level);

    let code = match cli.run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            EXIT_FAILURE_CODE
        }
    };
    std::process::exit(code);
}
