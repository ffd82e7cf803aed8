// src/main.rs

use tasklaunch::cli::{self, Command};
use tasklaunch::{logging, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("tasklaunch error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> anyhow::Result<()> {
    let args = cli::parse();
    let default_level = match args.command {
        Command::ForkChild { .. } => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    logging::init_logging(args.log_level, default_level)?;
    run(args).await
}
