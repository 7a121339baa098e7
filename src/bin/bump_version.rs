use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Stamp the CI run number into the crate version.
#[derive(Parser)]
#[command(name = "bump-version", version = openmux::VERSION)]
struct Cli {
    /// Build number used as the new patch version
    run_number: u64,

    /// Repository root containing Cargo.toml and src/lib.rs
    #[arg(long, default_value = ".")]
    root: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("openmux=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match openmux::release::bump(&cli.root, cli.run_number) {
        Ok(outcome) => {
            println!("Version bumped from {} to {}", outcome.previous, outcome.bumped);
            // Picked up as a step output by CI.
            println!("BUMPED_VERSION={}", outcome.bumped);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Version bump failed: {e}");
            ExitCode::FAILURE
        }
    }
}
