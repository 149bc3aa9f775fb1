//! vigil CLI entry point.
//!
//! Parses arguments, merges the configuration, initializes logging, and
//! hands control to the dispatcher. Exit code 0 means clean shutdown
//! (including `--one_shot_vanguards`); every fatal error exits 1 with a
//! message on stderr.

use clap::Parser;
use std::process::ExitCode;

use vigil::{config, control, logger, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> vigil::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let toml = Config::default().to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.global.loglevel, config.global.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("vigil {} starting", control::VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("State file: {}", config.global.state_file.display()),
    );

    let g = &config.global;
    if g.enable_vanguards {
        logger::plog(LogLevel::Info, "Vanguard set management enabled");
    }
    if g.enable_bandguards {
        logger::plog(LogLevel::Info, "Bandwidth side-channel checks enabled");
    }
    if g.enable_rendguard {
        logger::plog(LogLevel::Info, "Rendezvous point monitoring enabled");
    }
    if g.enable_cbtverify {
        logger::plog(LogLevel::Info, "Circuit build-time verification enabled");
    }
    if g.enable_pathverify {
        logger::plog(LogLevel::Info, "Circuit path verification enabled");
    }
    if g.enable_logguard {
        logger::plog(LogLevel::Info, "Tor log buffering enabled");
    }

    control::run_main(config).await
}
