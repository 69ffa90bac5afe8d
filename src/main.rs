use std::process::ExitCode;

use log::{error, info, LevelFilter};

mod cli;
mod codec;
mod config;
mod error;
mod fetcher;
mod fileinfo;
mod filter;
mod lock;
mod matching;
mod mirror;
mod parser;
mod path_safety;
mod pgp;
mod pipeline;
mod run;
mod snapshot;
mod storage;

fn init_logging(cli_level: Option<&str>, config_level: Option<&str>, quiet: bool) {
    let level = cli_level
        .or(config_level)
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(if quiet {
            LevelFilter::Warn
        } else {
            LevelFilter::Info
        });
    env_logger::Builder::new().filter_level(level).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: cli::Args = argh::from_env();

    let config = match config::parse_config(&args.config) {
        Ok(c) => c,
        Err(e) => {
            // log facilities haven't been initialized yet without a parsed
            // config's `log` section, so fall back to a plain filter here.
            init_logging(args.log_level.as_deref(), None, args.quiet);
            error!("loading config {}: {e:#}", args.config);
            return ExitCode::FAILURE;
        }
    };

    init_logging(
        args.log_level.as_deref(),
        config.log.level.as_deref(),
        args.quiet,
    );
    config::lint_config(&config);

    match &args.command {
        Some(cli::Command::Validate(_)) => {
            info!("configuration at {} is valid", args.config);
            ExitCode::SUCCESS
        }
        Some(cli::Command::Version(_)) => {
            println!("mirrorctl {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Some(cli::Command::Sync(sync)) => run_sync(&config, &sync.ids, &args).await,
        None => run_sync(&config, &[], &args).await,
    }
}

async fn run_sync(config: &config::Config, ids: &[String], args: &cli::Args) -> ExitCode {
    let outcome = run::run(config, ids, args.no_pgp_check, args.dry_run, args.force).await;

    match outcome {
        Ok(result) => {
            info!("sync complete: {} mirror(s) updated", result.mirror_results.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            if args.verbose_errors {
                error!("sync failed: {e:#}");
            } else {
                error!("sync failed: {e}");
            }
            ExitCode::FAILURE
        }
    }
}
