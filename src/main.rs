use std::process;

use isr_cache::{
    application::{
        commands::{self, ExpireTarget},
        error::AppError,
    },
    config,
    infra::{error::InfraError, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args.command.unwrap_or_default();

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Inspect(args) => {
            let report = commands::inspect(&settings.cache, args.keys).await?;
            println!("root:       {}", report.root_dir.display());
            println!("generation: {}", report.generation);
            println!("entries:    {}", report.stats.disk_entries);
            println!("budget:     {} bytes", report.stats.max_bytes);
            for key in report.keys {
                println!("  {key}");
            }
        }
        config::Command::Vacuum(_) => {
            let report = commands::vacuum_generations(&settings.cache).await?;
            for generation in &report.removed {
                println!("removed {generation}");
            }
            for generation in &report.failed {
                println!("failed  {generation}");
            }
            if report.removed.is_empty() && report.failed.is_empty() {
                println!("nothing to vacuum");
            }
        }
        config::Command::Expire(args) => {
            let target = ExpireTarget::from_args(args.key, args.all)?;
            let report = commands::expire(&settings.cache, target).await?;
            println!("expired {} entries", report.removed);
        }
    }

    Ok(())
}
