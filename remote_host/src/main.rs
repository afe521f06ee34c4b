use clap::Parser;
use log::{error, info};
use remote_host::{
    config::{HostArgs, HostConfig},
    session::{Session, SessionSummary},
};
use std::process::ExitCode;

fn print_summary(summary: &SessionSummary) {
    println!("calls: {}", summary.calls);
    println!("async calls: {}", summary.async_calls);
    println!("bytes copied: {}", summary.bytes_copied);
    println!("bytes reported: {}", summary.bytes_reported);
    println!("failures: {}", summary.failures);
    println!("violations: {}", summary.violations);
    println!("version: {}", summary.version);
    if let Some(round_trip) = summary.mean_round_trip {
        println!("mean round trip: {:?}", round_trip);
    }
}

fn main() -> ExitCode {
    let args = HostArgs::parse();
    // check if there is a configuration file
    let mut config = match HostConfig::get_config(args.config.clone()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not load configuration: {:?}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = config.apply_args(&args) {
        eprintln!("invalid arguments: {:?}", err);
        return ExitCode::FAILURE;
    }

    let default_level = if cfg!(debug_assertions) {
        config.log_level.as_str().to_lowercase()
    } else {
        String::from("warn")
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    println!("config: {:?}", config);

    let mut session = match Session::new(&config) {
        Ok(session) => session,
        Err(err) => {
            error!("failed to set up session: {:?}", err);
            return ExitCode::FAILURE;
        }
    };
    let summary = match session.run() {
        Ok(summary) => summary,
        Err(err) => {
            error!("session aborted: {:?}", err);
            return ExitCode::FAILURE;
        }
    };
    info!("message pool served {} allocations", session.pool().allocations());
    print_summary(&summary);
    if summary.failures > 0 || summary.violations > 0 {
        return ExitCode::FAILURE;
    }
    return ExitCode::SUCCESS;
}
