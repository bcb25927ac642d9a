use std::process::ExitCode;
use clap::Parser;
use log::error;
use wireless_flat_panel::app::{run, Args};
use wireless_flat_panel::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("Another instance of wireless-flat-panel is already running");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        },
    }
}
