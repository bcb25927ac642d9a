use std::env;
use log::LevelFilter;

pub mod app;
pub mod config;
pub mod device;
pub mod error;
pub mod panel;
pub mod sim;

/// Logs to stderr, and additionally to the file named by the `LOG_FILE` environment variable.
pub fn init_logging(level: LevelFilter) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        // btleplug is chatty at debug level
        .level_for("btleplug", LevelFilter::Warn)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(fern::log_file(log_file)?);
    }

    dispatch.apply()?;
    Ok(())
}
