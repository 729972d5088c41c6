use std::fs;
use std::io;
use std::path::Path;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use glycoscreener::{GlycoScreener, GlycoScreenerError, CONFIG_FILE, ENV_PREFIX};

#[cfg(feature = "mimalloc")]
use mimalloc::MiMalloc;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn configure_log(log_file: Option<&Path>) -> io::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(fs::File::create(path)?);
            let layer = fmt::layer()
                .compact()
                .with_ansi(false)
                .with_timer(fmt::time::ChronoLocal::rfc_3339())
                .with_writer(writer)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::Level::DEBUG.into())
                        .from_env_lossy(),
                );
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .compact()
                .with_timer(fmt::time::ChronoLocal::rfc_3339())
                .with_writer(io::stderr)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(tracing::Level::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;
    tracing_log::LogTracer::init().map_err(io::Error::other)?;
    Ok(guard)
}

fn load_configuration(args: &GlycoScreener) -> Result<GlycoScreener, GlycoScreenerError> {
    let mut config = Figment::from(Serialized::defaults(args));
    config = match args.config_file.as_ref() {
        Some(path) => config.merge(Toml::file_exact(path)),
        None => config.merge(Toml::file(CONFIG_FILE)),
    };
    config = config.merge(Env::prefixed(ENV_PREFIX).split("__"));
    Ok(config.extract()?)
}

fn main() -> Result<(), GlycoScreenerError> {
    let args = GlycoScreener::parse();
    let driver = load_configuration(&args)?;
    let _guard = configure_log(driver.log_file.as_deref())?;
    match driver.main() {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("{e}");
            Err(e)
        }
    }
}
