//! Logging setup shared by the ztls binaries.
//!
//! [`Logging`] installs up to two `tracing` outputs as the global default
//! subscriber: human readable or JSON lines on stderr, and JSON log files.
//! Each output has its own level filter, read from an environment variable.
//!
//! ```
//! use tracing_subscriber::filter::LevelFilter;
//! use ztls_telemetry::{ConsoleOutput, LevelSource, Logging};
//!
//! Logging::builder("ztls")
//!     .console(ConsoleOutput::new(LevelSource::new(
//!         "CONSOLE_LOG_LEVEL",
//!         LevelFilter::INFO,
//!     )))
//!     .build()
//!     .init()?;
//!
//! tracing::info!("logging initialized");
//! # Ok::<(), ztls_telemetry::Error>(())
//! ```
use bon::Builder;
use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{
    Layer, Registry,
    filter::LevelFilter,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

pub use crate::{
    options::{LogLevel, LoggingOptions, RotationPeriod},
    output::{ConsoleOutput, FileOutput, Format, LevelSource, Rotation},
};

mod options;
mod output;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create the log file appender"))]
    CreateFileAppender { source: InitError },

    #[snafu(display("failed to install the global subscriber"))]
    InstallSubscriber { source: TryInitError },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Builder)]
pub struct Logging {
    /// Prefix of log file names.
    #[builder(start_fn)]
    service_name: &'static str,

    console: Option<ConsoleOutput>,
    file: Option<FileOutput>,
}

impl Logging {
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    pub const FILE_LOG_SUFFIX: &str = "log.json";

    /// Console logging at [`LoggingOptions::log_level`] (INFO if unset)
    /// unless disabled, plus file logging at INFO if a log directory is set.
    pub fn from_options(service_name: &'static str, options: LoggingOptions) -> Self {
        let console_level = options.log_level.map_or(LevelFilter::INFO, LevelFilter::from);
        let console = (!options.no_console_log).then(|| {
            ConsoleOutput::new(LevelSource::new(Self::CONSOLE_LOG_LEVEL, console_level))
                .with_format(options.log_format.unwrap_or_default())
        });
        let file = options.log_directory.map(|directory| {
            FileOutput::new(
                LevelSource::new(Self::FILE_LOG_LEVEL, LevelFilter::INFO),
                directory,
            )
            .with_rotation(options.log_rotation.unwrap_or_default())
            .with_max_files(options.log_max_files)
        });

        Self::builder(service_name)
            .maybe_console(console)
            .maybe_file(file)
            .build()
    }

    pub fn service_name(&self) -> &'static str {
        self.service_name
    }

    /// Installs the configured outputs as the global default subscriber.
    /// Nothing is installed if no output is configured.
    pub fn init(self) -> Result<()> {
        let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

        if let Some(console) = &self.console {
            let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            let layer = match console.format {
                Format::Plain => layer.with_filter(console.level.env_filter()).boxed(),
                Format::Json => layer
                    .json()
                    .with_filter(console.level.env_filter())
                    .boxed(),
            };
            layers.push(layer);
        }

        if let Some(file) = &self.file {
            let mut appender = RollingFileAppender::builder()
                .rotation(file.rotation.clone())
                .filename_prefix(self.service_name)
                .filename_suffix(Self::FILE_LOG_SUFFIX);
            if let Some(max_files) = file.max_files {
                appender = appender.max_log_files(max_files);
            }
            let appender = appender
                .build(&file.directory)
                .context(CreateFileAppenderSnafu)?;

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file.level.env_filter())
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing_subscriber::registry()
                .with(layers)
                .try_init()
                .context(InstallSubscriberSnafu)?;
        }

        Ok(())
    }
}
