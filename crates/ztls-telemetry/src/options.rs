use std::path::PathBuf;

use tracing_subscriber::filter::LevelFilter;

use crate::output::{Format, Rotation};

/// Logging options of a binary, see [`Logging::from_options`](crate::Logging::from_options).
///
/// With the `clap` feature enabled this can be flattened into the CLI
/// arguments.
#[cfg_attr(feature = "clap", derive(clap::Args, PartialEq, Eq))]
#[cfg_attr(feature = "clap", command(next_help_heading = "Logging options"))]
#[derive(Debug, Default)]
pub struct LoggingOptions {
    /// Disable log output on stderr.
    #[cfg_attr(feature = "clap", arg(long, env = "ZTLS_NO_CONSOLE_LOG"))]
    pub no_console_log: bool,

    /// Minimum LEVEL of the log output on stderr. Filter directives in
    /// `CONSOLE_LOG_LEVEL` take precedence.
    #[cfg_attr(
        feature = "clap",
        arg(
            long = "loglevel",
            visible_alias = "ll",
            env = "LOGLEVEL",
            value_name = "LEVEL",
            ignore_case = true
        )
    )]
    pub log_level: Option<LogLevel>,

    /// FORMAT of the log output on stderr.
    #[cfg_attr(feature = "clap", arg(long, env = "ZTLS_LOG_FORMAT", value_name = "FORMAT"))]
    pub log_format: Option<Format>,

    /// Additionally write JSON logs to files in DIRECTORY.
    #[cfg_attr(
        feature = "clap",
        arg(long, env = "ZTLS_LOG_DIRECTORY", value_name = "DIRECTORY")
    )]
    pub log_directory: Option<PathBuf>,

    /// How often log files are rotated.
    #[cfg_attr(
        feature = "clap",
        arg(
            long,
            env = "ZTLS_LOG_ROTATION",
            value_name = "PERIOD",
            requires = "log_directory"
        )
    )]
    pub log_rotation: Option<RotationPeriod>,

    /// Number of rotated log files to keep.
    #[cfg_attr(
        feature = "clap",
        arg(
            long,
            env = "ZTLS_LOG_MAX_FILES",
            value_name = "COUNT",
            requires = "log_directory"
        )
    )]
    pub log_max_files: Option<usize>,
}

/// Console log levels. Accepts the short forms `e`, `w`, `i`, `d` and `t` as
/// well.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum LogLevel {
    #[cfg_attr(feature = "clap", value(aliases = ["err", "e"]))]
    #[strum(to_string = "error", serialize = "err", serialize = "e")]
    Error,

    #[cfg_attr(feature = "clap", value(aliases = ["warning", "w"]))]
    #[strum(to_string = "warn", serialize = "warning", serialize = "w")]
    Warn,

    #[cfg_attr(feature = "clap", value(aliases = ["information", "i"]))]
    #[strum(to_string = "info", serialize = "information", serialize = "i")]
    Info,

    #[cfg_attr(feature = "clap", value(aliases = ["dbg", "d"]))]
    #[strum(to_string = "debug", serialize = "dbg", serialize = "d")]
    Debug,

    #[cfg_attr(feature = "clap", value(alias = "t"))]
    #[strum(to_string = "trace", serialize = "t")]
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,
    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(period: RotationPeriod) -> Self {
        match period {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}
