//! Settings of the individual log outputs.
use std::path::PathBuf;

pub use tracing_appender::rolling::Rotation;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Where the level filter of an output comes from.
///
/// The environment variable takes full [`EnvFilter`] directives, for example
/// `info,ztls_certs=debug`. Without it, or if it can't be parsed, `default`
/// applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSource {
    pub environment_variable: &'static str,
    pub default: LevelFilter,
}

impl LevelSource {
    pub const fn new(environment_variable: &'static str, default: LevelFilter) -> Self {
        Self {
            environment_variable,
            default,
        }
    }

    pub(crate) fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_env_var(self.environment_variable)
            .with_default_directive(self.default.into())
            .from_env_lossy()
    }
}

/// Log event formats of the console output.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Format {
    /// Human readable lines, colored unless `NO_COLOR` is set.
    #[default]
    Plain,

    /// One JSON object per line.
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleOutput {
    pub level: LevelSource,
    pub format: Format,
}

impl ConsoleOutput {
    pub fn new(level: LevelSource) -> Self {
        Self {
            level,
            format: Format::default(),
        }
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}

/// JSON log files in `directory`, named `<service>.<date>.log.json`, the date
/// is omitted if files are never rotated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOutput {
    pub level: LevelSource,
    pub directory: PathBuf,
    pub rotation: Rotation,

    /// Older files beyond this count are deleted on rotation.
    pub max_files: Option<usize>,
}

impl FileOutput {
    pub fn new(level: LevelSource, directory: impl Into<PathBuf>) -> Self {
        Self {
            level,
            directory: directory.into(),
            rotation: Rotation::NEVER,
            max_files: None,
        }
    }

    pub fn with_rotation(mut self, rotation: impl Into<Rotation>) -> Self {
        self.rotation = rotation.into();
        self
    }

    pub fn with_max_files(mut self, max_files: impl Into<Option<usize>>) -> Self {
        self.max_files = max_files.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn file_output_defaults() {
        let output = FileOutput::new(LevelSource::new("LOG", LevelFilter::INFO), "/var/log/ztls");

        assert_eq!(output.directory, PathBuf::from("/var/log/ztls"));
        assert_eq!(output.rotation, Rotation::NEVER);
        assert_eq!(output.max_files, None);

        let output = output.with_rotation(Rotation::HOURLY).with_max_files(3);
        assert_eq!(output.rotation, Rotation::HOURLY);
        assert_eq!(output.max_files, Some(3));
    }

    #[rstest]
    #[case("plain", Format::Plain)]
    #[case("json", Format::Json)]
    fn parses_formats(#[case] input: &str, #[case] expected: Format) {
        assert_eq!(input.parse::<Format>().unwrap(), expected);
        assert_eq!(expected.to_string(), input);
    }
}
