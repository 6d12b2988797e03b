//! `ztls config new`: packages root material and an access secret into a
//! `ZTLSCONFIG` block.
use std::{
    io::{self, Write},
    path::PathBuf,
};

use snafu::{ResultExt, Snafu};
use tracing::{info, instrument};
use ztls_certs::{
    AuthorityConfig, ErrorKind,
    config::{self, GenerateOptions},
};

use crate::{
    cli::{ConfigCommand, ConfigNewArguments},
    commands::{exit_code_for, exit_codes, write_private_file},
    content::{self, read_content_value},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the {argument} argument"))]
    ReadArgument {
        source: content::Error,
        argument: &'static str,
    },

    #[snafu(display("the {argument} argument is not valid UTF-8"))]
    InvalidUtf8 {
        source: std::string::FromUtf8Error,
        argument: &'static str,
    },

    #[snafu(display("failed to generate the configuration"))]
    GenerateConfig { source: config::Error },

    #[snafu(display("failed to encode the configuration"))]
    EncodeConfig { source: config::Error },

    #[snafu(display("failed to write the configuration to {path:?}"))]
    WriteFile {
        source: io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write the configuration to stdout"))]
    WriteStdout { source: io::Error },
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::GenerateConfig { source } | Error::EncodeConfig { source } => {
                Some(source.kind())
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ReadArgument { .. } | Error::InvalidUtf8 { .. } => exit_codes::INVALID_CONTENT,
            Error::WriteFile { .. } | Error::WriteStdout { .. } => exit_codes::IO,
            Error::GenerateConfig { source } | Error::EncodeConfig { source } => {
                exit_code_for(source.kind())
            }
        }
    }
}

pub fn run(command: &ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::New(arguments) => new(arguments),
    }
}

#[instrument(skip_all)]
fn new(arguments: &ConfigNewArguments) -> Result<()> {
    let config = generate_config(arguments)?;
    let pem = config
        .to_pem_with_default_metadata()
        .context(EncodeConfigSnafu)?;

    if arguments.stdout {
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(pem.as_bytes())
            .and_then(|()| stdout.flush())
            .context(WriteStdoutSnafu)?;
        return Ok(());
    }

    write_private_file(&arguments.output, pem.as_bytes()).context(WriteFileSnafu {
        path: arguments.output.clone(),
    })?;
    info!(path = %arguments.output.display(), "configuration written");

    Ok(())
}

/// Creates the configuration, reusing root material and access secret where
/// they were provided.
pub fn generate_config(arguments: &ConfigNewArguments) -> Result<AuthorityConfig> {
    let root_key = read_pem_argument(arguments.key.as_deref(), "key")?;
    let root_certificate = read_pem_argument(arguments.cert.as_deref(), "cert")?;

    let options = GenerateOptions::builder()
        .key_size(arguments.key_size)
        .maybe_root_key(root_key)
        .maybe_root_certificate(root_certificate)
        .maybe_root_key_password(arguments.key_password.clone())
        .maybe_access_secret(arguments.apikey.clone())
        .build();

    AuthorityConfig::generate(options).context(GenerateConfigSnafu)
}

fn read_pem_argument(value: Option<&str>, argument: &'static str) -> Result<Option<String>> {
    let Some(value) = value.filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    let data = read_content_value(value, true).context(ReadArgumentSnafu { argument })?;
    let pem = String::from_utf8(data).context(InvalidUtf8Snafu { argument })?;
    Ok(Some(pem))
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use ztls_certs::{ca, keys};

    use super::*;

    const TEST_KEY_SIZE: usize = 2048;

    fn root_key_pem() -> &'static str {
        static KEY: OnceLock<String> = OnceLock::new();
        KEY.get_or_init(|| keys::new_key_pem(TEST_KEY_SIZE).expect("failed to create test key"))
    }

    fn arguments() -> ConfigNewArguments {
        ConfigNewArguments {
            key: None,
            cert: None,
            apikey: None,
            key_password: None,
            key_size: TEST_KEY_SIZE,
            output: PathBuf::from("ztlsconfig.txt"),
            stdout: false,
        }
    }

    #[test]
    fn reuses_provided_material() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("ca-key.pem");
        std::fs::write(&key_path, root_key_pem()).unwrap();
        let certificate_pem = ca::new_ca_root_pem(root_key_pem().as_bytes(), None).unwrap();
        let certificate_path = dir.path().join("ca-cert.pem");
        std::fs::write(&certificate_path, &certificate_pem).unwrap();

        let mut arguments = arguments();
        arguments.key = Some(key_path.to_string_lossy().into_owned());
        arguments.cert = Some(format!("file:{}", certificate_path.display()));
        arguments.apikey = Some("secret".to_owned());

        let config = generate_config(&arguments).unwrap();
        assert_eq!(config.root_key, root_key_pem());
        assert_eq!(config.root_certificate, certificate_pem);
        assert_eq!(config.access_secret, "secret");
    }

    #[test]
    fn writes_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut arguments = arguments();
        arguments.key = Some(root_key_pem().to_owned());
        arguments.output = dir.path().join("ztlsconfig.txt");

        run(&ConfigCommand::New(arguments)).unwrap();

        let written = std::fs::read(dir.path().join("ztlsconfig.txt")).unwrap();
        let (config, metadata) = AuthorityConfig::from_pem_with_metadata(&written).unwrap();
        assert_eq!(config.root_key, root_key_pem());
        assert_eq!(metadata["Generator"], "ztls CLI");
        assert_eq!(metadata["X-API-KEY"], config.access_secret);
    }

    #[test]
    fn certificate_without_key_is_rejected() {
        let mut arguments = arguments();
        arguments.cert = Some(ca::new_ca_root_pem(root_key_pem().as_bytes(), None).unwrap());

        let err = generate_config(&arguments).unwrap_err();
        assert!(matches!(err, Error::GenerateConfig { .. }));
    }

    #[test]
    fn unreadable_key_argument() {
        let mut arguments = arguments();
        arguments.key = Some("/does/not/exist.pem".to_owned());

        let err = generate_config(&arguments).unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::INVALID_CONTENT);
    }
}
