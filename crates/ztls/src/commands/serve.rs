//! `ztls serve`: hosts the REST server.
use std::{
    io::{self, Write},
    sync::Arc,
};

use snafu::{ResultExt, Snafu};
use tracing::{info, instrument, warn};
use ztls_certs::{
    Authority, AuthorityConfig, ErrorKind, authority,
    config::{self, GenerateOptions},
};
use ztls_server::{Options, Server, ServerError};

use crate::{
    cli::ServeArguments,
    commands::{exit_code_for, exit_codes},
    content::{self, read_content_value},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the configuration"))]
    ReadConfig { source: content::Error },

    #[snafu(display("failed to load the configuration"))]
    LoadConfig { source: authority::Error },

    #[snafu(display("failed to generate a configuration"))]
    GenerateConfig { source: config::Error },

    #[snafu(display("failed to print the generated configuration"))]
    PrintConfig { source: io::Error },

    #[snafu(display("failed to run the REST server"))]
    RunServer { source: ServerError },
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::LoadConfig { source } => Some(source.kind()),
            Error::GenerateConfig { source } => Some(source.kind()),
            Error::ReadConfig { .. } | Error::PrintConfig { .. } | Error::RunServer { .. } => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::ReadConfig { .. } => exit_codes::INVALID_CONFIG,
            Error::LoadConfig { source } => exit_code_for(source.kind()),
            Error::GenerateConfig { source } => exit_code_for(source.kind()),
            Error::PrintConfig { .. } => exit_codes::IO,
            Error::RunServer { .. } => exit_codes::SERVER,
        }
    }
}

#[instrument(skip_all, fields(server.listen = %arguments.listen))]
pub async fn run(arguments: &ServeArguments) -> Result<()> {
    let authority = match arguments.config.as_deref().filter(|config| !config.is_empty()) {
        Some(config) => load_authority(config)?,
        None => {
            let config = AuthorityConfig::generate(GenerateOptions::builder().build())
                .context(GenerateConfigSnafu)?;
            print_generated_config(&config)?;
            Authority::new(config)
        }
    };

    if !authority.is_ready() {
        warn!("root certificate authority is not usable, signing requests will be rejected");
    }

    let options = Options::builder()
        .socket_addr(arguments.listen)
        .trust_forwarded_headers(arguments.trust_forwarded_headers)
        .build();

    Server::new(Arc::new(authority), options)
        .run()
        .await
        .context(RunServerSnafu)
}

/// Loads the authority from a content value, bare values are file paths.
pub fn load_authority(config: &str) -> Result<Authority> {
    let config_pem = read_content_value(config, true).context(ReadConfigSnafu)?;
    Authority::from_config_pem(&config_pem).context(LoadConfigSnafu)
}

/// The generated configuration only lives in memory, so it is shown once.
fn print_generated_config(config: &AuthorityConfig) -> Result<()> {
    let pem = config
        .to_pem_with_default_metadata()
        .context(GenerateConfigSnafu)?;

    let mut stdout = io::stdout().lock();
    writeln!(
        stdout,
        "No configuration given, generated a new one. Store it now, it can't be recovered:\n"
    )
    .and_then(|()| writeln!(stdout, "{pem}"))
    .and_then(|()| stdout.flush())
    .context(PrintConfigSnafu)?;

    info!("generated a new configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use ztls_certs::keys;

    use super::*;

    fn config_pem() -> String {
        let key = keys::new_key_pem(2048).unwrap();
        AuthorityConfig::generate(
            GenerateOptions::builder()
                .root_key(key)
                .access_secret("s3cr3t")
                .build(),
        )
        .unwrap()
        .to_pem_with_default_metadata()
        .unwrap()
    }

    #[test]
    fn loads_inline_and_file_configs() {
        let pem = config_pem();

        let authority = load_authority(&pem).unwrap();
        assert!(authority.is_ready());
        assert_eq!(authority.access_secret(), "s3cr3t");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ztlsconfig.txt");
        std::fs::write(&path, &pem).unwrap();

        let authority = load_authority(path.to_str().unwrap()).unwrap();
        assert!(authority.is_ready());
        let authority = load_authority(&format!("file:{}", path.display())).unwrap();
        assert!(authority.is_ready());
    }

    #[test]
    fn missing_config_file() {
        let err = load_authority("/does/not/exist").unwrap_err();
        assert!(matches!(err, Error::ReadConfig { .. }));
        assert_eq!(err.exit_code(), exit_codes::INVALID_CONFIG);
    }

    #[test]
    fn wrong_label() {
        let err =
            load_authority("-----BEGIN CERTIFICATE-----\naGVsbG8=\n-----END CERTIFICATE-----\n")
                .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::LabelMismatch));
        assert_eq!(err.exit_code(), exit_code_for(ErrorKind::LabelMismatch));
    }
}
