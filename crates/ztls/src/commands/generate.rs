//! `ztls generate`: creates a root key and a self-signed CA certificate.
use std::path::PathBuf;

use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};
use ztls_certs::{
    ErrorKind,
    ca::{self, CreateCertificateAuthorityError},
    keys,
};

use crate::{
    cli::GenerateArguments,
    commands::{exit_codes, exit_code_for, write_private_file},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate the root key"))]
    CreateKey { source: keys::Error },

    #[snafu(display("failed to create the CA certificate"))]
    CreateCertificate {
        source: CreateCertificateAuthorityError,
    },

    #[snafu(display("failed to write {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::CreateKey { source } => Some(source.kind()),
            Error::CreateCertificate { source } => Some(source.kind()),
            Error::WriteFile { .. } => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.kind().map_or(exit_codes::IO, exit_code_for)
    }
}

/// The paths the key and certificate were written to.
#[derive(Debug)]
pub struct GeneratedFiles {
    pub key_path: PathBuf,
    pub certificate_path: PathBuf,
}

#[instrument(skip_all, fields(key_size = arguments.key_size))]
pub fn run(arguments: &GenerateArguments) -> Result<GeneratedFiles> {
    info!("generating RSA private key");
    let key_pem = keys::new_key_pem(arguments.key_size).context(CreateKeySnafu)?;

    info!("generating CA certificate");
    let certificate_pem =
        ca::new_ca_root_pem(key_pem.as_bytes(), None).context(CreateCertificateSnafu)?;

    let (key_path, certificate_path) = match &arguments.output_dir {
        Some(output_dir) => (
            output_dir.join(&arguments.key_output_name),
            output_dir.join(&arguments.cert_output_name),
        ),
        None => (
            arguments.key_output_name.clone(),
            arguments.cert_output_name.clone(),
        ),
    };

    write_private_file(&key_path, key_pem.as_bytes()).context(WriteFileSnafu {
        path: key_path.clone(),
    })?;
    debug!(path = %key_path.display(), "key written");

    std::fs::write(&certificate_path, certificate_pem).context(WriteFileSnafu {
        path: certificate_path.clone(),
    })?;
    debug!(path = %certificate_path.display(), "CA certificate written");

    Ok(GeneratedFiles {
        key_path,
        certificate_path,
    })
}
