//! `ztls easycert`: requests a fresh key and certificate from a remote ztls
//! server and writes both to files.
use std::path::PathBuf;

use snafu::{ResultExt, Snafu};
use tracing::{debug, info, instrument};
use ztls_certs::CsrSubject;
use ztls_client::{Client, provision, request_credentials};

use crate::{
    cli::EasycertArguments,
    commands::{exit_codes, write_private_file},
};

/// Common name used if neither `--common-name` nor `USER` is set.
pub const FALLBACK_COMMON_NAME: &str = "client.localhost";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create the REST client"))]
    CreateClient { source: ztls_client::Error },

    #[snafu(display("failed to request the certificate"))]
    RequestCredentials { source: provision::Error },

    #[snafu(display("failed to write {path:?}"))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::CreateClient { .. } | Error::RequestCredentials { .. } => exit_codes::REMOTE,
            Error::WriteFile { .. } => exit_codes::IO,
        }
    }
}

/// The paths the key and certificate were written to.
#[derive(Debug)]
pub struct WrittenFiles {
    pub key_path: PathBuf,
    pub certificate_path: PathBuf,
}

/// `<user>.localhost`, or [`FALLBACK_COMMON_NAME`] without a user.
pub fn default_common_name(user: Option<&str>) -> String {
    match user.filter(|user| !user.is_empty()) {
        Some(user) => format!("{user}.localhost"),
        None => FALLBACK_COMMON_NAME.to_owned(),
    }
}

#[instrument(skip_all, fields(endpoint = %arguments.endpoint))]
pub async fn run(arguments: &EasycertArguments) -> Result<WrittenFiles> {
    let mut client = Client::new(&arguments.endpoint)
        .context(CreateClientSnafu)?
        .with_key_size(arguments.key_size);
    if let Some(apikey) = &arguments.apikey {
        client = client.with_api_key(apikey);
    }

    let common_name = arguments.common_name.clone().unwrap_or_else(|| {
        default_common_name(std::env::var("USER").ok().as_deref())
    });
    info!(%common_name, "requesting certificate");
    let credentials = request_credentials(&client, &CsrSubject::new(common_name))
        .await
        .context(RequestCredentialsSnafu)?;

    let key_path = arguments.key_out.clone();
    write_private_file(&key_path, credentials.key_pem.as_bytes()).context(WriteFileSnafu {
        path: key_path.clone(),
    })?;
    debug!(path = %key_path.display(), "key written");

    let certificate_path = arguments.cert_out.clone();
    std::fs::write(&certificate_path, &credentials.certificate_pem).context(WriteFileSnafu {
        path: certificate_path.clone(),
    })?;
    debug!(path = %certificate_path.display(), "certificate written");

    Ok(WrittenFiles {
        key_path,
        certificate_path,
    })
}
