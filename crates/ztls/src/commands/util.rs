use std::{
    io::{self, Write},
    path::PathBuf,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::{
    cli::{Base64DecodeArguments, UtilCommand},
    commands::exit_codes,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read the input file {path:?}"))]
    ReadInput {
        source: io::Error,
        path: PathBuf,
    },

    #[snafu(display("no input data given"))]
    MissingInput,

    #[snafu(display("failed to decode the base64 input"))]
    Decode { source: base64::DecodeError },

    #[snafu(display("no output destination given, use --output or --stdout"))]
    MissingOutput,

    #[snafu(display("failed to write {path:?}"))]
    WriteFile {
        source: io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write to stdout"))]
    WriteStdout { source: io::Error },
}

impl Error {
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::MissingInput | Error::Decode { .. } => exit_codes::INVALID_CONTENT,
            Error::MissingOutput => exit_codes::MISSING_OUTPUT,
            Error::ReadInput { .. } | Error::WriteFile { .. } | Error::WriteStdout { .. } => {
                exit_codes::IO
            }
        }
    }
}

pub fn run(command: &UtilCommand) -> Result<()> {
    match command {
        UtilCommand::Base64Decode(arguments) => base64_decode(arguments),
    }
}

#[instrument(skip_all)]
fn base64_decode(arguments: &Base64DecodeArguments) -> Result<()> {
    let decoded = decode_input(arguments)?;

    match (&arguments.output, arguments.stdout) {
        (_, true) => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(&decoded)
                .and_then(|()| stdout.flush())
                .context(WriteStdoutSnafu)
        }
        (Some(path), false) => {
            std::fs::write(path, &decoded).context(WriteFileSnafu { path: path.clone() })?;
            debug!(path = %path.display(), bytes = decoded.len(), "decoded data written");
            Ok(())
        }
        (None, false) => MissingOutputSnafu.fail(),
    }
}

/// Decodes the positional input, or the contents of `--file` with
/// surrounding whitespace removed.
fn decode_input(arguments: &Base64DecodeArguments) -> Result<Vec<u8>> {
    let input = match (&arguments.file, &arguments.input) {
        (Some(path), _) => {
            std::fs::read_to_string(path).context(ReadInputSnafu { path: path.clone() })?
        }
        (None, Some(input)) => input.clone(),
        (None, None) => return MissingInputSnafu.fail(),
    };

    STANDARD.decode(input.trim()).context(DecodeSnafu)
}
