use std::process::ExitCode;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tracing::{error, info};
use ztls_telemetry::Logging;

use crate::{
    cli::{Cli, Command},
    commands::{config, easycert, exit_codes, generate, serve, util},
};

mod cli;
mod commands;
mod content;

const SERVICE_NAME: &str = "ztls";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to generate the root certificate authority"))]
    Generate { source: generate::Error },

    #[snafu(display("failed to serve"))]
    Serve { source: serve::Error },

    #[snafu(display("failed to create the configuration"))]
    Config { source: config::Error },

    #[snafu(display("failed to decode"))]
    Util { source: util::Error },

    #[snafu(display("failed to request a certificate"))]
    Easycert { source: easycert::Error },
}

impl Error {
    fn exit_code(&self) -> u8 {
        match self {
            Error::Generate { source } => source.exit_code(),
            Error::Serve { source } => source.exit_code(),
            Error::Config { source } => source.exit_code(),
            Error::Util { source } => source.exit_code(),
            Error::Easycert { source } => source.exit_code(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = Logging::from_options(SERVICE_NAME, cli.logging).init() {
        eprintln!("{}", snafu::Report::from_error(err));
        return ExitCode::from(exit_codes::TELEMETRY);
    }

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(
                error = &err as &dyn std::error::Error,
                exit_code = err.exit_code(),
                "command failed"
            );
            eprintln!("{}", snafu::Report::from_error(&err));
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Generate(arguments) => {
            let files = generate::run(&arguments).context(GenerateSnafu)?;
            info!(
                key.path = %files.key_path.display(),
                certificate.path = %files.certificate_path.display(),
                "generated root certificate authority"
            );
            println!(
                "Wrote {} and {}",
                files.key_path.display(),
                files.certificate_path.display()
            );
            Ok(())
        }
        Command::Serve(arguments) => serve::run(&arguments).await.context(ServeSnafu),
        Command::Config(command) => config::run(&command).context(ConfigSnafu),
        Command::Util(command) => util::run(&command).context(UtilSnafu),
        Command::Easycert(arguments) => {
            let files = easycert::run(&arguments).await.context(EasycertSnafu)?;
            println!("Wrote key to {}", files.key_path.display());
            println!("Wrote certificate to {}", files.certificate_path.display());
            Ok(())
        }
    }
}
