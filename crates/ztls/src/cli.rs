use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use ztls_certs::keys::DEFAULT_KEY_SIZE;
use ztls_client::Client;
use ztls_server::constants::DEFAULT_SOCKET_ADDR;
use ztls_telemetry::LoggingOptions;

#[derive(Debug, Parser)]
#[command(
    name = "ztls",
    author,
    version,
    about = "A minimal private certificate authority"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    // Flattened option groups go last, otherwise their help heading swallows
    // the arguments that follow.
    #[command(flatten)]
    pub logging: LoggingOptions,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Generate a new root key and CA certificate
    #[command(visible_alias = "gen")]
    Generate(GenerateArguments),

    /// Host the REST server
    #[command(visible_alias = "s")]
    Serve(ServeArguments),

    /// Configuration file manipulation
    #[command(subcommand, visible_alias = "cfg")]
    Config(ConfigCommand),

    /// Utilities
    #[command(subcommand)]
    Util(UtilCommand),

    /// Request a key and certificate from a remote REST server
    #[command(name = "easycert", visible_alias = "ec")]
    Easycert(EasycertArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct GenerateArguments {
    /// Key size in bits, for example 2048, 4096 or 8192.
    #[arg(long, visible_alias = "ksz", value_name = "BITS", default_value_t = DEFAULT_KEY_SIZE)]
    pub key_size: usize,

    /// Directory the key and certificate are written to.
    #[arg(long, visible_alias = "odir", value_name = "DIRECTORY")]
    pub output_dir: Option<PathBuf>,

    /// File name of the root key.
    #[arg(long, visible_alias = "kout", value_name = "FILE", default_value = "ca-key.pem")]
    pub key_output_name: PathBuf,

    /// File name of the root certificate.
    #[arg(long, visible_alias = "caout", value_name = "FILE", default_value = "ca-cert.pem")]
    pub cert_output_name: PathBuf,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct ServeArguments {
    /// The configuration to boot the REST server with. A new configuration is
    /// generated and printed if none is given.
    #[arg(
        long,
        env = "ZTLS_CONFIG",
        value_name = "CONTENT",
        long_help = format!(
            "The configuration to boot the REST server with. A new configuration is generated \
             and printed if none is given. Unprefixed values are file paths. {}",
            crate::content::CONTENT_VALUE_HELP
        )
    )]
    pub config: Option<String>,

    /// The socket address to listen on, `:PORT` listens on all addresses.
    #[arg(long, env = "LISTEN", value_name = "ADDRESS", default_value_t = DEFAULT_SOCKET_ADDR, value_parser = parse_listen_address)]
    pub listen: SocketAddr,

    /// Take the caller IP for rate limiting from the X-Forwarded-For and
    /// X-Real-IP headers. Only enable this behind a trusted reverse proxy.
    #[arg(long, env)]
    pub trust_forwarded_headers: bool,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct EasycertArguments {
    /// The REST server to request the certificate from.
    #[arg(long, env = "ZTLS_ENDPOINT", value_name = "URL", default_value = Client::DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// The access secret of the server. If set, the certificate is requested
    /// from the authenticated server certificate route.
    #[arg(long, env = "ZTLS_API_KEY", value_name = "SECRET", hide_env_values = true)]
    pub apikey: Option<String>,

    /// Output file of the private key.
    #[arg(long, visible_alias = "key", value_name = "FILE", default_value = "key.pem")]
    pub key_out: PathBuf,

    /// Output file of the certificate.
    #[arg(long, visible_alias = "cert", value_name = "FILE", default_value = "cert.pem")]
    pub cert_out: PathBuf,

    /// Common name of the certificate, `$USER.localhost` if not given.
    #[arg(long, value_name = "NAME")]
    pub common_name: Option<String>,

    /// Key size in bits.
    #[arg(long, value_name = "BITS", default_value_t = DEFAULT_KEY_SIZE)]
    pub key_size: usize,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum ConfigCommand {
    /// Create a new ZTLS configuration
    New(ConfigNewArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct ConfigNewArguments {
    /// The root key (PEM), a new one is generated if not given.
    #[arg(long, value_name = "CONTENT", long_help = content_help("The root key (PEM)."))]
    pub key: Option<String>,

    /// The root certificate (PEM), a new one is created if not given.
    #[arg(
        long,
        visible_alias = "ca",
        value_name = "CONTENT",
        long_help = content_help("The root certificate (PEM).")
    )]
    pub cert: Option<String>,

    /// The access secret for authenticated REST routes, a random UUID is used
    /// if not given.
    #[arg(long, value_name = "SECRET")]
    pub apikey: Option<String>,

    /// Password of the root key. A newly generated root key is encrypted with
    /// it.
    #[arg(long, env = "ZTLS_KEY_PASSWORD", value_name = "PASSWORD", hide_env_values = true)]
    pub key_password: Option<String>,

    /// Key size in bits of a newly generated root key.
    #[arg(long, value_name = "BITS", default_value_t = DEFAULT_KEY_SIZE)]
    pub key_size: usize,

    /// Output file path.
    #[arg(long, short = 'o', value_name = "FILE", default_value = "ztlsconfig.txt")]
    pub output: PathBuf,

    /// Write the configuration to standard output instead of a file.
    #[arg(long)]
    pub stdout: bool,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum UtilCommand {
    /// Decode base64 data
    #[command(name = "base64decode", visible_alias = "b64d")]
    Base64Decode(Base64DecodeArguments),
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct Base64DecodeArguments {
    /// The base64 encoded data, unless --file is given.
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub input: Option<String>,

    /// Read the base64 encoded data from FILE.
    #[arg(long, value_name = "FILE")]
    pub file: Option<PathBuf>,

    /// Output file.
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the decoded data to standard output.
    #[arg(long, conflicts_with = "output")]
    pub stdout: bool,
}

fn content_help(description: &str) -> String {
    format!(
        "{description} Unprefixed values are file paths. {}",
        crate::content::CONTENT_VALUE_HELP
    )
}

/// Parses a socket address, where `:PORT` binds to all IPv4 addresses.
fn parse_listen_address(value: &str) -> Result<SocketAddr, String> {
    match value.strip_prefix(':') {
        Some(port) => port
            .parse::<u16>()
            .map(|port| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .map_err(|err| format!("invalid port {port:?}: {err}")),
        None => value
            .parse()
            .map_err(|err| format!("invalid socket address {value:?}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use rstest::rstest;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().print_long_help().unwrap();
        Cli::command().debug_assert()
    }

    #[rstest]
    #[case(":8080", "0.0.0.0:8080")]
    #[case("127.0.0.1:9000", "127.0.0.1:9000")]
    #[case("[::1]:443", "[::1]:443")]
    fn listen_addresses(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(
            parse_listen_address(input).unwrap(),
            expected.parse::<SocketAddr>().unwrap()
        );
    }

    #[rstest]
    #[case(":http")]
    #[case("localhost")]
    fn invalid_listen_addresses(#[case] input: &str) {
        assert!(parse_listen_address(input).is_err());
    }

    #[test]
    fn parses_aliases() {
        let cli = Cli::try_parse_from(["ztls", "gen", "--ksz", "2048", "--odir", "/tmp"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Generate(GenerateArguments {
                key_size: 2048,
                output_dir: Some(PathBuf::from("/tmp")),
                key_output_name: PathBuf::from("ca-key.pem"),
                cert_output_name: PathBuf::from("ca-cert.pem"),
            })
        );

        let cli = Cli::try_parse_from(["ztls", "util", "b64d", "aGVsbG8=", "--stdout"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Util(UtilCommand::Base64Decode(Base64DecodeArguments {
                input: Some("aGVsbG8=".to_owned()),
                file: None,
                output: None,
                stdout: true,
            }))
        );
    }

    #[test]
    fn config_new_defaults() {
        let cli = Cli::try_parse_from(["ztls", "cfg", "new", "--apikey", "secret"]).unwrap();
        let Command::Config(ConfigCommand::New(arguments)) = cli.command else {
            panic!("expected the config new command");
        };

        assert_eq!(arguments.apikey.as_deref(), Some("secret"));
        assert_eq!(arguments.output, PathBuf::from("ztlsconfig.txt"));
        assert!(!arguments.stdout);
    }

    #[test]
    fn log_level_before_subcommand() {
        let cli = Cli::try_parse_from(["ztls", "--ll", "w", "gen"]).unwrap();
        assert_eq!(cli.logging.log_level, Some(ztls_telemetry::LogLevel::Warn));
    }

    #[test]
    fn easycert_aliases() {
        let cli = Cli::try_parse_from([
            "ztls",
            "ec",
            "--endpoint",
            "http://ca.internal:8080",
            "--key",
            "/tmp/k.pem",
            "--cert",
            "/tmp/c.pem",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Command::Easycert(EasycertArguments {
                endpoint: "http://ca.internal:8080".to_owned(),
                apikey: None,
                key_out: PathBuf::from("/tmp/k.pem"),
                cert_out: PathBuf::from("/tmp/c.pem"),
                common_name: None,
                key_size: DEFAULT_KEY_SIZE,
            })
        );
    }
}
