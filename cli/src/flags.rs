//! Command-line flags. Every flag can also be set through its environment
//! variable and overrides the config file.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputKind {
    Hec,
    Console,
    File,
    Null,
}

#[derive(Debug, Default, Parser)]
#[command(
    name = "fabriclog",
    about = "Ingest Hyperledger Fabric blocks and chaincode events into Splunk HEC",
    long_about = "
fabriclog listens to Hyperledger Fabric channels and chaincode events, decodes
the binary payloads, and forwards every block, transaction, and event to Splunk
HTTP Event Collector (or files, or stdout). Progress is checkpointed so a
restart resumes where it left off.

Configuration is read from --config-file, or ./fabriclog.yaml when present.
Flags and environment variables override the file.
",
    version
)]
pub struct Flags {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(short = 'c', long, env = "FABRIC_LOGGER_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Enable debug log output
    #[arg(long)]
    pub debug: bool,

    /// Enable trace output (very, very verbose)
    #[arg(long, conflicts_with = "debug")]
    pub trace: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Splunk HEC URL; the default path is appended to a bare base URL
    #[arg(long, env = "SPLUNK_HEC_URL")]
    pub hec_url: Option<String>,

    /// Token to authenticate against Splunk HEC
    #[arg(long, env = "SPLUNK_HEC_TOKEN", hide_env_values = true)]
    pub hec_token: Option<String>,

    /// Splunk index to send events to
    #[arg(long, env = "SPLUNK_INDEX")]
    pub hec_events_index: Option<String>,

    /// Reject invalid (e.g. self-signed) HEC certificates
    #[arg(
        long,
        env = "SPLUNK_HEC_REJECT_INVALID_CERTS",
        num_args = 0..=1,
        default_missing_value = "true",
        value_name = "BOOL"
    )]
    pub hec_reject_invalid_certs: Option<bool>,

    /// Peer to connect to
    #[arg(long, env = "FABRIC_PEER")]
    pub peer: Option<String>,

    /// The name of the MSP that the user is enrolled in
    #[arg(long, env = "FABRIC_MSP")]
    pub msp: Option<String>,

    /// Network configuration ("mock" selects the in-memory ledger client)
    #[arg(long, env = "NETWORK_CONFIG")]
    pub network: Option<String>,

    /// The username to use for fabriclog
    #[arg(long, env = "FABRIC_LOGGER_USERNAME")]
    pub user: Option<String>,

    /// The private key for the user
    #[arg(long, env = "FABRIC_KEYFILE")]
    pub user_key: Option<String>,

    /// The signed certificate from the fabric certificate authority
    #[arg(long, env = "FABRIC_CERTFILE")]
    pub user_cert: Option<String>,

    /// Client private key for mutual TLS with the peer
    #[arg(long, env = "FABRIC_CLIENT_KEYFILE")]
    pub client_key: Option<String>,

    /// Client certificate for mutual TLS with the peer
    #[arg(long, env = "FABRIC_CLIENT_CERTFILE")]
    pub client_cert: Option<String>,

    /// Checkpoint file
    #[arg(long, env = "CHECKPOINTS_FILE")]
    pub checkpoints_file: Option<PathBuf>,

    /// Where records are sent
    #[arg(long, env = "LOGGING_LOCATION", value_enum)]
    pub output: Option<OutputKind>,

    /// Port of the operator HTTP API
    #[arg(long, env = "FABRIC_LOGGER_PORT")]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_overrides() {
        let flags = Flags::try_parse_from([
            "fabriclog",
            "--peer",
            "peer0",
            "--output",
            "console",
            "--hec-reject-invalid-certs",
            "--debug",
        ])
        .unwrap();
        assert_eq!(flags.peer.as_deref(), Some("peer0"));
        assert_eq!(flags.output, Some(OutputKind::Console));
        assert_eq!(flags.hec_reject_invalid_certs, Some(true));
        assert!(flags.debug);
    }

    #[test]
    fn debug_and_trace_conflict() {
        assert!(Flags::try_parse_from(["fabriclog", "--debug", "--trace"]).is_err());
    }
}
