//! # CLI Interface
//!
//! Command-line arguments for `otm-node`, via `clap` derive. Three
//! subcommands: `run`, `init`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use otm_protocol::config::{DEFAULT_API_PORT, DEFAULT_METRICS_PORT};

/// Offline Token Manager issuer node.
///
/// Mints offline tokens against paid-in value, validates and divides them,
/// takes in offline transfer records, redeems tokens back into ledger value,
/// and refunds whatever expires unredeemed.
#[derive(Parser, Debug)]
#[command(
    name = "otm-node",
    about = "Offline Token Manager issuer node",
    version,
    propagate_version = true
)]
pub struct OtmNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the issuer service.
    Run(RunArgs),
    /// Create the data directory and generate a fresh issuer keypair.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Protocol configuration file (TOML).
    ///
    /// When omitted, `config.toml` in the data directory is used if it
    /// exists, otherwise built-in defaults.
    #[arg(long, short = 'c', env = "OTM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the token database and the issuer key.
    #[arg(long, short = 'd', env = "OTM_DATA_DIR", default_value = ".otm")]
    pub data_dir: PathBuf,

    /// Port for the JSON API.
    #[arg(long, env = "OTM_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "OTM_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Hex-encoded Ed25519 issuer secret key.
    ///
    /// If not provided, the key is read from `issuer.key` in the data
    /// directory. Don't pass this on a shared machine.
    #[arg(long, env = "OTM_ISSUER_KEY", hide_env_values = true)]
    pub issuer_key: Option<String>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "OTM_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "OTM_DATA_DIR", default_value = ".otm")]
    pub data_dir: PathBuf,

    /// Overwrite an existing issuer key.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        OtmNodeCli::command().debug_assert();
    }

    #[test]
    fn run_defaults() {
        let cli = OtmNodeCli::try_parse_from(["otm-node", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.api_port, DEFAULT_API_PORT);
        assert_eq!(args.metrics_port, DEFAULT_METRICS_PORT);
        assert_eq!(args.log_format, "pretty");
        assert!(args.config.is_none());
    }

    #[test]
    fn init_accepts_force() {
        let cli = OtmNodeCli::try_parse_from(["otm-node", "init", "-d", "/tmp/x", "--force"])
            .unwrap();
        let Commands::Init(args) = cli.command else {
            panic!("expected init");
        };
        assert!(args.force);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/x"));
    }
}
