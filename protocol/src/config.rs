//! # Protocol Configuration & Constants
//!
//! Every magic number in the protocol lives here. Domain tags in particular
//! are part of the signed byte layout: changing one invalidates every token
//! and transfer record ever signed under the old tag, so treat them as frozen.
//!
//! The tunable knobs (validity window, denominations, fees, timeouts, retry
//! policy) are grouped into [`ProtocolConfig`], which has sane defaults and
//! can be loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Protocol Version
// ---------------------------------------------------------------------------

pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Bumped whenever a signed byte layout changes.
pub const WIRE_FORMAT_VERSION: u16 = 1;

// ---------------------------------------------------------------------------
// Domain Separation Tags
// ---------------------------------------------------------------------------

/// Prefix of the canonical token encoding the issuer (or a delegate) signs.
pub const TOKEN_DOMAIN_TAG: &[u8] = b"otm/token/v1";

/// Prefix of the transfer-authorization payload a sender signs.
pub const TRANSFER_DOMAIN_TAG: &[u8] = b"otm/transfer/v1";

/// Prefix of the delegation certificate payload the issuer signs.
pub const DELEGATION_DOMAIN_TAG: &[u8] = b"otm/delegation/v1";

/// Hash tag for deriving division output ids from their parent.
pub const DIVISION_ID_TAG: &[u8] = b"otm/division-id/v1";

// ---------------------------------------------------------------------------
// Cryptographic Parameters
// ---------------------------------------------------------------------------

pub const SIGNING_ALGORITHM: &str = "Ed25519";
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = 64;

/// Token ids and transfer ids are both 32 bytes.
pub const ID_LENGTH: usize = 32;

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

/// Amounts are integer minor units. 100 minor units make one major unit.
pub const MINOR_UNITS_PER_MAJOR: u64 = 100;

/// Basis-point denominator for the issuance fee.
pub const BPS_DENOMINATOR: u64 = 10_000;

// ---------------------------------------------------------------------------
// Issuer Defaults
// ---------------------------------------------------------------------------

/// Tokens expire this many days after issuance unless configured otherwise.
pub const DEFAULT_TOKEN_VALIDITY_DAYS: i64 = 30;

/// Upper bound on tokens minted by one `issue` call. Keeps a silly
/// denomination table from producing a million one-cent tokens.
pub const MAX_TOKENS_PER_ISSUE: usize = 1_000;

/// Upper bound on tokens in one redemption request.
pub const MAX_REDEMPTION_BATCH: usize = 512;

// ---------------------------------------------------------------------------
// Wallet Defaults
// ---------------------------------------------------------------------------

/// A reservation not confirmed within this window lapses on its own.
pub const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a sender waits for the receiver's acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Reconciliation Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// How often the node sweeps for expired tokens.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Node Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_API_PORT: u16 = 9841;
pub const DEFAULT_METRICS_PORT: u16 = 9842;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Issuer-side knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IssuerConfig {
    pub token_validity_days: i64,
    /// Denominations for greedy issuance, in minor units. Empty means one
    /// token of the exact amount.
    pub denominations: Vec<u64>,
    /// Issuance fee in basis points of the face value.
    pub issuance_fee_bps: u64,
    pub max_tokens_per_issue: usize,
    pub max_redemption_batch: usize,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            token_validity_days: DEFAULT_TOKEN_VALIDITY_DAYS,
            denominations: Vec::new(),
            issuance_fee_bps: 0,
            max_tokens_per_issue: MAX_TOKENS_PER_ISSUE,
            max_redemption_batch: MAX_REDEMPTION_BATCH,
        }
    }
}

impl IssuerConfig {
    pub fn token_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.token_validity_days)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WalletConfig {
    pub reservation_timeout_secs: u64,
    pub ack_timeout_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: DEFAULT_RESERVATION_TIMEOUT.as_secs(),
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
        }
    }
}

impl WalletConfig {
    pub fn reservation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_timeout_secs as i64)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Everything tunable, in one place.
///
/// ```
/// use otm_protocol::config::ProtocolConfig;
///
/// let cfg = ProtocolConfig::from_toml_str("[issuer]\nissuance_fee_bps = 25\n").unwrap();
/// assert_eq!(cfg.issuer.issuance_fee_bps, 25);
/// assert_eq!(cfg.issuer.token_validity_days, 30);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolConfig {
    pub issuer: IssuerConfig,
    pub wallet: WalletConfig,
    pub retry: RetryConfig,
    pub sweep: SweepConfig,
}

impl ProtocolConfig {
    /// Parse and validate a TOML document. Missing sections take defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: ProtocolConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a TOML file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.token_validity_days <= 0 {
            return Err(ConfigError::Invalid {
                field: "issuer.token_validity_days",
                reason: "must be positive".into(),
            });
        }
        if self.issuer.denominations.iter().any(|&d| d == 0) {
            return Err(ConfigError::Invalid {
                field: "issuer.denominations",
                reason: "zero is not a denomination".into(),
            });
        }
        if self.issuer.issuance_fee_bps > BPS_DENOMINATOR {
            return Err(ConfigError::Invalid {
                field: "issuer.issuance_fee_bps",
                reason: format!("must be at most {BPS_DENOMINATOR}"),
            });
        }
        if self.issuer.max_tokens_per_issue == 0 || self.issuer.max_redemption_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "issuer",
                reason: "batch limits must be non-zero".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.max_attempts",
                reason: "at least one attempt is required".into(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay_ms",
                reason: "base delay exceeds max delay".into(),
            });
        }
        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sweep.interval_secs",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}
