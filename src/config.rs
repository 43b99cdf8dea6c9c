use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use hmac::Mac;
use log::{error, info, warn};
use mongodb::Client as MongoClient;
use rand::rngs::OsRng;
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio, Build, Rocket,
};
use serde::Deserialize;
use votecommit::IssuerKey;

use crate::anchor::RetryPolicy;
use crate::issuer::HmacSha256;
use crate::ledger::{HttpLedger, Ledger, MemLedger};
use crate::oracle::{EligibilityOracle, HttpOracle, StaticOracle};
use crate::store::{
    CredentialStore, ElectionDirectory, MemCredentials, MemElections, MongoCredentials,
};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "defaults::timestamp_bucket_secs")]
    timestamp_bucket_secs: u64,
    #[serde(default = "defaults::mix_batch_size")]
    mix_batch_size: usize,
    #[serde(default = "defaults::mix_max_hold_secs")]
    mix_max_hold_secs: u32,
    #[serde(default = "defaults::anchor_max_attempts")]
    anchor_max_attempts: u32,
    #[serde(default = "defaults::anchor_base_delay_ms")]
    anchor_base_delay_ms: u32,
    #[serde(default = "defaults::anchor_max_delay_ms")]
    anchor_max_delay_ms: u32,
    #[serde(default = "defaults::anchor_attempt_timeout_ms")]
    anchor_attempt_timeout_ms: u64,
    #[serde(default = "defaults::verify_rate_limit")]
    verify_rate_limit: u32,
    #[serde(default = "defaults::verify_rate_window_secs")]
    verify_rate_window_secs: u64,
    #[serde(default)]
    verify_trust_ip_header: bool,
    // secrets
    hmac_secret: String,
    operator_key: String,
}

mod defaults {
    pub fn timestamp_bucket_secs() -> u64 {
        300
    }

    pub fn mix_batch_size() -> usize {
        16
    }

    pub fn mix_max_hold_secs() -> u32 {
        30
    }

    pub fn anchor_max_attempts() -> u32 {
        8
    }

    pub fn anchor_base_delay_ms() -> u32 {
        500
    }

    pub fn anchor_max_delay_ms() -> u32 {
        60_000
    }

    pub fn anchor_attempt_timeout_ms() -> u64 {
        10_000
    }

    pub fn verify_rate_limit() -> u32 {
        30
    }

    pub fn verify_rate_window_secs() -> u64 {
        60
    }

    pub fn issuer_key_bits() -> usize {
        2048
    }

    pub fn eligibility_timeout_ms() -> u64 {
        5_000
    }

    pub fn db_name() -> String {
        "votecommit".to_string()
    }
}

impl Config {
    /// Width of the commitment timestamp buckets, in seconds.
    pub fn timestamp_bucket_secs(&self) -> u64 {
        self.timestamp_bucket_secs
    }

    /// Number of commitments released by the relay at once.
    pub fn mix_batch_size(&self) -> usize {
        self.mix_batch_size.max(1)
    }

    /// Longest a commitment may wait in the relay for its batch to fill.
    pub fn mix_max_hold(&self) -> Duration {
        Duration::seconds(self.mix_max_hold_secs.into())
    }

    /// Retry schedule for anchoring attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.anchor_max_attempts.max(1),
            base_delay: Duration::milliseconds(self.anchor_base_delay_ms.into()),
            max_delay: Duration::milliseconds(self.anchor_max_delay_ms.into()),
            attempt_timeout: StdDuration::from_millis(self.anchor_attempt_timeout_ms),
        }
    }

    /// Verification requests allowed per client per window.
    pub fn verify_rate_limit(&self) -> u32 {
        self.verify_rate_limit
    }

    pub fn verify_rate_window(&self) -> StdDuration {
        StdDuration::from_secs(self.verify_rate_window_secs)
    }

    /// Whether clients are identified by Rocket's `ip_header` rather than
    /// the connection's peer address. Only safe behind a proxy that
    /// overwrites that header.
    pub fn verify_trust_ip_header(&self) -> bool {
        self.verify_trust_ip_header
    }

    /// Secret key used to sign HMACs.
    pub fn hmac_secret(&self) -> &[u8] {
        self.hmac_secret.as_bytes()
    }

    /// Check a presented operator key in constant time.
    pub fn is_operator_key(&self, presented: &str) -> bool {
        let expected = self.operator_tag(self.operator_key.as_bytes());
        let mut hmac = HmacSha256::new_from_slice(self.hmac_secret())
            .expect("HMAC can take key of any size");
        hmac.update(presented.as_bytes());
        hmac.verify_slice(&expected).is_ok()
    }

    fn operator_tag(&self, key: &[u8]) -> Vec<u8> {
        let mut hmac = HmacSha256::new_from_slice(self.hmac_secret())
            .expect("HMAC can take key of any size");
        hmac.update(key);
        hmac.finalize().into_bytes().to_vec()
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        if config.hmac_secret.is_empty() || config.operator_key.is_empty() {
            error!("`hmac_secret` and `operator_key` must not be empty");
            return Err(rocket);
        }

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the election directory.
#[derive(Deserialize)]
struct ElectionsConfig {
    elections_path: String,
}

/// A fairing that loads election metadata and places an
/// `Arc<dyn ElectionDirectory>` into managed state.
pub struct ElectionsFairing;

#[rocket::async_trait]
impl Fairing for ElectionsFairing {
    fn info(&self) -> Info {
        Info {
            name: "Elections",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<ElectionsConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load elections config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let elections = match MemElections::from_file(&config.elections_path) {
            Ok(elections) => elections,
            Err(e) => {
                error!("Failed to load elections from {}: {e}", config.elections_path);
                return Err(rocket);
            }
        };
        if elections.is_empty() {
            warn!("No elections defined in {}", config.elections_path);
        }
        info!("Loaded {} elections", elections.len());

        let directory: Arc<dyn ElectionDirectory> = Arc::new(elections);
        rocket = rocket.manage(directory);
        Ok(rocket)
    }
}

/// Configuration for the eligibility oracle.
#[derive(Deserialize)]
struct EligibilityConfig {
    eligibility_url: Option<String>,
    eligibility_path: Option<String>,
    #[serde(default = "defaults::eligibility_timeout_ms")]
    eligibility_timeout_ms: u64,
}

/// A fairing that connects to the eligibility oracle and places an
/// `Arc<dyn EligibilityOracle>` into managed state. A remote oracle is
/// preferred; a local allow-list is accepted for development.
pub struct EligibilityFairing;

#[rocket::async_trait]
impl Fairing for EligibilityFairing {
    fn info(&self) -> Info {
        Info {
            name: "Eligibility oracle",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<EligibilityConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load eligibility config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let timeout = StdDuration::from_millis(config.eligibility_timeout_ms);
        let oracle: Arc<dyn EligibilityOracle> = match (config.eligibility_url, config.eligibility_path) {
            (Some(url), _) => match HttpOracle::new(url, timeout) {
                Ok(oracle) => {
                    info!("Using remote eligibility oracle");
                    Arc::new(oracle)
                }
                Err(e) => {
                    error!("Failed to set up eligibility oracle: {e}");
                    return Err(rocket);
                }
            },
            (None, Some(path)) => match StaticOracle::from_file(&path) {
                Ok(oracle) => {
                    warn!("Using eligibility allow-list from {path}; not for production use");
                    Arc::new(oracle)
                }
                Err(e) => {
                    error!("{e}");
                    return Err(rocket);
                }
            },
            (None, None) => {
                error!("One of `eligibility_url` or `eligibility_path` must be set");
                return Err(rocket);
            }
        };

        rocket = rocket.manage(oracle);
        Ok(rocket)
    }
}

/// Configuration for the ledger connection.
#[derive(Deserialize)]
struct LedgerConfig {
    ledger_url: Option<String>,
    #[serde(default = "defaults::anchor_attempt_timeout_ms")]
    anchor_attempt_timeout_ms: u64,
}

/// A fairing that connects to the ledger gateway and places an
/// `Arc<dyn Ledger>` into managed state. Without a gateway, commitments are
/// anchored to an in-process ledger that does not survive restarts.
pub struct LedgerFairing;

#[rocket::async_trait]
impl Fairing for LedgerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ledger",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<LedgerConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load ledger config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let ledger: Arc<dyn Ledger> = match config.ledger_url {
            Some(url) => {
                info!("Loaded ledger config, connecting...");
                let timeout = StdDuration::from_millis(config.anchor_attempt_timeout_ms);
                match HttpLedger::new(url, timeout) {
                    Ok(ledger) => {
                        info!("...ledger gateway client online!");
                        Arc::new(ledger)
                    }
                    Err(e) => {
                        error!("Failed to set up ledger client: {e}");
                        return Err(rocket);
                    }
                }
            }
            None => {
                warn!("No `ledger_url` set, anchoring to an in-process ledger");
                Arc::new(MemLedger::new())
            }
        };

        rocket = rocket.manage(ledger);
        Ok(rocket)
    }
}

/// Configuration for the credential store.
#[derive(Deserialize)]
struct CredentialsConfig {
    db_uri: Option<String>,
    #[serde(default = "defaults::db_name")]
    db_name: String,
    #[serde(default)]
    volatile_credentials: bool,
}

/// A fairing that connects to the credential database and places an
/// `Arc<dyn CredentialStore>` into managed state.
///
/// Without `db_uri` the service refuses to start, unless
/// `volatile_credentials` explicitly allows records of issued and spent
/// tokens to be lost on restart.
pub struct CredentialsFairing;

#[rocket::async_trait]
impl Fairing for CredentialsFairing {
    fn info(&self) -> Info {
        Info {
            name: "Credential store",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<CredentialsConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load credential store config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let credentials: Arc<dyn CredentialStore> = match config.db_uri {
            Some(uri) => {
                info!("Loaded database config, connecting...");
                let client = match MongoClient::with_uri_str(uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to the database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&config.db_name);
                match MongoCredentials::open(&db).await {
                    Ok(store) => {
                        info!("...credential store online!");
                        Arc::new(store)
                    }
                    Err(e) => {
                        error!("Failed to prepare credential collections: {e}");
                        return Err(rocket);
                    }
                }
            }
            None if config.volatile_credentials => {
                warn!("No `db_uri` set, issued and spent tokens will be forgotten on restart");
                Arc::new(MemCredentials::new())
            }
            None => {
                error!("`db_uri` must be set, or `volatile_credentials` enabled for development");
                return Err(rocket);
            }
        };

        rocket = rocket.manage(credentials);
        Ok(rocket)
    }
}

/// Configuration for the token issuer's signing key.
#[derive(Deserialize)]
struct IssuerKeyConfig {
    issuer_key_path: Option<String>,
    #[serde(default = "defaults::issuer_key_bits")]
    issuer_key_bits: usize,
}

/// A fairing that loads, or generates, the issuer's RSA key and places it
/// into managed state.
pub struct IssuerKeyFairing;

#[rocket::async_trait]
impl Fairing for IssuerKeyFairing {
    fn info(&self) -> Info {
        Info {
            name: "Issuer key",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<IssuerKeyConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load issuer key config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let key = match config.issuer_key_path {
            Some(path) => {
                let loaded = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| e.to_string())
                    .and_then(|pem| IssuerKey::from_pkcs8_pem(&pem).map_err(|e| e.to_string()));
                match loaded {
                    Ok(key) => {
                        info!("Loaded issuer key from {path}");
                        key
                    }
                    Err(e) => {
                        error!("Failed to load issuer key from {path}: {e}");
                        return Err(rocket);
                    }
                }
            }
            None => {
                let bits = config.issuer_key_bits;
                warn!("No `issuer_key_path` set, generating a {bits}-bit issuer key...");
                let generated =
                    tokio::task::spawn_blocking(move || IssuerKey::generate(&mut OsRng, bits))
                        .await;
                match generated {
                    Ok(Ok(key)) => {
                        warn!("...generated; tokens will not survive a restart");
                        key
                    }
                    Ok(Err(e)) => {
                        error!("Failed to generate issuer key: {e}");
                        return Err(rocket);
                    }
                    Err(e) => {
                        error!("Issuer key generation panicked: {e}");
                        return Err(rocket);
                    }
                }
            }
        };

        rocket = rocket.manage(key);
        Ok(rocket)
    }
}
