#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{figment::Figment, Build, Rocket};
use votecommit::IssuerKey;

use crate::config::{
    ConfigFairing, CredentialsFairing, ElectionsFairing, EligibilityFairing, IssuerKeyFairing,
    LedgerFairing,
};
use crate::ledger::Ledger;
use crate::logging::LoggerFairing;
use crate::oracle::EligibilityOracle;
use crate::pipeline::PipelineFairing;
use crate::store::{CredentialStore, ElectionDirectory};

pub mod anchor;
pub mod api;
pub mod builder;
pub mod config;
pub mod error;
pub mod issuer;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod oracle;
pub mod pipeline;
pub mod ratelimit;
pub mod relay;
pub mod scheduled_task;
pub mod store;
pub mod verification;

/// Build the server from `Rocket.toml` and the environment.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(ElectionsFairing)
        .attach(EligibilityFairing)
        .attach(LedgerFairing)
        .attach(CredentialsFairing)
        .attach(IssuerKeyFairing)
        .attach(PipelineFairing)
        .mount("/", api::routes())
}

/// External systems the pipeline depends on, for when they are constructed
/// by the caller rather than from configuration.
pub struct Collaborators {
    pub elections: Arc<dyn ElectionDirectory>,
    pub oracle: Arc<dyn EligibilityOracle>,
    pub ledger: Arc<dyn Ledger>,
    pub credentials: Arc<dyn CredentialStore>,
    pub issuer_key: IssuerKey,
}

/// Build the server around already-constructed collaborators. Only the
/// application config is read from `figment`.
pub fn rocket_with(figment: Figment, collaborators: Collaborators) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(collaborators.elections)
        .manage(collaborators.oracle)
        .manage(collaborators.ledger)
        .manage(collaborators.credentials)
        .manage(collaborators.issuer_key)
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(PipelineFairing)
        .mount("/", api::routes())
}

/// Operator key accepted by test servers.
#[cfg(test)]
pub(crate) const TEST_OPERATOR_KEY: &str = "operator-test-key";

/// Config for test servers: single-commitment batches and fast retries so
/// anchoring completes within a test.
#[cfg(test)]
pub(crate) fn test_figment() -> Figment {
    rocket::Config::figment()
        .merge(("log_level", "off"))
        .merge(("hmac_secret", "test-hmac-secret"))
        .merge(("operator_key", TEST_OPERATOR_KEY))
        .merge(("mix_batch_size", 1))
        .merge(("mix_max_hold_secs", 1))
        .merge(("anchor_max_attempts", 3))
        .merge(("anchor_base_delay_ms", 10))
        .merge(("anchor_max_delay_ms", 50))
        .merge(("anchor_attempt_timeout_ms", 2_000))
        .merge(("verify_rate_limit", 20))
}
