use std::sync::Arc;

use log::{error, info};
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Orbit, Rocket,
};
use votecommit::IssuerKey;

use crate::anchor::{AnchorClient, AnchorService, AnchorWorker};
use crate::builder::CommitmentBuilder;
use crate::config::Config;
use crate::issuer::TokenIssuer;
use crate::ledger::Ledger;
use crate::ratelimit::RateLimiter;
use crate::relay::MixRelay;
use crate::store::{AuditLog, CommitmentIndex, CredentialStore, ElectionDirectory};
use crate::verification::VerificationService;

/// A fairing that assembles the commitment pipeline from the configured
/// collaborators, places every component into managed state and starts the
/// anchoring worker. On shutdown the relay is flushed and the worker stopped.
///
/// Must be attached after the config and collaborator fairings.
pub struct PipelineFairing;

#[rocket::async_trait]
impl Fairing for PipelineFairing {
    fn info(&self) -> Info {
        Info {
            name: "Commitment pipeline",
            kind: Kind::Ignite | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (Some(config), Some(elections), Some(ledger), Some(credentials), Some(key)) = (
            rocket.state::<Config>(),
            rocket.state::<Arc<dyn ElectionDirectory>>(),
            rocket.state::<Arc<dyn Ledger>>(),
            rocket.state::<Arc<dyn CredentialStore>>(),
            rocket.state::<IssuerKey>(),
        ) else {
            error!("Pipeline started before its config and collaborators were loaded");
            return Err(rocket);
        };
        let elections = elections.clone();
        let ledger = ledger.clone();
        let credentials = credentials.clone();

        let audit = Arc::new(AuditLog::new());
        let index = Arc::new(CommitmentIndex::new());

        let issuer = TokenIssuer::new(
            key.clone(),
            config.hmac_secret(),
            elections.clone(),
            credentials.clone(),
            audit.clone(),
        );
        let builder = CommitmentBuilder::new(
            key.public_key().clone(),
            elections.clone(),
            credentials,
            index.clone(),
            audit.clone(),
            config.timestamp_bucket_secs(),
        );

        let (relay, batches) = MixRelay::new(config.mix_batch_size(), config.mix_max_hold());
        let policy = config.retry_policy();
        let client = AnchorClient::new(
            ledger.clone(),
            elections,
            index.clone(),
            policy.attempt_timeout,
        );
        let service = Arc::new(AnchorService::new(
            client,
            policy,
            index.clone(),
            audit.clone(),
            relay.clone(),
        ));
        let worker = Arc::new(AnchorWorker::spawn(service.clone(), relay.clone(), batches));

        let verification = VerificationService::new(index.clone(), ledger);
        let limiter = RateLimiter::new(config.verify_rate_limit(), config.verify_rate_window())
            .trusting_ip_header(config.verify_trust_ip_header());
        info!(
            "Pipeline ready: batches of {}, held for at most {}s",
            relay.batch_size(),
            config.mix_max_hold().num_seconds()
        );

        Ok(rocket
            .manage(audit)
            .manage(index)
            .manage(issuer)
            .manage(builder)
            .manage(relay)
            .manage(service)
            .manage(worker)
            .manage(verification)
            .manage(limiter))
    }

    async fn on_shutdown(&self, rocket: &Rocket<Orbit>) {
        if let Some(worker) = rocket.state::<Arc<AnchorWorker>>() {
            worker.shutdown().await;
        }
    }
}
