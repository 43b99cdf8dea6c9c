//! The external identity/KYC check, reduced to a yes/no per voter and election.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Eligibility oracle unreachable: {0}")]
    Unavailable(String),
    #[error("Eligibility oracle returned an invalid response: {0}")]
    BadResponse(String),
    #[error("Failed to load eligibility list: {0}")]
    Load(String),
}

/// How the voter reached us.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Web,
    Whatsapp,
    Api,
    Offline,
    Paper,
}

/// The oracle's verdict. Ephemeral: consumed once by the token issuer and
/// never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityAssertion {
    pub voter_registration_id: String,
    pub election_id: String,
    pub eligible: bool,
    pub channel: Channel,
}

#[rocket::async_trait]
pub trait EligibilityOracle: Send + Sync {
    async fn check(
        &self,
        voter_registration_id: &str,
        election_id: &str,
        channel: Channel,
    ) -> Result<EligibilityAssertion, OracleError>;
}

/// Oracle backed by a remote HTTP service.
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OracleRequest<'a> {
    voter_registration_id: &'a str,
    election_id: &'a str,
    channel: Channel,
}

#[derive(Deserialize)]
struct OracleResponse {
    eligible: bool,
}

impl HttpOracle {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[rocket::async_trait]
impl EligibilityOracle for HttpOracle {
    async fn check(
        &self,
        voter_registration_id: &str,
        election_id: &str,
        channel: Channel,
    ) -> Result<EligibilityAssertion, OracleError> {
        let response = self
            .client
            .post(&self.url)
            .json(&OracleRequest {
                voter_registration_id,
                election_id,
                channel,
            })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| OracleError::Unavailable(e.to_string()))?;
        let body: OracleResponse = response
            .json()
            .await
            .map_err(|e| OracleError::BadResponse(e.to_string()))?;
        Ok(EligibilityAssertion {
            voter_registration_id: voter_registration_id.to_string(),
            election_id: election_id.to_string(),
            eligible: body.eligible,
            channel,
        })
    }
}

/// Oracle backed by a fixed allow-list of registration ids per election,
/// loaded from JSON such as `{"E1": ["reg-1", "reg-2"]}`.
#[derive(Debug, Clone, Default)]
pub struct StaticOracle {
    eligible: HashMap<String, HashSet<String>>,
}

impl StaticOracle {
    pub fn new(eligible: HashMap<String, HashSet<String>>) -> Self {
        Self { eligible }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| OracleError::Load(e.to_string()))?;
        let eligible = rocket::serde::json::from_str(&contents)
            .map_err(|e| OracleError::Load(e.to_string()))?;
        Ok(Self { eligible })
    }
}

#[rocket::async_trait]
impl EligibilityOracle for StaticOracle {
    async fn check(
        &self,
        voter_registration_id: &str,
        election_id: &str,
        channel: Channel,
    ) -> Result<EligibilityAssertion, OracleError> {
        let eligible = self
            .eligible
            .get(election_id)
            .map_or(false, |voters| voters.contains(voter_registration_id));
        Ok(EligibilityAssertion {
            voter_registration_id: voter_registration_id.to_string(),
            election_id: election_id.to_string(),
            eligible,
            channel,
        })
    }
}

#[cfg(test)]
pub mod examples {
    use super::*;

    impl StaticOracle {
        /// `reg-1` to `reg-9` may vote in `E1`, `E2` and `E3`; nobody else.
        pub fn example() -> Self {
            let voters: HashSet<String> = (1..=9).map(|i| format!("reg-{i}")).collect();
            Self::new(
                ["E1", "E2", "E3"]
                    .into_iter()
                    .map(|e| (e.to_string(), voters.clone()))
                    .collect(),
            )
        }
    }

    impl EligibilityAssertion {
        pub fn example(voter: &str, election: &str) -> Self {
            Self {
                voter_registration_id: voter.to_string(),
                election_id: election.to_string(),
                eligible: true,
                channel: Channel::Web,
            }
        }
    }
}
