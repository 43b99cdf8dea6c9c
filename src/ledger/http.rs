use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use votecommit::Digest256;

use super::{Ledger, LedgerError, LedgerPayload, LedgerTx, TxStatus};

/// Client for a JSON gateway in front of the ledger network.
///
/// - `POST {base}/transactions` submits a payload and returns a [`LedgerTx`],
///   or 409 if the payload already exists.
/// - `GET {base}/transactions/{txId}` returns `{"status": ...}`.
/// - `GET {base}/commitments/{hash}` returns the anchoring [`LedgerTx`].
///
/// Missing entries are reported as 404.
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: TxStatus,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Option<Response>, LedgerError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => Err(LedgerError::Unavailable(format!("gateway returned {status}"))),
        }
    }
}

fn unavailable(err: reqwest::Error) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

#[rocket::async_trait]
impl Ledger for HttpLedger {
    async fn submit(&self, payload: &LedgerPayload) -> Result<LedgerTx, LedgerError> {
        let response = self
            .client
            .post(format!("{}/transactions", self.base_url))
            .json(payload)
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            StatusCode::CONFLICT => Err(LedgerError::Duplicate),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| LedgerError::Rejected(e.to_string())),
            status if status.is_client_error() => {
                let reason = response.text().await.unwrap_or_default();
                Err(LedgerError::Rejected(format!("{status}: {reason}")))
            }
            status => Err(LedgerError::Unavailable(format!("gateway returned {status}"))),
        }
    }

    async fn query(&self, tx_id: &str) -> Result<Option<TxStatus>, LedgerError> {
        match self.get(&format!("/transactions/{tx_id}")).await? {
            Some(response) => {
                let body: StatusResponse = response.json().await.map_err(unavailable)?;
                Ok(Some(body.status))
            }
            None => Ok(None),
        }
    }

    async fn find_commitment(
        &self,
        commitment_hash: &Digest256,
    ) -> Result<Option<LedgerTx>, LedgerError> {
        match self.get(&format!("/commitments/{commitment_hash}")).await? {
            Some(response) => Ok(Some(response.json().await.map_err(unavailable)?)),
            None => Ok(None),
        }
    }
}
