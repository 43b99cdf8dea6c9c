use std::sync::Arc;

use log::error;
use rocket::{
    http::Status,
    response::status::Custom,
    serde::json::Json,
    Route, State,
};

use crate::builder::CommitmentBuilder;
use crate::error::Result;
use crate::model::api::{CommitmentAccepted, CommitmentRequest};
use crate::relay::MixRelay;

pub fn routes() -> Vec<Route> {
    routes![submit_commitment]
}

/// Spend a token on a ballot. The commitment is accepted once recorded;
/// anchoring happens later, after the relay releases it.
#[post("/commitments", data = "<request>", format = "json")]
async fn submit_commitment(
    request: Json<CommitmentRequest>,
    builder: &State<CommitmentBuilder>,
    relay: &State<Arc<MixRelay>>,
) -> Result<Custom<Json<CommitmentAccepted>>> {
    let request = request.into_inner();
    let commitment = builder
        .build(
            &request.token,
            &request.election_id,
            &request.selections,
            request.salt,
        )
        .await?;
    if let Err(e) = relay.enqueue(commitment.clone()) {
        error!(
            "Commitment {} could not be queued for anchoring: {e}",
            commitment.receipt_code()
        );
        builder.withdraw(&commitment, &request.token.token_id).await;
        return Err(e.into());
    }
    Ok(Custom(Status::Accepted, Json(commitment.into())))
}
