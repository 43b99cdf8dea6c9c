use std::sync::Arc;

use log::{info, warn};
use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
    serde::json::{json, Json},
    Request, Route, State,
};
use votecommit::Digest256;

use crate::anchor::AnchorService;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::api::{
    AuditAnchor, AuditVerification, DeadLetterList, RequeueResponse,
};
use crate::store::{audit::OPERATOR_STREAM, AuditLog};

/// Header carrying the shared operator secret.
pub const OPERATOR_KEY_HEADER: &str = "X-Operator-Key";

pub fn routes() -> Vec<Route> {
    routes![dead_letters, requeue, verify_audit, anchor_audit]
}

/// Proof that the request presented the operator key.
pub struct Operator;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Operator {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Outcome::Success(config) = req.guard::<&State<Config>>().await else {
            return Outcome::Error((
                Status::InternalServerError,
                Error::Unauthorized("operator access is not configured".to_string()),
            ));
        };
        match req.headers().get_one(OPERATOR_KEY_HEADER) {
            Some(key) if config.is_operator_key(key) => Outcome::Success(Operator),
            presented => {
                if presented.is_some() {
                    warn!("Rejected operator request with a wrong key");
                }
                Outcome::Error((
                    Status::Unauthorized,
                    Error::Unauthorized("missing or invalid operator key".to_string()),
                ))
            }
        }
    }
}

#[get("/operator/dead-letters")]
async fn dead_letters(_operator: Operator, anchor: &State<Arc<AnchorService>>) -> Json<DeadLetterList> {
    Json(DeadLetterList {
        dead_letters: anchor.dead_letters().into_iter().map(Into::into).collect(),
    })
}

#[post("/operator/dead-letters/<hash>/requeue")]
async fn requeue(
    _operator: Operator,
    hash: &str,
    anchor: &State<Arc<AnchorService>>,
) -> Result<Json<RequeueResponse>> {
    let hash: Digest256 = hash
        .parse()
        .map_err(|_| Error::BadRequest(format!("`{hash}` is not a commitment hash")))?;
    let record = anchor.requeue(&hash)?;
    Ok(Json(RequeueResponse {
        commitment_hash: record.commitment_hash,
        status: record.state,
    }))
}

/// Recompute an audit stream from genesis. A broken chain halts the stream.
#[get("/operator/audit/<stream>/verify")]
async fn verify_audit(
    _operator: Operator,
    stream: &str,
    audit: &State<Arc<AuditLog>>,
) -> Json<AuditVerification> {
    let (valid, entries) = match audit.verify(stream) {
        Ok(entries) => (true, entries),
        Err(_) => (false, audit.entries(stream).len()),
    };
    Json(AuditVerification {
        stream: stream.to_string(),
        valid,
        entries,
    })
}

/// Write the Merkle root of an audit stream to the ledger.
#[post("/operator/audit/<stream>/anchor")]
async fn anchor_audit(
    _operator: Operator,
    stream: &str,
    audit: &State<Arc<AuditLog>>,
    anchor: &State<Arc<AnchorService>>,
) -> Result<Json<AuditAnchor>> {
    let (merkle_root, entry_count) = audit.root(stream)?;
    let tx = anchor
        .client()
        .anchor_audit_root(stream, merkle_root, entry_count)
        .await?;
    info!("Anchored audit stream `{stream}` ({entry_count} entries) in block {}", tx.block_num);
    audit.append(
        OPERATOR_STREAM,
        "audit.anchored",
        "AuditStream",
        stream,
        &json!({
            "merkleRoot": merkle_root,
            "entryCount": entry_count,
            "fabricTxId": tx.tx_id,
        }),
    )?;
    Ok(Json(AuditAnchor {
        stream: stream.to_string(),
        merkle_root,
        entry_count,
        fabric_tx_id: tx.tx_id,
        fabric_block_num: tx.block_num,
    }))
}
