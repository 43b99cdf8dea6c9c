use rocket::{serde::json::Json, Route, State};

use crate::error::Result;
use crate::ratelimit::{Quota, WithQuota};
use crate::verification::{VerificationResult, VerificationService};

pub fn routes() -> Vec<Route> {
    routes![verify]
}

/// Look up a commitment by hash or receipt code. Anything that cannot be
/// confirmed to exist gets the same answer.
#[get("/verify?<hash>")]
async fn verify(
    hash: Option<String>,
    quota: Quota,
    verification: &State<VerificationService>,
) -> Result<WithQuota<Json<VerificationResult>>> {
    quota.admit()?;
    let result = verification.verify(hash.as_deref().unwrap_or_default()).await?;
    Ok(quota.wrap(Json(result)))
}
