use std::sync::Arc;

use rocket::{serde::json::Json, Route, State};
use votecommit::IssuerPublicKey;

use crate::error::Result;
use crate::issuer::{BlindIssuance, TokenIssuer};
use crate::model::api::TokenRequestBody;
use crate::oracle::EligibilityOracle;

pub fn routes() -> Vec<Route> {
    routes![issuer_key, issue_token]
}

/// The key voters blind their token requests against and commitments are
/// checked with.
#[get("/issuer-key")]
async fn issuer_key(issuer: &State<TokenIssuer>) -> Json<IssuerPublicKey> {
    Json(issuer.public_key().clone())
}

#[post("/elections/<election_id>/tokens", data = "<request>", format = "json")]
async fn issue_token(
    election_id: &str,
    request: Json<TokenRequestBody>,
    oracle: &State<Arc<dyn EligibilityOracle>>,
    issuer: &State<TokenIssuer>,
) -> Result<Json<BlindIssuance>> {
    let request = request.into_inner();
    let assertion = oracle
        .check(&request.voter_registration_id, election_id, request.channel)
        .await?;
    let issuance = issuer.issue(&assertion, &request.blinded_message).await?;
    Ok(Json(issuance))
}

#[cfg(test)]
pub(crate) mod examples {
    use chrono::{DateTime, Utc};
    use rand::rngs::OsRng;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, serde_json, Value},
    };
    use votecommit::{BlindSignature, BlindToken, IssuerPublicKey, TokenRequest};

    /// Run the voter's side of issuance: fetch the issuer key, blind a fresh
    /// token id, ask for a signature and unblind it.
    pub async fn obtain_token(client: &Client, election_id: &str, voter: &str) -> BlindToken {
        let response = client.get(uri!(super::issuer_key)).dispatch().await;
        assert_eq!(Status::Ok, response.status());
        let issuer: IssuerPublicKey =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();

        let request = TokenRequest::new(&issuer, election_id, &mut OsRng).unwrap();
        let response = client
            .post(uri!(super::issue_token(election_id)))
            .header(ContentType::JSON)
            .body(
                json!({
                    "voterRegistrationId": voter,
                    "channel": "WEB",
                    "blindedMessage": request.blinded(),
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let body: Value = serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        let signature: BlindSignature =
            serde_json::from_value(body["blindSignature"].clone()).unwrap();
        let issued_at: DateTime<Utc> = serde_json::from_value(body["issuedAt"].clone()).unwrap();

        request.finalize(&issuer, &signature, issued_at).unwrap()
    }
}
