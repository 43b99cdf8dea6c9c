use log::{debug, error, warn};
use rocket::{
    http::{Header, Status, StatusClass},
    response::{self, Responder},
    serde::json::{json, Json},
    Request, Response,
};
use thiserror::Error;
use votecommit::SelectionError;

use crate::anchor::AnchorError;
use crate::builder::BuildError;
use crate::issuer::IssueError;
use crate::ledger::LedgerError;
use crate::logging::RequestId;
use crate::oracle::OracleError;
use crate::relay::RelayError;
use crate::store::{audit::AuditError, commitments::IndexError};
use crate::verification::VerifyError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Issue(#[from] IssueError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Anchor(#[from] AnchorError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("Too many requests, limit is {limit}; retry in {retry_after}s")]
    RateLimited { limit: u32, retry_after: u64 },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// The HTTP status this error is reported with.
    pub fn status(&self) -> Status {
        match self {
            Self::Issue(err) => match err {
                IssueError::NotEligible => Status::Forbidden,
                IssueError::AlreadyIssued | IssueError::InvalidElection(_) => Status::Conflict,
                IssueError::UnknownElection(_) => Status::NotFound,
                IssueError::InvalidBlindedMessage(_) => Status::UnprocessableEntity,
                IssueError::Credentials(_) => Status::ServiceUnavailable,
                IssueError::Audit(_) => Status::InternalServerError,
            },
            Self::Build(err) => match err {
                BuildError::InvalidToken(_) => Status::Unauthorized,
                BuildError::ElectionNotOpen(_) | BuildError::TokenConsumed => Status::Conflict,
                BuildError::UnknownElection(_) => Status::NotFound,
                BuildError::ElectionMismatch
                | BuildError::InvalidSelections(_)
                | BuildError::BadSalt => Status::UnprocessableEntity,
                BuildError::Credentials(_) => Status::ServiceUnavailable,
                BuildError::Audit(_) | BuildError::Index(_) => Status::InternalServerError,
            },
            Self::Relay(RelayError::Closed) => Status::ServiceUnavailable,
            Self::Anchor(err) => match err {
                AnchorError::LedgerUnavailable(_) => Status::ServiceUnavailable,
                AnchorError::Rejected(_) => Status::BadGateway,
                AnchorError::DuplicateCommitment(_)
                | AnchorError::ElectionNotActive(_)
                | AnchorError::NotDeadLettered(_) => Status::Conflict,
                AnchorError::UnknownCommitment(_) => Status::NotFound,
                AnchorError::Index(_) => Status::InternalServerError,
                AnchorError::Relay(_) => Status::ServiceUnavailable,
            },
            Self::Ledger(err) => match err {
                LedgerError::Unavailable(_) => Status::ServiceUnavailable,
                LedgerError::Duplicate => Status::Conflict,
                LedgerError::Rejected(_) => Status::BadGateway,
            },
            Self::Verify(VerifyError::LedgerUnavailable(_)) => Status::ServiceUnavailable,
            Self::Audit(_) => Status::InternalServerError,
            Self::Oracle(err) => match err {
                OracleError::Unavailable(_) => Status::ServiceUnavailable,
                OracleError::BadResponse(_) => Status::BadGateway,
                OracleError::Load(_) => Status::InternalServerError,
            },
            Self::Index(err) => match err {
                IndexError::Unknown(_) => Status::NotFound,
                IndexError::Duplicate(_) | IndexError::IllegalTransition { .. } => {
                    Status::Conflict
                }
            },
            Self::RateLimited { .. } => Status::TooManyRequests,
            Self::BadRequest(_) => Status::BadRequest,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::NotFound(_) => Status::NotFound,
        }
    }

    /// Machine-readable name of the error, reported alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Issue(err) => match err {
                IssueError::NotEligible => "NotEligible",
                IssueError::AlreadyIssued => "AlreadyIssued",
                IssueError::InvalidElection(_) => "InvalidElection",
                IssueError::UnknownElection(_) => "UnknownElection",
                IssueError::InvalidBlindedMessage(_) => "InvalidBlindedMessage",
                IssueError::Credentials(_) => "CredentialStoreUnavailable",
                IssueError::Audit(err) => audit_code(err),
            },
            Self::Build(err) => match err {
                BuildError::ElectionMismatch => "ElectionMismatch",
                BuildError::InvalidToken(_) => "InvalidToken",
                BuildError::ElectionNotOpen(_) => "ElectionNotOpen",
                BuildError::UnknownElection(_) => "UnknownElection",
                BuildError::InvalidSelections(_) => "InvalidSelections",
                BuildError::TokenConsumed => "TokenConsumed",
                BuildError::BadSalt => "InvalidSalt",
                BuildError::Credentials(_) => "CredentialStoreUnavailable",
                BuildError::Audit(err) => audit_code(err),
                BuildError::Index(_) => "IndexError",
            },
            Self::Relay(_) => "RelayClosed",
            Self::Anchor(err) => match err {
                AnchorError::LedgerUnavailable(_) => "LedgerUnavailable",
                AnchorError::Rejected(_) => "LedgerRejected",
                AnchorError::DuplicateCommitment(_) => "DuplicateCommitment",
                AnchorError::ElectionNotActive(_) => "ElectionNotActive",
                AnchorError::NotDeadLettered(_) => "NotDeadLettered",
                AnchorError::UnknownCommitment(_) => "NotFound",
                AnchorError::Index(_) => "IndexError",
                AnchorError::Relay(_) => "RelayClosed",
            },
            Self::Ledger(err) => match err {
                LedgerError::Unavailable(_) => "LedgerUnavailable",
                LedgerError::Duplicate => "AlreadyOnLedger",
                LedgerError::Rejected(_) => "LedgerRejected",
            },
            Self::Verify(_) => "LedgerUnavailable",
            Self::Audit(err) => audit_code(err),
            Self::Oracle(_) => "EligibilityUnavailable",
            Self::Index(_) => "IndexError",
            Self::RateLimited { .. } => "RateLimited",
            Self::BadRequest(_) => "BadRequest",
            Self::Unauthorized(_) => "Unauthorized",
            Self::NotFound(_) => "NotFound",
        }
    }
}

fn audit_code(err: &AuditError) -> &'static str {
    match err {
        AuditError::ChainMismatch { .. } => "AuditChainMismatch",
        AuditError::Details(_) => "AuditError",
    }
}

impl From<SelectionError> for Error {
    fn from(err: SelectionError) -> Self {
        Self::Build(BuildError::InvalidSelections(err))
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let id = req.local_cache(RequestId::next);
        let status = self.status();
        match status.class() {
            StatusClass::ServerError => error!("req{id} failed: {self}"),
            _ if status == Status::TooManyRequests => warn!("req{id} rate limited"),
            _ => debug!("req{id} rejected: {self}"),
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        let mut response = Response::build_from(body.respond_to(req)?)
            .status(status)
            .finalize();
        if let Self::RateLimited { retry_after, .. } = self {
            response.set_header(Header::new("Retry-After", retry_after.to_string()));
        }
        Ok(response)
    }
}
