//! Cryptographic core of the vote commitment service.
//!
//! Nothing in this crate performs I/O: it is shared between the server,
//! which issues tokens and builds commitments, and voter-side tooling, which
//! blinds token requests and re-derives commitments from a receipt.

pub mod audit;
pub mod ballot;
pub mod blind;
pub mod commitment;
pub mod error;
pub mod hash;
pub mod merkle;
pub mod token;

pub use audit::{verify_chain, AuditEntry};
pub use ballot::{Choice, Selection};
pub use blind::{BlindSignature, BlindedMessage, IssuerKey, IssuerPublicKey, Signature};
pub use commitment::{Commitment, ReceiptCode, Salt, TimestampBucket, VoterReceipt};
pub use error::{BlindError, DecodeError, SelectionError};
pub use hash::Digest256;
pub use merkle::merkle_root;
pub use token::{BlindToken, TokenId, TokenRequest};
