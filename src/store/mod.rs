//! State shared by the pipeline components.

pub mod audit;
pub mod commitments;
pub mod credentials;
pub mod elections;
pub mod mongo;
pub mod partition;

pub use audit::AuditLog;
pub use commitments::CommitmentIndex;
pub use credentials::{CredentialStore, MemCredentials};
pub use elections::{ElectionDirectory, MemElections};
pub use mongo::MongoCredentials;
