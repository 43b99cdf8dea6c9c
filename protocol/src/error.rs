use thiserror::Error;

/// Failure to decode one of the protocol's textual encodings.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("Expected {expected} characters, found {actual}")]
    Length { expected: usize, actual: usize },
    #[error("Invalid hex encoding")]
    Hex,
    #[error("Invalid base64 encoding")]
    Base64,
}

/// Errors arising from the blind signature scheme.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum BlindError {
    #[error("Blinded message is not smaller than the issuer modulus")]
    MessageOutOfRange,
    #[error("Signature does not verify against the issuer key")]
    BadSignature,
    #[error("Invalid issuer key: {0}")]
    Key(String),
}

/// Reasons a set of ballot selections is rejected.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum SelectionError {
    #[error("No selections were made")]
    Empty,
    #[error("Selection must name exactly one of optionId or writeIn")]
    Ambiguous,
    #[error("Unknown contest `{0}`")]
    UnknownContest(String),
    #[error("Unknown option `{option}` in contest `{contest}`")]
    UnknownOption { contest: String, option: String },
    #[error("Option `{option}` selected more than once in contest `{contest}`")]
    DuplicateOption { contest: String, option: String },
    #[error("Contest `{contest}` needs between {min} and {max} selections, got {actual}")]
    Count {
        contest: String,
        min: u32,
        max: u32,
        actual: u32,
    },
    #[error("Contest `{0}` does not allow write-ins")]
    WriteInNotAllowed(String),
    #[error("Write-in for contest `{0}` is empty or too long")]
    BadWriteIn(String),
}
