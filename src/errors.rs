// Broker error taxonomy
// Every failure in the core surfaces as one of these kinds; the gateway is
// the only layer that maps them to HTTP status codes.

use thiserror::Error;

/// Closed set of broker failures.
///
/// The core raises these unchanged through the entity walk and the
/// allocation engine. `BottomOfRequest` is control flow for the path cursor
/// and is consumed by the tree walk; if it ever escapes it reports as
/// unclassified.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed HTTP framing, undecodable JSON, or a missing required field.
    #[error("poorly formatted request: {0}")]
    Validation(String),

    /// Ledger column mapping did not resolve, or a ledger write failed.
    #[error("database write failed: {0}")]
    DatabaseWrite(String),

    /// A policy evaluated to false at some tree node.
    #[error("rejected by policy: {0}")]
    Rejected(String),

    /// A path fragment named no child, or the organization root is missing.
    #[error("route does not exist: {0}")]
    RouteDoesNotExist(String),

    /// Semantically invalid operation (query on a routing entity,
    /// non-positive ticket quantity, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Ticket capacity exhausted.
    #[error("no tickets available: {0}")]
    NoTicketsAvailable(String),

    /// Timestamps not ISO-8601, or start >= end.
    #[error("invalid timeslot: {0}")]
    InvalidTimeslot(String),

    /// Strict-mode interval conflict.
    #[error("overlapping timeslot: {0}")]
    OverlappingTimeslot(String),

    /// Organization directory already exists during PUT.
    #[error("association already exists: {0}")]
    AssociationAlreadyExists(String),

    /// PUT definition missing fields or carrying a bad type.
    #[error("malformed entity: {0}")]
    MalformedEntity(String),

    /// The request path cursor is exhausted.
    #[error("bottom of request")]
    BottomOfRequest,

    /// Anything unclassified.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl BrokerError {
    /// HTTP status code for this kind. The mapping is fixed; see the
    /// gateway for the only call site that serializes it.
    pub fn status_code(&self) -> u16 {
        match self {
            BrokerError::Validation(_)
            | BrokerError::DatabaseWrite(_)
            | BrokerError::AssociationAlreadyExists(_)
            | BrokerError::MalformedEntity(_) => 400,
            BrokerError::Rejected(_) => 401,
            BrokerError::RouteDoesNotExist(_) => 404,
            BrokerError::InvalidRequest(_)
            | BrokerError::NoTicketsAvailable(_)
            | BrokerError::InvalidTimeslot(_)
            | BrokerError::OverlappingTimeslot(_) => 403,
            BrokerError::BottomOfRequest | BrokerError::Unknown(_) => 402,
        }
    }

    /// Wrap any displayable failure as unclassified.
    pub fn unknown(err: impl std::fmt::Display) -> Self {
        BrokerError::Unknown(err.to_string())
    }
}

/// Convenience alias used throughout the core.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;
