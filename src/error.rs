use crate::association::pdu::{describe_abort, describe_rejection, AbortRQSource, AssociationRJ};
use crate::association::{AssociationError, NegotiationError};
use crate::dimse::{ReadError, ServiceError, WriteError};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Raised before any network activity when a configuration or query is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
	#[error("Invalid AE title '{value}': {reason}")]
	AeTitle { value: String, reason: &'static str },
	#[error("Invalid configuration: {0}")]
	Configuration(String),
	#[error("Invalid query keys: {0}")]
	QueryKeys(String),
}

/// Errors reported by [`DimseClient`](crate::client::DimseClient) operations.
#[derive(Debug, Error)]
pub enum ScuError {
	#[error("Operation timed out after {0:?}")]
	Timeout(Duration),
	#[error("Connection failed: {0}")]
	ConnectionFailed(String),
	#[error("Association rejected: {}", describe_rejection(.0))]
	AssociationRejected(AssociationRJ),
	#[error("Invalid response: {0}")]
	InvalidResponse(String),
	#[error(transparent)]
	Validation(#[from] ValidationError),
	#[error("Association aborted: {0}")]
	Aborted(AbortCause),
}

/// Why an association ended in an A-ABORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortCause {
	/// The caller's cancellation token fired.
	Cancelled,
	/// The peer sent an A-ABORT.
	Peer(AbortRQSource),
}

impl Display for AbortCause {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Cancelled => write!(f, "cancelled by caller"),
			Self::Peer(source) => write!(f, "aborted by peer ({})", describe_abort(source)),
		}
	}
}

impl ScuError {
	/// Transport failures worth another attempt. A rejection is an answer from the peer,
	/// even when it is flagged as transient.
	pub const fn is_retryable(&self) -> bool {
		matches!(self, Self::Timeout(_) | Self::ConnectionFailed(_))
	}
}

impl From<AssociationError> for ScuError {
	fn from(err: AssociationError) -> Self {
		match err {
			AssociationError::Timeout(timeout) => Self::Timeout(timeout),
			AssociationError::Connect { .. }
			| AssociationError::ConnectionClosed
			| AssociationError::Io(_) => Self::ConnectionFailed(err.to_string()),
			AssociationError::Rejected(reason) => Self::AssociationRejected(reason),
			AssociationError::Aborted(source) => Self::Aborted(AbortCause::Peer(source)),
			AssociationError::Cancelled => Self::Aborted(AbortCause::Cancelled),
			AssociationError::TooManyPresentationContexts(_) => {
				Self::Validation(ValidationError::Configuration(err.to_string()))
			}
			AssociationError::Receive(_)
			| AssociationError::Encode(_)
			| AssociationError::UnexpectedPdu(_)
			| AssociationError::InvalidState { .. } => Self::InvalidResponse(err.to_string()),
		}
	}
}

impl From<NegotiationError> for ScuError {
	fn from(err: NegotiationError) -> Self {
		Self::InvalidResponse(err.to_string())
	}
}

impl From<ReadError> for ScuError {
	fn from(err: ReadError) -> Self {
		match err {
			ReadError::Association(err) => Self::from(err),
			ReadError::Negotiation(err) => Self::from(err),
			other => Self::InvalidResponse(other.to_string()),
		}
	}
}

impl From<WriteError> for ScuError {
	fn from(err: WriteError) -> Self {
		match err {
			WriteError::Association(err) => Self::from(err),
			WriteError::Negotiation(err) => Self::from(err),
			// The outgoing command or data set could not be encoded.
			WriteError::Writer(err) => {
				Self::Validation(ValidationError::Configuration(err.to_string()))
			}
		}
	}
}

impl From<ServiceError> for ScuError {
	fn from(err: ServiceError) -> Self {
		match err {
			ServiceError::Read(err) => Self::from(err),
			ServiceError::Write(err) => Self::from(err),
			ServiceError::Association(err) => Self::from(err),
			ServiceError::Negotiation(err) => Self::from(err),
			other => Self::InvalidResponse(other.to_string()),
		}
	}
}
