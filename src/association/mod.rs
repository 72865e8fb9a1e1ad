use crate::types::UI;
use pdu::{
	describe_abort, describe_rejection, AbortRQSource, AssociationRJ, Pdu,
	PresentationContextNegotiated, PresentationContextResultReason,
};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub mod client;
pub mod pdu;

pub use client::{ClientAssociation, ClientAssociationOptions};

#[derive(Debug, Error)]
pub enum AssociationError {
	#[error("Failed to connect to {address}: {source}")]
	Connect {
		address: String,
		source: std::io::Error,
	},
	#[error("Timed out after {0:?}")]
	Timeout(Duration),
	#[error("Cancelled by the caller")]
	Cancelled,
	#[error("Association rejected: {}", describe_rejection(.0))]
	Rejected(AssociationRJ),
	#[error("Association aborted by {}", describe_abort(.0))]
	Aborted(AbortRQSource),
	#[error("Connection closed by peer")]
	ConnectionClosed,
	#[error("Connection failed: {0}")]
	Io(std::io::Error),
	#[error("Failed to receive PDU: {0}")]
	Receive(dicom_ul::association::Error),
	#[error("Failed to encode PDU: {0}")]
	Encode(#[from] dicom_ul::pdu::WriteError),
	#[error("Received unexpected {0}")]
	UnexpectedPdu(&'static str),
	#[error("Cannot {operation} while the association is {state:?}")]
	InvalidState {
		operation: &'static str,
		state: AssociationState,
	},
	#[error("Cannot propose {0} presentation contexts, at most 128 are allowed")]
	TooManyPresentationContexts(usize),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("No presentation context was proposed for '{0}'")]
	NotProposed(UI),
	#[error("Presentation context for '{abstract_syntax}' was not accepted: {reason}")]
	Rejected {
		abstract_syntax: UI,
		reason: PresentationContextResultReason,
	},
	#[error("No presentation context with id {0}")]
	UnknownPresentationContext(u8),
}

/// Lifecycle of an association, as seen by the requestor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AssociationState {
	Idle,
	Requesting,
	Established,
	Releasing,
	Closed,
	Aborted,
}

fn is_accepted(pctx: &PresentationContextNegotiated) -> bool {
	pctx.reason == PresentationContextResultReason::Acceptance
}

/// Combines the maximum PDU lengths of both sides. 0 means unlimited.
pub const fn negotiate_max_pdu_length(requested: u32, accepted: u32) -> u32 {
	match (requested, accepted) {
		(0, other) | (other, 0) => other,
		(requested, accepted) if requested < accepted => requested,
		(_, accepted) => accepted,
	}
}

pub trait Association {
	fn uuid(&self) -> &Uuid;

	fn state(&self) -> AssociationState;

	async fn send(&mut self, pdu: Pdu) -> Result<(), AssociationError>;

	async fn receive(&mut self) -> Result<Pdu, AssociationError>;

	/// Every proposed context with the peer's answer, rejected ones included.
	fn presentation_contexts(&self) -> &[PresentationContextNegotiated];

	/// Largest P-DATA-TF variable field either side accepts. 0 means unlimited.
	fn max_pdu_length(&self) -> u32;

	/// The accepted presentation context for an abstract syntax.
	fn presentation_context_for(
		&self,
		abstract_syntax: &str,
	) -> Result<&PresentationContextNegotiated, NegotiationError> {
		let mut proposed = self
			.presentation_contexts()
			.iter()
			.filter(|pctx| pctx.abstract_syntax == abstract_syntax)
			.peekable();
		let first_rejection = proposed.peek().map(|pctx| pctx.reason.clone());
		proposed
			.find(|pctx| is_accepted(pctx))
			.ok_or_else(|| match first_rejection {
				Some(reason) => NegotiationError::Rejected {
					abstract_syntax: UI::from(abstract_syntax),
					reason,
				},
				None => NegotiationError::NotProposed(UI::from(abstract_syntax)),
			})
	}

	fn presentation_context(&self, id: u8) -> Result<&PresentationContextNegotiated, NegotiationError> {
		self.presentation_contexts()
			.iter()
			.find(|pctx| pctx.id == id && is_accepted(pctx))
			.ok_or(NegotiationError::UnknownPresentationContext(id))
	}
}
