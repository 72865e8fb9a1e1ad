use super::pdu::{
	describe_abort, describe_rejection, pdu_name, AbortRQSource, AssociationRQ, Pdu, PduStream,
	PresentationContextNegotiated, PresentationContextProposed, PresentationContextResultReason,
	RoleSelection, UserVariableItem, APPLICATION_CONTEXT_NAME, DEFAULT_MAX_PDU_LENGTH,
	PROTOCOL_VERSION,
};
use super::{is_accepted, negotiate_max_pdu_length, Association, AssociationError, AssociationState};
use crate::types::{AeTitle, UI};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Upper bound for sending an A-ABORT, which must not block teardown.
const ABORT_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_PRESENTATION_CONTEXTS: usize = 128;

/// Parameters for requesting an association.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
	calling_ae_title: AeTitle,
	called_ae_title: AeTitle,
	presentation_contexts: Vec<(UI, Vec<UI>)>,
	scp_roles: Vec<UI>,
	max_pdu_length: u32,
	timeout: Duration,
	cancellation: CancellationToken,
}

impl ClientAssociationOptions {
	pub fn new(calling_ae_title: AeTitle, called_ae_title: AeTitle) -> Self {
		Self {
			calling_ae_title,
			called_ae_title,
			presentation_contexts: Vec::new(),
			scp_roles: Vec::new(),
			max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
			timeout: Duration::from_secs(30),
			cancellation: CancellationToken::new(),
		}
	}

	/// Proposes a presentation context. Ids are assigned in proposal order (1, 3, 5, ...).
	pub fn with_presentation_context(
		mut self,
		abstract_syntax: impl Into<UI>,
		transfer_syntaxes: Vec<UI>,
	) -> Self {
		self.presentation_contexts
			.push((abstract_syntax.into(), transfer_syntaxes));
		self
	}

	/// Requests the SCP role for a SOP class, so the peer may send C-STORE sub-operations
	/// over this association.
	pub fn with_scp_role(mut self, sop_class_uid: impl Into<UI>) -> Self {
		self.scp_roles.push(sop_class_uid.into());
		self
	}

	pub const fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
		self.max_pdu_length = max_pdu_length;
		self
	}

	/// Timeout for connecting and for every single PDU exchange.
	pub const fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
		self.cancellation = cancellation;
		self
	}

	/// Connects to `address` (host:port) and negotiates the association.
	#[instrument(skip_all, fields(address = address, called = %self.called_ae_title))]
	pub async fn establish(
		self,
		address: &str,
	) -> Result<ClientAssociation<TcpStream>, AssociationError> {
		let connect = tokio::time::timeout(self.timeout, TcpStream::connect(address));
		let stream = tokio::select! {
			biased;
			() = self.cancellation.cancelled() => return Err(AssociationError::Cancelled),
			result = connect => result
				.map_err(|_| AssociationError::Timeout(self.timeout))?
				.map_err(|source| AssociationError::Connect {
					address: String::from(address),
					source,
				})?,
		};
		if let Err(err) = stream.set_nodelay(true) {
			debug!("Failed to set TCP_NODELAY: {err}");
		}
		self.establish_with(stream).await
	}

	/// Negotiates the association over an already connected stream.
	pub async fn establish_with<S>(self, stream: S) -> Result<ClientAssociation<S>, AssociationError>
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		if self.presentation_contexts.len() > MAX_PRESENTATION_CONTEXTS {
			return Err(AssociationError::TooManyPresentationContexts(
				self.presentation_contexts.len(),
			));
		}

		let proposed: Vec<PresentationContextProposed> = self
			.presentation_contexts
			.into_iter()
			.zip((1u8..=255).step_by(2))
			.map(|((abstract_syntax, transfer_syntaxes), id)| PresentationContextProposed {
				id,
				abstract_syntax,
				transfer_syntaxes,
			})
			.collect();

		let mut user_variables = vec![
			UserVariableItem::MaxLength(self.max_pdu_length),
			UserVariableItem::ImplementationClassUID(UI::from(IMPLEMENTATION_CLASS_UID)),
			UserVariableItem::ImplementationVersionName(String::from(IMPLEMENTATION_VERSION_NAME)),
		];
		user_variables.extend(self.scp_roles.into_iter().map(|sop_class_uid| {
			RoleSelection {
				sop_class_uid,
				scu_role: true,
				scp_role: true,
			}
			.to_user_variable()
		}));

		let request = AssociationRQ {
			protocol_version: PROTOCOL_VERSION,
			calling_ae_title: String::from(self.calling_ae_title.as_str()),
			called_ae_title: String::from(self.called_ae_title.as_str()),
			application_context_name: UI::from(APPLICATION_CONTEXT_NAME),
			presentation_contexts: proposed.clone(),
			user_variables,
		};

		let mut association = ClientAssociation {
			stream: PduStream::new(stream, self.max_pdu_length),
			uuid: Uuid::new_v4(),
			state: AssociationState::Requesting,
			presentation_contexts: Vec::new(),
			max_pdu_length: self.max_pdu_length,
			timeout: self.timeout,
			cancellation: self.cancellation,
		};

		association.transmit(Pdu::AssociationRQ(request)).await?;

		match association.next_pdu().await? {
			Pdu::AssociationAC(ac) => {
				association.presentation_contexts = proposed
					.into_iter()
					.map(|pctx| {
						let result = ac.presentation_contexts.iter().find(|r| r.id == pctx.id);
						PresentationContextNegotiated {
							id: pctx.id,
							abstract_syntax: pctx.abstract_syntax,
							transfer_syntax: result
								.map(|r| r.transfer_syntax.clone())
								.unwrap_or_default(),
							reason: result.map_or(PresentationContextResultReason::NoReason, |r| {
								r.reason.clone()
							}),
						}
					})
					.collect();

				let acceptor_max_pdu_length = ac
					.user_variables
					.iter()
					.find_map(|variable| match variable {
						UserVariableItem::MaxLength(length) => Some(*length),
						_ => None,
					})
					.unwrap_or(0);
				association.max_pdu_length =
					negotiate_max_pdu_length(self.max_pdu_length, acceptor_max_pdu_length);
				association.state = AssociationState::Established;

				for pctx in association.presentation_contexts.iter().filter(|p| !is_accepted(p)) {
					debug!(
						association_id = %association.uuid,
						abstract_syntax = %pctx.abstract_syntax,
						"Presentation context {} rejected: {}",
						pctx.id,
						pctx.reason
					);
				}
				for role in ac.user_variables.iter().filter_map(RoleSelection::from_user_variable) {
					if !role.scp_role {
						debug!(
							association_id = %association.uuid,
							"Peer declined the SCP role for {}", role.sop_class_uid
						);
					}
				}
				info!(
					association_id = %association.uuid,
					max_pdu_length = association.max_pdu_length,
					"Established association with {}",
					ac.called_ae_title
				);
				Ok(association)
			}
			Pdu::AssociationRJ(rejection) => {
				warn!(
					association_id = %association.uuid,
					"Association rejected: {}",
					describe_rejection(&rejection)
				);
				association.state = AssociationState::Closed;
				association.shutdown().await;
				Err(AssociationError::Rejected(rejection))
			}
			other => {
				association.abort_in_place().await;
				Err(AssociationError::UnexpectedPdu(pdu_name(&other)))
			}
		}
	}
}

/// The requestor side of an established association.
///
/// Every PDU exchange is bounded by the configured timeout and observes the cancellation
/// token. Either one aborts the association. Dropping an established association without
/// calling [`Self::release`] or [`Self::abort`] leaves the peer to notice the closed socket.
pub struct ClientAssociation<S = TcpStream> {
	stream: PduStream<S>,
	uuid: Uuid,
	state: AssociationState,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	max_pdu_length: u32,
	timeout: Duration,
	cancellation: CancellationToken,
}

impl<S> ClientAssociation<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	/// Performs the orderly release handshake.
	/// P-DATA-TF PDUs that arrive before the A-RELEASE-RP are discarded.
	#[instrument(skip_all, fields(association_id = %self.uuid))]
	pub async fn release(mut self) -> Result<(), AssociationError> {
		self.ensure_established("release")?;
		self.state = AssociationState::Releasing;
		self.transmit(Pdu::ReleaseRQ).await?;

		loop {
			match self.next_pdu().await? {
				Pdu::ReleaseRP => break,
				Pdu::PData { .. } => trace!("Discarding P-DATA-TF received while releasing"),
				// Release collision: answer the peer, then keep waiting for our reply.
				Pdu::ReleaseRQ => self.transmit(Pdu::ReleaseRP).await?,
				other => {
					self.abort_in_place().await;
					return Err(AssociationError::UnexpectedPdu(pdu_name(&other)));
				}
			}
		}

		self.state = AssociationState::Closed;
		self.shutdown().await;
		debug!("Released association");
		Ok(())
	}

	/// Sends an A-ABORT (if the association is still open) and closes the connection.
	#[instrument(skip_all, fields(association_id = %self.uuid))]
	pub async fn abort(mut self) {
		self.abort_in_place().await;
	}

	fn ensure_established(&self, operation: &'static str) -> Result<(), AssociationError> {
		if self.state == AssociationState::Established {
			Ok(())
		} else {
			Err(AssociationError::InvalidState {
				operation,
				state: self.state,
			})
		}
	}

	async fn transmit(&mut self, pdu: Pdu) -> Result<(), AssociationError> {
		let cancellation = self.cancellation.clone();
		let timeout = self.timeout;
		let name = pdu_name(&pdu);

		let outcome = tokio::select! {
			biased;
			() = cancellation.cancelled() => None,
			result = tokio::time::timeout(timeout, self.stream.write(&pdu)) => Some(result),
		};

		match outcome {
			Some(Ok(Ok(()))) => {
				trace!(association_id = %self.uuid, "Sent {name}");
				Ok(())
			}
			Some(Ok(Err(err))) => {
				self.abort_in_place().await;
				Err(err)
			}
			Some(Err(_)) => {
				warn!(association_id = %self.uuid, "Timed out sending {name}");
				self.abort_in_place().await;
				Err(AssociationError::Timeout(timeout))
			}
			None => {
				debug!(association_id = %self.uuid, "Cancelled while sending {name}");
				self.abort_in_place().await;
				Err(AssociationError::Cancelled)
			}
		}
	}

	async fn next_pdu(&mut self) -> Result<Pdu, AssociationError> {
		let cancellation = self.cancellation.clone();
		let timeout = self.timeout;

		let outcome = tokio::select! {
			biased;
			() = cancellation.cancelled() => None,
			result = tokio::time::timeout(timeout, self.stream.read()) => Some(result),
		};

		match outcome {
			Some(Ok(Ok(Pdu::AbortRQ { source }))) => {
				warn!(
					association_id = %self.uuid,
					"Peer aborted the association ({})",
					describe_abort(&source)
				);
				self.state = AssociationState::Aborted;
				self.shutdown().await;
				Err(AssociationError::Aborted(source))
			}
			Some(Ok(Ok(pdu))) => {
				trace!(association_id = %self.uuid, "Received {}", pdu_name(&pdu));
				Ok(pdu)
			}
			Some(Ok(Err(AssociationError::ConnectionClosed))) => {
				self.state = AssociationState::Aborted;
				Err(AssociationError::ConnectionClosed)
			}
			Some(Ok(Err(err))) => {
				warn!(association_id = %self.uuid, "Failed to receive PDU: {err}");
				self.abort_in_place().await;
				Err(err)
			}
			Some(Err(_)) => {
				warn!(association_id = %self.uuid, "Timed out waiting for PDU");
				self.abort_in_place().await;
				Err(AssociationError::Timeout(timeout))
			}
			None => {
				debug!(association_id = %self.uuid, "Cancelled while waiting for PDU");
				self.abort_in_place().await;
				Err(AssociationError::Cancelled)
			}
		}
	}

	async fn abort_in_place(&mut self) {
		if matches!(
			self.state,
			AssociationState::Closed | AssociationState::Aborted | AssociationState::Idle
		) {
			return;
		}
		self.state = AssociationState::Aborted;

		let abort = Pdu::AbortRQ {
			source: AbortRQSource::ServiceUser,
		};
		match tokio::time::timeout(ABORT_TIMEOUT, self.stream.write(&abort)).await {
			Ok(Ok(())) => debug!(association_id = %self.uuid, "Sent A-ABORT"),
			Ok(Err(err)) => debug!(association_id = %self.uuid, "Failed to send A-ABORT: {err}"),
			Err(_) => debug!(association_id = %self.uuid, "Timed out sending A-ABORT"),
		}
		self.shutdown().await;
	}

	async fn shutdown(&mut self) {
		let shutdown = self.stream.shutdown();
		match tokio::time::timeout(ABORT_TIMEOUT, shutdown).await {
			Ok(Ok(())) => {}
			Ok(Err(err)) => debug!(association_id = %self.uuid, "Failed to shutdown stream: {err}"),
			Err(_) => debug!(association_id = %self.uuid, "Timed out shutting down stream"),
		}
	}
}

impl<S> Drop for ClientAssociation<S> {
	fn drop(&mut self) {
		if matches!(
			self.state,
			AssociationState::Requesting | AssociationState::Established | AssociationState::Releasing
		) {
			debug!(
				association_id = %self.uuid,
				"Association dropped in state {:?}", self.state
			);
		}
	}
}

impl<S> Association for ClientAssociation<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	fn state(&self) -> AssociationState {
		self.state
	}

	async fn send(&mut self, pdu: Pdu) -> Result<(), AssociationError> {
		self.ensure_established("send")?;
		self.transmit(pdu).await
	}

	async fn receive(&mut self) -> Result<Pdu, AssociationError> {
		self.ensure_established("receive")?;
		self.next_pdu().await
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}

	fn max_pdu_length(&self) -> u32 {
		self.max_pdu_length
	}
}
