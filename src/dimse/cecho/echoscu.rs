use super::{CompositeEchoRequest, COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE};
use crate::association::Association;
use crate::dimse::{
	next_message_id, DicomMessageReader, DicomMessageWriter, DimseStatus, ServiceError,
};
use crate::types::US;
use dicom::dictionary_std::uids;
use tracing::{debug, instrument, trace};

/// Service class user for the Verification SOP class.
/// It simply sends a C-ECHO-RQ and waits for a C-ECHO-RSP.
pub struct EchoServiceClassUser<'a, A> {
	association: &'a mut A,
	message_id: US,
}

impl<'a, A: Association> EchoServiceClassUser<'a, A> {
	pub fn new(association: &'a mut A) -> Self {
		Self {
			association,
			message_id: next_message_id(),
		}
	}

	pub const fn message_id(mut self, message_id: US) -> Self {
		self.message_id = message_id;
		self
	}

	/// Initiates the C-ECHO protocol and returns the peer's status.
	#[instrument(skip_all, name = "ECHO-SCU")]
	pub async fn echo(&mut self) -> Result<DimseStatus, ServiceError> {
		let presentation_context_id = self.association.presentation_context_for(uids::VERIFICATION)?.id;
		let request = CompositeEchoRequest {
			message_id: self.message_id,
		};
		self.association.write_message(request, presentation_context_id).await?;
		trace!("Sent C-ECHO-RQ");

		let response = self.association.read_message().await?;
		let status = response.expect_response(
			COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE,
			self.message_id,
			"C-ECHO-RSP",
		)?;
		debug!(status = status.code, "Received C-ECHO-RSP ({:?})", status.status_type);
		Ok(status)
	}
}
