use super::{CompositeStoreRequest, CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_RESPONSE};
use crate::association::Association;
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ServiceError};
use crate::results::StoreResult;
use tracing::{info, instrument, trace, warn};

/// Service class user for C-STORE. One request, one response.
pub struct StoreServiceClassUser<'a, A> {
	association: &'a mut A,
}

impl<'a, A: Association> StoreServiceClassUser<'a, A> {
	pub fn new(association: &'a mut A) -> Self {
		Self { association }
	}

	#[instrument(skip_all, name = "STORE-SCU", fields(sop_instance_uid = %request.affected_sop_instance_uid))]
	pub async fn store(&mut self, request: CompositeStoreRequest) -> Result<StoreResult, ServiceError> {
		let presentation_context_id = self
			.association
			.presentation_context_for(&request.affected_sop_class_uid)?
			.id;
		let message_id = request.message_id;
		let sop_instance_uid = request.affected_sop_instance_uid.clone();
		self.association.write_message(request, presentation_context_id).await?;
		trace!("Sent C-STORE-RQ");

		let message = self.association.read_message().await?;
		message.expect_response(COMMAND_FIELD_COMPOSITE_STORE_RESPONSE, message_id, "C-STORE-RSP")?;
		let response = CompositeStoreResponse::try_from(message)?;

		let result = StoreResult {
			status: response.status,
			sop_instance_uid,
		};
		if result.is_success() {
			info!("Stored instance with status {}", result.status);
		} else {
			warn!("Peer refused instance with status {}", result.status);
		}
		Ok(result)
	}
}
