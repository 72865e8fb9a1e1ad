use super::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, DimseStatus, ServiceError,
	DATA_SET_MISSING,
};
use crate::association::Association;
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use tracing::{debug, trace};

pub const COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST: US = 0x0FFF;

/// C-CANCEL-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.2.3.html>
#[derive(Debug, Copy, Clone)]
pub struct CompositeCancelRequest {
	/// Message ID of the C-FIND, C-MOVE or C-GET request to cancel.
	pub message_id_being_responded_to: US,
}

impl From<CompositeCancelRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeCancelRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_CANCEL_REQUEST])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [request.message_id_being_responded_to])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

/// Sends a C-CANCEL-RQ for an outstanding request and drains its responses.
/// Returns the status of the final response, usually Cancel (0xFE00).
pub async fn cancel<A: Association>(
	association: &mut A,
	presentation_context_id: u8,
	message_id: US,
	response_command_field: US,
	name: &'static str,
) -> Result<DimseStatus, ServiceError> {
	let request = CompositeCancelRequest {
		message_id_being_responded_to: message_id,
	};
	association.write_message(request, presentation_context_id).await?;
	debug!(message_id, "Sent C-CANCEL-RQ");

	loop {
		let response = association.read_message().await?;
		let status = response.expect_response(response_command_field, message_id, name)?;
		if !status.is_pending() {
			return Ok(status);
		}
		trace!("Discarded pending {name} after cancellation");
	}
}
