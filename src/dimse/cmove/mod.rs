use super::{
	DicomMessage, DimseStatus, ReadError, SubOperationCounters, DATA_SET_EXISTS, DATA_SET_MISSING,
};
use crate::types::{AeTitle, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

pub mod movescu;

pub use movescu::MoveServiceClassUser;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_MOVE_REQUEST: US = 0x0021;
pub const COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE: US = 0x8021;

/// C-MOVE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.4.html>
#[derive(Debug)]
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AeTitle,
	pub affected_sop_class_uid: UI,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination.to_string())),
		]);

		Self {
			command,
			data: Some(request.identifier),
			presentation_context_id: None,
		}
	}
}

/// C-MOVE-RSP
#[derive(Debug)]
pub struct CompositeMoveResponse {
	pub message_id: US,
	pub status: DimseStatus,
	pub counters: SubOperationCounters,
}

impl From<CompositeMoveResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeMoveResponse) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status.code])),
		]);
		response.counters.put_into(&mut command);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

impl TryFrom<DicomMessage> for CompositeMoveResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message
			.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID_BEING_RESPONDED_TO))?;
		Ok(Self {
			message_id,
			status: message.status()?,
			counters: SubOperationCounters::from_message(&message),
		})
	}
}
