pub mod storescp;
pub mod storescu;

pub use storescp::{DirectoryStore, ReceivedInstance, StoreHandler};
pub use storescu::StoreServiceClassUser;

use super::{DicomMessage, DimseStatus, ReadError, DATA_SET_EXISTS, DATA_SET_MISSING};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;

// Magic numbers defined by the DICOM specification.
pub const COMMAND_FIELD_COMPOSITE_STORE_REQUEST: US = 0x0001;
pub const COMMAND_FIELD_COMPOSITE_STORE_RESPONSE: US = 0x8001;

/// C-STORE-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_9.3.html#sect_9.3.1>
#[derive(Debug)]
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<String>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
		let mut command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_REQUEST])),
			DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
			DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
		]);

		if let Some(move_originator_aet) = request.move_originator_aet {
			command.put(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
		}
		if let Some(move_originator_message_id) = request.move_originator_message_id {
			command.put(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
		}

		Self {
			command,
			data: Some(request.data_set),
			presentation_context_id: None,
		}
	}
}

impl TryFrom<DicomMessage> for CompositeStoreRequest {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let affected_sop_class_uid = message
			.command_str(tags::AFFECTED_SOP_CLASS_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_CLASS_UID))?;
		let affected_sop_instance_uid = message
			.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
			.ok_or(ReadError::MissingAttribute(tags::AFFECTED_SOP_INSTANCE_UID))?;
		let message_id = message
			.command_u16(tags::MESSAGE_ID)
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID))?;

		Ok(Self {
			affected_sop_class_uid,
			affected_sop_instance_uid,
			move_originator_aet: message.command_str(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE),
			move_originator_message_id: message.command_u16(tags::MOVE_ORIGINATOR_MESSAGE_ID),
			message_id,
			priority: message.command_u16(tags::PRIORITY).unwrap_or_default(),
			data_set: message.data.ok_or(ReadError::MissingDataSet)?,
		})
	}
}

/// C-STORE-RSP
#[derive(Debug)]
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: DimseStatus,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_STORE_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status.code])),
			DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid)),
		]);

		Self {
			command,
			data: None,
			presentation_context_id: None,
		}
	}
}

impl TryFrom<DicomMessage> for CompositeStoreResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let message_id = message
			.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
			.ok_or(ReadError::MissingAttribute(tags::MESSAGE_ID_BEING_RESPONDED_TO))?;
		Ok(Self {
			message_id,
			sop_class_uid: message.command_str(tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default(),
			sop_instance_uid: message
				.command_str(tags::AFFECTED_SOP_INSTANCE_UID)
				.unwrap_or_default(),
			status: message.status()?,
		})
	}
}
