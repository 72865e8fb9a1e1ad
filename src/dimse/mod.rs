//! DIMSE message exchange on top of an [`Association`].
//! - C-FIND, C-MOVE, C-GET, C-STORE and C-ECHO are implemented as service class users.
//! - C-STORE sub-operations of C-GET are answered in the SCP role on the same association.
//!

pub mod ccancel;
pub mod cecho;
pub mod cfind;
pub mod cget;
pub mod cmove;
pub mod cstore;

use crate::association::pdu::{pdu_name, PDataValue, PDataValueType, Pdu, PDV_OVERHEAD};
use crate::association::{Association, AssociationError, NegotiationError};
use crate::types::{UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;
use tracing::{instrument, trace};

/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message contains a data set.
/// For reading DICOM messages, check for `command_data_set_type != DATA_SET_MISSING` instead,
/// as AEs are free to choose another value for a truthy state.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Should be set for [`tags::COMMAND_DATA_SET_TYPE`] if a DICOM message has no data set.
pub const DATA_SET_MISSING: US = 0x0101; // DICOM NULL

/// Represents a DICOM message composed of a command set followed by an optional data set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	/// The command set.
	pub command: InMemDicomObject,
	/// The data set.
	pub data: Option<InMemDicomObject>,
	/// The presentation context the message was received on.
	pub presentation_context_id: Option<u8>,
}

impl Debug for DicomMessage {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

impl DicomMessage {
	pub fn command_field(&self) -> Result<US, ReadError> {
		self.command_u16(tags::COMMAND_FIELD)
			.ok_or(ReadError::MissingAttribute(tags::COMMAND_FIELD))
	}

	pub fn status(&self) -> Result<DimseStatus, ReadError> {
		self.command_u16(tags::STATUS)
			.map(DimseStatus::new)
			.ok_or(ReadError::MissingAttribute(tags::STATUS))
	}

	pub fn command_u16(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	/// A string attribute of the command set without its padding.
	pub fn command_str(&self, tag: Tag) -> Option<UI> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value: Cow<'_, str>| UI::from(value.trim_end_matches(['\0', ' '])))
	}

	/// Checks that this is the expected response to the request with `message_id`.
	pub fn expect_response(
		&self,
		command_field: US,
		message_id: US,
		name: &'static str,
	) -> Result<DimseStatus, ServiceError> {
		let actual = self.command_field()?;
		if actual != command_field {
			return Err(ServiceError::UnexpectedCommand {
				expected: name,
				actual,
			});
		}
		if let Some(responded_to) = self.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO) {
			if responded_to != message_id {
				return Err(ServiceError::MessageIdMismatch {
					expected: message_id,
					actual: responded_to,
				});
			}
		}
		Ok(self.status()?)
	}
}

/// Status types supported by the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl StatusType {
	/// Like [`TryFrom`], but codes outside the known ranges are failures.
	pub fn classify(code: US) -> Self {
		Self::try_from(code).unwrap_or(Self::Failure)
	}
}

impl TryFrom<u16> for StatusType {
	type Error = u16;

	/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0xC000..=0xCFFF | 0x0100..=0x01FF | 0x0200..=0x02FF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

/// A raw DIMSE status code together with its classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DimseStatus {
	pub code: US,
	pub status_type: StatusType,
}

impl DimseStatus {
	pub const SUCCESS: Self = Self {
		code: 0x0000,
		status_type: StatusType::Success,
	};

	pub fn new(code: US) -> Self {
		Self {
			code,
			status_type: StatusType::classify(code),
		}
	}

	pub fn is_success(&self) -> bool {
		self.status_type == StatusType::Success
	}

	pub fn is_pending(&self) -> bool {
		self.status_type == StatusType::Pending
	}
}

impl Display for DimseStatus {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(f, "0x{:04X} ({:?})", self.code, self.status_type)
	}
}

/// Sub-operation counters of a C-MOVE-RSP or C-GET-RSP. Absent attributes are `None`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SubOperationCounters {
	pub remaining: Option<US>,
	pub completed: Option<US>,
	pub failed: Option<US>,
	pub warning: Option<US>,
}

impl SubOperationCounters {
	pub fn from_message(message: &DicomMessage) -> Self {
		Self {
			remaining: message.command_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
			completed: message.command_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
			failed: message.command_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
			warning: message.command_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
		}
	}

	pub const fn is_empty(&self) -> bool {
		self.remaining.is_none()
			&& self.completed.is_none()
			&& self.failed.is_none()
			&& self.warning.is_none()
	}

	/// Adds the present counters to a response command set.
	pub fn put_into(&self, command: &mut InMemDicomObject) {
		let counters = [
			(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, self.remaining),
			(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, self.completed),
			(tags::NUMBER_OF_FAILED_SUBOPERATIONS, self.failed),
			(tags::NUMBER_OF_WARNING_SUBOPERATIONS, self.warning),
		];
		for (tag, value) in counters {
			if let Some(value) = value {
				command.put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
			}
		}
	}
}

pub trait DicomMessageReader {
	async fn read_message(&mut self) -> Result<DicomMessage, ReadError>;
}

pub trait DicomMessageWriter {
	async fn write_message(
		&mut self,
		message: impl Into<DicomMessage>,
		presentation_context_id: u8,
	) -> Result<(), WriteError>;
}

/// Number of data bytes per PDV so that a P-DATA-TF stays within `max_pdu_length`.
pub const fn fragment_length(max_pdu_length: u32) -> usize {
	if max_pdu_length == 0 {
		usize::MAX
	} else if max_pdu_length <= PDV_OVERHEAD {
		1
	} else {
		(max_pdu_length - PDV_OVERHEAD) as usize
	}
}

async fn send_fragments<A: Association>(
	association: &mut A,
	presentation_context_id: u8,
	value_type: PDataValueType,
	buf: &[u8],
) -> Result<(), AssociationError> {
	let max_fragment = fragment_length(association.max_pdu_length());
	let mut fragments = buf.chunks(max_fragment).peekable();
	if fragments.peek().is_none() {
		return association
			.send(Pdu::PData {
				data: vec![PDataValue {
					presentation_context_id,
					value_type,
					is_last: true,
					data: Vec::new(),
				}],
			})
			.await;
	}
	while let Some(fragment) = fragments.next() {
		let is_last = fragments.peek().is_none();
		trace!("Sending {value_type:?} fragment of {} bytes (last={is_last})", fragment.len());
		association
			.send(Pdu::PData {
				data: vec![PDataValue {
					presentation_context_id,
					value_type: value_type.clone(),
					is_last,
					data: fragment.to_vec(),
				}],
			})
			.await?;
	}
	Ok(())
}

impl<A: Association> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&mut self,
		message: impl Into<DicomMessage>,
		presentation_context_id: u8,
	) -> Result<(), WriteError> {
		let message: DicomMessage = Into::into(message);
		let transfer_syntax_uid = self
			.presentation_context(presentation_context_id)?
			.transfer_syntax
			.clone();

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;
		send_fragments(self, presentation_context_id, PDataValueType::Command, &command_buf).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&transfer_syntax_uid)
				.ok_or_else(|| NegotiationError::UnknownTransferSyntax(transfer_syntax_uid.clone()))?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;
			send_fragments(self, presentation_context_id, PDataValueType::Data, &data_buf).await?;
		}

		Ok(())
	}
}

impl<A: Association> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&mut self) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive().await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(pdu_name(&pdu)));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							// The full command set was already received.
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						let command = match (message_command.take(), pdv.is_last) {
							// Data cannot be interpreted before the entire command set.
							(None, _) => return Err(ReadError::OutOfOrder),
							(Some(command), false) => {
								data_fragments.append(&mut pdv.data);
								message_command = Some(command);
								continue;
							}
							(Some(command), true) => command,
						};
						data_fragments.append(&mut pdv.data);

						let transfer_syntax_uid = &self
							.presentation_context(pdv.presentation_context_id)?
							.transfer_syntax;
						let transfer_syntax = TransferSyntaxRegistry
							.get(transfer_syntax_uid)
							.ok_or_else(|| {
								NegotiationError::UnknownTransferSyntax(transfer_syntax_uid.clone())
							})?;
						let data = InMemDicomObject::read_dataset_with_ts(
							data_fragments.as_slice(),
							transfer_syntax,
						)?;

						return Ok(DicomMessage {
							command,
							data: Some(data),
							presentation_context_id: Some(pdv.presentation_context_id),
						});
					}
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected {0}")]
	UnexpectedPdu(&'static str),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
	#[error("Message has no data set")]
	MissingDataSet,
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
}

/// Errors of a single DIMSE operation.
#[derive(Debug, Error)]
pub enum ServiceError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Expected {expected}, received command field 0x{actual:04X}")]
	UnexpectedCommand { expected: &'static str, actual: US },
	#[error("Response refers to message {actual}, expected {expected}")]
	MessageIdMismatch { expected: US, actual: US },
}

/// Returns a new message id by incrementing a global counter. Zero is never returned.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	loop {
		let id = CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst);
		if id != 0 {
			return id;
		}
	}
}
