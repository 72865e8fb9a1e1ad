//! Upper Layer PDUs as defined by `dicom_ul`, plus what the requestor adds on top:
//! SCP/SCU role selection, log names and a PDU stream over any async socket.
//! <https://dicom.nema.org/medical/dicom/current/output/chtml/part08/sect_9.3.html>

use super::AssociationError;
use bytes::BytesMut;
use dicom_ul::association::{read_pdu_from_wire_async, Error as UlError};
use dicom_ul::pdu::ReadError;
use std::borrow::Cow;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub use dicom_ul::pdu::{
	AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
	AssociationRJServiceProviderPresentationReason, AssociationRJServiceUserReason,
	AssociationRJSource, AssociationRQ, PDataValue, PDataValueType,
	PresentationContextNegotiated, PresentationContextProposed, PresentationContextResult,
	PresentationContextResultReason, UserVariableItem,
};
pub use dicom_ul::Pdu;

/// Bytes of a P-DATA-TF variable field taken by the PDV item length, presentation context id
/// and message control header. Fragment data is limited to the max PDU length minus this.
pub const PDV_OVERHEAD: u32 = dicom_ul::pdu::PDV_HEADER_SIZE;
pub const PROTOCOL_VERSION: u16 = 0x0001;
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16_384;
pub const MINIMUM_MAX_PDU_LENGTH: u32 = 1_024;

const ROLE_SELECTION_ITEM: u8 = 0x54;

/// A short name for log messages and errors.
pub const fn pdu_name(pdu: &Pdu) -> &'static str {
	match pdu {
		Pdu::Unknown { .. } => "unknown PDU",
		Pdu::AssociationRQ(_) => "A-ASSOCIATE-RQ",
		Pdu::AssociationAC(_) => "A-ASSOCIATE-AC",
		Pdu::AssociationRJ(_) => "A-ASSOCIATE-RJ",
		Pdu::PData { .. } => "P-DATA-TF",
		Pdu::ReleaseRQ => "A-RELEASE-RQ",
		Pdu::ReleaseRP => "A-RELEASE-RP",
		Pdu::AbortRQ { .. } => "A-ABORT",
	}
}

pub fn describe_abort(source: &AbortRQSource) -> Cow<'static, str> {
	match source {
		AbortRQSource::ServiceUser => Cow::Borrowed("service-user"),
		AbortRQSource::Reserved => Cow::Borrowed("reserved"),
		AbortRQSource::ServiceProvider(reason) => Cow::Owned(format!("service-provider, {reason}")),
	}
}

pub fn describe_rejection(rejection: &AssociationRJ) -> String {
	let result = match rejection.result {
		AssociationRJResult::Permanent => "rejected-permanent",
		AssociationRJResult::Transient => "rejected-transient",
	};
	format!("{result}, {}", rejection.source)
}

/// SCP/SCU Role Selection sub-item of the User Information item.
/// `dicom_ul` has no variant for it, so it travels as an unknown user variable.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_D.3.3.4.html>
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
	pub sop_class_uid: String,
	pub scu_role: bool,
	pub scp_role: bool,
}

impl RoleSelection {
	pub fn to_user_variable(&self) -> UserVariableItem {
		let uid = self.sop_class_uid.as_bytes();
		// UIDs are at most 64 bytes
		#[allow(clippy::cast_possible_truncation)]
		let uid_length = uid.len() as u16;
		let mut data = Vec::with_capacity(uid.len() + 4);
		data.extend_from_slice(&uid_length.to_be_bytes());
		data.extend_from_slice(uid);
		data.push(u8::from(self.scu_role));
		data.push(u8::from(self.scp_role));
		UserVariableItem::Unknown(ROLE_SELECTION_ITEM, data)
	}

	pub fn from_user_variable(item: &UserVariableItem) -> Option<Self> {
		let UserVariableItem::Unknown(ROLE_SELECTION_ITEM, data) = item else {
			return None;
		};
		let (uid_length, rest) = data.split_first_chunk::<2>()?;
		let uid_length = usize::from(u16::from_be_bytes(*uid_length));
		if rest.len() != uid_length + 2 {
			return None;
		}
		let (uid, roles) = rest.split_at(uid_length);
		Some(Self {
			sop_class_uid: String::from_utf8_lossy(uid).trim_end_matches('\0').to_owned(),
			scu_role: roles[0] == 1,
			scp_role: roles[1] == 1,
		})
	}
}

/// Reads and writes whole PDUs on a byte stream.
pub struct PduStream<S> {
	socket: S,
	read_buffer: BytesMut,
	write_buffer: Vec<u8>,
	/// Largest PDU accepted from the peer. 0 means unlimited.
	max_receive_length: u32,
}

impl<S> PduStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	pub fn new(socket: S, max_receive_length: u32) -> Self {
		Self {
			socket,
			read_buffer: BytesMut::with_capacity(DEFAULT_MAX_PDU_LENGTH as usize),
			write_buffer: Vec::with_capacity(DEFAULT_MAX_PDU_LENGTH as usize),
			max_receive_length,
		}
	}

	/// Waits for the next complete PDU. Cancel safe: partial reads stay buffered.
	pub async fn read(&mut self) -> Result<Pdu, AssociationError> {
		let max_pdu_length = match self.max_receive_length {
			0 => u32::MAX,
			length => length,
		};
		read_pdu_from_wire_async(&mut self.socket, &mut self.read_buffer, max_pdu_length, true)
			.await
			.map_err(|err| match err {
				UlError::ConnectionClosed => AssociationError::ConnectionClosed,
				UlError::ReceivePdu {
					source: ReadError::ReadPdu { source, .. },
					..
				} => AssociationError::Io(source),
				other => AssociationError::Receive(other),
			})
	}

	pub async fn write(&mut self, pdu: &Pdu) -> Result<(), AssociationError> {
		self.write_buffer.clear();
		dicom_ul::write_pdu(&mut self.write_buffer, pdu)?;
		self.socket
			.write_all(&self.write_buffer)
			.await
			.map_err(AssociationError::Io)
	}

	pub async fn shutdown(&mut self) -> std::io::Result<()> {
		self.socket.shutdown().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn role_selection_round_trips_through_the_user_variable() {
		let role = RoleSelection {
			sop_class_uid: String::from("1.2.840.10008.5.1.4.1.1.2"),
			scu_role: false,
			scp_role: true,
		};
		let item = role.to_user_variable();
		let UserVariableItem::Unknown(item_type, data) = &item else {
			panic!("expected an unknown user variable, got {item:?}");
		};
		assert_eq!(*item_type, 0x54);
		assert_eq!(&data[..2], &[0x00, 0x19]);
		assert_eq!(&data[data.len() - 2..], &[0, 1]);
		assert_eq!(RoleSelection::from_user_variable(&item), Some(role));
	}

	#[test]
	fn other_user_variables_are_not_role_selections() {
		assert_eq!(RoleSelection::from_user_variable(&UserVariableItem::MaxLength(16_384)), None);
		assert_eq!(
			RoleSelection::from_user_variable(&UserVariableItem::Unknown(0x54, vec![0x00, 0x08, b'1'])),
			None
		);
	}

	#[tokio::test]
	async fn pdus_cross_a_split_stream() {
		let (client, server) = tokio::io::duplex(64);
		let mut client = PduStream::new(client, 0);
		let mut server = PduStream::new(server, 0);
		let pdu = Pdu::PData {
			data: vec![PDataValue {
				presentation_context_id: 1,
				value_type: PDataValueType::Data,
				is_last: true,
				data: vec![0x55; 1_000],
			}],
		};

		let writer = tokio::spawn(async move {
			client.write(&pdu).await.unwrap();
			client.write(&Pdu::ReleaseRQ).await.unwrap();
			client
		});
		let Pdu::PData { data } = server.read().await.unwrap() else {
			panic!("expected P-DATA-TF");
		};
		assert_eq!(data[0].data.len(), 1_000);
		assert_eq!(server.read().await.unwrap(), Pdu::ReleaseRQ);

		drop(writer.await.unwrap());
		assert!(matches!(server.read().await, Err(AssociationError::ConnectionClosed)));
	}

	#[tokio::test]
	async fn oversized_pdus_are_refused() {
		let (client, server) = tokio::io::duplex(64 * 1024);
		let mut client = PduStream::new(client, 0);
		let mut server = PduStream::new(server, MINIMUM_MAX_PDU_LENGTH);
		client
			.write(&Pdu::PData {
				data: vec![PDataValue {
					presentation_context_id: 1,
					value_type: PDataValueType::Data,
					is_last: true,
					data: vec![0; 4_096],
				}],
			})
			.await
			.unwrap();
		assert!(matches!(server.read().await, Err(AssociationError::Receive(_))));
	}

	#[test]
	fn rejections_and_aborts_are_described() {
		let rejection = AssociationRJ {
			result: AssociationRJResult::Permanent,
			source: AssociationRJSource::ServiceUser(
				AssociationRJServiceUserReason::CalledAETitleNotRecognized,
			),
		};
		assert_eq!(
			describe_rejection(&rejection),
			"rejected-permanent, called AE title not recognized"
		);
		assert_eq!(
			describe_abort(&AbortRQSource::ServiceProvider(
				AbortRQServiceProviderReason::UnexpectedPdu
			)),
			"service-provider, unexpected PDU"
		);
	}
}
