//! A scripted storage/query SCP on a loopback socket, negotiated by `dicom_ul`'s acceptor.
#![allow(dead_code)]

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use dicom_scu::association::pdu::{Pdu, PresentationContextNegotiated};
use dicom_scu::association::{Association, AssociationError, AssociationState};
use dicom_scu::dimse::cecho::CompositeEchoResponse;
use dicom_scu::dimse::cfind::CompositeFindResponse;
use dicom_scu::dimse::cget::CompositeGetResponse;
use dicom_scu::dimse::cmove::CompositeMoveResponse;
use dicom_scu::dimse::cstore::storescp::respond_to_store_request;
use dicom_scu::dimse::cstore::{CompositeStoreRequest, ReceivedInstance};
use dicom_scu::dimse::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, DimseStatus, SubOperationCounters,
};
use dicom_ul::association::server::AcceptCalledAeTitle;
use dicom_ul::association::AsyncServerAssociation;
use dicom_ul::ServerAssociationOptions;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

pub const SCP_AE_TITLE: &str = "MOCK_SCP";

/// Abstract syntaxes the SCP accepts unless told to refuse one.
const ABSTRACT_SYNTAXES: [&str; 9] = [
	uids::VERIFICATION,
	uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
	uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
	uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
	uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
	uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
	uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
	uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
	uids::CT_IMAGE_STORAGE,
];

/// What the SCP does with one incoming connection.
#[derive(Debug, Clone)]
pub enum Behaviour {
	/// Closes the socket without reading anything.
	Hangup,
	/// Answers with a permanent rejection: called AE title not recognized.
	Reject,
	/// Accepts the association but rejects the presentation context of one abstract syntax,
	/// then waits for the requestor to give up.
	Refuse(&'static str),
	Serve(Script),
}

/// The DIMSE exchange after the association was accepted.
#[derive(Debug, Clone)]
pub enum Script {
	Echo,
	/// Every match as a pending response, then Success.
	Find(Vec<InMemDicomObject>),
	/// Every match as a pending response, then waits for C-CANCEL and answers with Cancel.
	FindUntilCancel(Vec<InMemDicomObject>),
	/// Pending responses with the given counters, then a final response.
	Move {
		pending: Vec<SubOperationCounters>,
		status: u16,
		last: SubOperationCounters,
	},
	/// One C-STORE sub-operation per SOP Instance UID, each followed by a pending response.
	Get(Vec<&'static str>),
	/// Accepts one C-STORE.
	Store,
	/// Reads the request and never answers.
	Stall,
}

/// Everything the SCP observed.
#[derive(Default)]
pub struct Record {
	pub connections: AtomicUsize,
	pub releases: AtomicUsize,
	pub aborts: AtomicUsize,
	pub commands: Mutex<Vec<u16>>,
	pub messages: Mutex<Vec<DicomMessage>>,
	pub sub_operation_statuses: Mutex<Vec<u16>>,
	pub stored: Mutex<Vec<String>>,
}

impl Record {
	pub fn commands(&self) -> Vec<u16> {
		self.commands.lock().unwrap().clone()
	}

	pub fn connections(&self) -> usize {
		self.connections.load(Ordering::SeqCst)
	}

	pub fn releases(&self) -> usize {
		self.releases.load(Ordering::SeqCst)
	}

	pub fn aborts(&self) -> usize {
		self.aborts.load(Ordering::SeqCst)
	}

	/// Command field of every received message plus the message itself.
	fn push(&self, message: DicomMessage) {
		self.commands
			.lock()
			.unwrap()
			.push(message.command_field().unwrap());
		self.messages.lock().unwrap().push(message);
	}

	pub fn last_message<T>(&self, f: impl FnOnce(&DicomMessage) -> T) -> T {
		let messages = self.messages.lock().unwrap();
		f(messages.last().unwrap())
	}

	pub fn message<T>(&self, index: usize, f: impl FnOnce(&DicomMessage) -> T) -> T {
		let messages = self.messages.lock().unwrap();
		f(&messages[index])
	}
}

pub struct MockScp {
	pub port: u16,
	pub record: Arc<Record>,
}

impl MockScp {
	/// Serves connections one after another on its own thread. The last behaviour repeats.
	pub fn start(behaviours: Vec<Behaviour>) -> Self {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		listener.set_nonblocking(true).unwrap();
		let port = listener.local_addr().unwrap().port();
		let record = Arc::new(Record::default());
		let shared = Arc::clone(&record);

		std::thread::spawn(move || {
			let runtime = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.unwrap();
			runtime.block_on(async move {
				let listener = TcpListener::from_std(listener).unwrap();
				let mut behaviours = behaviours.into_iter();
				let mut last = None;
				while let Ok((stream, _)) = listener.accept().await {
					shared.connections.fetch_add(1, Ordering::SeqCst);
					let behaviour = match behaviours.next() {
						Some(behaviour) => {
							last = Some(behaviour.clone());
							behaviour
						}
						None => last.clone().unwrap(),
					};
					serve(stream, behaviour, &shared).await;
				}
			});
		});

		Self { port, record }
	}

	pub fn address(&self) -> SocketAddr {
		SocketAddr::from(([127, 0, 0, 1], self.port))
	}
}

/// Polls until `condition` holds or two seconds passed.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
	for _ in 0..200 {
		if condition() {
			return true;
		}
		tokio::time::sleep(std::time::Duration::from_millis(10)).await;
	}
	condition()
}

fn acceptor(ae_title: &str, refused: Option<&str>) -> ServerAssociationOptions<'static, AcceptCalledAeTitle> {
	ABSTRACT_SYNTAXES
		.into_iter()
		.filter(|uid| Some(*uid) != refused)
		.fold(
			ServerAssociationOptions::new()
				.accept_called_ae_title()
				.ae_title(ae_title.to_owned()),
			|options, uid| options.with_abstract_syntax(uid),
		)
}

async fn serve(stream: TcpStream, behaviour: Behaviour, record: &Record) {
	let (options, script) = match behaviour {
		Behaviour::Hangup => return,
		// The requestor never calls this title.
		Behaviour::Reject => (acceptor("SOMEONE_ELSE", None), None),
		Behaviour::Refuse(abstract_syntax) => (acceptor(SCP_AE_TITLE, Some(abstract_syntax)), None),
		Behaviour::Serve(script) => (acceptor(SCP_AE_TITLE, None), Some(script)),
	};
	let Ok(association) = options.establish_async(stream).await else {
		return;
	};
	let mut association = ScpAssociation {
		association,
		uuid: Uuid::new_v4(),
		record,
	};
	if let Some(script) = script {
		run(&mut association, script, record).await;
	}
	// Until the requestor releases, aborts or hangs up.
	while association.receive().await.is_ok() {}
}

async fn run(association: &mut ScpAssociation<'_>, script: Script, record: &Record) {
	let Ok(request) = association.read_message().await else {
		return;
	};
	let presentation_context_id = request.presentation_context_id.unwrap();
	let message_id = request.command_u16(tags::MESSAGE_ID).unwrap();
	let affected_sop_class_uid = request.command_str(tags::AFFECTED_SOP_CLASS_UID);

	match script {
		Script::Stall => record.push(request),
		Script::Echo => {
			record.push(request);
			let response = CompositeEchoResponse {
				message_id,
				status: DimseStatus::SUCCESS,
			};
			association.write_message(response, presentation_context_id).await.unwrap();
		}
		Script::Find(matches) => {
			record.push(request);
			for data in matches {
				association
					.write_message(find_response(message_id, 0xFF00, Some(data)), presentation_context_id)
					.await
					.unwrap();
			}
			association
				.write_message(find_response(message_id, 0x0000, None), presentation_context_id)
				.await
				.unwrap();
		}
		Script::FindUntilCancel(matches) => {
			record.push(request);
			for data in matches {
				association
					.write_message(find_response(message_id, 0xFF00, Some(data)), presentation_context_id)
					.await
					.unwrap();
			}
			let Ok(cancel) = association.read_message().await else {
				return;
			};
			record.push(cancel);
			association
				.write_message(find_response(message_id, 0xFE00, None), presentation_context_id)
				.await
				.unwrap();
		}
		Script::Move { pending, status, last } => {
			record.push(request);
			for counters in pending {
				let response = CompositeMoveResponse {
					message_id,
					status: DimseStatus::new(0xFF00),
					counters,
				};
				association.write_message(response, presentation_context_id).await.unwrap();
			}
			let response = CompositeMoveResponse {
				message_id,
				status: DimseStatus::new(status),
				counters: last,
			};
			association.write_message(response, presentation_context_id).await.unwrap();
		}
		Script::Get(sop_instance_uids) => {
			record.push(request);
			let storage_context_id = association
				.presentation_context_for(uids::CT_IMAGE_STORAGE)
				.unwrap()
				.id;
			let total = u16::try_from(sop_instance_uids.len()).unwrap();
			let mut completed = 0;
			let mut failed = 0;
			for (index, sop_instance_uid) in sop_instance_uids.into_iter().enumerate() {
				let sub_operation = CompositeStoreRequest {
					affected_sop_class_uid: String::from(uids::CT_IMAGE_STORAGE),
					affected_sop_instance_uid: String::from(sop_instance_uid),
					move_originator_aet: None,
					move_originator_message_id: None,
					message_id: 1000 + u16::try_from(index).unwrap(),
					priority: 0,
					data_set: ct_instance(sop_instance_uid),
				};
				association.write_message(sub_operation, storage_context_id).await.unwrap();
				let response = association.read_message().await.unwrap();
				let status = response.status().unwrap();
				record.sub_operation_statuses.lock().unwrap().push(status.code);
				if status.is_success() {
					completed += 1;
				} else {
					failed += 1;
				}
				let response = CompositeGetResponse {
					message_id,
					status: DimseStatus::new(0xFF00),
					counters: counters(total - completed - failed, completed, failed),
				};
				association.write_message(response, presentation_context_id).await.unwrap();
			}
			let response = CompositeGetResponse {
				message_id,
				status: DimseStatus::new(if failed == 0 { 0x0000 } else { 0xB000 }),
				counters: counters(0, completed, failed),
			};
			association.write_message(response, presentation_context_id).await.unwrap();
		}
		Script::Store => {
			assert_eq!(affected_sop_class_uid.as_deref(), Some(uids::CT_IMAGE_STORAGE));
			let mut stored = Vec::new();
			let message = DicomMessage {
				command: request.command.clone(),
				data: request.data.clone(),
				presentation_context_id: request.presentation_context_id,
			};
			record.push(request);
			respond_to_store_request(association, message, &mut |instance: ReceivedInstance| -> anyhow::Result<()> {
				stored.push(instance.sop_instance_uid);
				Ok(())
			})
			.await
			.unwrap();
			record.stored.lock().unwrap().extend(stored);
		}
	}
}

fn find_response(message_id: u16, status: u16, data: Option<InMemDicomObject>) -> CompositeFindResponse {
	CompositeFindResponse {
		message_id,
		status: DimseStatus::new(status),
		data,
	}
}

pub const fn counters(remaining: u16, completed: u16, failed: u16) -> SubOperationCounters {
	SubOperationCounters {
		remaining: Some(remaining),
		completed: Some(completed),
		failed: Some(failed),
		warning: Some(0),
	}
}

pub fn ct_instance(sop_instance_uid: &str) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
		DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
		DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P-1")),
		DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
	])
}

pub fn study_match(study_instance_uid: &str) -> InMemDicomObject {
	InMemDicomObject::from_element_iter([
		DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, PrimitiveValue::from("STUDY")),
		DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_instance_uid)),
		DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("P-1")),
	])
}

/// The acceptor side of an association, enough to run DIMSE exchanges in tests.
/// Counts A-RELEASE-RQ and A-ABORT as they arrive and answers the release.
pub struct ScpAssociation<'a> {
	association: AsyncServerAssociation<TcpStream>,
	uuid: Uuid,
	record: &'a Record,
}

impl Association for ScpAssociation<'_> {
	fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	fn state(&self) -> AssociationState {
		AssociationState::Established
	}

	async fn send(&mut self, pdu: Pdu) -> Result<(), AssociationError> {
		// Sending only fails once the requestor hung up.
		self.association
			.send(&pdu)
			.await
			.map_err(|_| AssociationError::ConnectionClosed)
	}

	async fn receive(&mut self) -> Result<Pdu, AssociationError> {
		match self.association.receive().await {
			Ok(Pdu::AbortRQ { source }) => {
				self.record.aborts.fetch_add(1, Ordering::SeqCst);
				Err(AssociationError::Aborted(source))
			}
			Ok(Pdu::ReleaseRQ) => {
				self.record.releases.fetch_add(1, Ordering::SeqCst);
				let _ = self.association.send(&Pdu::ReleaseRP).await;
				Err(AssociationError::ConnectionClosed)
			}
			Ok(pdu) => Ok(pdu),
			Err(dicom_ul::association::Error::ConnectionClosed) => Err(AssociationError::ConnectionClosed),
			Err(err) => Err(AssociationError::Receive(err)),
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		self.association.presentation_contexts()
	}

	fn max_pdu_length(&self) -> u32 {
		self.association.requestor_max_pdu_length()
	}
}
