use super::{CompositeStoreRequest, CompositeStoreResponse};
use crate::association::Association;
use crate::dimse::{DicomMessage, DicomMessageWriter, DimseStatus, ServiceError};
use crate::types::UI;
use anyhow::Context;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Refused: Out of Resources. Sent when the handler could not keep an instance.
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;

/// An instance received through a C-STORE sub-operation.
#[derive(Debug)]
pub struct ReceivedInstance {
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	/// Transfer syntax of the presentation context the instance arrived on.
	pub transfer_syntax: UI,
	pub data: InMemDicomObject,
}

impl ReceivedInstance {
	/// Wraps the data set in a Part 10 file with a matching file meta group.
	pub fn into_file(self) -> anyhow::Result<FileDicomObject<InMemDicomObject>> {
		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(self.sop_class_uid.as_str())
			.media_storage_sop_instance_uid(self.sop_instance_uid.as_str())
			.transfer_syntax(self.transfer_syntax.as_str())
			.build()
			.context("Failed to build file meta group")?;
		Ok(self.data.with_exact_meta(meta))
	}
}

/// Receives the instances of a C-GET. An error refuses the sub-operation; the C-GET goes on.
pub trait StoreHandler {
	fn on_instance(&mut self, instance: ReceivedInstance) -> anyhow::Result<()>;
}

impl<F> StoreHandler for F
where
	F: FnMut(ReceivedInstance) -> anyhow::Result<()>,
{
	fn on_instance(&mut self, instance: ReceivedInstance) -> anyhow::Result<()> {
		self(instance)
	}
}

/// Writes every instance to `<directory>/<SOP Instance UID>.dcm`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
	directory: PathBuf,
}

impl DirectoryStore {
	pub fn new(directory: impl Into<PathBuf>) -> Self {
		Self {
			directory: directory.into(),
		}
	}

	pub fn directory(&self) -> &Path {
		&self.directory
	}

	pub fn path_for(&self, sop_instance_uid: &str) -> PathBuf {
		self.directory.join(format!("{sop_instance_uid}.dcm"))
	}
}

impl StoreHandler for DirectoryStore {
	fn on_instance(&mut self, instance: ReceivedInstance) -> anyhow::Result<()> {
		if instance.sop_instance_uid.is_empty()
			|| instance.sop_instance_uid.contains(['/', '\\'])
			|| instance.sop_instance_uid.starts_with('.')
		{
			anyhow::bail!("Refusing to store instance with UID '{}'", instance.sop_instance_uid);
		}
		let path = self.path_for(&instance.sop_instance_uid);
		instance
			.into_file()?
			.write_to_file(&path)
			.with_context(|| format!("Failed to write {}", path.display()))?;
		debug!(path = %path.display(), "Wrote instance");
		Ok(())
	}
}

/// Answers a C-STORE-RQ received on a client association, in the SCP role.
/// Returns the status that was sent back.
#[instrument(skip_all, name = "STORE-SCP")]
pub async fn respond_to_store_request<A: Association>(
	association: &mut A,
	message: DicomMessage,
	handler: &mut impl StoreHandler,
) -> Result<DimseStatus, ServiceError> {
	let presentation_context_id = message.presentation_context_id.unwrap_or_default();
	let transfer_syntax = association
		.presentation_context(presentation_context_id)?
		.transfer_syntax
		.clone();
	let request = CompositeStoreRequest::try_from(message)?;
	info!(
		sop_instance_uid = %request.affected_sop_instance_uid,
		sop_class_uid = %request.affected_sop_class_uid,
		"Received instance"
	);

	let instance = ReceivedInstance {
		sop_class_uid: request.affected_sop_class_uid.clone(),
		sop_instance_uid: request.affected_sop_instance_uid.clone(),
		transfer_syntax,
		data: request.data_set,
	};
	let status = match handler.on_instance(instance) {
		Ok(()) => DimseStatus::SUCCESS,
		Err(err) => {
			warn!("Store handler failed: {err:#}");
			DimseStatus::new(STATUS_OUT_OF_RESOURCES)
		}
	};

	let response = CompositeStoreResponse {
		message_id: request.message_id,
		sop_class_uid: request.affected_sop_class_uid,
		sop_instance_uid: request.affected_sop_instance_uid,
		status,
	};
	association.write_message(response, presentation_context_id).await?;
	Ok(status)
}
