use crate::dimse::{DimseStatus, StatusType};
use crate::progress::RetrieveProgress;
use crate::types::UI;
use dicom::object::InMemDicomObject;

/// Matches of a C-FIND together with its final status.
#[derive(Debug, Clone)]
pub struct QueryResult {
	pub status: DimseStatus,
	pub matches: Vec<InMemDicomObject>,
}

impl QueryResult {
	pub fn is_success(&self) -> bool {
		self.status.is_success()
	}
}

/// Final status and the last progress snapshot of a C-MOVE or C-GET.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetrieveResult {
	pub status: DimseStatus,
	pub progress: RetrieveProgress,
}

impl RetrieveResult {
	/// A Success status with failed sub-operations is not a success.
	pub fn is_success(&self) -> bool {
		self.status.status_type == StatusType::Success && self.progress.failed == 0
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreResult {
	pub status: DimseStatus,
	pub sop_instance_uid: UI,
}

impl StoreResult {
	/// Warnings (e.g. coercion of data elements) still mean the instance was stored.
	pub fn is_success(&self) -> bool {
		matches!(
			self.status.status_type,
			StatusType::Success | StatusType::Warning
		)
	}
}
