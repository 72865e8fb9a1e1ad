use super::{CompositeMoveRequest, CompositeMoveResponse, COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE};
use crate::association::Association;
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ServiceError, StatusType};
use crate::progress::{ProgressAggregator, ProgressHandler};
use crate::results::RetrieveResult;
use tracing::{error, info, instrument, trace, warn};

/// Service class user for C-MOVE. The instances travel to the move destination on a
/// separate association, so only the sub-operation counters are observed here.
pub struct MoveServiceClassUser<'a, A> {
	association: &'a mut A,
}

impl<'a, A: Association> MoveServiceClassUser<'a, A> {
	pub fn new(association: &'a mut A) -> Self {
		Self { association }
	}

	#[instrument(skip_all, name = "MOVE-SCU")]
	pub async fn invoke(
		&mut self,
		request: CompositeMoveRequest,
		progress: &mut impl ProgressHandler,
	) -> Result<RetrieveResult, ServiceError> {
		let presentation_context_id = self
			.association
			.presentation_context_for(&request.affected_sop_class_uid)?
			.id;
		let message_id = request.message_id;
		info!(destination = %request.destination, "Sending C-MOVE-RQ");
		self.association.write_message(request, presentation_context_id).await?;

		let mut aggregator = ProgressAggregator::new();
		loop {
			let message = self.association.read_message().await?;
			message.expect_response(COMMAND_FIELD_COMPOSITE_MOVE_RESPONSE, message_id, "C-MOVE-RSP")?;
			let response = CompositeMoveResponse::try_from(message)?;
			trace!("Received C-MOVE-RSP with status {}", response.status);

			if response.status.is_pending() {
				let snapshot = aggregator.pending(response.counters);
				progress.on_progress(&snapshot);
				continue;
			}

			let result = RetrieveResult {
				status: response.status,
				progress: aggregator.finish(response.counters),
			};
			match response.status.status_type {
				StatusType::Success if !result.progress.has_failures() => {
					info!("C-MOVE completed successfully");
				}
				StatusType::Success | StatusType::Warning => {
					warn!(
						failed = result.progress.failed,
						warning = result.progress.warning,
						"C-MOVE completed with status {}",
						response.status
					);
				}
				StatusType::Cancel => info!("C-MOVE was cancelled"),
				StatusType::Failure | StatusType::Pending => {
					error!("C-MOVE failed with status {}", response.status);
				}
			}
			return Ok(result);
		}
	}
}
