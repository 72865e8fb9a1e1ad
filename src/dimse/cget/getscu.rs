use super::{CompositeGetRequest, CompositeGetResponse, COMMAND_FIELD_COMPOSITE_GET_RESPONSE};
use crate::association::Association;
use crate::dimse::cstore::storescp::respond_to_store_request;
use crate::dimse::cstore::{StoreHandler, COMMAND_FIELD_COMPOSITE_STORE_REQUEST};
use crate::dimse::{DicomMessageReader, DicomMessageWriter, ServiceError, StatusType};
use crate::progress::{ProgressAggregator, ProgressHandler};
use crate::results::RetrieveResult;
use tracing::{debug, error, info, instrument, trace, warn};

/// Service class user for C-GET.
///
/// The peer sends the matching instances as C-STORE sub-operations on the same association,
/// interleaved with the C-GET responses. Each one is handed to the [`StoreHandler`] and
/// answered before the next message is read.
pub struct GetServiceClassUser<'a, A> {
	association: &'a mut A,
}

impl<'a, A: Association> GetServiceClassUser<'a, A> {
	pub fn new(association: &'a mut A) -> Self {
		Self { association }
	}

	#[instrument(skip_all, name = "GET-SCU")]
	pub async fn invoke(
		&mut self,
		request: CompositeGetRequest,
		progress: &mut impl ProgressHandler,
		store: &mut impl StoreHandler,
	) -> Result<RetrieveResult, ServiceError> {
		let presentation_context_id = self
			.association
			.presentation_context_for(&request.affected_sop_class_uid)?
			.id;
		let message_id = request.message_id;
		self.association.write_message(request, presentation_context_id).await?;
		trace!("Sent C-GET-RQ");

		let mut aggregator = ProgressAggregator::new();
		let mut received = 0usize;
		loop {
			let message = self.association.read_message().await?;
			if message.command_field()? == COMMAND_FIELD_COMPOSITE_STORE_REQUEST {
				let status = respond_to_store_request(&mut *self.association, message, store).await?;
				received += 1;
				debug!(received, "Answered C-STORE sub-operation with status {status}");
				continue;
			}

			message.expect_response(COMMAND_FIELD_COMPOSITE_GET_RESPONSE, message_id, "C-GET-RSP")?;
			let response = CompositeGetResponse::try_from(message)?;
			trace!("Received C-GET-RSP with status {}", response.status);

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
					info!(received, "C-GET completed successfully");
				}
				StatusType::Success | StatusType::Warning => {
					warn!(
						received,
						failed = result.progress.failed,
						warning = result.progress.warning,
						"C-GET completed with status {}",
						response.status
					);
				}
				StatusType::Cancel => info!(received, "C-GET was cancelled"),
				StatusType::Failure | StatusType::Pending => {
					error!("C-GET failed with status {}", response.status);
				}
			}
			return Ok(result);
		}
	}
}
