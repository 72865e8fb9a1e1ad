use super::{CompositeFindRequest, CompositeFindResponse, COMMAND_FIELD_COMPOSITE_FIND_RESPONSE};
use crate::association::Association;
use crate::dimse::ccancel;
use crate::dimse::{DicomMessageReader, DicomMessageWriter, DimseStatus, ServiceError};
use crate::types::US;
use async_stream::try_stream;
use futures::Stream;
use tracing::{debug, trace};

/// Service class user for the C-FIND operation of the query/retrieve and worklist models.
pub struct FindServiceClassUser<'a, A> {
	association: &'a mut A,
}

impl<'a, A: Association + 'a> FindServiceClassUser<'a, A> {
	pub fn new(association: &'a mut A) -> Self {
		Self { association }
	}

	/// Sends the request and yields every response in arrival order, ending after the
	/// first response that is not Pending.
	///
	/// Dropping the stream early leaves the request outstanding; follow up with
	/// [`FindServiceClassUser::cancel`] before reusing the association.
	pub fn invoke(
		self,
		request: CompositeFindRequest,
	) -> impl Stream<Item = Result<CompositeFindResponse, ServiceError>> + 'a {
		let association = self.association;
		try_stream! {
			let presentation_context_id = association
				.presentation_context_for(&request.affected_sop_class_uid)?
				.id;
			let message_id = request.message_id;
			association.write_message(request, presentation_context_id).await?;
			trace!(message_id, "Sent C-FIND-RQ");

			loop {
				let message = association.read_message().await?;
				let status = message.expect_response(
					COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
					message_id,
					"C-FIND-RSP",
				)?;
				trace!("Received C-FIND-RSP with status {status}");

				yield CompositeFindResponse {
					message_id,
					status,
					data: message.data,
				};

				if !status.is_pending() {
					debug!("C-FIND finished with status {status}");
					break;
				}
			}
		}
	}

	/// Cancels the outstanding C-FIND with `message_id` and waits for its final response.
	pub async fn cancel(self, message_id: US, affected_sop_class_uid: &str) -> Result<DimseStatus, ServiceError> {
		let presentation_context_id = self
			.association
			.presentation_context_for(affected_sop_class_uid)?
			.id;
		ccancel::cancel(
			self.association,
			presentation_context_id,
			message_id,
			COMMAND_FIELD_COMPOSITE_FIND_RESPONSE,
			"C-FIND-RSP",
		)
		.await
	}
}
