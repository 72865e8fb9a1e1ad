//! The public entry points. Every call opens a fresh association, runs one operation,
//! releases the association (or aborts it on failure) and retries transport failures
//! according to the [`RetryPolicy`].

mod configuration;
mod retry;

pub use configuration::*;
pub use retry::RetryPolicy;

use crate::association::{AssociationError, ClientAssociation, ClientAssociationOptions};
use crate::dimse::cecho::EchoServiceClassUser;
use crate::dimse::cfind::{CompositeFindRequest, FindServiceClassUser};
use crate::dimse::cget::{CompositeGetRequest, GetServiceClassUser};
use crate::dimse::cmove::{CompositeMoveRequest, MoveServiceClassUser};
use crate::dimse::cstore::{CompositeStoreRequest, StoreHandler, StoreServiceClassUser};
use crate::dimse::{next_message_id, DimseStatus, ServiceError};
use crate::error::{ScuError, ValidationError};
use crate::progress::ProgressHandler;
use crate::query::QueryKeys;
use crate::results::{QueryResult, RetrieveResult, StoreResult};
use crate::types::{QueryInformationModel, QueryRetrieveLevel, UI};
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, InMemDicomObject};
use futures::StreamExt;
use std::ops::ControlFlow;
use std::pin::pin;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A DIMSE service class user for one remote application entity.
#[derive(Debug, Clone)]
pub struct DimseClient {
	address: String,
	retry_policy: RetryPolicy,
	cancellation: CancellationToken,
}

impl DimseClient {
	pub fn new(host: &str, port: u16) -> Self {
		let address = if host.contains(':') && !host.starts_with('[') {
			format!("[{host}]:{port}")
		} else {
			format!("{host}:{port}")
		};
		Self {
			address,
			retry_policy: RetryPolicy::default(),
			cancellation: CancellationToken::new(),
		}
	}

	#[must_use]
	pub const fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
		self.retry_policy = retry_policy;
		self
	}

	/// Cancelling the token aborts the running association and ends any pending backoff.
	#[must_use]
	pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
		self.cancellation = cancellation;
		self
	}

	pub fn address(&self) -> &str {
		&self.address
	}

	pub const fn retry_policy(&self) -> &RetryPolicy {
		&self.retry_policy
	}

	/// Verifies that the peer is reachable and answers C-ECHO.
	#[instrument(skip_all, fields(address = %self.address))]
	pub async fn echo(&self, config: &EchoConfiguration) -> Result<DimseStatus, ScuError> {
		let options = config.association_options();
		let mut attempts = self.retry_policy.attempts(&self.cancellation);
		loop {
			attempts.start()?;
			let result = match self.connect(&options).await {
				Ok(mut association) => {
					let result = EchoServiceClassUser::new(&mut association).echo().await;
					Self::close(association, result).await
				}
				Err(err) => Err(err),
			};
			match result {
				Ok(status) => return Ok(status),
				Err(err) => attempts.backoff(err).await?,
			}
		}
	}

	/// Runs a C-FIND and collects all matches.
	#[instrument(skip_all, fields(address = %self.address, model = ?config.information_model))]
	pub async fn query(
		&self,
		config: &QueryConfiguration,
		keys: &QueryKeys,
	) -> Result<QueryResult, ScuError> {
		keys.validate_for(config.information_model)?;
		let options = config.association_options();
		let mut attempts = self.retry_policy.attempts(&self.cancellation);
		loop {
			attempts.start()?;
			let mut matches = Vec::new();
			let mut collect = |data: InMemDicomObject| {
				matches.push(data);
				ControlFlow::Continue(())
			};
			let mut delivered = 0;
			match self.find(&options, config, keys, &mut collect, &mut delivered).await {
				Ok(status) => {
					info!(matches = matches.len(), "C-FIND finished with status {status}");
					return Ok(QueryResult { status, matches });
				}
				Err(err) => attempts.backoff(err).await?,
			}
		}
	}

	/// Runs a C-FIND and hands every match to `handler` as it arrives. Returning
	/// [`ControlFlow::Break`] cancels the query with C-CANCEL.
	///
	/// Once a match was delivered, failures are no longer retried so that no match is
	/// seen twice.
	#[instrument(skip_all, fields(address = %self.address, model = ?config.information_model))]
	pub async fn query_with<H>(
		&self,
		config: &QueryConfiguration,
		keys: &QueryKeys,
		mut handler: H,
	) -> Result<DimseStatus, ScuError>
	where
		H: FnMut(InMemDicomObject) -> ControlFlow<()>,
	{
		keys.validate_for(config.information_model)?;
		let options = config.association_options();
		let mut attempts = self.retry_policy.attempts(&self.cancellation);
		let mut delivered = 0;
		loop {
			attempts.start()?;
			match self.find(&options, config, keys, &mut handler, &mut delivered).await {
				Ok(status) => return Ok(status),
				Err(err) if delivered > 0 => return Err(err),
				Err(err) => attempts.backoff(err).await?,
			}
		}
	}

	/// Queries the modality worklist. `keys` must use the worklist level,
	/// see [`QueryKeys::worklist`].
	pub async fn worklist(
		&self,
		config: &QueryConfiguration,
		keys: &QueryKeys,
	) -> Result<QueryResult, ScuError> {
		let config = config
			.clone()
			.with_information_model(QueryInformationModel::Worklist);
		self.query(&config, keys).await
	}

	/// C-MOVE of a study to the configured move destination.
	pub async fn move_study(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		progress: &mut impl ProgressHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_move(config)?;
		let keys = retrieve_keys(QueryRetrieveLevel::Study, &[study_instance_uid])?;
		self.retrieve(config, &keys, progress, &mut RefuseInstances).await
	}

	pub async fn move_series(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		series_instance_uid: &str,
		progress: &mut impl ProgressHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_move(config)?;
		let keys = retrieve_keys(
			QueryRetrieveLevel::Series,
			&[study_instance_uid, series_instance_uid],
		)?;
		self.retrieve(config, &keys, progress, &mut RefuseInstances).await
	}

	pub async fn move_instance(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		progress: &mut impl ProgressHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_move(config)?;
		let keys = retrieve_keys(
			QueryRetrieveLevel::Image,
			&[study_instance_uid, series_instance_uid, sop_instance_uid],
		)?;
		self.retrieve(config, &keys, progress, &mut RefuseInstances).await
	}

	/// C-GET of a study. Each instance is handed to `store`.
	pub async fn get_study(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		progress: &mut impl ProgressHandler,
		store: &mut impl StoreHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_get(config)?;
		let keys = retrieve_keys(QueryRetrieveLevel::Study, &[study_instance_uid])?;
		self.retrieve(config, &keys, progress, store).await
	}

	pub async fn get_series(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		series_instance_uid: &str,
		progress: &mut impl ProgressHandler,
		store: &mut impl StoreHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_get(config)?;
		let keys = retrieve_keys(
			QueryRetrieveLevel::Series,
			&[study_instance_uid, series_instance_uid],
		)?;
		self.retrieve(config, &keys, progress, store).await
	}

	pub async fn get_instance(
		&self,
		config: &RetrieveConfiguration,
		study_instance_uid: &str,
		series_instance_uid: &str,
		sop_instance_uid: &str,
		progress: &mut impl ProgressHandler,
		store: &mut impl StoreHandler,
	) -> Result<RetrieveResult, ScuError> {
		Self::require_get(config)?;
		let keys = retrieve_keys(
			QueryRetrieveLevel::Image,
			&[study_instance_uid, series_instance_uid, sop_instance_uid],
		)?;
		self.retrieve(config, &keys, progress, store).await
	}

	/// C-MOVE if the configuration names a move destination, C-GET otherwise.
	/// `store` only sees instances of a C-GET.
	#[instrument(skip_all, fields(address = %self.address, level = %keys.level()))]
	pub async fn retrieve(
		&self,
		config: &RetrieveConfiguration,
		keys: &QueryKeys,
		progress: &mut impl ProgressHandler,
		store: &mut impl StoreHandler,
	) -> Result<RetrieveResult, ScuError> {
		keys.validate_for(config.information_model())?;
		let options = config.association_options()?;
		let sop_class = config.sop_class()?;
		let mut attempts = self.retry_policy.attempts(&self.cancellation);
		loop {
			attempts.start()?;
			let result = match self.connect(&options).await {
				Ok(mut association) => {
					let identifier = keys.to_identifier();
					let message_id = next_message_id();
					let priority = config.priority.code();
					let result = match config.operation() {
						RetrieveOperation::Move { destination } => {
							let request = CompositeMoveRequest {
								identifier,
								message_id,
								priority,
								destination: destination.clone(),
								affected_sop_class_uid: UI::from(sop_class),
							};
							MoveServiceClassUser::new(&mut association)
								.invoke(request, progress)
								.await
						}
						RetrieveOperation::Get => {
							let request = CompositeGetRequest {
								identifier,
								message_id,
								priority,
								affected_sop_class_uid: UI::from(sop_class),
							};
							GetServiceClassUser::new(&mut association)
								.invoke(request, progress, store)
								.await
						}
					};
					Self::close(association, result).await
				}
				Err(err) => Err(err),
			};
			match result {
				Ok(result) => return Ok(result),
				Err(err) => attempts.backoff(err).await?,
			}
		}
	}

	/// Sends one instance with C-STORE.
	#[instrument(skip_all, fields(address = %self.address))]
	pub async fn store(
		&self,
		config: &StoreConfiguration,
		file: &FileDicomObject<InMemDicomObject>,
	) -> Result<StoreResult, ScuError> {
		let meta = file.meta();
		let sop_class_uid = UI::from(meta.media_storage_sop_class_uid());
		let sop_instance_uid = UI::from(meta.media_storage_sop_instance_uid());
		if sop_class_uid.is_empty() || sop_instance_uid.is_empty() {
			return Err(ValidationError::Configuration(String::from(
				"the file meta group lacks the SOP class or instance UID",
			))
			.into());
		}
		let options = config.association_options(&sop_class_uid, meta.transfer_syntax());

		let mut attempts = self.retry_policy.attempts(&self.cancellation);
		loop {
			attempts.start()?;
			let result = match self.connect(&options).await {
				Ok(mut association) => {
					let request = CompositeStoreRequest {
						affected_sop_class_uid: sop_class_uid.clone(),
						affected_sop_instance_uid: sop_instance_uid.clone(),
						move_originator_aet: None,
						move_originator_message_id: None,
						message_id: next_message_id(),
						priority: config.priority.code(),
						data_set: file.clone().into_inner(),
					};
					let result = StoreServiceClassUser::new(&mut association).store(request).await;
					Self::close(association, result).await
				}
				Err(err) => Err(err),
			};
			match result {
				Ok(result) => return Ok(result),
				Err(err) => attempts.backoff(err).await?,
			}
		}
	}

	async fn connect(&self, options: &ClientAssociationOptions) -> Result<ClientAssociation, ScuError> {
		let association = options
			.clone()
			.cancellation(self.cancellation.clone())
			.establish(&self.address)
			.await?;
		Ok(association)
	}

	/// Releases the association after a successful operation and aborts it otherwise.
	async fn close<T>(association: ClientAssociation, result: Result<T, ServiceError>) -> Result<T, ScuError> {
		match result {
			Ok(value) => {
				if let Err(err) = association.release().await {
					// the operation itself completed
					warn!("Failed to release association: {err}");
				}
				Ok(value)
			}
			Err(err) => {
				association.abort().await;
				Err(ScuError::from(err))
			}
		}
	}

	/// One C-FIND attempt on a fresh association.
	async fn find(
		&self,
		options: &ClientAssociationOptions,
		config: &QueryConfiguration,
		keys: &QueryKeys,
		handler: &mut impl FnMut(InMemDicomObject) -> ControlFlow<()>,
		delivered: &mut usize,
	) -> Result<DimseStatus, ScuError> {
		let mut association = self.connect(options).await?;
		let request = CompositeFindRequest {
			message_id: next_message_id(),
			priority: config.priority.code(),
			affected_sop_class_uid: UI::from(config.information_model.as_sop_class()),
			identifier: keys.to_identifier(),
		};
		let result = Self::find_on(&mut association, request, handler, delivered).await;
		Self::close(association, result).await
	}

	async fn find_on(
		association: &mut ClientAssociation,
		request: CompositeFindRequest,
		handler: &mut impl FnMut(InMemDicomObject) -> ControlFlow<()>,
		delivered: &mut usize,
	) -> Result<DimseStatus, ServiceError> {
		let message_id = request.message_id;
		let sop_class_uid = request.affected_sop_class_uid.clone();

		let mut stopped = false;
		let mut status = None;
		{
			let mut responses = pin!(FindServiceClassUser::new(&mut *association).invoke(request));
			while let Some(response) = responses.next().await {
				let response = response?;
				if !response.status.is_pending() {
					status = Some(response.status);
					break;
				}
				if let Some(data) = response.data {
					*delivered += 1;
					if handler(data).is_break() {
						stopped = true;
						break;
					}
				}
			}
		}

		if stopped {
			debug!(delivered = *delivered, "Caller stopped the query, sending C-CANCEL");
			return FindServiceClassUser::new(association)
				.cancel(message_id, &sop_class_uid)
				.await;
		}
		status.ok_or(ServiceError::Association(AssociationError::ConnectionClosed))
	}

	fn require_move(config: &RetrieveConfiguration) -> Result<(), ValidationError> {
		match config.operation() {
			RetrieveOperation::Move { .. } => Ok(()),
			RetrieveOperation::Get => Err(ValidationError::Configuration(String::from(
				"C-MOVE requires a move destination",
			))),
		}
	}

	fn require_get(config: &RetrieveConfiguration) -> Result<(), ValidationError> {
		match config.operation() {
			RetrieveOperation::Get => Ok(()),
			RetrieveOperation::Move { .. } => Err(ValidationError::Configuration(String::from(
				"C-GET must not have a move destination",
			))),
		}
	}
}

/// Unique keys down to `level`: Study, Series and SOP Instance UID in that order.
fn retrieve_keys(level: QueryRetrieveLevel, uids: &[&str]) -> Result<QueryKeys, ValidationError> {
	const UNIQUE_KEYS: [dicom::core::Tag; 3] = [
		tags::STUDY_INSTANCE_UID,
		tags::SERIES_INSTANCE_UID,
		tags::SOP_INSTANCE_UID,
	];
	let mut keys = QueryKeys::new(level);
	for (tag, uid) in UNIQUE_KEYS.into_iter().zip(uids) {
		if uid.is_empty() {
			return Err(ValidationError::QueryKeys(format!("{tag} must not be empty")));
		}
		keys = keys.with_key(tag, *uid)?;
	}
	Ok(keys)
}

/// Store handler for C-MOVE, which never receives instances on its own association.
struct RefuseInstances;

impl StoreHandler for RefuseInstances {
	fn on_instance(&mut self, instance: crate::dimse::cstore::ReceivedInstance) -> anyhow::Result<()> {
		anyhow::bail!("Unexpected instance {}", instance.sop_instance_uid)
	}
}
