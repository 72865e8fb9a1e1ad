mod common;

use common::{counters, ct_instance, eventually, study_match, Behaviour, MockScp, Script};
use dicom::dictionary_std::{tags, uids};
use dicom::object::{open_file, InMemDicomObject};
use dicom_scu::association::pdu::{
	AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
};
use dicom_scu::{
	AbortCause, AssociationConfiguration, DimseClient, DirectoryStore, EchoConfiguration,
	QueryConfiguration, QueryKeys, QueryRetrieveLevel, ReceivedInstance, RetrieveConfiguration,
	RetrieveProgress, RetryPolicy, ScuError, StatusType, StoreConfiguration,
};
use pretty_assertions::assert_eq;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_retries(max_attempts: u32) -> RetryPolicy {
	RetryPolicy {
		max_attempts,
		base_delay: Duration::from_millis(10),
		max_delay: Duration::from_millis(50),
	}
}

fn client(scp: &MockScp) -> DimseClient {
	DimseClient::new("127.0.0.1", scp.port).with_retry_policy(RetryPolicy::never())
}

fn echo_config() -> EchoConfiguration {
	EchoConfiguration::new("TEST_SCU", "MOCK_SCP")
		.unwrap()
		.with_timeout(TIMEOUT)
		.unwrap()
}

fn query_config() -> QueryConfiguration {
	QueryConfiguration::new("TEST_SCU", "MOCK_SCP")
		.unwrap()
		.with_timeout(TIMEOUT)
		.unwrap()
}

fn retrieve_config() -> RetrieveConfiguration {
	RetrieveConfiguration::new("TEST_SCU", "MOCK_SCP")
		.unwrap()
		.with_timeout(TIMEOUT)
		.unwrap()
}

fn string(data: &InMemDicomObject, tag: dicom::core::Tag) -> String {
	data.get(tag).unwrap().to_str().unwrap().trim().to_owned()
}

#[tokio::test]
async fn echo_round_trip_releases_the_association() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Echo)]);

	let status = client(&scp).echo(&echo_config()).await.unwrap();

	assert!(status.is_success());
	assert_eq!(scp.record.commands(), vec![0x0030]);
	assert!(eventually(|| scp.record.releases() == 1).await);
}

#[tokio::test]
async fn query_collects_matches_in_arrival_order() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Find(vec![
		study_match("1.2.1"),
		study_match("1.2.2"),
		study_match("1.2.3"),
	]))]);
	let keys = QueryKeys::new(QueryRetrieveLevel::Study)
		.with_key(tags::PATIENT_ID, "P-1")
		.unwrap()
		.with_return_key(tags::STUDY_INSTANCE_UID)
		.unwrap();

	let result = client(&scp).query(&query_config(), &keys).await.unwrap();

	assert!(result.is_success());
	let uids: Vec<_> = result
		.matches
		.iter()
		.map(|data| string(data, tags::STUDY_INSTANCE_UID))
		.collect();
	assert_eq!(uids, vec!["1.2.1", "1.2.2", "1.2.3"]);

	scp.record.message(0, |request| {
		assert_eq!(
			request.command_str(tags::AFFECTED_SOP_CLASS_UID).as_deref(),
			Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
		);
		let identifier = request.data.as_ref().unwrap();
		assert_eq!(string(identifier, tags::QUERY_RETRIEVE_LEVEL), "STUDY");
		assert_eq!(string(identifier, tags::PATIENT_ID), "P-1");
		assert!(identifier.get(tags::STUDY_INSTANCE_UID).is_some());
	});
}

#[tokio::test]
async fn stopping_a_query_sends_c_cancel() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::FindUntilCancel(vec![
		study_match("1.2.1"),
		study_match("1.2.2"),
		study_match("1.2.3"),
	]))]);
	let keys = QueryKeys::new(QueryRetrieveLevel::Study);

	let mut seen = Vec::new();
	let status = client(&scp)
		.query_with(&query_config(), &keys, |data| {
			seen.push(string(&data, tags::STUDY_INSTANCE_UID));
			ControlFlow::Break(())
		})
		.await
		.unwrap();

	assert_eq!(seen, vec!["1.2.1"]);
	assert_eq!(status.status_type, StatusType::Cancel);
	assert_eq!(scp.record.commands(), vec![0x0020, 0x0FFF]);
	let find_id = scp.record.message(0, |find| find.command_u16(tags::MESSAGE_ID));
	let cancelled_id =
		scp.record.message(1, |cancel| cancel.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO));
	assert_eq!(find_id, cancelled_id);
	assert!(eventually(|| scp.record.releases() == 1).await);
}

#[tokio::test]
async fn worklist_query_has_no_query_retrieve_level() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Find(vec![study_match("1.2.1")]))]);
	let keys = QueryKeys::worklist()
		.with_keyword("ScheduledProcedureStepSequence.Modality", "CT")
		.unwrap();

	let result = client(&scp).worklist(&query_config(), &keys).await.unwrap();

	assert_eq!(result.matches.len(), 1);
	scp.record.message(0, |request| {
		assert_eq!(
			request.command_str(tags::AFFECTED_SOP_CLASS_UID).as_deref(),
			Some(uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND)
		);
		let identifier = request.data.as_ref().unwrap();
		assert!(identifier.get(tags::QUERY_RETRIEVE_LEVEL).is_none());
		assert!(identifier.get(tags::PATIENT_NAME).is_some());
	});
}

#[tokio::test]
async fn move_reports_every_progress_snapshot() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Move {
		pending: vec![counters(2, 1, 0), counters(1, 2, 0)],
		status: 0x0000,
		last: counters(0, 3, 0),
	})]);
	let config = retrieve_config().with_move_destination("ARCHIVE").unwrap();

	let mut snapshots = Vec::new();
	let result = client(&scp)
		.move_study(&config, "1.2.3", &mut |progress: &RetrieveProgress| {
			snapshots.push(*progress);
		})
		.await
		.unwrap();

	assert!(result.is_success());
	assert_eq!(result.progress.completed, 3);
	assert!(result.progress.is_complete());
	assert_eq!(
		snapshots.iter().map(|p| p.completed).collect::<Vec<_>>(),
		vec![1, 2]
	);
	scp.record.message(0, |request| {
		assert_eq!(request.command_str(tags::MOVE_DESTINATION).as_deref(), Some("ARCHIVE"));
		let identifier = request.data.as_ref().unwrap();
		assert_eq!(string(identifier, tags::STUDY_INSTANCE_UID), "1.2.3");
	});
}

#[tokio::test]
async fn move_with_failed_sub_operations_is_not_a_success() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Move {
		pending: Vec::new(),
		status: 0xB000,
		last: counters(0, 2, 1),
	})]);
	let config = retrieve_config().with_move_destination("ARCHIVE").unwrap();

	let result = client(&scp)
		.move_series(&config, "1.2.3", "1.2.3.4", &mut dicom_scu::NoProgress)
		.await
		.unwrap();

	assert!(!result.is_success());
	assert_eq!(result.status.status_type, StatusType::Warning);
	assert_eq!(result.progress.failed, 1);
}

#[tokio::test]
async fn get_writes_instances_to_a_directory() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Get(vec!["1.2.3.1", "1.2.3.2"]))]);
	let directory = tempfile::tempdir().unwrap();
	let mut store = DirectoryStore::new(directory.path());

	let result = client(&scp)
		.get_study(&retrieve_config(), "1.2.3", &mut dicom_scu::NoProgress, &mut store)
		.await
		.unwrap();

	assert!(result.is_success());
	assert_eq!(result.progress.completed, 2);
	assert_eq!(*scp.record.sub_operation_statuses.lock().unwrap(), vec![0, 0]);
	for sop_instance_uid in ["1.2.3.1", "1.2.3.2"] {
		let file = open_file(directory.path().join(format!("{sop_instance_uid}.dcm"))).unwrap();
		assert_eq!(file.meta().media_storage_sop_instance_uid(), sop_instance_uid);
		assert_eq!(string(&file, tags::MODALITY), "CT");
	}
}

#[tokio::test]
async fn get_refuses_instances_the_handler_cannot_keep() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Get(vec!["1.2.3.1"]))]);

	let result = client(&scp)
		.get_study(
			&retrieve_config(),
			"1.2.3",
			&mut dicom_scu::NoProgress,
			&mut |_: ReceivedInstance| -> anyhow::Result<()> { anyhow::bail!("disk full") },
		)
		.await
		.unwrap();

	assert!(!result.is_success());
	assert_eq!(result.progress.failed, 1);
	assert_eq!(*scp.record.sub_operation_statuses.lock().unwrap(), vec![0xA700]);
}

#[tokio::test]
async fn store_sends_the_instance() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Store)]);
	let file = ReceivedInstance {
		sop_class_uid: String::from(uids::CT_IMAGE_STORAGE),
		sop_instance_uid: String::from("1.2.3.9"),
		transfer_syntax: String::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		data: ct_instance("1.2.3.9"),
	}
	.into_file()
	.unwrap();
	let config = StoreConfiguration::new("TEST_SCU", "MOCK_SCP")
		.unwrap()
		.with_timeout(TIMEOUT)
		.unwrap();

	let result = client(&scp).store(&config, &file).await.unwrap();

	assert!(result.is_success());
	assert_eq!(result.sop_instance_uid, "1.2.3.9");
	assert_eq!(*scp.record.stored.lock().unwrap(), vec![String::from("1.2.3.9")]);
}

#[tokio::test]
async fn rejection_is_reported_without_retry() {
	let scp = MockScp::start(vec![Behaviour::Reject]);
	let client = DimseClient::new("127.0.0.1", scp.port).with_retry_policy(fast_retries(3));

	let err = client.echo(&echo_config()).await.unwrap_err();

	let ScuError::AssociationRejected(rejection) = err else {
		panic!("expected a rejection, got {err}");
	};
	assert_eq!(rejection.result, AssociationRJResult::Permanent);
	assert_eq!(
		rejection.source,
		AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
	);
	assert_eq!(scp.record.connections(), 1);
}

#[tokio::test]
async fn rejected_query_context_is_an_invalid_response() {
	let scp = MockScp::start(vec![Behaviour::Refuse(
		uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
	)]);
	let client = DimseClient::new("127.0.0.1", scp.port).with_retry_policy(fast_retries(3));

	let err = client
		.query(&query_config(), &QueryKeys::new(QueryRetrieveLevel::Study))
		.await
		.unwrap_err();

	assert!(matches!(err, ScuError::InvalidResponse(_)), "{err}");
	assert_eq!(scp.record.connections(), 1);
	assert!(scp.record.commands().is_empty());
	assert!(eventually(|| scp.record.aborts() + scp.record.releases() == 1).await);
}

#[tokio::test]
async fn dropped_connections_are_retried() {
	let scp = MockScp::start(vec![Behaviour::Hangup, Behaviour::Serve(Script::Echo)]);
	let client = DimseClient::new("127.0.0.1", scp.port).with_retry_policy(fast_retries(3));

	let status = client.echo(&echo_config()).await.unwrap();

	assert!(status.is_success());
	assert_eq!(scp.record.connections(), 2);
}

#[tokio::test]
async fn retries_stop_after_max_attempts() {
	let scp = MockScp::start(vec![Behaviour::Hangup]);
	let client = DimseClient::new("127.0.0.1", scp.port).with_retry_policy(fast_retries(2));

	let err = client.echo(&echo_config()).await.unwrap_err();

	assert!(err.is_retryable(), "{err}");
	assert_eq!(scp.record.connections(), 2);
}

#[tokio::test]
async fn unanswered_requests_time_out_and_abort() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Stall)]);
	let config = EchoConfiguration::new("TEST_SCU", "MOCK_SCP")
		.unwrap()
		.with_timeout(Duration::from_millis(200))
		.unwrap();

	let err = client(&scp).echo(&config).await.unwrap_err();

	assert!(matches!(err, ScuError::Timeout(_)), "{err}");
	assert!(eventually(|| scp.record.aborts() == 1).await);
}

#[tokio::test]
async fn cancellation_aborts_the_running_operation() {
	let scp = MockScp::start(vec![Behaviour::Serve(Script::Stall)]);
	let cancellation = CancellationToken::new();
	let client = client(&scp).with_cancellation(cancellation.clone());

	let token = cancellation.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(100)).await;
		token.cancel();
	});
	let err = client.echo(&echo_config()).await.unwrap_err();

	assert!(matches!(err, ScuError::Aborted(AbortCause::Cancelled)), "{err}");
	assert!(eventually(|| scp.record.aborts() == 1).await);
}
