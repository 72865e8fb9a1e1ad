use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dicom::object::{open_file, InMemDicomObject};
use dicom_json::DicomJson;
use dicom_scu::config::AppConfig;
use dicom_scu::{
	AssociationConfiguration, DimseClient, DirectoryStore, EchoConfiguration, QueryConfiguration,
	QueryInformationModel, QueryKeys, QueryRetrieveLevel, ReceivedInstance, RetrieveConfiguration,
	RetrieveProgress, StoreConfiguration,
};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dicom-scu", version, about = "Query, retrieve and store DICOM objects on a PACS")]
struct Cli {
	#[command(flatten)]
	peer: PeerArgs,
	#[command(subcommand)]
	command: Command,
}

/// Either a peer from the configuration or an explicit address.
#[derive(Args, Debug)]
struct PeerArgs {
	/// Name of a peer in the `peers` table of the configuration
	#[arg(long, global = true, conflicts_with_all = ["host", "port", "called_aet"])]
	peer: Option<String>,
	#[arg(long, global = true, requires_all = ["port", "called_aet"])]
	host: Option<String>,
	#[arg(long, global = true)]
	port: Option<u16>,
	/// AE title of the peer
	#[arg(long, global = true)]
	called_aet: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Verify connectivity with C-ECHO
	Echo,
	/// Query with C-FIND and print matches as DICOM JSON
	Find {
		#[arg(long, value_enum, default_value_t = Model::Study)]
		model: Model,
		#[arg(long, default_value = "STUDY")]
		level: QueryRetrieveLevel,
		/// Matching or return key, e.g. `PatientID=123` or `StudyDate=` (repeatable)
		#[arg(short, long = "key", value_parser = parse_key)]
		keys: Vec<(String, String)>,
		/// Cancel the query after this many matches
		#[arg(long)]
		limit: Option<usize>,
	},
	/// Query the modality worklist
	Mwl {
		#[arg(short, long = "key", value_parser = parse_key)]
		keys: Vec<(String, String)>,
	},
	/// Retrieve with C-MOVE to another application entity
	Move {
		#[arg(long)]
		destination: String,
		#[command(flatten)]
		retrieve: RetrieveArgs,
	},
	/// Retrieve with C-GET into a directory
	Get {
		#[arg(short, long, default_value = ".")]
		output: PathBuf,
		#[command(flatten)]
		retrieve: RetrieveArgs,
	},
	/// Send DICOM files with C-STORE
	Store {
		#[arg(required = true)]
		files: Vec<PathBuf>,
	},
}

#[derive(Args, Debug)]
struct RetrieveArgs {
	#[arg(long, value_enum, default_value_t = Model::Study)]
	model: Model,
	#[arg(long, default_value = "STUDY")]
	level: QueryRetrieveLevel,
	#[arg(short, long = "key", value_parser = parse_key)]
	keys: Vec<(String, String)>,
}

#[derive(ValueEnum, Debug, Copy, Clone)]
enum Model {
	Study,
	Patient,
}

impl From<Model> for QueryInformationModel {
	fn from(model: Model) -> Self {
		match model {
			Model::Study => Self::Study,
			Model::Patient => Self::Patient,
		}
	}
}

fn parse_key(value: &str) -> Result<(String, String), String> {
	match value.split_once('=') {
		Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
		Some(_) => Err(String::from("the key name is empty")),
		None => Ok((value.to_owned(), String::new())),
	}
}

fn query_keys(level: QueryRetrieveLevel, keys: Vec<(String, String)>) -> anyhow::Result<QueryKeys> {
	let initial = match level {
		QueryRetrieveLevel::Worklist => QueryKeys::worklist(),
		level => QueryKeys::new(level),
	};
	keys.into_iter()
		.try_fold(initial, |query, (key, value)| query.with_keyword(&key, value))
		.context("Invalid query keys")
}

fn init_logger(level: tracing::Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_writer(std::io::stderr)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.init();
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	let config = match AppConfig::new() {
		Ok(config) => config,
		Err(err) => {
			eprintln!("Failed to load configuration: {err}");
			return ExitCode::FAILURE;
		}
	};
	init_logger(config.telemetry.level);

	let cancellation = CancellationToken::new();
	let token = cancellation.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupted, aborting");
			token.cancel();
		}
	});

	match run(cli, config, cancellation).await {
		Ok(code) => code,
		Err(err) => {
			error!("{err:#}");
			ExitCode::FAILURE
		}
	}
}

async fn run(cli: Cli, config: AppConfig, cancellation: CancellationToken) -> anyhow::Result<ExitCode> {
	let (client, called_aet) = match (&cli.peer.peer, &cli.peer.host) {
		(Some(name), _) => {
			let peer = config.peer(name)?;
			(peer.client(config.client.retry), peer.aet.to_string())
		}
		(None, Some(host)) => {
			let (Some(port), Some(called_aet)) = (cli.peer.port, cli.peer.called_aet.clone()) else {
				bail!("--host requires --port and --called-aet");
			};
			(
				DimseClient::new(host, port).with_retry_policy(config.client.retry),
				called_aet,
			)
		}
		(None, None) => bail!("Either --peer or --host, --port and --called-aet are required"),
	};
	let client = client.with_cancellation(cancellation);
	let calling_aet = config.client.aet.as_str();
	let priority = config.client.priority;

	match cli.command {
		Command::Echo => {
			let echo = config.client.apply(EchoConfiguration::new(calling_aet, &called_aet)?)?;
			let status = client.echo(&echo).await?;
			info!("C-ECHO to {called_aet} at {} returned {status}", client.address());
			Ok(exit_code(status.is_success()))
		}
		Command::Find {
			model,
			level,
			keys,
			limit,
		} => {
			let query = config
				.client
				.apply(QueryConfiguration::new(calling_aet, &called_aet)?)?
				.with_priority(priority)
				.with_information_model(model.into());
			let keys = query_keys(level, keys)?;
			let mut matches = Vec::new();
			let status = client
				.query_with(&query, &keys, |data| {
					matches.push(DicomJson::from(data));
					match limit {
						Some(limit) if matches.len() >= limit => ControlFlow::Break(()),
						_ => ControlFlow::Continue(()),
					}
				})
				.await?;
			println!("{}", serde_json::to_string_pretty(&matches)?);
			info!(matches = matches.len(), "C-FIND finished with status {status}");
			Ok(exit_code(status.is_success() || status.status_type == dicom_scu::StatusType::Cancel))
		}
		Command::Mwl { keys } => {
			let query = config
				.client
				.apply(QueryConfiguration::worklist(calling_aet, &called_aet)?)?
				.with_priority(priority);
			let keys = query_keys(QueryRetrieveLevel::Worklist, keys)?;
			let result = client.worklist(&query, &keys).await?;
			let matches: Vec<DicomJson<InMemDicomObject>> =
				result.matches.into_iter().map(DicomJson::from).collect();
			println!("{}", serde_json::to_string_pretty(&matches)?);
			Ok(exit_code(result.status.is_success()))
		}
		Command::Move { destination, retrieve } => {
			let configuration = config
				.client
				.apply(RetrieveConfiguration::new(calling_aet, &called_aet)?)?
				.with_priority(priority)
				.with_information_model(retrieve.model.into())?
				.with_move_destination(&destination)?;
			let keys = query_keys(retrieve.level, retrieve.keys)?;
			let result = client
				.retrieve(
					&configuration,
					&keys,
					&mut log_progress,
					&mut |instance: ReceivedInstance| -> anyhow::Result<()> {
						bail!("C-MOVE does not deliver {} here", instance.sop_instance_uid)
					},
				)
				.await?;
			println!("{}", serde_json::to_string_pretty(&result.progress)?);
			Ok(exit_code(result.is_success()))
		}
		Command::Get { output, retrieve } => {
			let configuration = config
				.client
				.apply(RetrieveConfiguration::new(calling_aet, &called_aet)?)?
				.with_priority(priority)
				.with_information_model(retrieve.model.into())?;
			let keys = query_keys(retrieve.level, retrieve.keys)?;
			std::fs::create_dir_all(&output)
				.with_context(|| format!("Failed to create {}", output.display()))?;
			let mut store = DirectoryStore::new(output);
			let result = client
				.retrieve(&configuration, &keys, &mut log_progress, &mut store)
				.await?;
			info!(
				"Retrieved {} instances into {}",
				result.progress.completed,
				store.directory().display()
			);
			println!("{}", serde_json::to_string_pretty(&result.progress)?);
			Ok(exit_code(result.is_success()))
		}
		Command::Store { files } => {
			let store = config
				.client
				.apply(StoreConfiguration::new(calling_aet, &called_aet)?)?
				.with_priority(priority);
			let mut failed = 0usize;
			for path in &files {
				let file = open_file(path).with_context(|| format!("Failed to read {}", path.display()))?;
				let result = client.store(&store, &file).await?;
				if result.is_success() {
					info!("Stored {} with status {}", result.sop_instance_uid, result.status);
				} else {
					failed += 1;
					error!("Storing {} failed with status {}", result.sop_instance_uid, result.status);
				}
			}
			Ok(exit_code(failed == 0))
		}
	}
}

fn log_progress(progress: &RetrieveProgress) {
	info!(
		remaining = progress.remaining,
		completed = progress.completed,
		failed = progress.failed,
		warning = progress.warning,
		"{:.0}% complete",
		progress.fraction_complete() * 100.0
	);
}

const fn exit_code(success: bool) -> ExitCode {
	if success {
		ExitCode::SUCCESS
	} else {
		ExitCode::FAILURE
	}
}
