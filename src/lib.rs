//! A DICOM Upper Layer / DIMSE service class user.
//!
//! [`DimseClient`] is the entry point: it negotiates an association with a remote
//! application entity per call and runs C-ECHO, C-FIND (including modality worklist),
//! C-MOVE, C-GET or C-STORE on it.
//!
//! ```no_run
//! use dicom_scu::{DimseClient, QueryConfiguration, QueryKeys, QueryRetrieveLevel};
//! use dicom::dictionary_std::tags;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DimseClient::new("pacs.local", 104);
//! let config = QueryConfiguration::new("MY_SCU", "PACS")?;
//! let keys = QueryKeys::new(QueryRetrieveLevel::Study)
//! 	.with_key(tags::PATIENT_ID, "12345")?
//! 	.with_return_key(tags::STUDY_INSTANCE_UID)?;
//! let result = client.query(&config, &keys).await?;
//! println!("{} matches", result.matches.len());
//! # Ok(())
//! # }
//! ```

pub mod association;
pub mod client;
pub mod config;
pub mod dimse;
pub mod error;
pub mod progress;
pub mod query;
pub mod results;
pub mod types;

pub use client::{
	AssociationConfiguration, DimseClient, EchoConfiguration, QueryConfiguration, RetrieveConfiguration,
	RetryPolicy, StoreConfiguration,
};
pub use dimse::cstore::{DirectoryStore, ReceivedInstance, StoreHandler};
pub use dimse::{DimseStatus, StatusType};
pub use error::{AbortCause, ScuError, ValidationError};
pub use progress::{NoProgress, ProgressHandler, RetrieveProgress};
pub use query::QueryKeys;
pub use results::{QueryResult, RetrieveResult, StoreResult};
pub use types::{AeTitle, Priority, QueryInformationModel, QueryRetrieveLevel};

/// The implementation class UID sent during association negotiation.
/// A random UUID represented as a single integer under the 2.25 root.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.84786763347651861022342811269176797436";

/// "DICOM-SCU" followed by the crate version.
pub const IMPLEMENTATION_VERSION_NAME: &str = concat!("DICOM-SCU ", env!("CARGO_PKG_VERSION"));
