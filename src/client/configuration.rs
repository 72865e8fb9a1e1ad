use crate::association::pdu::{DEFAULT_MAX_PDU_LENGTH, MINIMUM_MAX_PDU_LENGTH};
use crate::association::ClientAssociationOptions;
use crate::error::ValidationError;
use crate::types::{AeTitle, Priority, QueryInformationModel, UI};
use dicom::dictionary_std::uids;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Storage SOP classes offered in the SCP role for C-GET, unless configured otherwise.
pub const DEFAULT_STORAGE_SOP_CLASSES: &[&str] = &[
	"1.2.840.10008.5.1.4.1.1.1",      // Computed Radiography
	"1.2.840.10008.5.1.4.1.1.1.1",    // Digital X-Ray, for presentation
	"1.2.840.10008.5.1.4.1.1.1.2",    // Digital Mammography, for presentation
	"1.2.840.10008.5.1.4.1.1.2",      // CT
	"1.2.840.10008.5.1.4.1.1.2.1",    // Enhanced CT
	"1.2.840.10008.5.1.4.1.1.4",      // MR
	"1.2.840.10008.5.1.4.1.1.4.1",    // Enhanced MR
	"1.2.840.10008.5.1.4.1.1.6.1",    // Ultrasound
	"1.2.840.10008.5.1.4.1.1.3.1",    // Ultrasound Multi-frame
	"1.2.840.10008.5.1.4.1.1.7",      // Secondary Capture
	"1.2.840.10008.5.1.4.1.1.12.1",   // X-Ray Angiography
	"1.2.840.10008.5.1.4.1.1.20",     // Nuclear Medicine
	"1.2.840.10008.5.1.4.1.1.128",    // PET
	"1.2.840.10008.5.1.4.1.1.481.1",  // RT Image
	"1.2.840.10008.5.1.4.1.1.481.2",  // RT Dose
	"1.2.840.10008.5.1.4.1.1.481.3",  // RT Structure Set
	"1.2.840.10008.5.1.4.1.1.481.5",  // RT Plan
	"1.2.840.10008.5.1.4.1.1.66.4",   // Segmentation
	"1.2.840.10008.5.1.4.1.1.88.11",  // Basic Text SR
	"1.2.840.10008.5.1.4.1.1.88.22",  // Enhanced SR
	"1.2.840.10008.5.1.4.1.1.88.33",  // Comprehensive SR
	"1.2.840.10008.5.1.4.1.1.104.1",  // Encapsulated PDF
	"1.2.840.10008.5.1.4.1.1.11.1",   // Grayscale Softcopy Presentation State
	"1.2.840.10008.5.1.4.1.1.77.1.4", // VL Photographic
];

/// Transfer syntaxes proposed for queries and retrieves, most preferred first.
pub fn query_transfer_syntaxes() -> Vec<UI> {
	vec![
		UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
	]
}

/// The knobs every association shares: AE titles, timeout and maximum PDU length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSettings {
	pub calling_ae_title: AeTitle,
	pub called_ae_title: AeTitle,
	pub timeout: Duration,
	/// Largest PDU we accept. 0 means unlimited.
	pub max_pdu_length: u32,
}

impl AssociationSettings {
	pub fn new(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self {
			calling_ae_title: AeTitle::new(calling_ae_title)?,
			called_ae_title: AeTitle::new(called_ae_title)?,
			timeout: DEFAULT_TIMEOUT,
			max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
		})
	}

	/// Association options without presentation contexts.
	pub fn association_options(&self) -> ClientAssociationOptions {
		ClientAssociationOptions::new(self.calling_ae_title.clone(), self.called_ae_title.clone())
			.timeout(self.timeout)
			.max_pdu_length(self.max_pdu_length)
	}
}

/// Builders shared by all operation configurations.
pub trait AssociationConfiguration: Sized {
	fn settings(&self) -> &AssociationSettings;

	fn settings_mut(&mut self) -> &mut AssociationSettings;

	/// Timeout for connecting and for every PDU exchange. Must not be zero.
	fn with_timeout(mut self, timeout: Duration) -> Result<Self, ValidationError> {
		if timeout.is_zero() {
			return Err(ValidationError::Configuration(String::from(
				"timeout must be greater than zero",
			)));
		}
		self.settings_mut().timeout = timeout;
		Ok(self)
	}

	/// 0 for unlimited, otherwise at least 1024 bytes.
	fn with_max_pdu_length(mut self, max_pdu_length: u32) -> Result<Self, ValidationError> {
		if max_pdu_length != 0 && max_pdu_length < MINIMUM_MAX_PDU_LENGTH {
			return Err(ValidationError::Configuration(format!(
				"max PDU length {max_pdu_length} is below the minimum of {MINIMUM_MAX_PDU_LENGTH} bytes"
			)));
		}
		self.settings_mut().max_pdu_length = max_pdu_length;
		Ok(self)
	}
}

macro_rules! impl_association_configuration {
	($($ty:ty),+) => {
		$(impl AssociationConfiguration for $ty {
			fn settings(&self) -> &AssociationSettings {
				&self.settings
			}

			fn settings_mut(&mut self) -> &mut AssociationSettings {
				&mut self.settings
			}
		})+
	};
}

impl_association_configuration!(
	QueryConfiguration,
	RetrieveConfiguration,
	StoreConfiguration,
	EchoConfiguration
);

/// Configuration of a C-FIND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfiguration {
	settings: AssociationSettings,
	pub priority: Priority,
	pub information_model: QueryInformationModel,
}

impl QueryConfiguration {
	pub fn new(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self {
			settings: AssociationSettings::new(calling_ae_title, called_ae_title)?,
			priority: Priority::default(),
			information_model: QueryInformationModel::default(),
		})
	}

	/// A modality worklist query.
	pub fn worklist(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self::new(calling_ae_title, called_ae_title)?
			.with_information_model(QueryInformationModel::Worklist))
	}

	#[must_use]
	pub const fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	#[must_use]
	pub const fn with_information_model(mut self, information_model: QueryInformationModel) -> Self {
		self.information_model = information_model;
		self
	}

	pub fn association_options(&self) -> ClientAssociationOptions {
		self.settings.association_options().with_presentation_context(
			self.information_model.as_sop_class(),
			query_transfer_syntaxes(),
		)
	}
}

/// How a retrieve is carried out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetrieveOperation<'a> {
	/// C-MOVE to another application entity.
	Move { destination: &'a AeTitle },
	/// C-GET, the instances arrive on the same association.
	Get,
}

/// Configuration of a C-MOVE or C-GET. A move destination selects C-MOVE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveConfiguration {
	settings: AssociationSettings,
	pub priority: Priority,
	information_model: QueryInformationModel,
	move_destination: Option<AeTitle>,
	storage_sop_classes: Vec<UI>,
}

impl RetrieveConfiguration {
	pub fn new(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self {
			settings: AssociationSettings::new(calling_ae_title, called_ae_title)?,
			priority: Priority::default(),
			information_model: QueryInformationModel::default(),
			move_destination: None,
			storage_sop_classes: DEFAULT_STORAGE_SOP_CLASSES
				.iter()
				.map(|uid| UI::from(*uid))
				.collect(),
		})
	}

	pub fn with_move_destination(mut self, destination: &str) -> Result<Self, ValidationError> {
		self.move_destination = Some(AeTitle::new(destination)?);
		Ok(self)
	}

	#[must_use]
	pub const fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	/// Only the Patient Root and Study Root models define retrieve SOP classes.
	pub fn with_information_model(
		mut self,
		information_model: QueryInformationModel,
	) -> Result<Self, ValidationError> {
		if information_model.move_sop_class().is_none() {
			return Err(ValidationError::Configuration(format!(
				"the {information_model:?} information model does not support retrieval"
			)));
		}
		self.information_model = information_model;
		Ok(self)
	}

	/// Storage SOP classes accepted from the peer during a C-GET.
	pub fn with_storage_sop_classes<I, S>(mut self, sop_classes: I) -> Result<Self, ValidationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<UI>,
	{
		let sop_classes: Vec<UI> = sop_classes.into_iter().map(Into::into).collect();
		if sop_classes.is_empty() {
			return Err(ValidationError::Configuration(String::from(
				"at least one storage SOP class is required for C-GET",
			)));
		}
		// one context is taken by the C-GET SOP class
		if sop_classes.len() > 127 {
			return Err(ValidationError::Configuration(format!(
				"{} storage SOP classes exceed the limit of 127 presentation contexts",
				sop_classes.len()
			)));
		}
		self.storage_sop_classes = sop_classes;
		Ok(self)
	}

	pub const fn information_model(&self) -> QueryInformationModel {
		self.information_model
	}

	pub const fn move_destination(&self) -> Option<&AeTitle> {
		self.move_destination.as_ref()
	}

	pub fn storage_sop_classes(&self) -> &[UI] {
		&self.storage_sop_classes
	}

	pub const fn operation(&self) -> RetrieveOperation<'_> {
		match &self.move_destination {
			Some(destination) => RetrieveOperation::Move { destination },
			None => RetrieveOperation::Get,
		}
	}

	/// The C-MOVE or C-GET SOP class of the information model.
	pub fn sop_class(&self) -> Result<&'static str, ValidationError> {
		let sop_class = match self.operation() {
			RetrieveOperation::Move { .. } => self.information_model.move_sop_class(),
			RetrieveOperation::Get => self.information_model.get_sop_class(),
		};
		sop_class.ok_or_else(|| {
			ValidationError::Configuration(format!(
				"the {:?} information model does not support retrieval",
				self.information_model
			))
		})
	}

	/// For C-GET, every storage SOP class is proposed with the SCP role.
	pub fn association_options(&self) -> Result<ClientAssociationOptions, ValidationError> {
		let mut options = self
			.settings
			.association_options()
			.with_presentation_context(self.sop_class()?, query_transfer_syntaxes());
		if self.operation() == RetrieveOperation::Get {
			for sop_class in &self.storage_sop_classes {
				options = options
					.with_presentation_context(sop_class.clone(), storage_transfer_syntaxes())
					.with_scp_role(sop_class.clone());
			}
		}
		Ok(options)
	}
}

/// Transfer syntaxes accepted for incoming C-STORE sub-operations.
fn storage_transfer_syntaxes() -> Vec<UI> {
	vec![
		UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN),
		UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN),
		UI::from("1.2.840.10008.1.2.1.99"), // Deflated Explicit VR Little Endian
		UI::from("1.2.840.10008.1.2.4.50"), // JPEG Baseline
		UI::from("1.2.840.10008.1.2.4.70"), // JPEG Lossless, first order prediction
		UI::from("1.2.840.10008.1.2.4.90"), // JPEG 2000 lossless
		UI::from("1.2.840.10008.1.2.4.91"), // JPEG 2000
		UI::from("1.2.840.10008.1.2.5"),    // RLE Lossless
	]
}

/// Configuration of a C-STORE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfiguration {
	settings: AssociationSettings,
	pub priority: Priority,
}

impl StoreConfiguration {
	pub fn new(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self {
			settings: AssociationSettings::new(calling_ae_title, called_ae_title)?,
			priority: Priority::default(),
		})
	}

	#[must_use]
	pub const fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	/// Proposes the object's own transfer syntax first. Native little endian objects may
	/// also be sent in the other little endian syntax.
	pub fn association_options(&self, sop_class_uid: &str, transfer_syntax: &str) -> ClientAssociationOptions {
		let mut transfer_syntaxes = vec![UI::from(transfer_syntax)];
		match transfer_syntax {
			uids::EXPLICIT_VR_LITTLE_ENDIAN => {
				transfer_syntaxes.push(UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN));
			}
			uids::IMPLICIT_VR_LITTLE_ENDIAN => {
				transfer_syntaxes.push(UI::from(uids::EXPLICIT_VR_LITTLE_ENDIAN));
			}
			_ => {}
		}
		self.settings
			.association_options()
			.with_presentation_context(sop_class_uid, transfer_syntaxes)
	}
}

/// Configuration of a C-ECHO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfiguration {
	settings: AssociationSettings,
}

impl EchoConfiguration {
	pub fn new(calling_ae_title: &str, called_ae_title: &str) -> Result<Self, ValidationError> {
		Ok(Self {
			settings: AssociationSettings::new(calling_ae_title, called_ae_title)?,
		})
	}

	pub fn association_options(&self) -> ClientAssociationOptions {
		self.settings.association_options().with_presentation_context(
			uids::VERIFICATION,
			vec![UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN)],
		)
	}
}
