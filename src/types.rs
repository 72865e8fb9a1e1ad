use crate::error::ValidationError;
use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use serde::{Deserialize, Deserializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// An application entity title.
///
/// AE titles are 1 to 16 characters of the default character repertoire without
/// backslashes or control characters. Leading and trailing spaces are not significant.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part05/sect_6.2.html>
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeTitle(String);

impl AeTitle {
	pub const MAX_LENGTH: usize = 16;

	pub fn new(value: impl AsRef<str>) -> Result<Self, ValidationError> {
		let raw = value.as_ref();
		let trimmed = raw.trim_matches(' ');
		if trimmed.is_empty() {
			return Err(ValidationError::AeTitle {
				value: raw.to_owned(),
				reason: "must not be empty",
			});
		}
		if raw.len() > Self::MAX_LENGTH {
			return Err(ValidationError::AeTitle {
				value: raw.to_owned(),
				reason: "must not exceed 16 characters",
			});
		}
		if !trimmed.chars().all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\') {
			return Err(ValidationError::AeTitle {
				value: raw.to_owned(),
				reason: "contains characters outside the default repertoire",
			});
		}
		Ok(Self(trimmed.to_owned()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl Display for AeTitle {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for AeTitle {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::new(s)
	}
}

impl TryFrom<String> for AeTitle {
	type Error = ValidationError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::new(value)
	}
}

impl AsRef<str> for AeTitle {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl<'de> Deserialize<'de> for AeTitle {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = String::deserialize(deserializer)?;
		Self::new(value).map_err(serde::de::Error::custom)
	}
}

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Low = 0x0002,
	#[default]
	Medium = 0x0000,
	High = 0x0001,
}

impl Priority {
	pub const fn code(self) -> US {
		self as US
	}
}

/// Selects the information model, which determines the SOP classes used for C-FIND,
/// C-MOVE and C-GET and the valid query levels.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryInformationModel {
	#[default]
	Study,
	Patient,
	Worklist,
}

impl QueryInformationModel {
	pub const fn as_sop_class(&self) -> &'static str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Worklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
		}
	}

	/// The C-MOVE SOP class, absent for the worklist model.
	pub const fn move_sop_class(&self) -> Option<&'static str> {
		match self {
			Self::Study => Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			Self::Patient => Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
			Self::Worklist => None,
		}
	}

	/// The C-GET SOP class, absent for the worklist model.
	pub const fn get_sop_class(&self) -> Option<&'static str> {
		match self {
			Self::Study => Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			Self::Patient => Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET),
			Self::Worklist => None,
		}
	}

	pub const fn supports_level(&self, level: QueryRetrieveLevel) -> bool {
		matches!(
			(self, level),
			(
				Self::Patient,
				QueryRetrieveLevel::Patient
					| QueryRetrieveLevel::Study
					| QueryRetrieveLevel::Series
					| QueryRetrieveLevel::Image
			) | (
				Self::Study,
				QueryRetrieveLevel::Study | QueryRetrieveLevel::Series | QueryRetrieveLevel::Image
			) | (Self::Worklist, QueryRetrieveLevel::Worklist)
		)
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
	/// Modality worklist queries carry no Query/Retrieve Level attribute.
	Worklist,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
			Self::Worklist => write!(f, "WORKLIST"),
		}
	}
}

impl FromStr for QueryRetrieveLevel {
	type Err = ValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_uppercase().as_str() {
			"PATIENT" => Ok(Self::Patient),
			"STUDY" => Ok(Self::Study),
			"SERIES" => Ok(Self::Series),
			"IMAGE" => Ok(Self::Image),
			"WORKLIST" => Ok(Self::Worklist),
			_ => Err(ValidationError::QueryKeys(format!("unknown query level '{s}'"))),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}
