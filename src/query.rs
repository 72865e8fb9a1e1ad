//! Query keys for C-FIND, C-MOVE and C-GET identifiers.

use crate::error::ValidationError;
use crate::types::{QueryInformationModel, QueryRetrieveLevel};
use dicom::core::dictionary::{DataDictionary, VirtualVr};
use dicom::core::ops::{ApplyOp, AttributeAction, AttributeOp, AttributeSelector};
use dicom::core::{PrimitiveValue, Tag, VR};
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use tracing::warn;

/// Return keys requested by default for modality worklist queries.
/// Top level keys first, then keys of the Scheduled Procedure Step Sequence item.
pub const WORKLIST_RETURN_KEYS: &[Tag] = &[
	// Patient Identification
	tags::PATIENT_NAME,
	tags::PATIENT_ID,
	tags::ISSUER_OF_PATIENT_ID,
	// Patient Demographics
	tags::PATIENT_BIRTH_DATE,
	tags::PATIENT_SEX,
	// Requested Procedure
	tags::ACCESSION_NUMBER,
	tags::REQUESTED_PROCEDURE_ID,
	tags::REQUESTED_PROCEDURE_DESCRIPTION,
	tags::STUDY_INSTANCE_UID,
];

pub const WORKLIST_STEP_RETURN_KEYS: &[Tag] = &[
	tags::MODALITY,
	tags::SCHEDULED_STATION_AE_TITLE,
	tags::SCHEDULED_PROCEDURE_STEP_START_DATE,
	tags::SCHEDULED_PROCEDURE_STEP_START_TIME,
	tags::SCHEDULED_PERFORMING_PHYSICIAN_NAME,
	tags::SCHEDULED_PROCEDURE_STEP_DESCRIPTION,
	tags::SCHEDULED_PROCEDURE_STEP_ID,
	tags::SCHEDULED_STATION_NAME,
	tags::SCHEDULED_PROCEDURE_STEP_LOCATION,
];

/// An ordered set of matching and return keys plus the query level.
///
/// An empty value requests the attribute without filtering on it. Non-empty values are
/// matched by the peer, with `*`/`?` wildcards and `A-B` ranges for dates and times.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKeys {
	level: QueryRetrieveLevel,
	keys: Vec<(AttributeSelector, String)>,
}

impl QueryKeys {
	pub const fn new(level: QueryRetrieveLevel) -> Self {
		Self {
			level,
			keys: Vec::new(),
		}
	}

	/// Worklist keys with the usual scheduled procedure step return keys.
	pub fn worklist() -> Self {
		let mut keys = Self::new(QueryRetrieveLevel::Worklist);
		for tag in WORKLIST_RETURN_KEYS {
			keys.upsert(AttributeSelector::from(*tag), String::new());
		}
		for tag in WORKLIST_STEP_RETURN_KEYS {
			keys.upsert(
				AttributeSelector::from((tags::SCHEDULED_PROCEDURE_STEP_SEQUENCE, *tag)),
				String::new(),
			);
		}
		keys
	}

	pub const fn level(&self) -> QueryRetrieveLevel {
		self.level
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	/// Adds or replaces a matching key.
	pub fn with_key(mut self, tag: Tag, value: impl Into<String>) -> Result<Self, ValidationError> {
		let value = value.into();
		validate_value(tag, &value)?;
		self.upsert(AttributeSelector::from(tag), value);
		Ok(self)
	}

	/// Requests an attribute without matching on it.
	pub fn with_return_key(self, tag: Tag) -> Result<Self, ValidationError> {
		self.with_key(tag, "")
	}

	/// Adds a key inside the first item of a sequence attribute.
	pub fn with_nested_key(
		mut self,
		sequence: Tag,
		tag: Tag,
		value: impl Into<String>,
	) -> Result<Self, ValidationError> {
		let value = value.into();
		match vr_of(sequence)? {
			Some(VR::SQ) => {}
			_ => {
				return Err(ValidationError::QueryKeys(format!(
					"{sequence} is not a sequence attribute"
				)))
			}
		}
		validate_value(tag, &value)?;
		self.upsert(AttributeSelector::from((sequence, tag)), value);
		Ok(self)
	}

	/// Adds a key given as keyword (`PatientName`), tag (`00100010` or `(0010,0010)`) or
	/// a sequence path (`ScheduledProcedureStepSequence.Modality`).
	pub fn with_keyword(self, key: &str, value: impl Into<String>) -> Result<Self, ValidationError> {
		match key.split_once('.') {
			Some((sequence, nested)) => {
				let sequence = parse_tag(sequence)?;
				let nested = parse_tag(nested)?;
				self.with_nested_key(sequence, nested, value)
			}
			None => {
				let tag = parse_tag(key)?;
				self.with_key(tag, value)
			}
		}
	}

	/// Checks the query level against the information model.
	pub fn validate_for(&self, model: QueryInformationModel) -> Result<(), ValidationError> {
		if model.supports_level(self.level) {
			Ok(())
		} else {
			Err(ValidationError::QueryKeys(format!(
				"query level {} is not valid for the {model:?} information model",
				self.level
			)))
		}
	}

	/// Builds the identifier data set. Worklist identifiers carry no Query/Retrieve Level.
	pub fn to_identifier(&self) -> InMemDicomObject {
		let mut identifier = InMemDicomObject::new_empty();
		if self.level != QueryRetrieveLevel::Worklist {
			apply(
				&mut identifier,
				AttributeSelector::from(tags::QUERY_RETRIEVE_LEVEL),
				PrimitiveValue::from(self.level),
			);
		}
		for (selector, value) in &self.keys {
			let value = if value.is_empty() {
				PrimitiveValue::Empty
			} else {
				PrimitiveValue::from(value.as_str())
			};
			apply(&mut identifier, selector.clone(), value);
		}
		identifier
	}

	fn upsert(&mut self, selector: AttributeSelector, value: String) {
		if let Some(entry) = self.keys.iter_mut().find(|(s, _)| *s == selector) {
			entry.1 = value;
		} else {
			self.keys.push((selector, value));
		}
	}
}

fn apply(identifier: &mut InMemDicomObject, selector: AttributeSelector, value: PrimitiveValue) {
	if let Err(err) = identifier.apply(AttributeOp::new(selector, AttributeAction::Set(value))) {
		warn!("Skipped attribute operation: {err}");
	}
}

fn parse_tag(key: &str) -> Result<Tag, ValidationError> {
	let hex: String = key
		.chars()
		.filter(|c| !matches!(c, '(' | ')' | ','))
		.collect();
	if hex.len() == 8 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
		let group = u16::from_str_radix(&hex[..4], 16);
		let element = u16::from_str_radix(&hex[4..], 16);
		if let (Ok(group), Ok(element)) = (group, element) {
			return Ok(Tag(group, element));
		}
	}
	StandardDataDictionary
		.by_name(key)
		.map(|entry| entry.tag.inner())
		.ok_or_else(|| ValidationError::QueryKeys(format!("unknown attribute '{key}'")))
}

/// VR from the dictionary. Private attributes are accepted without one.
fn vr_of(tag: Tag) -> Result<Option<VR>, ValidationError> {
	if tag.group() % 2 == 1 {
		return Ok(None);
	}
	let entry = StandardDataDictionary
		.by_tag(tag)
		.ok_or_else(|| ValidationError::QueryKeys(format!("unknown attribute {tag}")))?;
	Ok(match entry.vr {
		VirtualVr::Exact(vr) => Some(vr),
		_ => None,
	})
}

fn validate_value(tag: Tag, value: &str) -> Result<(), ValidationError> {
	let vr = vr_of(tag)?;
	let is_date_time = matches!(vr, Some(VR::DA | VR::TM | VR::DT));
	if !is_date_time || value.is_empty() {
		return Ok(());
	}
	let vr = vr.unwrap_or(VR::UN);
	let well_formed = match value.split_once('-') {
		Some((lower, upper)) => {
			(!lower.is_empty() || !upper.is_empty())
				&& (lower.is_empty() || is_well_formed(vr, lower))
				&& (upper.is_empty() || is_well_formed(vr, upper))
		}
		None => is_well_formed(vr, value),
	};
	if well_formed {
		Ok(())
	} else {
		Err(ValidationError::QueryKeys(format!(
			"'{value}' is not a valid {vr} value or range for {tag}"
		)))
	}
}

fn all_digits(value: &str) -> bool {
	value.bytes().all(|b| b.is_ascii_digit())
}

/// Whether `value` is a date (YYYYMMDD), time (HH[MM[SS[.F{1,6}]]]) or date time.
fn is_well_formed(vr: VR, value: &str) -> bool {
	let time = |value: &str| {
		let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
		matches!(whole.len(), 2 | 4 | 6)
			&& all_digits(whole)
			&& fraction.len() <= 6
			&& all_digits(fraction)
			&& (fraction.is_empty() || whole.len() == 6)
	};
	match vr {
		VR::DA => value.len() == 8 && all_digits(value),
		VR::TM => time(value),
		VR::DT => {
			let value = match value.rfind(['+', '-']) {
				Some(offset) if value.len() - offset == 5 && all_digits(&value[offset + 1..]) => {
					&value[..offset]
				}
				_ => value,
			};
			let (date, rest) = value.split_at(value.len().min(8));
			matches!(date.len(), 4 | 6 | 8)
				&& all_digits(date)
				&& (rest.is_empty() || (date.len() == 8 && time(rest)))
		}
		_ => true,
	}
}
