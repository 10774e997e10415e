//! DG11 additional personal details and DG12 additional document details.
//!
//! ICAO Doc 9303-10 Sections 4.7.11 and 4.7.12. Fields holding several values separate
//! them with `<`.

use crate::{
    asn1::{unwrap_file, TlvIter},
    record::{decode_string, split_fillers},
    EmrtdError,
};
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use serde::Serialize;
use tracing::{error, trace, warn};

/// Decoded DG11.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdditionalPersonDetails {
    /// Full name as `SURNAME, GIVEN NAMES`.
    pub name_of_holder: Option<String>,
    pub other_names: Vec<String>,
    pub personal_number: Option<String>,
    /// `YYYYMMDD`, possibly with unknown parts as `00`.
    pub full_date_of_birth: Option<String>,
    pub place_of_birth: Vec<String>,
    pub permanent_address: Vec<String>,
    pub telephone: Option<String>,
    pub profession: Option<String>,
    pub title: Option<String>,
    pub personal_summary: Option<String>,
    #[serde(skip)]
    pub proof_of_citizenship: Option<Vec<u8>>,
    pub other_valid_td_numbers: Vec<String>,
    pub custody_information: Option<String>,
    /// Tags announced by the tag list `5C`.
    pub tag_presence_list: Vec<u32>,
}

/// Decoded DG12.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdditionalDocumentDetails {
    pub issuing_authority: Option<String>,
    /// `YYYYMMDD`.
    pub date_of_issue: Option<String>,
    pub names_of_other_persons: Vec<String>,
    pub endorsements_and_observations: Option<String>,
    pub tax_or_exit_requirements: Option<String>,
    #[serde(skip)]
    pub image_of_front: Option<Vec<u8>>,
    #[serde(skip)]
    pub image_of_rear: Option<Vec<u8>>,
    /// `YYYYMMDDhhmmss`.
    pub date_and_time_of_personalization: Option<String>,
    pub personalization_system_serial_number: Option<String>,
    pub tag_presence_list: Vec<u32>,
}

fn text(value: &[u8]) -> String {
    String::from_utf8_lossy(value).trim().to_string()
}

/// Dates are ASCII digits, some issuers store them as packed BCD.
fn date(value: &[u8], digits: usize) -> String {
    if value.len() * 2 == digits {
        value.iter().map(|b| format!("{b:02X}")).collect()
    } else {
        text(value)
    }
}

/// Tags of a `5C` tag list, each one or two bytes.
fn tag_list(value: &[u8]) -> Vec<u32> {
    let mut tags = Vec::new();
    let mut bytes = value.iter();
    while let Some(&first) = bytes.next() {
        if first & 0x1F == 0x1F {
            match bytes.next() {
                Some(&second) => tags.push((u32::from(first) << 8) | u32::from(second)),
                None => warn!("Tag list ends within a tag"),
            }
        } else {
            tags.push(u32::from(first));
        }
    }
    tags
}

/// Values of a content specific constructed object `A0 { 02 count, tag value... }`.
fn repeated_values(group: &[u8], tag: u32) -> Result<Vec<String>, EmrtdError> {
    let mut values = Vec::new();
    let mut announced = None;
    for tlv in TlvIter::new(group) {
        match tlv? {
            (0x02, count) => announced = count.first().copied(),
            (t, value) if t == tag => values.push(decode_string(&text(value))),
            (other, _) => trace!("Skipping tag {other:04X} inside a repeated field"),
        }
    }
    if announced.is_some_and(|count| usize::from(count) != values.len()) {
        warn!(
            "Repeated field announces {announced:?} values, found {}",
            values.len()
        );
    }
    Ok(values)
}

/// # Errors
///
/// `EmrtdError` if the file is not a DG11 or a TLV is malformed.
pub fn parse_dg11(dg11: &[u8]) -> Result<AdditionalPersonDetails, EmrtdError> {
    let content = unwrap_file(dg11, &[0x6B], "EF.DG11")?;
    let mut details = AdditionalPersonDetails::default();
    for tlv in TlvIter::new(content) {
        let (tag, value) = tlv?;
        match tag {
            0x5C => details.tag_presence_list = tag_list(value),
            0x5F0E => details.name_of_holder = Some(decode_string(&text(value))),
            0xA0 => details.other_names.extend(repeated_values(value, 0x5F0F)?),
            0x5F0F => details.other_names.push(decode_string(&text(value))),
            0x5F10 => details.personal_number = Some(text(value)),
            0x5F2B => details.full_date_of_birth = Some(date(value, 8)),
            0x5F11 => details.place_of_birth = split_fillers(&text(value)),
            0x5F42 => details.permanent_address = split_fillers(&text(value)),
            0x5F12 => details.telephone = Some(text(value)),
            0x5F13 => details.profession = Some(text(value)),
            0x5F14 => details.title = Some(text(value)),
            0x5F15 => details.personal_summary = Some(text(value)),
            0x5F16 => details.proof_of_citizenship = Some(value.to_vec()),
            0x5F17 => details.other_valid_td_numbers = split_fillers(&text(value)),
            0x5F18 => details.custody_information = Some(text(value)),
            other => trace!("Skipping tag {other:04X} of EF.DG11"),
        }
    }
    if details.tag_presence_list.is_empty() {
        error!("EF.DG11 has no tag list");
        return Err(EmrtdError::InvalidFileStructure("EF.DG11"));
    }
    Ok(details)
}

/// # Errors
///
/// `EmrtdError` if the file is not a DG12 or a TLV is malformed.
pub fn parse_dg12(dg12: &[u8]) -> Result<AdditionalDocumentDetails, EmrtdError> {
    let content = unwrap_file(dg12, &[0x6C], "EF.DG12")?;
    let mut details = AdditionalDocumentDetails::default();
    for tlv in TlvIter::new(content) {
        let (tag, value) = tlv?;
        match tag {
            0x5C => details.tag_presence_list = tag_list(value),
            0x5F19 => details.issuing_authority = Some(text(value)),
            0x5F26 => details.date_of_issue = Some(date(value, 8)),
            0xA0 => details.names_of_other_persons.extend(repeated_values(value, 0x5F1A)?),
            0x5F1A => details.names_of_other_persons.push(decode_string(&text(value))),
            0x5F1B => details.endorsements_and_observations = Some(text(value)),
            0x5F1C => details.tax_or_exit_requirements = Some(text(value)),
            0x5F1D => details.image_of_front = Some(value.to_vec()),
            0x5F1E => details.image_of_rear = Some(value.to_vec()),
            0x5F55 => details.date_and_time_of_personalization = Some(date(value, 14)),
            0x5F56 => details.personalization_system_serial_number = Some(text(value)),
            other => trace!("Skipping tag {other:04X} of EF.DG12"),
        }
    }
    if details.tag_presence_list.is_empty() {
        error!("EF.DG12 has no tag list");
        return Err(EmrtdError::InvalidFileStructure("EF.DG12"));
    }
    Ok(details)
}
