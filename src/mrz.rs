//! Cleaning of OCR'd Machine Readable Zones and the MRZ derived access key.
//!
//! Layouts and check digits are explained at ICAO Doc 9303-3 Section 4.9:
//! <https://www.icao.int/publications/Documents/9303_p3_cons_en.pdf>

use crate::{record::MrzRecord, MrzError};
use alloc::{
    borrow::ToOwned,
    format,
    string::String,
    vec::Vec,
};
use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

/// Filler character of the MRZ.
pub const FILLER: char = '<';

/// Maximum length of a two line payload, 2 × 44 plus the line break.
const TWO_LINE_MAX: usize = 89;
/// Maximum length of a three line payload, 3 × 30 plus two line breaks.
const THREE_LINE_MAX: usize = 92;

/// First letters of every document code.
const DOCUMENT_TYPES: &[char] = &['P', 'I', 'A', 'C', 'V'];

/// Stray glyphs OCR engines read inside filler runs.
const FILLER_CONFUSIONS: [&str; 10] = [
    "<c<", "<e<", "<E<", "<K<", "<S<", "<C<", "<¢<", "<(<", "<{<", "<[<",
];

/// Text restricted to `[A-Z0-9<\n]` with one or two line breaks, starting with a
/// document type letter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NormalizedMrz(String);

impl TryFrom<String> for NormalizedMrz {
    type Error = MrzError;

    /// Accepts only text `normalize` leaves unchanged.
    fn try_from(text: String) -> Result<Self, Self::Error> {
        let normalized = normalize(&text)?;
        if normalized.0 != text {
            error!("MRZ is not in normalized form");
            return Err(MrzError::NotMrzLike);
        }
        Ok(normalized)
    }
}

impl From<NormalizedMrz> for String {
    fn from(mrz: NormalizedMrz) -> Self {
        mrz.0
    }
}

impl NormalizedMrz {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Builds the MRZ stored on the chip in DG1, where the rows are not separated.
    /// 90 characters are TD1, 72 are TD2 and 88 are TD3.
    ///
    /// # Errors
    ///
    /// * `MrzError::UnsupportedLayout` for any other length.
    /// * `MrzError::InvalidCharacter` for a character outside `[A-Z0-9<]`.
    pub(crate) fn from_unbroken(text: &str) -> Result<Self, MrzError> {
        let format = match text.len() {
            90 => MrzFormat::Td1,
            72 => MrzFormat::Td2,
            88 => MrzFormat::Td3,
            len => {
                error!("MRZ of {len} characters matches no layout");
                return Err(MrzError::UnsupportedLayout { rows: 1, columns: len });
            }
        };
        if let Some(c) = text.chars().find(|c| character_value(*c).is_none()) {
            error!("MRZ can not contain the character: `{c}`");
            return Err(MrzError::InvalidCharacter(c));
        }
        let rows: Vec<&str> = (0..format.rows())
            .map(|row| &text[row * format.columns()..(row + 1) * format.columns()])
            .collect();
        Ok(Self(rows.join("\n")))
    }

    /// Rows of the MRZ, shorter rows right padded with fillers to the widest row.
    #[must_use]
    pub fn rows(&self) -> Vec<String> {
        let rows: Vec<&str> = self.0.split('\n').collect();
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
        rows.iter()
            .map(|row| {
                let mut row = (*row).to_owned();
                while row.len() < width {
                    row.push(FILLER);
                }
                row
            })
            .collect()
    }
}

impl fmt::Display for NormalizedMrz {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The supported ICAO 9303 layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrzFormat {
    /// ID-1 sized cards, 3 rows of 30.
    Td1,
    /// ID-2 sized cards, 2 rows of 36.
    Td2,
    /// Passport booklets (MRP), 2 rows of 44.
    Td3,
}

impl MrzFormat {
    #[must_use]
    pub fn rows(self) -> usize {
        match self {
            Self::Td1 => 3,
            Self::Td2 | Self::Td3 => 2,
        }
    }

    #[must_use]
    pub fn columns(self) -> usize {
        match self {
            Self::Td1 => 30,
            Self::Td2 => 36,
            Self::Td3 => 44,
        }
    }

    /// Detects the layout from the number of rows and the row width.
    ///
    /// # Errors
    ///
    /// `MrzError::UnsupportedLayout` if no layout has these dimensions.
    pub fn detect(mrz: &NormalizedMrz) -> Result<Self, MrzError> {
        let rows = mrz.rows();
        let columns = rows.iter().map(String::len).max().unwrap_or(0);
        match (rows.len(), columns) {
            (3, 30) => Ok(Self::Td1),
            (2, 36) => Ok(Self::Td2),
            (2, 44) => Ok(Self::Td3),
            (rows, columns) => {
                error!("MRZ of {rows} rows by {columns} columns matches no layout");
                Err(MrzError::UnsupportedLayout { rows, columns })
            }
        }
    }
}

/// Cleans raw OCR text into a canonical MRZ.
///
/// Everything before the first document type letter is dropped, whitespace and
/// repeated line breaks are collapsed, glyphs OCR confuses with fillers are mapped
/// to fillers and any remaining character outside `[A-Z0-9<\n]` is removed. The
/// result is cut to the fixed width of its layout. Applying it to its own output
/// returns the output unchanged.
///
/// # Errors
///
/// * `MrzError::NotMrzLike` if no filler or no leading document type letter remains.
/// * `MrzError::WrongLineCount` unless there are exactly one or two line breaks.
///
/// # Example
///
/// ```
/// # use emrtd_verify::MrzError;
/// #
/// # fn main() -> Result<(), MrzError> {
/// use emrtd_verify::normalize;
///
/// let mrz = normalize("xx P«UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\n\
///                      L898902C<3UTO6908061F9406236ZE184226B<<<<<14 ")?;
/// assert!(mrz.as_str().starts_with("P<UTOERIKSSON"));
/// assert_eq!(mrz.as_str().len(), 89);
/// #
/// #     Ok(())
/// # }
/// ```
pub fn normalize(raw: &str) -> Result<NormalizedMrz, MrzError> {
    let mut result = clean(raw);
    // Dropping characters may bring new confusions next to each other
    loop {
        let next = clean(&result);
        if next == result {
            break;
        }
        result = next;
    }

    if !result.contains(FILLER) || !result.starts_with(DOCUMENT_TYPES) {
        error!("Text does not look like an MRZ: {}", result.replace('\n', "↩"));
        return Err(MrzError::NotMrzLike);
    }

    // Truncation can cut a line break, which lowers the limit for the next round
    loop {
        let limit = line_limit(&result)?;
        if result.len() <= limit {
            break;
        }
        trace!("Truncating MRZ of {} characters to {limit}", result.len());
        result.truncate(limit);
        result = result.trim().to_owned();
    }

    Ok(NormalizedMrz(result))
}

/// Longest payload allowed for the number of line breaks in `text`.
fn line_limit(text: &str) -> Result<usize, MrzError> {
    match line_breaks(text) {
        1 => Ok(TWO_LINE_MAX),
        2 => Ok(THREE_LINE_MAX),
        count => {
            error!("Invalid MRZ string, found {count} line breaks");
            Err(MrzError::WrongLineCount(count))
        }
    }
}

fn line_breaks(text: &str) -> usize {
    text.chars().filter(|&c| c == '\n').count()
}

fn clean(raw: &str) -> String {
    let start = raw.find(DOCUMENT_TYPES).unwrap_or(raw.len());
    let mut result = String::with_capacity(raw.len() - start);
    let mut previous_newline = false;
    for c in raw[start..].chars() {
        match c {
            ' ' | '\t' | '\r' => {}
            '\n' if previous_newline => {}
            '«' => {
                result.push(FILLER);
                previous_newline = false;
            }
            c => {
                result.push(c);
                previous_newline = c == '\n';
            }
        }
    }

    loop {
        let replaced = FILLER_CONFUSIONS
            .iter()
            .fold(result.clone(), |acc, pattern| acc.replace(pattern, "<<<"));
        if replaced == result {
            break;
        }
        result = replaced;
    }

    if result.starts_with("PK") || result.starts_with("PC") {
        result.replace_range(1..2, "<");
    }

    result
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == FILLER || *c == '\n')
        .collect::<String>()
        .trim()
        .to_owned()
}

/// Value of an MRZ character in the check digit calculation.
fn character_value(c: char) -> Option<u32> {
    match c {
        FILLER => Some(0),
        '0'..='9' => c.to_digit(10),
        'A'..='Z' => Some(u32::from(c) - u32::from('A') + 10),
        _ => None,
    }
}

/// Calculates the 7-3-1 weighted check digit of the given MRZ field.
///
/// # Errors
///
/// * `MrzError::InvalidCharacter` if the field contains a character outside `[A-Z0-9<]`.
///
/// # Example
///
/// ```
/// # use emrtd_verify::MrzError;
/// #
/// # fn main() -> Result<(), MrzError> {
/// use emrtd_verify::calculate_check_digit;
/// assert_eq!(calculate_check_digit("L898902C<")?, '3');
/// assert_eq!(calculate_check_digit("690806")?, '1');
/// #
/// #     Ok(())
/// # }
/// ```
pub fn calculate_check_digit(data: &str) -> Result<char, MrzError> {
    let weights = [7, 3, 1];
    let mut total = 0;

    for (counter, value) in data.chars().enumerate() {
        let Some(weighted_value) = character_value(value) else {
            error!("Can not calculate check digit for invalid character: `{value}`");
            return Err(MrzError::InvalidCharacter(value));
        };
        total += weights[counter % 3] * weighted_value;
    }

    char::from_digit(total % 10, 10).ok_or(MrzError::InvalidCharacter(FILLER))
}

/// Whether `digit` is the check digit of `data`. A filler check digit counts as `0`.
pub(crate) fn check_digit_holds(data: &str, digit: char, field: &str) -> bool {
    let printed = if digit == FILLER { '0' } else { digit };
    match calculate_check_digit(data) {
        Ok(expected) if expected == printed => true,
        Ok(expected) => {
            debug!("Check digit verification failed for {field}: expected {expected} but got {printed}");
            false
        }
        Err(_) => false,
    }
}

fn validate_field(name: &'static str, value: &str, len: core::ops::RangeInclusive<usize>) -> Result<(), MrzError> {
    if !len.contains(&value.len()) || value.chars().any(|c| character_value(c).is_none()) {
        error!("MRZ field {name} must be {len:?} MRZ characters long, received {value}");
        return Err(MrzError::InvalidField(name, value.to_owned()));
    }
    Ok(())
}

/// Document number, birth date and expiry date, the key material of BAC and PACE.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrzSeed {
    document_number: String,
    date_of_birth: String,
    date_of_expiry: String,
}

impl fmt::Debug for MrzSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MrzSeed").finish_non_exhaustive()
    }
}

impl MrzSeed {
    /// Builds the seed from the printed fields. Document numbers shorter than 9
    /// characters are padded with fillers.
    ///
    /// Document number can be up to 9 characters on TD3, up to 22 on TD1 and up
    /// to 14 on TD2 sized documents.
    ///
    /// # Errors
    ///
    /// * `MrzError::InvalidField` if a field has the wrong length or illegal characters.
    pub fn new(
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<Self, MrzError> {
        validate_field("document number", document_number, 1..=22)?;
        validate_field("date of birth", date_of_birth, 6..=6)?;
        validate_field("date of expiry", date_of_expiry, 6..=6)?;
        Ok(Self {
            document_number: format!("{document_number:<<9}"),
            date_of_birth: date_of_birth.to_owned(),
            date_of_expiry: date_of_expiry.to_owned(),
        })
    }

    #[must_use]
    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    #[must_use]
    pub fn date_of_birth(&self) -> &str {
        &self.date_of_birth
    }

    #[must_use]
    pub fn date_of_expiry(&self) -> &str {
        &self.date_of_expiry
    }

    /// The key string `docno + cd + dob + cd + exp + cd`.
    ///
    /// # Errors
    ///
    /// * `MrzError` if a field contains a character outside `[A-Z0-9<]`.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_verify::MrzError;
    /// #
    /// # fn main() -> Result<(), MrzError> {
    /// use emrtd_verify::MrzSeed;
    /// let seed = MrzSeed::new("L898902C3", "740812", "120415")?;
    /// assert_eq!(seed.mrz_key()?, "L898902C3674081221204159");
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn mrz_key(&self) -> Result<String, MrzError> {
        Ok(format!(
            "{}{}{}{}{}{}",
            self.document_number,
            calculate_check_digit(&self.document_number)?,
            self.date_of_birth,
            calculate_check_digit(&self.date_of_birth)?,
            self.date_of_expiry,
            calculate_check_digit(&self.date_of_expiry)?
        ))
    }
}

/// Debounce state of a scanning session: the last canonical MRZ whose check digits failed.
///
/// One instance can serve any number of consecutive scans.
#[derive(Debug, Clone, Default)]
pub struct MrzScanSession {
    last_rejected: Option<String>,
}

impl MrzScanSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes and parses one OCR frame.
    ///
    /// # Errors
    ///
    /// Any `MrzError`. `InvalidCheckDigits.repeated` is set when the previous
    /// rejection was for the same text.
    pub fn scan(&mut self, raw: &str) -> Result<MrzRecord, MrzError> {
        let normalized = normalize(raw)?;
        match MrzRecord::parse(&normalized) {
            Err(MrzError::InvalidCheckDigits { mrz, .. }) => {
                let repeated = self.last_rejected.as_deref() == Some(mrz.as_str());
                if repeated {
                    debug!("Same MRZ rejected again, still accepting scans");
                } else {
                    self.last_rejected = Some(mrz.clone());
                }
                Err(MrzError::InvalidCheckDigits { mrz, repeated })
            }
            other => other,
        }
    }

    #[must_use]
    pub fn last_rejected(&self) -> Option<&str> {
        self.last_rejected.as_deref()
    }
}

impl fmt::Display for MrzFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Td1 => "TD1",
            Self::Td2 => "TD2",
            Self::Td3 => "TD3",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECIMEN: &str = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                            L898902C<3UTO6908061F9406236ZE184226B<<<<<14";

    #[test]
    fn test_calculate_check_digit_valid_data() -> Result<(), MrzError> {
        assert_eq!(calculate_check_digit("D23145890")?, '7');
        assert_eq!(calculate_check_digit("340712")?, '7');
        assert_eq!(calculate_check_digit("950712")?, '2');
        assert_eq!(calculate_check_digit("L898902C<")?, '3');
        assert_eq!(calculate_check_digit("<<<<<<<<<")?, '0');
        Ok(())
    }

    #[test]
    fn test_calculate_check_digit_invalid_character() {
        let result = calculate_check_digit("L898902c<");
        assert!(result.is_err_and(|e| matches!(e, MrzError::InvalidCharacter('c'))));
    }

    #[test]
    fn test_filler_check_digit_counts_as_zero() {
        assert!(check_digit_holds("<<<<<<<<<", '<', "empty"));
        assert!(check_digit_holds("<<<<<<<<<", '0', "empty"));
        assert!(!check_digit_holds("L898902C<", '4', "document number"));
    }

    #[test]
    fn test_normalize_canonical_is_unchanged() -> Result<(), MrzError> {
        let mrz = normalize(SPECIMEN)?;
        assert_eq!(mrz.as_str(), SPECIMEN);
        assert_eq!(normalize(mrz.as_str())?, mrz);
        Ok(())
    }

    #[test]
    fn test_normalize_ocr_noise() -> Result<(), MrzError> {
        let raw = "  -- \r\n  P«UT0ERIKSSON<<ANNA<MARIA<<<<<<<<<<<c<<<<<<<\n\n\n\
                   L898902C<3UTO6908061F9406236ZE184226B<<<<<14 \t";
        let mrz = normalize(raw)?;
        assert_eq!(
            mrz.as_str(),
            "P<UT0ERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
             L898902C<3UTO6908061F9406236ZE184226B<<<<<14"
        );
        assert_eq!(normalize(mrz.as_str())?, mrz);
        Ok(())
    }

    #[test]
    fn test_normalize_is_idempotent_after_dropping_characters() -> Result<(), MrzError> {
        let raw = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<E!<<<\n\
                   L898902C<3UTO6908061F9406236ZE184226B<<<<<14";
        let once = normalize(raw)?;
        assert!(!once.as_str().contains("<E<"));
        assert_eq!(once.as_str().len(), 89);
        assert_eq!(normalize(once.as_str())?, once);
        Ok(())
    }

    #[test]
    fn test_normalize_pk_prefix() -> Result<(), MrzError> {
        let mrz = normalize("PKUTOERIKSSON<<ANNA\nL898902C<3")?;
        assert!(mrz.as_str().starts_with("P<UTO"));
        Ok(())
    }

    #[test]
    fn test_normalize_truncation_boundaries() -> Result<(), MrzError> {
        let exact = normalize(SPECIMEN)?;
        assert_eq!(exact.as_str().len(), 89);

        let longer = normalize(&format!("{SPECIMEN}7"))?;
        assert_eq!(longer.as_str().len(), 89);
        assert_eq!(longer, exact);

        let td1 = "I<UTOD231458907<<<<<<<<<<<<<<<\n\
                   7408122F1204159UTO<<<<<<<<<<<6\n\
                   ERIKSSON<<ANNA<MARIA<<<<<<<<<<XYZ";
        assert_eq!(normalize(td1)?.as_str().len(), 92);
        Ok(())
    }

    #[test]
    fn test_normalize_truncation_dropping_a_line_break() -> Result<(), MrzError> {
        let raw = format!("I<UTO{}\n{}\n{}", "<".repeat(45), "A".repeat(50), "B".repeat(30));
        let once = normalize(&raw)?;
        assert_eq!(once.as_str().matches('\n').count(), 1);
        assert!(once.as_str().len() <= 89);
        assert_eq!(normalize(once.as_str())?, once);

        // Cutting the only line break leaves no MRZ
        let single = format!("P<UTO{}\nL898", "<".repeat(95));
        assert!(normalize(&single).is_err_and(|e| e == MrzError::WrongLineCount(0)));
        Ok(())
    }

    #[test]
    fn test_deserialize_checks_the_text() -> Result<(), serde_json::Error> {
        let mrz: NormalizedMrz = serde_json::from_str(&serde_json::to_string(SPECIMEN)?)?;
        assert_eq!(mrz.as_str(), SPECIMEN);
        assert_eq!(serde_json::to_string(&mrz)?, serde_json::to_string(SPECIMEN)?);

        let accented = SPECIMEN.replacen("ERIK", "ÉRI", 1);
        assert_eq!(accented.len(), SPECIMEN.len());
        assert!(serde_json::from_str::<NormalizedMrz>(&serde_json::to_string(&accented)?).is_err());
        let noisy = format!("  {SPECIMEN}");
        assert!(serde_json::from_str::<NormalizedMrz>(&serde_json::to_string(&noisy)?).is_err());
        Ok(())
    }

    #[test]
    fn test_normalize_rejections() {
        assert!(normalize("P<UTOERIKSSON<<ANNA").is_err_and(|e| e == MrzError::WrongLineCount(0)));
        assert!(normalize("P<A\nB\nC\nD").is_err_and(|e| e == MrzError::WrongLineCount(3)));
        assert!(normalize("hello world\n").is_err_and(|e| e == MrzError::NotMrzLike));
        assert!(normalize("PASSPORT\nNUMBER").is_err_and(|e| e == MrzError::NotMrzLike));
        assert!(normalize("").is_err_and(|e| e == MrzError::NotMrzLike));
    }

    #[test]
    fn test_format_detection() -> Result<(), MrzError> {
        assert_eq!(MrzFormat::detect(&normalize(SPECIMEN)?)?, MrzFormat::Td3);

        // Short second row is padded to the first row's width
        let td2 = normalize("I<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<\nD231458907UTO7408122F1204159<<<<<<6")?;
        assert_eq!(MrzFormat::detect(&td2)?, MrzFormat::Td2);

        let td1 = NormalizedMrz::from_unbroken(
            "I<UTOD231458907<<<<<<<<<<<<<<<7408122F1204159UTO<<<<<<<<<<<6ERIKSSON<<ANNA<MARIA<<<<<<<<<<",
        )?;
        assert_eq!(MrzFormat::detect(&td1)?, MrzFormat::Td1);
        assert_eq!(td1.rows()[2], "ERIKSSON<<ANNA<MARIA<<<<<<<<<<");
        assert!(NormalizedMrz::from_unbroken("P<UTO").is_err());

        let odd = normalize("P<UTO<<<\nL898")?;
        assert!(MrzFormat::detect(&odd)
            .is_err_and(|e| e == MrzError::UnsupportedLayout { rows: 2, columns: 8 }));
        Ok(())
    }

    #[test]
    fn test_mrz_seed() -> Result<(), MrzError> {
        let seed = MrzSeed::new("L898902C", "690806", "940623")?;
        assert_eq!(seed.document_number(), "L898902C<");
        assert_eq!(seed.mrz_key()?, "L898902C<369080619406236");

        assert!(MrzSeed::new("L898902C", "6908", "940623")
            .is_err_and(|e| matches!(e, MrzError::InvalidField("date of birth", _))));
        assert!(MrzSeed::new("l898902c", "690806", "940623").is_err());
        assert!(MrzSeed::new("", "690806", "940623").is_err());
        assert!(!format!("{seed:?}").contains("L898902C"));
        Ok(())
    }

    #[test]
    fn test_scan_session_debounce() {
        let corrupted = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                         L898902C<4UTO6908062F9406237ZE184226B<<<<<15";
        let mut session = MrzScanSession::new();

        let first = session.scan(corrupted);
        assert!(first.is_err_and(|e| matches!(e, MrzError::InvalidCheckDigits { repeated: false, .. })));
        let second = session.scan(corrupted);
        assert!(second.is_err_and(|e| matches!(e, MrzError::InvalidCheckDigits { repeated: true, .. })));
        assert!(session.last_rejected().is_some());

        assert!(session.scan(SPECIMEN).is_ok());
    }
}
