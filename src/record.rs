//! Structured travel document records decoded from a normalized MRZ.

use crate::mrz::{check_digit_holds, MrzFormat, MrzSeed, NormalizedMrz, FILLER};
use crate::MrzError;
use alloc::{
    borrow::ToOwned,
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Kind of travel document, from the first two characters of the MRZ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentCode {
    Passport,
    TypeA,
    TypeC,
    TypeI,
    TypeV,
    CrewMember,
    Migrant,
}

impl DocumentCode {
    /// Classifies the two character document code.
    ///
    /// # Errors
    ///
    /// * `MrzError::InvalidField` for `IV` and for unknown type letters.
    pub fn parse(code: &str) -> Result<Self, MrzError> {
        match code {
            "IV" => {
                error!("Document code IV is not allowed");
                return Err(MrzError::InvalidField("document code", code.to_owned()));
            }
            "AC" => return Ok(Self::CrewMember),
            "ME" | "TD" => return Ok(Self::Migrant),
            "IP" => return Ok(Self::Passport),
            _ => {}
        }
        match code.chars().next() {
            Some('T' | 'P') => Ok(Self::Passport),
            Some('A') => Ok(Self::TypeA),
            Some('C') => Ok(Self::TypeC),
            Some('V') => Ok(Self::TypeV),
            Some('I') => Ok(Self::TypeI),
            Some('R') => Ok(Self::Migrant),
            _ => {
                error!("Unsupported document code: {code}");
                Err(MrzError::InvalidField("document code", code.to_owned()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Unspecified,
}

impl Sex {
    /// # Errors
    ///
    /// * `MrzError::InvalidField` for anything but `M`, `F`, `X` and `<`.
    pub fn parse(c: char) -> Result<Self, MrzError> {
        match c {
            'M' => Ok(Self::Male),
            'F' => Ok(Self::Female),
            'X' | FILLER => Ok(Self::Unspecified),
            other => {
                error!("Invalid sex marker: {other}");
                Err(MrzError::InvalidField("sex", other.to_string()))
            }
        }
    }

    #[must_use]
    pub fn as_char(self) -> char {
        match self {
            Self::Male => 'M',
            Self::Female => 'F',
            Self::Unspecified => 'X',
        }
    }
}

/// A `YYMMDD` date as printed in the MRZ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrzDate {
    raw: String,
    year: u8,
    month: u8,
    day: u8,
    valid: bool,
}

impl MrzDate {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let number = |range: core::ops::Range<usize>| {
            raw.get(range)
                .and_then(|s| s.parse::<u8>().ok())
                .unwrap_or(0)
        };
        let (year, month, day) = (number(0..2), number(2..4), number(4..6));
        let valid = raw.len() == 6
            && raw.chars().all(|c| c.is_ascii_digit())
            && (1..=12).contains(&month)
            && (1..=31).contains(&day);
        if !valid {
            debug!("Invalid MRZ date: {raw}");
        }
        Self {
            raw: raw.to_owned(),
            year,
            month,
            day,
            valid,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn year(&self) -> u8 {
        self.year
    }

    #[must_use]
    pub fn month(&self) -> u8 {
        self.month
    }

    #[must_use]
    pub fn day(&self) -> u8 {
        self.day
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl fmt::Display for MrzDate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Fields shared by every layout, with the outcome of the check digit verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrzFields {
    pub format: MrzFormat,
    pub code: DocumentCode,
    /// The two characters of the document code, fillers kept.
    pub raw_code: String,
    pub issuing_country: String,
    pub surname: String,
    pub given_names: String,
    /// Document number without fillers.
    pub document_number: String,
    /// Document number as used for the check digit and the access key.
    pub raw_document_number: String,
    pub nationality: String,
    pub date_of_birth: MrzDate,
    pub sex: Sex,
    pub date_of_expiry: MrzDate,
    pub valid_document_number: bool,
    pub valid_date_of_birth: bool,
    pub valid_expiration_date: bool,
    pub valid_composite: bool,
    /// The canonical MRZ this record was decoded from.
    pub mrz: String,
}

impl MrzFields {
    /// A record is usable if all individual check digits hold or the composite one does.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        (self.valid_document_number && self.valid_date_of_birth && self.valid_expiration_date)
            || self.valid_composite
    }
}

/// Machine readable passport (TD3) or TD2 sized document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrpRecord {
    pub fields: MrzFields,
    /// Personal number on TD3, optional data on TD2.
    pub optional_data: String,
    /// Check digit of the personal number. `None` on TD2 which has no such digit.
    pub valid_optional_data: Option<bool>,
}

/// TD1 sized identity card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Td1Record {
    pub fields: MrzFields,
    pub optional_data: String,
    pub optional_data_2: String,
}

/// Read access to the fields every record carries.
pub trait TravelDocumentRecord {
    fn fields(&self) -> &MrzFields;

    fn optional_data(&self) -> &str;

    /// The key material for BAC and PACE.
    ///
    /// # Errors
    ///
    /// * `MrzError::InvalidField` if a seed field is malformed.
    fn bac_seed(&self) -> Result<MrzSeed, MrzError> {
        let fields = self.fields();
        MrzSeed::new(
            &fields.raw_document_number,
            fields.date_of_birth.as_str(),
            fields.date_of_expiry.as_str(),
        )
    }
}

impl TravelDocumentRecord for MrpRecord {
    fn fields(&self) -> &MrzFields {
        &self.fields
    }

    fn optional_data(&self) -> &str {
        &self.optional_data
    }
}

impl TravelDocumentRecord for Td1Record {
    fn fields(&self) -> &MrzFields {
        &self.fields
    }

    fn optional_data(&self) -> &str {
        &self.optional_data
    }
}

/// A decoded and accepted MRZ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrzRecord {
    /// TD3 or TD2.
    Mrp(MrpRecord),
    Td1(Td1Record),
}

impl TravelDocumentRecord for MrzRecord {
    fn fields(&self) -> &MrzFields {
        match self {
            Self::Mrp(record) => record.fields(),
            Self::Td1(record) => record.fields(),
        }
    }

    fn optional_data(&self) -> &str {
        match self {
            Self::Mrp(record) => record.optional_data(),
            Self::Td1(record) => record.optional_data(),
        }
    }
}

impl MrzRecord {
    /// Detects the layout and decodes the MRZ.
    ///
    /// # Errors
    ///
    /// * `MrzError::UnsupportedLayout` if no layout has the dimensions of the MRZ.
    /// * `MrzError::InvalidCheckDigits` unless all of document number, birth date and
    ///   expiry date check digits hold, or the composite check digit holds.
    /// * `MrzError::InvalidField` for an unknown document code or sex.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_verify::MrzError;
    /// #
    /// # fn main() -> Result<(), MrzError> {
    /// use emrtd_verify::{normalize, MrzRecord, TravelDocumentRecord};
    ///
    /// let mrz = normalize("P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
    ///                      L898902C<3UTO6908061F9406236ZE184226B<<<<<14")?;
    /// let record = MrzRecord::parse(&mrz)?;
    /// assert_eq!(record.fields().surname, "ERIKSSON");
    /// assert_eq!(record.bac_seed()?.mrz_key()?, "L898902C<369080619406236");
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn parse(mrz: &NormalizedMrz) -> Result<Self, MrzError> {
        Self::parse_as(mrz, MrzFormat::detect(mrz)?)
    }

    /// Decodes the MRZ with the given layout.
    ///
    /// # Errors
    ///
    /// See [`MrzRecord::parse`].
    pub fn parse_as(mrz: &NormalizedMrz, format: MrzFormat) -> Result<Self, MrzError> {
        let rows = mrz.rows();
        if rows.len() != format.rows() || rows.iter().any(|row| row.len() != format.columns()) {
            let columns = rows.iter().map(String::len).max().unwrap_or(0);
            error!("MRZ does not fit the {format} layout");
            return Err(MrzError::UnsupportedLayout {
                rows: rows.len(),
                columns,
            });
        }

        let record = match format {
            MrzFormat::Td1 => Self::Td1(parse_td1(&rows, mrz)?),
            MrzFormat::Td2 | MrzFormat::Td3 => Self::Mrp(parse_mrp(&rows, mrz, format)?),
        };

        let fields = record.fields();
        if !fields.is_accepted() {
            error!(
                "Check digits failed: document number {}, date of birth {}, date of expiry {}, composite {}",
                fields.valid_document_number,
                fields.valid_date_of_birth,
                fields.valid_expiration_date,
                fields.valid_composite
            );
            return Err(MrzError::InvalidCheckDigits {
                mrz: mrz.as_str().to_owned(),
                repeated: false,
            });
        }
        info!("Accepted {format} MRZ of document {}", fields.document_number);
        Ok(record)
    }

    /// The key material for BAC and PACE.
    ///
    /// # Errors
    ///
    /// * `MrzError::InvalidField` if a seed field is malformed.
    pub fn bac_seed(&self) -> Result<MrzSeed, MrzError> {
        TravelDocumentRecord::bac_seed(self)
    }

    #[must_use]
    pub fn format(&self) -> MrzFormat {
        self.fields().format
    }
}

/// Digits OCR reads in place of letters, undone in fields that only hold letters.
fn correct_letters(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '0' => 'O',
            '1' => 'I',
            '8' => 'B',
            '5' => 'S',
            '2' => 'Z',
            '3' => 'J',
            other => other,
        })
        .collect()
}

/// Fillers become spaces, a double filler becomes `, `.
pub(crate) fn decode_string(value: &str) -> String {
    value
        .replace("<<", ", ")
        .replace(FILLER, " ")
        .trim()
        .trim_end_matches(',')
        .trim()
        .to_owned()
}

/// Splits the name field into primary and secondary identifiers.
fn decode_name(value: &str) -> (String, String) {
    let corrected = correct_letters(value.trim_end_matches(FILLER));
    let mut parts = corrected.splitn(2, "<<");
    match (parts.next(), parts.next()) {
        (Some(surname), Some(given_names)) => (decode_string(surname), decode_string(given_names)),
        (Some(only), None) => (String::new(), decode_string(only)),
        _ => (String::new(), String::new()),
    }
}

fn char_at(row: &str, index: usize) -> char {
    row.as_bytes().get(index).map_or(FILLER, |b| char::from(*b))
}

/// Inputs of the fields every layout shares.
struct CommonInput<'a> {
    format: MrzFormat,
    code: &'a str,
    issuing_country: &'a str,
    name: &'a str,
    document_number: &'a str,
    document_number_digit: char,
    nationality: &'a str,
    date_of_birth: &'a str,
    date_of_birth_digit: char,
    sex: char,
    date_of_expiry: &'a str,
    date_of_expiry_digit: char,
    composite: String,
    composite_digit: char,
}

fn common_fields(input: CommonInput<'_>, mrz: &NormalizedMrz) -> Result<MrzFields, MrzError> {
    let code = DocumentCode::parse(input.code)?;
    let sex = Sex::parse(input.sex)?;
    let (surname, given_names) = decode_name(input.name);
    let date_of_birth = MrzDate::parse(input.date_of_birth);
    let date_of_expiry = MrzDate::parse(input.date_of_expiry);

    let valid_document_number = check_digit_holds(
        input.document_number,
        input.document_number_digit,
        "document number",
    );
    let valid_date_of_birth = date_of_birth.is_valid()
        && check_digit_holds(input.date_of_birth, input.date_of_birth_digit, "date of birth");
    let valid_expiration_date = date_of_expiry.is_valid()
        && check_digit_holds(input.date_of_expiry, input.date_of_expiry_digit, "date of expiry");
    let valid_composite = check_digit_holds(&input.composite, input.composite_digit, "composite");

    Ok(MrzFields {
        format: input.format,
        code,
        raw_code: input.code.to_owned(),
        issuing_country: decode_string(&correct_letters(input.issuing_country)),
        surname,
        given_names,
        document_number: decode_string(input.document_number),
        raw_document_number: input.document_number.to_owned(),
        nationality: decode_string(&correct_letters(input.nationality)),
        date_of_birth,
        sex,
        date_of_expiry,
        valid_document_number,
        valid_date_of_birth,
        valid_expiration_date,
        valid_composite,
        mrz: mrz.as_str().to_owned(),
    })
}

fn parse_mrp(rows: &[String], mrz: &NormalizedMrz, format: MrzFormat) -> Result<MrpRecord, MrzError> {
    let (top, bottom) = (&rows[0], &rows[1]);
    let width = format.columns();
    // TD3 ends with the personal number and its check digit, TD2 with optional data
    let optional_end = width - 1 - usize::from(format == MrzFormat::Td3);
    let composite = format!(
        "{}{}{}",
        &bottom[0..10],
        &bottom[13..20],
        &bottom[21..width - 1]
    );

    let fields = common_fields(
        CommonInput {
            format,
            code: &top[0..2],
            issuing_country: &top[2..5],
            name: &top[5..width],
            document_number: &bottom[0..9],
            document_number_digit: char_at(bottom, 9),
            nationality: &bottom[10..13],
            date_of_birth: &bottom[13..19],
            date_of_birth_digit: char_at(bottom, 19),
            sex: char_at(bottom, 20),
            date_of_expiry: &bottom[21..27],
            date_of_expiry_digit: char_at(bottom, 27),
            composite,
            composite_digit: char_at(bottom, width - 1),
        },
        mrz,
    )?;

    let raw_optional = &bottom[28..optional_end];
    let valid_optional_data = (format == MrzFormat::Td3)
        .then(|| check_digit_holds(raw_optional, char_at(bottom, optional_end), "personal number"));

    Ok(MrpRecord {
        fields,
        optional_data: decode_string(raw_optional),
        valid_optional_data,
    })
}

fn parse_td1(rows: &[String], mrz: &NormalizedMrz) -> Result<Td1Record, MrzError> {
    let (top, middle, bottom) = (&rows[0], &rows[1], &rows[2]);

    // A filler check digit means the document number continues in the optional data,
    // ending with its check digit before the next filler
    let mut document_number = top[5..14].to_owned();
    let mut document_number_digit = char_at(top, 14);
    let mut optional_data = &top[15..30];
    if document_number_digit == FILLER {
        if let Some(end) = optional_data.find(FILLER).filter(|end| *end > 0) {
            document_number.push_str(&optional_data[..end - 1]);
            document_number_digit = char_at(optional_data, end - 1);
            optional_data = &optional_data[end..];
            debug!("Long document number of {} characters", document_number.len());
        }
    }

    let composite = format!("{}{}{}{}", &top[5..30], &middle[0..7], &middle[8..15], &middle[18..29]);
    let fields = common_fields(
        CommonInput {
            format: MrzFormat::Td1,
            code: &top[0..2],
            issuing_country: &top[2..5],
            name: bottom,
            document_number: &document_number,
            document_number_digit,
            nationality: &middle[15..18],
            date_of_birth: &middle[0..6],
            date_of_birth_digit: char_at(middle, 6),
            sex: char_at(middle, 7),
            date_of_expiry: &middle[8..14],
            date_of_expiry_digit: char_at(middle, 14),
            composite,
            composite_digit: char_at(middle, 29),
        },
        mrz,
    )?;

    Ok(Td1Record {
        fields,
        optional_data: decode_string(optional_data),
        optional_data_2: decode_string(&middle[18..29]),
    })
}

/// Splits a DG11 or DG12 style list on fillers, as ICAO encodes multiple values.
pub(crate) fn split_fillers(value: &str) -> Vec<String> {
    value
        .split(FILLER)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{normalize, MrzScanSession};

    const TD3: &str = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                       L898902C<3UTO6908061F9406236ZE184226B<<<<<14";
    const TD2: &str = "I<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<\n\
                       D231458907UTO7408122F1204159<<<<<<<6";
    const TD1: &str = "I<UTOD231458907<<<<<<<<<<<<<<<\n\
                       7408122F1204159UTO<<<<<<<<<<<6\n\
                       ERIKSSON<<ANNA<MARIA<<<<<<<<<<";

    #[test]
    fn test_parse_td3() -> Result<(), MrzError> {
        let record = MrzRecord::parse(&normalize(TD3)?)?;
        let MrzRecord::Mrp(ref mrp) = record else {
            panic!("expected a TD3 record");
        };
        let fields = record.fields();
        assert_eq!(fields.format, MrzFormat::Td3);
        assert_eq!(fields.code, DocumentCode::Passport);
        assert_eq!(fields.issuing_country, "UTO");
        assert_eq!(fields.surname, "ERIKSSON");
        assert_eq!(fields.given_names, "ANNA MARIA");
        assert_eq!(fields.document_number, "L898902C");
        assert_eq!(fields.raw_document_number, "L898902C<");
        assert_eq!(fields.nationality, "UTO");
        assert_eq!(fields.date_of_birth.as_str(), "690806");
        assert_eq!(fields.sex, Sex::Female);
        assert_eq!(fields.date_of_expiry.as_str(), "940623");
        assert!(fields.valid_document_number);
        assert!(fields.valid_date_of_birth);
        assert!(fields.valid_expiration_date);
        assert!(fields.valid_composite);
        assert_eq!(mrp.optional_data, "ZE184226B");
        assert_eq!(mrp.valid_optional_data, Some(true));
        assert_eq!(fields.mrz, TD3);

        assert_eq!(record.bac_seed()?.mrz_key()?, "L898902C<369080619406236");
        Ok(())
    }

    #[test]
    fn test_parse_corrects_confused_digits() -> Result<(), MrzError> {
        let raw = "P«UT0ERIKSS0N<<ANNA<MAR1A<<<<<<<<<<<<<<<<<<<\n\
                   L898902C<3UTO6908061F9406236ZE184226B<<<<<14";
        let record = MrzRecord::parse(&normalize(raw)?)?;
        let fields = record.fields();
        assert_eq!(fields.issuing_country, "UTO");
        assert_eq!(fields.surname, "ERIKSSON");
        assert_eq!(fields.given_names, "ANNA MARIA");
        // Numeric fields are left alone
        assert_eq!(fields.document_number, "L898902C");
        Ok(())
    }

    #[test]
    fn test_composite_alone_is_enough() -> Result<(), MrzError> {
        // Document number check digit is off by one, compensated inside the composite field
        let raw = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                   L898902C<4UTO6908061F9406236YE184226B<<<<<14";
        let record = MrzRecord::parse(&normalize(raw)?)?;
        let fields = record.fields();
        assert!(!fields.valid_document_number);
        assert!(fields.valid_date_of_birth);
        assert!(fields.valid_composite);
        assert!(fields.is_accepted());
        Ok(())
    }

    #[test]
    fn test_individual_digits_are_enough() -> Result<(), MrzError> {
        let raw = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                   L898902C<3UTO6908061F9406236ZE184226B<<<<<19";
        let record = MrzRecord::parse(&normalize(raw)?)?;
        assert!(!record.fields().valid_composite);
        assert!(record.fields().is_accepted());
        Ok(())
    }

    #[test]
    fn test_invalid_date_fails_its_flag() -> Result<(), MrzError> {
        let mut fields = MrzRecord::parse(&normalize(TD3)?)?.fields().clone();
        fields.valid_date_of_birth = MrzDate::parse("691306").is_valid();
        assert!(!fields.valid_date_of_birth);
        assert!(MrzDate::parse("690806").is_valid());
        assert!(!MrzDate::parse("690800").is_valid());
        assert!(!MrzDate::parse("69O806").is_valid());
        Ok(())
    }

    #[test]
    fn test_parse_td2() -> Result<(), MrzError> {
        let record = MrzRecord::parse(&normalize(TD2)?)?;
        let MrzRecord::Mrp(mrp) = record else {
            panic!("expected a TD2 record");
        };
        assert_eq!(mrp.fields.format, MrzFormat::Td2);
        assert_eq!(mrp.fields.code, DocumentCode::TypeI);
        assert_eq!(mrp.fields.document_number, "D23145890");
        assert_eq!(mrp.fields.date_of_birth.as_str(), "740812");
        assert_eq!(mrp.fields.date_of_expiry.as_str(), "120415");
        assert!(mrp.fields.valid_composite);
        assert_eq!(mrp.valid_optional_data, None);
        assert_eq!(mrp.optional_data, "");
        Ok(())
    }

    #[test]
    fn test_parse_td1() -> Result<(), MrzError> {
        let record = MrzRecord::parse(&normalize(TD1)?)?;
        let MrzRecord::Td1(ref td1) = record else {
            panic!("expected a TD1 record");
        };
        let fields = &td1.fields;
        assert_eq!(fields.surname, "ERIKSSON");
        assert_eq!(fields.given_names, "ANNA MARIA");
        assert_eq!(fields.document_number, "D23145890");
        assert_eq!(fields.nationality, "UTO");
        assert_eq!(fields.sex, Sex::Female);
        assert!(fields.valid_document_number);
        assert!(fields.valid_date_of_birth);
        assert!(fields.valid_expiration_date);
        assert!(fields.valid_composite);
        assert_eq!(record.bac_seed()?.mrz_key()?, "D23145890774081221204159");
        Ok(())
    }

    #[test]
    fn test_parse_td1_long_document_number() -> Result<(), MrzError> {
        let number = "D23145890AB";
        let digit = crate::calculate_check_digit(number)?;
        let top = format!("I<UTO{}<AB{digit}<<<<<<<<<<<<", &number[..9]);
        let middle_head = "7408122F1204159UTO<<<<<<<<<<<";
        let composite = format!("{}{}{}{}", &top[5..30], &middle_head[0..7], &middle_head[8..15], &middle_head[18..29]);
        let composite_digit = crate::calculate_check_digit(&composite)?;
        let raw = format!("{top}\n{middle_head}{composite_digit}\nERIKSSON<<ANNA<MARIA<<<<<<<<<<");

        let record = MrzRecord::parse(&normalize(&raw)?)?;
        let fields = record.fields();
        assert_eq!(fields.raw_document_number, number);
        assert!(fields.valid_document_number);
        assert!(fields.valid_composite);
        assert_eq!(record.optional_data(), "");
        assert_eq!(record.bac_seed()?.document_number(), number);
        Ok(())
    }

    #[test]
    fn test_rejects_bad_check_digits() -> Result<(), MrzError> {
        let raw = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\n\
                   L898902C<4UTO6908061F9406236ZE184226B<<<<<19";
        let result = MrzRecord::parse(&normalize(raw)?);
        assert!(result.is_err_and(|e| matches!(
            e,
            MrzError::InvalidCheckDigits { repeated: false, ref mrz } if mrz.as_str() == raw
        )));
        Ok(())
    }

    #[test]
    fn test_document_codes() {
        assert_eq!(DocumentCode::parse("P<"), Ok(DocumentCode::Passport));
        assert_eq!(DocumentCode::parse("IP"), Ok(DocumentCode::Passport));
        assert_eq!(DocumentCode::parse("AC"), Ok(DocumentCode::CrewMember));
        assert_eq!(DocumentCode::parse("TD"), Ok(DocumentCode::Migrant));
        assert_eq!(DocumentCode::parse("ID"), Ok(DocumentCode::TypeI));
        assert_eq!(DocumentCode::parse("V<"), Ok(DocumentCode::TypeV));
        assert!(DocumentCode::parse("IV").is_err());
        assert!(DocumentCode::parse("X<").is_err());
    }

    #[test]
    fn test_sex_and_names() {
        assert_eq!(Sex::parse('<'), Ok(Sex::Unspecified));
        assert_eq!(Sex::parse('M'), Ok(Sex::Male));
        assert!(Sex::parse('Q').is_err());

        assert_eq!(
            decode_name("SMITH<<JOHN<<JR<<<<"),
            (String::from("SMITH"), String::from("JOHN, JR"))
        );
        assert_eq!(decode_name("MADONNA<<<<<"), (String::new(), String::from("MADONNA")));
        assert_eq!(split_fillers("ANNA<<MARIA<"), ["ANNA", "MARIA"]);
    }

    #[test]
    fn test_round_trip_through_scan_session() -> Result<(), MrzError> {
        let mut session = MrzScanSession::new();
        let record = session.scan(&format!("garbage\n{TD3}<<<<"))?;
        let seed = record.bac_seed()?;
        assert_eq!(seed.document_number(), "L898902C<");
        assert_eq!(seed.date_of_birth(), "690806");
        assert_eq!(seed.date_of_expiry(), "940623");
        Ok(())
    }
}
