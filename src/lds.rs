//! Elementary files of the Logical Data Structure and reading them over the channel.
//!
//! ICAO Doc 9303-10 Section 4
//! <https://www.icao.int/publications/Documents/9303_p10_cons_en.pdf>

use crate::{
    apdu::EmrtdCard,
    asn1::{unwrap_file, TlvIter},
    comms::{EmrtdComms, SecureChannelState},
    mrz::NormalizedMrz,
    record::MrzRecord,
    CardServiceError, ChipError, EmrtdError,
};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    format,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{error, info, trace, warn};

/// Files of the eMRTD application plus EF.CardAccess of the master file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataGroupId {
    CardAccess,
    Com,
    Sod,
    Dg1,
    Dg2,
    Dg3,
    Dg4,
    Dg5,
    Dg6,
    Dg7,
    Dg8,
    Dg9,
    Dg10,
    Dg11,
    Dg12,
    Dg13,
    Dg14,
    Dg15,
    Dg16,
}

const NUMBERED: [DataGroupId; 16] = [
    DataGroupId::Dg1,
    DataGroupId::Dg2,
    DataGroupId::Dg3,
    DataGroupId::Dg4,
    DataGroupId::Dg5,
    DataGroupId::Dg6,
    DataGroupId::Dg7,
    DataGroupId::Dg8,
    DataGroupId::Dg9,
    DataGroupId::Dg10,
    DataGroupId::Dg11,
    DataGroupId::Dg12,
    DataGroupId::Dg13,
    DataGroupId::Dg14,
    DataGroupId::Dg15,
    DataGroupId::Dg16,
];

// Outer tags of DG1 to DG16, in order
const DG_TAGS: [u8; 16] = [
    0x61, 0x75, 0x63, 0x76, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F, 0x70,
];

impl DataGroupId {
    /// Data group number, `None` for EF.CardAccess, EF.COM and EF.SOD.
    #[must_use]
    pub fn number(self) -> Option<u8> {
        NUMBERED
            .iter()
            .position(|&id| id == self)
            .and_then(|i| u8::try_from(i + 1).ok())
    }

    #[must_use]
    pub fn from_number(number: u8) -> Option<Self> {
        NUMBERED.get(usize::from(number).checked_sub(1)?).copied()
    }

    /// Short EF identifier used with SELECT.
    #[must_use]
    pub fn fid(self) -> [u8; 2] {
        match self {
            Self::CardAccess => [0x01, 0x1C],
            Self::Com => [0x01, 0x1E],
            Self::Sod => [0x01, 0x1D],
            _ => [0x01, self.number().unwrap_or(0)],
        }
    }

    /// Outer tag of the file. EF.CardAccess is a bare `SET`.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::CardAccess => 0x31,
            Self::Com => 0x60,
            Self::Sod => 0x77,
            _ => self
                .number()
                .map_or(0x00, |n| DG_TAGS[usize::from(n - 1)]),
        }
    }

    /// Data group announced by a tag of the EF.COM tag list.
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        DG_TAGS
            .iter()
            .position(|&t| t == tag)
            .map(|i| NUMBERED[i])
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::CardAccess => "EF.CardAccess",
            Self::Com => "EF.COM",
            Self::Sod => "EF.SOD",
            Self::Dg1 => "EF.DG1",
            Self::Dg2 => "EF.DG2",
            Self::Dg3 => "EF.DG3",
            Self::Dg4 => "EF.DG4",
            Self::Dg5 => "EF.DG5",
            Self::Dg6 => "EF.DG6",
            Self::Dg7 => "EF.DG7",
            Self::Dg8 => "EF.DG8",
            Self::Dg9 => "EF.DG9",
            Self::Dg10 => "EF.DG10",
            Self::Dg11 => "EF.DG11",
            Self::Dg12 => "EF.DG12",
            Self::Dg13 => "EF.DG13",
            Self::Dg14 => "EF.DG14",
            Self::Dg15 => "EF.DG15",
            Self::Dg16 => "EF.DG16",
        }
    }
}

impl fmt::Display for DataGroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw files read from the chip. A file is present, absent, or was not attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataGroupSet {
    present: BTreeMap<DataGroupId, Vec<u8>>,
    absent: BTreeSet<DataGroupId>,
}

impl DataGroupSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a file, replacing an earlier read of the same file.
    pub fn insert(&mut self, id: DataGroupId, data: Vec<u8>) {
        self.absent.remove(&id);
        self.present.insert(id, data);
    }

    pub fn mark_absent(&mut self, id: DataGroupId) {
        if !self.present.contains_key(&id) {
            self.absent.insert(id);
        }
    }

    #[must_use]
    pub fn get(&self, id: DataGroupId) -> Option<&[u8]> {
        self.present.get(&id).map(Vec::as_slice)
    }

    #[must_use]
    pub fn contains(&self, id: DataGroupId) -> bool {
        self.present.contains_key(&id)
    }

    #[must_use]
    pub fn is_absent(&self, id: DataGroupId) -> bool {
        self.absent.contains(&id)
    }

    pub fn present(&self) -> impl Iterator<Item = (DataGroupId, &[u8])> {
        self.present.iter().map(|(id, data)| (*id, data.as_slice()))
    }

    pub fn absent(&self) -> impl Iterator<Item = DataGroupId> + '_ {
        self.absent.iter().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

/// Reads files once an access protocol has opened the chip.
pub struct DataGroupReader<'a, C: EmrtdCard, R: RngCore + CryptoRng + Default> {
    comms: &'a mut EmrtdComms<C, R>,
}

impl<'a, C: EmrtdCard, R: RngCore + CryptoRng + Default> DataGroupReader<'a, C, R> {
    pub fn new(comms: &'a mut EmrtdComms<C, R>) -> Self {
        Self { comms }
    }

    /// Reads one file and checks its outer tag.
    ///
    /// # Errors
    ///
    /// * `ChipError::NotEstablished` before BAC or PACE succeeded.
    /// * `ChipError::CardService` if the file is missing, protected or malformed.
    pub fn read_group(&mut self, id: DataGroupId) -> Result<Vec<u8>, ChipError> {
        if matches!(self.comms.state(), SecureChannelState::Unestablished) {
            error!("Refusing to read {id} before an access protocol succeeded");
            return Err(ChipError::NotEstablished);
        }
        let data = self.comms.read_ef(&id.fid(), id.name())?;
        if data.first() != Some(&id.tag()) {
            error!("{id} starts with {:02X?} instead of {:02X}", data.first(), id.tag());
            return Err(EmrtdError::InvalidFileStructure(id.name()).into());
        }
        trace!("Read {} bytes of {id}", data.len());
        Ok(data)
    }

    /// Reads one file into `set`. A missing or unreadable file is recorded as absent.
    ///
    /// Returns whether the file was read.
    ///
    /// # Errors
    ///
    /// * `ChipError::NotEstablished` before BAC or PACE succeeded.
    /// * `ChipError::CardService` with a transport failure, after which no further
    ///   read can succeed.
    pub fn read_into(&mut self, id: DataGroupId, set: &mut DataGroupSet) -> Result<bool, ChipError> {
        match self.read_group(id) {
            Ok(data) => {
                info!("{id} read");
                set.insert(id, data);
                Ok(true)
            }
            Err(e @ (ChipError::NotEstablished | ChipError::CardService(CardServiceError::Transport(_)))) => {
                Err(e)
            }
            Err(e) => {
                warn!("{id} is not available: {e}");
                set.mark_absent(id);
                Ok(false)
            }
        }
    }
}

/// Decoded EF.COM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EfCom {
    /// LDS version as `major.minor`.
    pub lds_version: String,
    /// Unicode version as `major.minor.release`.
    pub unicode_version: String,
    pub data_groups: Vec<DataGroupId>,
}

impl EfCom {
    /// # Errors
    ///
    /// * `EmrtdError` if the file is not an EF.COM or the tag list is missing.
    pub fn parse(ef_com: &[u8]) -> Result<Self, EmrtdError> {
        let content = unwrap_file(ef_com, &[0x60], "EF.COM")?;
        let mut lds_version = String::new();
        let mut unicode_version = String::new();
        let mut data_groups = None;
        for tlv in TlvIter::new(content) {
            let (tag, value) = tlv?;
            match tag {
                0x5F01 => lds_version = dotted_version(value, 2),
                0x5F36 => unicode_version = dotted_version(value, 2),
                0x5C => {
                    data_groups = Some(
                        value
                            .iter()
                            .filter_map(|&t| {
                                let id = DataGroupId::from_tag(t);
                                if id.is_none() {
                                    warn!("EF.COM lists unknown tag {t:02X}");
                                }
                                id
                            })
                            .collect(),
                    );
                }
                other => trace!("Skipping tag {other:04X} of EF.COM"),
            }
        }
        let Some(data_groups) = data_groups else {
            error!("EF.COM has no tag list");
            return Err(EmrtdError::InvalidFileStructure("EF.COM"));
        };
        Ok(Self {
            lds_version,
            unicode_version,
            data_groups,
        })
    }

    #[must_use]
    pub fn lists(&self, id: DataGroupId) -> bool {
        self.data_groups.contains(&id)
    }
}

/// "0106" becomes "1.6" and "040000" becomes "4.0.0".
fn dotted_version(value: &[u8], width: usize) -> String {
    value
        .chunks(width)
        .map(|part| {
            let digits = String::from_utf8_lossy(part);
            digits
                .trim_start_matches('0')
                .parse::<u32>()
                .map_or_else(|_| String::from("0"), |n| n.to_string())
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Decodes the MRZ held in DG1.
///
/// # Errors
///
/// * `EmrtdError` if the file is malformed or the MRZ does not parse.
pub fn parse_dg1(dg1: &[u8]) -> Result<MrzRecord, EmrtdError> {
    let content = unwrap_file(dg1, &[0x61], "EF.DG1")?;
    let Some(Ok((0x5F1F, mrz))) = TlvIter::new(content).next() else {
        error!("EF.DG1 does not hold an MRZ data object");
        return Err(EmrtdError::InvalidFileStructure("EF.DG1"));
    };
    let text = core::str::from_utf8(mrz).map_err(|e| {
        error!("EF.DG1 MRZ is not ASCII: {e}");
        EmrtdError::ParseDataError(format!("EF.DG1 MRZ is not ASCII: {e}"))
    })?;
    NormalizedMrz::from_unbroken(text)
        .and_then(|mrz| MrzRecord::parse(&mrz))
        .map_err(|e| {
            error!("EF.DG1 MRZ is invalid: {e}");
            EmrtdError::ParseDataError(format!("EF.DG1 MRZ is invalid: {e}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        asn1::encode_tlv,
        testing::{MockRng, ScriptedCard},
        TravelDocumentRecord,
    };
    use hex_literal::hex;

    const TD3_UNBROKEN: &str = "P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<\
                                L898902C<3UTO6908061F9406236ZE184226B<<<<<14";

    #[test]
    fn test_data_group_ids() {
        assert_eq!(DataGroupId::Dg1.fid(), [0x01, 0x01]);
        assert_eq!(DataGroupId::Dg14.fid(), [0x01, 0x0E]);
        assert_eq!(DataGroupId::Sod.fid(), [0x01, 0x1D]);
        assert_eq!(DataGroupId::Dg2.tag(), 0x75);
        assert_eq!(DataGroupId::Dg15.tag(), 0x6F);
        assert_eq!(DataGroupId::from_tag(0x6E), Some(DataGroupId::Dg14));
        assert_eq!(DataGroupId::from_tag(0x77), None);
        assert_eq!(DataGroupId::from_number(11), Some(DataGroupId::Dg11));
        assert_eq!(DataGroupId::from_number(0), None);
        assert_eq!(DataGroupId::from_number(17), None);
        assert_eq!(DataGroupId::Com.number(), None);
    }

    #[test]
    fn test_parse_ef_com() -> Result<(), EmrtdError> {
        // ICAO Doc 9303-11 Appendix D.4
        let ef_com = EfCom::parse(&hex!("60145F0104303130365F36063034303030305C026175"))?;
        assert_eq!(ef_com.lds_version, "1.6");
        assert_eq!(ef_com.unicode_version, "4.0.0");
        assert_eq!(ef_com.data_groups, vec![DataGroupId::Dg1, DataGroupId::Dg2]);
        assert!(ef_com.lists(DataGroupId::Dg2));
        assert!(!ef_com.lists(DataGroupId::Dg15));

        assert!(EfCom::parse(&hex!("60085F0104303130365F")).is_err());
        assert!(EfCom::parse(&hex!("61065F01043031")).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_dg1() -> Result<(), EmrtdError> {
        let dg1 = encode_tlv(&[0x61], &encode_tlv(&[0x5F, 0x1F], TD3_UNBROKEN.as_bytes()));
        let record = parse_dg1(&dg1)?;
        assert_eq!(record.fields().surname, "ERIKSSON");
        assert_eq!(record.fields().document_number, "L898902C");

        let short = encode_tlv(&[0x61], &encode_tlv(&[0x5F, 0x1F], &TD3_UNBROKEN.as_bytes()[..80]));
        assert!(parse_dg1(&short).is_err());
        Ok(())
    }

    #[test]
    fn test_reader_refuses_before_access_control() {
        let card = ScriptedCard::new(vec![]);
        let log = card.log();
        let mut comms = EmrtdComms::<ScriptedCard, MockRng>::new(card);
        let mut set = DataGroupSet::new();

        let result = DataGroupReader::new(&mut comms).read_into(DataGroupId::Dg1, &mut set);
        assert!(result.is_err_and(|e| matches!(e, ChipError::NotEstablished)));
        assert!(log.borrow().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_missing_group_is_recorded_as_absent() -> Result<(), ChipError> {
        let card = ScriptedCard::new(vec![
            (hex!("00A4020C020103").to_vec(), hex!("6A82").to_vec()),
            (hex!("00A4020C02011E").to_vec(), hex!("9000").to_vec()),
            (hex!("00B0000004").to_vec(), hex!("60145F01 9000").to_vec()),
            (
                hex!("00B0000412").to_vec(),
                hex!("04303130365F36063034303030305C026175 9000").to_vec(),
            ),
        ]);
        let mut comms = EmrtdComms::<ScriptedCard, MockRng>::new(card);
        comms.transition(SecureChannelState::Unprotected)?;
        let mut set = DataGroupSet::new();

        let mut reader = DataGroupReader::new(&mut comms);
        assert!(!reader.read_into(DataGroupId::Dg3, &mut set)?);
        assert!(reader.read_into(DataGroupId::Com, &mut set)?);

        assert!(set.is_absent(DataGroupId::Dg3));
        assert!(set.contains(DataGroupId::Com));
        assert_eq!(set.absent().collect::<Vec<_>>(), vec![DataGroupId::Dg3]);

        // A card that went away stops the read phase
        assert!(reader
            .read_into(DataGroupId::Dg1, &mut set)
            .is_err_and(|e| e.is_retryable()));
        Ok(())
    }

    #[test]
    fn test_wrong_outer_tag_is_absent() -> Result<(), ChipError> {
        let card = ScriptedCard::new(vec![
            (hex!("00A4020C020101").to_vec(), hex!("9000").to_vec()),
            (hex!("00B0000004").to_vec(), hex!("75020102 9000").to_vec()),
        ]);
        let mut comms = EmrtdComms::<ScriptedCard, MockRng>::new(card);
        comms.transition(SecureChannelState::Unprotected)?;
        let mut set = DataGroupSet::new();

        assert!(!DataGroupReader::new(&mut comms).read_into(DataGroupId::Dg1, &mut set)?);
        assert!(set.is_absent(DataGroupId::Dg1));
        Ok(())
    }
}
