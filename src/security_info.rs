//! `SecurityInfos` of EF.CardAccess and EF.DG14.
//!
//! Structures are described in ICAO Doc 9303-11 Section 9.2 and BSI TR-03110-3 Appendix A.

use crate::{
    asn1::{der_uint, next_tlv, next_tlv_raw, oid_to_string, unwrap_file},
    comms::PaceMapping,
    crypto::EncryptionAlgorithm,
    EmrtdError,
};
use alloc::{borrow::ToOwned, string::String, vec::Vec};
use serde::Serialize;
use tracing::{debug, error, warn};

const ID_PACE: &str = "0.4.0.127.0.7.2.2.4";
const ID_CA: &str = "0.4.0.127.0.7.2.2.3";
const ID_PK: &str = "0.4.0.127.0.7.2.2.1";
const ID_TA: &str = "0.4.0.127.0.7.2.2.2";
/// `id-icao-mrtd-security-aaProtocolObject`
const ID_AA: &str = "2.23.136.1.1.5";

/// Key agreement family of a PACE or Chip Authentication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyAgreement {
    Dh,
    Ecdh,
}

/// Splits `prefix.family.cipher` protocol identifiers into their two last arcs.
fn protocol_arcs(protocol: &str, prefix: &str) -> Option<(u32, u32)> {
    let rest = protocol.strip_prefix(prefix)?.strip_prefix('.')?;
    let mut arcs = rest.split('.').map(str::parse::<u32>);
    match (arcs.next(), arcs.next(), arcs.next()) {
        (Some(Ok(family)), Some(Ok(cipher)), None) => Some((family, cipher)),
        _ => None,
    }
}

fn cipher_from_arc(arc: u32) -> Option<EncryptionAlgorithm> {
    match arc {
        1 => Some(EncryptionAlgorithm::DES3),
        2 => Some(EncryptionAlgorithm::AES128),
        3 => Some(EncryptionAlgorithm::AES192),
        4 => Some(EncryptionAlgorithm::AES256),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaceInfo {
    pub protocol: String,
    pub version: u64,
    /// Standardized domain parameter identifier.
    pub parameter_id: Option<u64>,
}

impl PaceInfo {
    #[must_use]
    pub fn mapping(&self) -> Option<PaceMapping> {
        match protocol_arcs(&self.protocol, ID_PACE)?.0 {
            1 | 2 => Some(PaceMapping::Generic),
            3 | 4 => Some(PaceMapping::Integrated),
            6 => Some(PaceMapping::ChipAuthentication),
            _ => None,
        }
    }

    #[must_use]
    pub fn key_agreement(&self) -> Option<KeyAgreement> {
        match protocol_arcs(&self.protocol, ID_PACE)?.0 {
            1 | 3 => Some(KeyAgreement::Dh),
            2 | 4 | 6 => Some(KeyAgreement::Ecdh),
            _ => None,
        }
    }

    #[must_use]
    pub fn cipher(&self) -> Option<EncryptionAlgorithm> {
        cipher_from_arc(protocol_arcs(&self.protocol, ID_PACE)?.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChipAuthenticationInfo {
    pub protocol: String,
    pub version: u64,
    pub key_id: Option<u64>,
}

impl ChipAuthenticationInfo {
    #[must_use]
    pub fn key_agreement(&self) -> Option<KeyAgreement> {
        match protocol_arcs(&self.protocol, ID_CA)?.0 {
            1 => Some(KeyAgreement::Dh),
            2 => Some(KeyAgreement::Ecdh),
            _ => None,
        }
    }

    #[must_use]
    pub fn cipher(&self) -> Option<EncryptionAlgorithm> {
        cipher_from_arc(protocol_arcs(&self.protocol, ID_CA)?.1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChipAuthenticationPublicKeyInfo {
    pub protocol: String,
    /// DER encoded `SubjectPublicKeyInfo`.
    pub subject_public_key_info: Vec<u8>,
    pub key_id: Option<u64>,
}

impl ChipAuthenticationPublicKeyInfo {
    #[must_use]
    pub fn key_agreement(&self) -> Option<KeyAgreement> {
        match self.protocol.strip_prefix(ID_PK)? {
            ".1" => Some(KeyAgreement::Dh),
            ".2" => Some(KeyAgreement::Ecdh),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalAuthenticationInfo {
    pub protocol: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAuthenticationInfo {
    pub protocol: String,
    pub version: u64,
    pub signature_algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SecurityInfo {
    Pace(PaceInfo),
    ChipAuthentication(ChipAuthenticationInfo),
    ChipAuthenticationPublicKey(ChipAuthenticationPublicKeyInfo),
    TerminalAuthentication(TerminalAuthenticationInfo),
    ActiveAuthentication(ActiveAuthenticationInfo),
    /// Anything else, for example PACE domain parameter infos, kept with its encoding.
    Unknown { protocol: String, raw: Vec<u8> },
}

/// Decoded `SecurityInfos ::= SET OF SecurityInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SecurityInfos(Vec<SecurityInfo>);

impl SecurityInfos {
    /// Parses EF.CardAccess, a bare `SecurityInfos` set.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the file is not a well formed set.
    pub fn from_card_access(data: &[u8]) -> Result<Self, EmrtdError> {
        Self::parse_set(unwrap_file(data, &[0x31], "EF.CardAccess")?)
    }

    /// Parses EF.DG14, `SecurityInfos` wrapped in application tag `6E`.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the file is not a well formed set.
    pub fn from_dg14(data: &[u8]) -> Result<Self, EmrtdError> {
        let set = unwrap_file(data, &[0x6E], "EF.DG14")?;
        Self::parse_set(unwrap_file(set, &[0x31], "EF.DG14")?)
    }

    fn parse_set(content: &[u8]) -> Result<Self, EmrtdError> {
        let mut infos = Vec::new();
        let mut rest = content;
        while !rest.is_empty() {
            let (tag, value, raw, next) = next_tlv_raw(rest)?;
            rest = next;
            if tag != 0x30 {
                error!("SecurityInfo must be a SEQUENCE, found tag {tag:02X}");
                return Err(EmrtdError::InvalidFileStructure("SecurityInfo"));
            }
            infos.push(parse_security_info(value, raw)?);
        }
        debug!("Parsed {} SecurityInfo entries", infos.len());
        Ok(Self(infos))
    }

    #[must_use]
    pub fn iter(&self) -> core::slice::Iter<'_, SecurityInfo> {
        self.0.iter()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pace_infos(&self) -> impl Iterator<Item = &PaceInfo> {
        self.0.iter().filter_map(|info| match info {
            SecurityInfo::Pace(pace) => Some(pace),
            _ => None,
        })
    }

    pub fn chip_authentication_infos(&self) -> impl Iterator<Item = &ChipAuthenticationInfo> {
        self.0.iter().filter_map(|info| match info {
            SecurityInfo::ChipAuthentication(ca) => Some(ca),
            _ => None,
        })
    }

    pub fn chip_authentication_public_keys(
        &self,
    ) -> impl Iterator<Item = &ChipAuthenticationPublicKeyInfo> {
        self.0.iter().filter_map(|info| match info {
            SecurityInfo::ChipAuthenticationPublicKey(pk) => Some(pk),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_terminal_authentication(&self) -> bool {
        self.0
            .iter()
            .any(|info| matches!(info, SecurityInfo::TerminalAuthentication(_)))
    }

    #[must_use]
    pub fn active_authentication(&self) -> Option<&ActiveAuthenticationInfo> {
        self.0.iter().find_map(|info| match info {
            SecurityInfo::ActiveAuthentication(aa) => Some(aa),
            _ => None,
        })
    }
}

fn read_oid(data: &[u8]) -> Result<(String, &[u8]), EmrtdError> {
    let (tag, value, rest) = next_tlv(data)?;
    if tag != 0x06 {
        error!("Expected an OBJECT IDENTIFIER, found tag {tag:02X}");
        return Err(EmrtdError::InvalidOidError());
    }
    Ok((oid_to_string(value), rest))
}

fn read_integer(data: &[u8]) -> Result<(u64, &[u8]), EmrtdError> {
    let (tag, value, rest) = next_tlv(data)?;
    if tag != 0x02 {
        error!("Expected an INTEGER, found tag {tag:02X}");
        return Err(EmrtdError::InvalidFileStructure("SecurityInfo"));
    }
    Ok((der_uint(value)?, rest))
}

/// Reads a trailing optional INTEGER, ignoring anything that is not one.
fn optional_integer(data: &[u8]) -> Result<Option<u64>, EmrtdError> {
    if data.first() == Some(&0x02) {
        return read_integer(data).map(|(value, _)| Some(value));
    }
    Ok(None)
}

fn parse_security_info(value: &[u8], raw: &[u8]) -> Result<SecurityInfo, EmrtdError> {
    let (protocol, rest) = read_oid(value)?;

    if protocol_arcs(&protocol, ID_PACE).is_some() {
        let (version, rest) = read_integer(rest)?;
        return Ok(SecurityInfo::Pace(PaceInfo {
            protocol,
            version,
            parameter_id: optional_integer(rest)?,
        }));
    }
    if protocol_arcs(&protocol, ID_CA).is_some() {
        let (version, rest) = read_integer(rest)?;
        return Ok(SecurityInfo::ChipAuthentication(ChipAuthenticationInfo {
            protocol,
            version,
            key_id: optional_integer(rest)?,
        }));
    }
    if protocol == format_arc(ID_PK, 1) || protocol == format_arc(ID_PK, 2) {
        let (tag, _, spki, rest) = next_tlv_raw(rest)?;
        if tag != 0x30 {
            error!("ChipAuthenticationPublicKeyInfo key is not a SubjectPublicKeyInfo");
            return Err(EmrtdError::InvalidFileStructure("ChipAuthenticationPublicKeyInfo"));
        }
        return Ok(SecurityInfo::ChipAuthenticationPublicKey(
            ChipAuthenticationPublicKeyInfo {
                protocol,
                subject_public_key_info: spki.to_vec(),
                key_id: optional_integer(rest)?,
            },
        ));
    }
    if protocol == ID_TA {
        let (version, _) = read_integer(rest)?;
        return Ok(SecurityInfo::TerminalAuthentication(
            TerminalAuthenticationInfo { protocol, version },
        ));
    }
    if protocol == ID_AA {
        let (version, rest) = read_integer(rest)?;
        let (signature_algorithm, _) = read_oid(rest)?;
        return Ok(SecurityInfo::ActiveAuthentication(ActiveAuthenticationInfo {
            protocol,
            version,
            signature_algorithm,
        }));
    }

    warn!("Keeping unknown SecurityInfo {protocol}");
    Ok(SecurityInfo::Unknown {
        protocol,
        raw: raw.to_owned(),
    })
}

fn format_arc(prefix: &str, arc: u32) -> String {
    alloc::format!("{prefix}.{arc}")
}
