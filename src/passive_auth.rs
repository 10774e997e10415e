//! Passive Authentication of the data groups against EF.SOD.
//!
//! ICAO Doc 9303-11 Section 5.1 and ICAO Doc 9303-10 Section 4.6.2
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
//!
//! The hash table, the document signer and the certificate path are checked
//! independently, each ending up in its own verdict.

use crate::{
    asn1::{lds_security_object::LDSSecurityObject, unwrap_file},
    cms::{name_to_string, oid_string, within_validity, SignedContent},
    crypto::oid2digestalg,
    lds::{DataGroupId, DataGroupSet},
    status::{CheckResult, HashCheck, PassiveAuthReport, VerificationStatus},
    trust_store::TrustStore,
    EmrtdError,
};
use alloc::{format, string::ToString, vec::Vec};
use constant_time_eq::constant_time_eq;
use openssl::{
    hash::{hash, MessageDigest},
    x509::X509,
};
use rasn::{der, types::Oid};
use tracing::{error, info, warn};

const ID_ICAO_LDS_SECURITY_OBJECT: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 1]);

/// EF.SOD with its decoded `LDSSecurityObject`.
pub struct SecurityObject {
    signed: SignedContent,
    lds: LDSSecurityObject,
    digest: MessageDigest,
}

impl SecurityObject {
    /// # Errors
    ///
    /// `EmrtdError` if EF.SOD does not follow ICAO Doc 9303-10 Section 4.6.2.
    pub fn parse(ef_sod: &[u8]) -> Result<Self, EmrtdError> {
        let content = unwrap_file(ef_sod, &[0x77], "EF.SOD")?;
        let signed = SignedContent::parse(content, ID_ICAO_LDS_SECURITY_OBJECT, "EF.SOD")?;

        let lds = der::decode::<LDSSecurityObject>(&signed.content).map_err(EmrtdError::RasnDecodeError)?;
        // LDSSecurityObject has two versions, it is defined by ICAO Doc 9303-10
        if lds.version.eq(&rasn::types::Integer::from(0)) {
            if lds.lds_version_info.is_some() {
                error!("EF.SOD LDSSecurityObjectVersion is V0, but ldsVersionInfo is present");
                return Err(EmrtdError::InvalidFileStructure(
                    "EF.SOD LDSSecurityObjectVersion is V0, but ldsVersionInfo is present",
                ));
            }
        } else if lds.version.eq(&rasn::types::Integer::from(1)) {
            if lds.lds_version_info.is_none() {
                error!("EF.SOD LDSSecurityObjectVersion is V1, but ldsVersionInfo is not present");
                return Err(EmrtdError::InvalidFileStructure(
                    "EF.SOD LDSSecurityObjectVersion is V1, but ldsVersionInfo is not present",
                ));
            }
        } else {
            error!("EF.SOD LDSSecurityObjectVersion must be V0 or V1");
            return Err(EmrtdError::InvalidFileStructure(
                "EF.SOD LDSSecurityObjectVersion must be V0 or V1",
            ));
        }
        if !(2..=16).contains(&lds.data_group_hash_values.len()) {
            error!(
                "EF.SOD lists {} data group hashes, expected 2 to 16",
                lds.data_group_hash_values.len()
            );
            return Err(EmrtdError::InvalidFileStructure("EF.SOD dataGroupHashValues"));
        }
        let digest = oid2digestalg(&lds.hash_algorithm.algorithm)?;

        Ok(Self { signed, lds, digest })
    }

    /// The signed hash of a data group.
    #[must_use]
    pub fn hash_of(&self, id: DataGroupId) -> Option<&[u8]> {
        let number = rasn::types::Integer::from(i32::from(id.number()?));
        self.lds
            .data_group_hash_values
            .iter()
            .find(|dg_hash| dg_hash.data_group_number == number)
            .map(|dg_hash| &dg_hash.data_group_hash_value[..])
    }

    /// Data groups that have a hash in the security object.
    pub fn listed(&self) -> impl Iterator<Item = DataGroupId> + '_ {
        (1..=16)
            .filter_map(DataGroupId::from_number)
            .filter(|id| self.hash_of(*id).is_some())
    }

    /// The document signer certificate carried in EF.SOD.
    #[must_use]
    pub fn document_signer(&self) -> Option<&X509> {
        self.signed.signer_certificate()
    }

    fn check_hash(&self, id: DataGroupId, data: &[u8]) -> Result<Option<bool>, EmrtdError> {
        let Some(expected) = self.hash_of(id) else {
            return Ok(None);
        };
        let actual = hash(self.digest, data).map_err(EmrtdError::OpensslErrorStack)?;
        Ok(Some(constant_time_eq(expected, &actual)))
    }
}

/// Verdicts of one Passive Authentication run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PassiveAuthOutcome {
    pub ht: CheckResult,
    pub ds: CheckResult,
    pub cs: CheckResult,
    pub report: Option<PassiveAuthReport>,
}

impl PassiveAuthOutcome {
    /// Copies the verdicts into `status`.
    pub fn apply(self, status: &mut VerificationStatus) {
        status.ht = self.ht;
        status.ds = self.ds;
        status.cs = self.cs;
        status.passive_auth = self.report;
    }
}

/// Checks data groups read from a chip against its EF.SOD and the CSCA anchors.
pub struct PassiveAuthenticator<'a> {
    trust_store: &'a TrustStore,
}

impl<'a> PassiveAuthenticator<'a> {
    #[must_use]
    pub fn new(trust_store: &'a TrustStore) -> Self {
        Self { trust_store }
    }

    /// Verifies `groups`, which must hold EF.SOD.
    ///
    /// DG1 and DG2 have to match their signed hashes, and DG14 as well once chip
    /// authentication succeeded. `groups` has to hold the DG14 read over the chip
    /// authenticated channel in that case.
    #[must_use]
    pub fn verify(&self, groups: &DataGroupSet, chip_authenticated: bool) -> PassiveAuthOutcome {
        let Some(ef_sod) = groups.get(DataGroupId::Sod) else {
            warn!("Passive Authentication without EF.SOD");
            let missing = CheckResult::not_present("EF.SOD was not read");
            return PassiveAuthOutcome {
                ht: missing.clone(),
                ds: missing.clone(),
                cs: missing,
                report: None,
            };
        };
        let sod = match SecurityObject::parse(ef_sod) {
            Ok(sod) => sod,
            Err(e) => {
                error!("EF.SOD can not be decoded: {e}");
                let failed = CheckResult::failed(format!("EF.SOD can not be decoded: {e}"));
                return PassiveAuthOutcome {
                    ht: failed.clone(),
                    ds: failed.clone(),
                    cs: failed,
                    report: None,
                };
            }
        };

        let mut report = PassiveAuthReport {
            digest_algorithm: oid_string(&sod.lds.hash_algorithm.algorithm),
            signature_algorithm: sod.signed.signature_algorithm(),
            ..PassiveAuthReport::default()
        };
        let mut required = Vec::from([DataGroupId::Dg1, DataGroupId::Dg2]);
        if chip_authenticated {
            required.push(DataGroupId::Dg14);
        }

        let ht = check_hashes(&sod, groups, &required, &mut report);
        let ds = check_document_signer(&sod, &mut report);
        let cs = self.check_chain(&sod, &mut report);
        info!("Passive Authentication ht: {ht}, ds: {ds}, cs: {cs}");
        PassiveAuthOutcome {
            ht,
            ds,
            cs,
            report: Some(report),
        }
    }

    fn check_chain(&self, sod: &SecurityObject, report: &mut PassiveAuthReport) -> CheckResult {
        if self.trust_store.is_empty() {
            warn!("No CSCA anchors, the certificate path is not checked");
            return CheckResult::not_checked("trust store is empty");
        }
        let Some(dsc) = sod.document_signer() else {
            return CheckResult::failed("EF.SOD carries no document signer certificate");
        };
        let intermediates: Vec<X509> = sod.signed.other_certificates().cloned().collect();
        match self.trust_store.validate_path(dsc, &intermediates) {
            Ok(path) if path.valid => {
                let anchor = path.anchor.unwrap_or_default();
                info!("Document signer chains to {anchor}");
                let result = CheckResult::succeeded(format!("chains to {anchor}"));
                report.trust_anchor = Some(anchor);
                result
            }
            Ok(path) => {
                warn!("Document signer path is not valid: {}", path.reason);
                CheckResult::failed(path.reason)
            }
            Err(e) => {
                warn!("Document signer path can not be validated: {e}");
                CheckResult::failed(e.to_string())
            }
        }
    }
}

fn check_hashes(
    sod: &SecurityObject,
    groups: &DataGroupSet,
    required: &[DataGroupId],
    report: &mut PassiveAuthReport,
) -> CheckResult {
    let mut problems = Vec::new();
    for id in sod.listed() {
        let Some(data) = groups.get(id) else {
            report.data_group_hashes.insert(id, HashCheck::NotRead);
            continue;
        };
        match sod.check_hash(id, data) {
            Ok(Some(true)) => {
                report.data_group_hashes.insert(id, HashCheck::Matched);
            }
            Ok(Some(false)) => {
                warn!("Potentially cloned document, hash of {id} does not match");
                report.data_group_hashes.insert(id, HashCheck::Mismatched);
                problems.push(format!("{id} hash mismatch"));
            }
            Ok(None) => {}
            Err(e) => problems.push(format!("{id} can not be hashed: {e}")),
        }
    }
    for id in required {
        if sod.hash_of(*id).is_none() {
            warn!("{id} file hash is not found inside verified hashes");
            problems.push(format!("{id} has no hash in EF.SOD"));
        } else if !groups.contains(*id) {
            problems.push(format!("{id} was not read"));
        }
    }

    if problems.is_empty() {
        let checked = report
            .data_group_hashes
            .values()
            .filter(|check| **check == HashCheck::Matched)
            .count();
        CheckResult::succeeded(format!("{checked} data group hashes match"))
    } else {
        CheckResult::failed(problems.join("; "))
    }
}

fn check_document_signer(sod: &SecurityObject, report: &mut PassiveAuthReport) -> CheckResult {
    let Some(dsc) = sod.document_signer() else {
        warn!("EF.SOD carries no document signer certificate");
        return CheckResult::failed("EF.SOD carries no document signer certificate");
    };
    report.document_signer_subject = Some(name_to_string(dsc.subject_name()));
    report.document_signer_issuer = Some(name_to_string(dsc.issuer_name()));

    if let Err(e) = sod.signed.check_message_digest(ID_ICAO_LDS_SECURITY_OBJECT) {
        return CheckResult::failed(e.to_string());
    }
    match sod.signed.verify_signature(dsc) {
        Ok(true) => report.signature_valid = true,
        Ok(false) => {
            warn!("Signature verification failure during EF.SOD parsing");
            return CheckResult::failed("EF.SOD signature does not verify");
        }
        Err(e) => {
            warn!("EF.SOD signature can not be verified: {e}");
            return CheckResult::failed(e.to_string());
        }
    }
    match within_validity(dsc) {
        Ok(true) => CheckResult::succeeded(format!(
            "signed by {}",
            report.document_signer_subject.clone().unwrap_or_default()
        )),
        Ok(false) => {
            warn!("Document signer certificate is outside its validity period");
            CheckResult::failed("document signer certificate is outside its validity period")
        }
        Err(e) => CheckResult::failed(e.to_string()),
    }
}
