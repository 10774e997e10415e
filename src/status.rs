//! Outcomes of the individual checks, kept as data so partial results stay visible.

use crate::lds::DataGroupId;
use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec,
    vec::Vec,
};
use core::fmt;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Succeeded,
    Failed,
    /// The document does not support the check.
    NotPresent,
    /// The check was skipped, by configuration or because an earlier step failed.
    NotChecked,
    #[default]
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::NotPresent => "NOT_PRESENT",
            Self::NotChecked => "NOT_CHECKED",
            Self::Unknown => "UNKNOWN",
        })
    }
}

/// Verdict of one check with a human readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CheckResult {
    pub verdict: Verdict,
    pub reason: String,
}

impl CheckResult {
    pub fn new(verdict: Verdict, reason: impl ToString) -> Self {
        Self {
            verdict,
            reason: reason.to_string(),
        }
    }

    pub fn succeeded(reason: impl ToString) -> Self {
        Self::new(Verdict::Succeeded, reason)
    }

    pub fn failed(reason: impl ToString) -> Self {
        Self::new(Verdict::Failed, reason)
    }

    pub fn not_present(reason: impl ToString) -> Self {
        Self::new(Verdict::NotPresent, reason)
    }

    pub fn not_checked(reason: impl ToString) -> Self {
        Self::new(Verdict::NotChecked, reason)
    }

    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.verdict)
        } else {
            write!(f, "{} ({})", self.verdict, self.reason)
        }
    }
}

/// Hash comparison of one data group against the SOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashCheck {
    Matched,
    Mismatched,
    /// Listed in the SOD but not read from the chip.
    NotRead,
}

/// Details of Passive Authentication behind the `ht`, `ds` and `cs` verdicts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PassiveAuthReport {
    /// Digest algorithm of the LDS security object, as an OID.
    pub digest_algorithm: String,
    pub data_group_hashes: BTreeMap<DataGroupId, HashCheck>,
    /// Signature algorithm of the signer info, as an OID.
    pub signature_algorithm: String,
    pub signature_valid: bool,
    pub document_signer_subject: Option<String>,
    pub document_signer_issuer: Option<String>,
    /// Subject of the CSCA the document signer chains to.
    pub trust_anchor: Option<String>,
}

/// The trust verdict of one read.
///
/// * `bac`, `sac` access control with BAC or PACE.
/// * `ht` data group hashes against the SOD.
/// * `ds` document signer certificate and SOD signature.
/// * `cs` certificate path from the document signer to a CSCA.
/// * `ca`, `aa` chip and active authentication.
/// * `eac` terminal authentication, never performed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct VerificationStatus {
    pub bac: CheckResult,
    pub sac: CheckResult,
    pub ht: CheckResult,
    pub ds: CheckResult,
    pub cs: CheckResult,
    pub ca: CheckResult,
    pub aa: CheckResult,
    pub eac: CheckResult,
    pub passive_auth: Option<PassiveAuthReport>,
}

impl VerificationStatus {
    /// Hashes, signer and chain all verified.
    #[must_use]
    pub fn passive_authentication_succeeded(&self) -> bool {
        self.ht.is_succeeded() && self.ds.is_succeeded() && self.cs.is_succeeded()
    }

    /// Each check name with its verdict, in a fixed order.
    #[must_use]
    pub fn checks(&self) -> Vec<(&'static str, &CheckResult)> {
        vec![
            ("bac", &self.bac),
            ("sac", &self.sac),
            ("ht", &self.ht),
            ("ds", &self.ds),
            ("cs", &self.cs),
            ("ca", &self.ca),
            ("aa", &self.aa),
            ("eac", &self.eac),
        ]
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (name, check) in self.checks() {
            writeln!(f, "{name}: {check}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeaturePresence {
    #[default]
    Unknown,
    Present,
    NotPresent,
}

impl FeaturePresence {
    fn from_bool(present: bool) -> Self {
        if present {
            Self::Present
        } else {
            Self::NotPresent
        }
    }
}

/// Security features the document advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FeatureStatus {
    pub sac: FeaturePresence,
    pub bac: FeaturePresence,
    pub aa: FeaturePresence,
    pub eac: FeaturePresence,
    pub ca: FeaturePresence,
}

impl FeatureStatus {
    pub fn set_sac(&mut self, present: bool) {
        self.sac = FeaturePresence::from_bool(present);
    }

    pub fn set_bac(&mut self, present: bool) {
        self.bac = FeaturePresence::from_bool(present);
    }

    pub fn set_aa(&mut self, present: bool) {
        self.aa = FeaturePresence::from_bool(present);
    }

    pub fn set_eac(&mut self, present: bool) {
        self.eac = FeaturePresence::from_bool(present);
    }

    pub fn set_ca(&mut self, present: bool) {
        self.ca = FeaturePresence::from_bool(present);
    }
}
