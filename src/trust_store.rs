//! CSCA trust anchors for Passive Authentication.
//!
//! Anchors come from ICAO CSCA master lists (ICAO Doc 9303-12 Section 9), bare
//! `CscaMasterList` sequences, certificate files and PKCS#12 keystores. The store is
//! built once and only read afterwards.

use crate::{
    asn1::{csca_master_list::CscaMasterList, next_tlv_raw},
    cms::{name_to_string, within_validity, SignedContent},
    EmrtdError,
};
use alloc::{string::String, vec::Vec};
use openssl::{
    pkcs12::Pkcs12,
    stack::Stack,
    x509::{
        store::{X509Store, X509StoreBuilder},
        X509StoreContext, X509,
    },
};
use rasn::{der, types::Oid};
use tracing::{debug, error, info, warn};

const ID_ICAO_CSCA_MASTER_LIST: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 2]);

/// Result of validating a certificate path to one of the anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathValidation {
    pub valid: bool,
    /// The verifier's error string when `valid` is false.
    pub reason: String,
    /// Subject of the anchor the path ends in.
    pub anchor: Option<String>,
}

/// Trusted CSCA certificates.
#[derive(Clone, Default)]
pub struct TrustStore {
    anchors: Vec<X509>,
}

impl core::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrustStore")
            .field("anchors", &self.subjects())
            .finish()
    }
}

impl TrustStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the CSCAs of a signed master list.
    ///
    /// # Errors
    ///
    /// See [`TrustStore::add_master_list`].
    pub fn from_master_list(data: &[u8]) -> Result<Self, EmrtdError> {
        let mut store = Self::new();
        store.add_master_list(data)?;
        Ok(store)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    #[must_use]
    pub fn anchors(&self) -> &[X509] {
        &self.anchors
    }

    /// Distinguished names of the anchors.
    #[must_use]
    pub fn subjects(&self) -> Vec<String> {
        self.anchors
            .iter()
            .map(|cert| name_to_string(cert.subject_name()))
            .collect()
    }

    /// Adds `cert` unless an identical certificate is already trusted.
    pub fn add_certificate(&mut self, cert: X509) -> bool {
        let der_bytes = cert.to_der().ok();
        if self
            .anchors
            .iter()
            .any(|known| known.to_der().ok() == der_bytes)
        {
            debug!("Skipping duplicate anchor {}", name_to_string(cert.subject_name()));
            return false;
        }
        match within_validity(&cert) {
            Ok(true) => {}
            Ok(false) => warn!(
                "Anchor {} is outside its validity period",
                name_to_string(cert.subject_name())
            ),
            Err(e) => warn!("Validity of anchor can not be checked: {e}"),
        }
        self.anchors.push(cert);
        true
    }

    /// Adds the CSCAs of a CMS signed master list after verifying its signer.
    ///
    /// The master list signer certificate is expected to chain to one of the CSCAs in
    /// the list itself. A signer that does not is only reported, the signature over
    /// the list has to verify.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the structure is malformed or the signature does not verify.
    pub fn add_master_list(&mut self, data: &[u8]) -> Result<usize, EmrtdError> {
        let signed = SignedContent::parse(data, ID_ICAO_CSCA_MASTER_LIST, "Master List")?;
        signed.check_message_digest(ID_ICAO_CSCA_MASTER_LIST)?;

        let Some(signer) = signed.signer_certificate() else {
            error!("Master List carries no signer certificate");
            return Err(EmrtdError::InvalidFileStructure("Master List signer certificate"));
        };
        if !signed.verify_signature(signer)? {
            error!("Signature verification failure during Master List parsing");
            return Err(EmrtdError::VerifySignatureError(
                "Signature verification failure during Master List parsing",
            ));
        }

        let list = decode_csca_master_list(&signed.content)?;
        let mut signer_anchors = Self::new();
        for cert in signed.other_certificates().chain(list.iter()) {
            signer_anchors.add_certificate(cert.clone());
        }
        match signer_anchors.validate_path(signer, &[]) {
            Ok(path) if path.valid => info!(
                "Master List signer chains to {}",
                path.anchor.unwrap_or_default()
            ),
            Ok(path) => warn!("Master List signer is not verified: {}", path.reason),
            Err(e) => warn!("Master List signer is not verified: {e}"),
        }

        let added = list
            .into_iter()
            .filter(|cert| self.add_certificate(cert.clone()))
            .count();
        info!("Master List added {added} CSCA certificates");
        Ok(added)
    }

    /// Adds every certificate of one or more concatenated DER `CscaMasterList`s.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if a list does not decode.
    pub fn add_csca_master_lists(&mut self, data: &[u8]) -> Result<usize, EmrtdError> {
        let mut added = 0;
        let mut rest = data;
        while !rest.is_empty() {
            let (_, _, raw, remaining) = next_tlv_raw(rest)?;
            for cert in decode_csca_master_list(raw)? {
                added += usize::from(self.add_certificate(cert));
            }
            rest = remaining;
        }
        info!("CSCA master lists added {added} certificates");
        Ok(added)
    }

    /// # Errors
    ///
    /// `EmrtdError` if `data` is not a DER certificate.
    pub fn add_der_certificate(&mut self, data: &[u8]) -> Result<bool, EmrtdError> {
        let cert = X509::from_der(data).map_err(|e| {
            error!("Certificate does not decode: {e}");
            EmrtdError::OpensslErrorStack(e)
        })?;
        Ok(self.add_certificate(cert))
    }

    /// # Errors
    ///
    /// `EmrtdError` if the bundle holds no parsable certificate.
    pub fn add_pem_bundle(&mut self, data: &[u8]) -> Result<usize, EmrtdError> {
        let certs = X509::stack_from_pem(data).map_err(|e| {
            error!("PEM bundle does not decode: {e}");
            EmrtdError::OpensslErrorStack(e)
        })?;
        Ok(certs
            .into_iter()
            .filter(|cert| self.add_certificate(cert.clone()))
            .count())
    }

    /// Adds the certificate and CA certificates of a PKCS#12 keystore.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the keystore does not decode with `password`.
    pub fn add_pkcs12(&mut self, data: &[u8], password: &str) -> Result<usize, EmrtdError> {
        let parsed = Pkcs12::from_der(data)
            .and_then(|pkcs12| pkcs12.parse2(password))
            .map_err(|e| {
                error!("PKCS#12 keystore does not open: {e}");
                EmrtdError::OpensslErrorStack(e)
            })?;
        let mut added = 0;
        for cert in parsed.cert.into_iter().chain(parsed.ca.into_iter().flatten()) {
            added += usize::from(self.add_certificate(cert));
        }
        Ok(added)
    }

    /// Adds a file of any supported format except PKCS#12, detected from its content.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if no format matches.
    pub fn add_file_contents(&mut self, data: &[u8]) -> Result<usize, EmrtdError> {
        if data.starts_with(b"-----BEGIN") {
            return self.add_pem_bundle(data);
        }
        if let Ok(added) = self.add_master_list(data) {
            return Ok(added);
        }
        if let Ok(added) = self.add_der_certificate(data) {
            return Ok(usize::from(added));
        }
        self.add_csca_master_lists(data).map_err(|e| {
            error!("Trust anchor file is in no supported format");
            e
        })
    }

    fn x509_store(&self) -> Result<X509Store, EmrtdError> {
        let mut builder = X509StoreBuilder::new().map_err(EmrtdError::OpensslErrorStack)?;
        for cert in &self.anchors {
            builder
                .add_cert(cert.clone())
                .map_err(EmrtdError::OpensslErrorStack)?;
        }
        Ok(builder.build())
    }

    /// X.509 path validation of `cert` to an anchor, `intermediates` untrusted.
    ///
    /// No revocation information is consulted.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if openssl fails to set up the verification.
    pub fn validate_path(
        &self,
        cert: &X509,
        intermediates: &[X509],
    ) -> Result<PathValidation, EmrtdError> {
        let store = self.x509_store()?;
        let mut chain = Stack::new().map_err(EmrtdError::OpensslErrorStack)?;
        for intermediate in intermediates {
            chain
                .push(intermediate.clone())
                .map_err(EmrtdError::OpensslErrorStack)?;
        }
        let mut context = X509StoreContext::new().map_err(EmrtdError::OpensslErrorStack)?;
        context
            .init(&store, cert, &chain, |c| {
                let valid = c.verify_cert()?;
                let anchor = c
                    .chain()
                    .and_then(|verified| verified.iter().last())
                    .map(|anchor| name_to_string(anchor.subject_name()));
                Ok(PathValidation {
                    valid,
                    reason: if valid {
                        String::new()
                    } else {
                        c.error().error_string().into()
                    },
                    anchor: anchor.filter(|_| valid),
                })
            })
            .map_err(EmrtdError::OpensslErrorStack)
    }
}

fn decode_csca_master_list(data: &[u8]) -> Result<Vec<X509>, EmrtdError> {
    let list = der::decode::<CscaMasterList>(data).map_err(EmrtdError::RasnDecodeError)?;
    if list.version.ne(&rasn::types::Integer::from(0)) {
        error!("MasterList CscaMasterListVersion must be V0");
        return Err(EmrtdError::InvalidFileStructure(
            "MasterList CscaMasterListVersion must be V0",
        ));
    }
    let mut certs = Vec::new();
    for cert in list.cert_list.iter() {
        let der_bytes = der::encode(cert).map_err(EmrtdError::RasnEncodeError)?;
        certs.push(X509::from_der(&der_bytes).map_err(EmrtdError::OpensslErrorStack)?);
    }
    Ok(certs)
}
