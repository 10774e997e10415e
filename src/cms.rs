//! CMS `SignedData` as used by EF.SOD and CSCA master lists.
//!
//! RFC 5652 Sections 5 and 12.1, profiled by ICAO Doc 9303-10 Section 4.6.2 and
//! ICAO Doc 9303-12 Section 9.

use crate::{crypto::oid2digestalg, EmrtdError};
use alloc::{
    string::{String, ToString},
    vec::Vec,
};
use core::cmp::Ordering;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ecdsa::EcdsaSig,
    hash::{hash, MessageDigest},
    pkey::Id,
    rsa::Padding,
    sign::{RsaPssSaltlen, Verifier},
    x509::{X509NameRef, X509},
};
use rasn::{
    der,
    types::{ObjectIdentifier, Oid},
};
use rasn_cms::{CertificateChoices, SignerIdentifier, SignerInfo};
use tracing::{debug, error, info, warn};

const ID_SIGNED_DATA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 7, 2]);
const ID_CONTENT_TYPE: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 3]);
const ID_MESSAGE_DIGEST: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 9, 4]);
/// `id-RSASSA-PSS`, advertised by some issuers without usable parameters.
const ID_RSASSA_PSS: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 10]);

/// Dotted notation of a rasn object identifier.
pub(crate) fn oid_string(oid: &Oid) -> String {
    oid.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// `C=UT, O=..., CN=...` rendering of a distinguished name.
pub(crate) fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|value| value.to_string())
                .unwrap_or_default();
            alloc::format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Digest named by a `*WithRSAEncryption` or `ecdsa-with-*` signature algorithm.
fn signature_digest(oid: &Oid) -> Option<MessageDigest> {
    let table: [(&Oid, MessageDigest); 10] = [
        (Oid::const_new(&[1, 2, 840, 113549, 1, 1, 5]), MessageDigest::sha1()),
        (Oid::const_new(&[1, 2, 840, 113549, 1, 1, 14]), MessageDigest::sha224()),
        (Oid::const_new(&[1, 2, 840, 113549, 1, 1, 11]), MessageDigest::sha256()),
        (Oid::const_new(&[1, 2, 840, 113549, 1, 1, 12]), MessageDigest::sha384()),
        (Oid::const_new(&[1, 2, 840, 113549, 1, 1, 13]), MessageDigest::sha512()),
        (Oid::const_new(&[1, 2, 840, 10045, 4, 1]), MessageDigest::sha1()),
        (Oid::const_new(&[1, 2, 840, 10045, 4, 3, 1]), MessageDigest::sha224()),
        (Oid::const_new(&[1, 2, 840, 10045, 4, 3, 2]), MessageDigest::sha256()),
        (Oid::const_new(&[1, 2, 840, 10045, 4, 3, 3]), MessageDigest::sha384()),
        (Oid::const_new(&[1, 2, 840, 10045, 4, 3, 4]), MessageDigest::sha512()),
    ];
    table
        .into_iter()
        .find(|(candidate, _)| oid.eq(*candidate))
        .map(|(_, digest)| digest)
}

/// ECDSA signatures are DER `Ecdsa-Sig-Value`, some chips store plain `r || s`.
fn der_ecdsa_signature(signature: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if EcdsaSig::from_der(signature).is_ok() {
        return Ok(signature.to_vec());
    }
    if signature.is_empty() || signature.len() % 2 != 0 {
        error!("ECDSA signature of {} bytes is neither DER nor r || s", signature.len());
        return Err(EmrtdError::VerifySignatureError("malformed ECDSA signature"));
    }
    debug!("Converting plain ECDSA signature to DER");
    let (r, s) = signature.split_at(signature.len() / 2);
    let r = BigNum::from_slice(r).map_err(EmrtdError::OpensslErrorStack)?;
    let s = BigNum::from_slice(s).map_err(EmrtdError::OpensslErrorStack)?;
    EcdsaSig::from_private_components(r, s)
        .and_then(|sig| sig.to_der())
        .map_err(EmrtdError::OpensslErrorStack)
}

/// Whether `now` lies within the certificate's validity period.
pub(crate) fn within_validity(cert: &X509) -> Result<bool, EmrtdError> {
    let now = Asn1Time::days_from_now(0).map_err(EmrtdError::OpensslErrorStack)?;
    let started = cert
        .not_before()
        .compare(&now)
        .map_err(EmrtdError::OpensslErrorStack)?
        != Ordering::Greater;
    let running = cert
        .not_after()
        .compare(&now)
        .map_err(EmrtdError::OpensslErrorStack)?
        != Ordering::Less;
    Ok(started && running)
}

/// A decoded `SignedData` with a single signer.
pub(crate) struct SignedContent {
    /// `eContent` octets.
    pub(crate) content: Vec<u8>,
    /// Certificates carried in the `certificates` field, in order.
    pub(crate) certificates: Vec<X509>,
    signer_index: Option<usize>,
    signer_info: SignerInfo,
    digest: MessageDigest,
}

impl SignedContent {
    /// Decodes a DER `ContentInfo` whose `eContentType` must be `content_type`.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the structure does not follow the ICAO profile.
    pub(crate) fn parse(
        data: &[u8],
        content_type: &Oid,
        name: &'static str,
    ) -> Result<Self, EmrtdError> {
        let content_info =
            der::decode::<rasn_cms::ContentInfo>(data).map_err(EmrtdError::RasnDecodeError)?;
        if content_info.content_type.ne(ID_SIGNED_DATA) {
            error!("{name} ContentInfo contentType OID must be id-signedData");
            return Err(EmrtdError::InvalidFileStructure(name));
        }

        let signed_data = der::decode::<rasn_cms::SignedData>(content_info.content.as_bytes())
            .map_err(EmrtdError::RasnDecodeError)?;
        if signed_data.version.ne(&rasn::types::Integer::from(3)) {
            error!("{name} SignedData version must be V3");
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        if signed_data.digest_algorithms.is_empty() {
            error!("{name} SignedData digestAlgorithms can not be empty");
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        if signed_data.encap_content_info.content_type.ne(content_type) {
            error!(
                "{name} encapContentInfo has type {}, expected {}",
                oid_string(&signed_data.encap_content_info.content_type),
                oid_string(content_type)
            );
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        let Some(content) = signed_data.encap_content_info.content.clone() else {
            error!("{name} SignedData must contain eContent");
            return Err(EmrtdError::InvalidFileStructure(name));
        };

        if signed_data.signer_infos.len() != 1 {
            error!(
                "{name} must have exactly one SignerInfo, found {}",
                signed_data.signer_infos.len()
            );
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        let Some(signer_info) = signed_data.signer_infos.first().cloned() else {
            return Err(EmrtdError::InvalidFileStructure(name));
        };
        let expected_version = match signer_info.sid {
            SignerIdentifier::IssuerAndSerialNumber(_) => 1,
            SignerIdentifier::SubjectKeyIdentifier(_) => 3,
        };
        if signer_info.version.ne(&rasn::types::Integer::from(expected_version)) {
            error!("{name} SignerInfo version does not match its signer identifier");
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        if !signed_data
            .digest_algorithms
            .contains(&signer_info.digest_algorithm)
        {
            error!("{name} SignerInfo digestAlgorithm is not listed in SignedData digestAlgorithms");
            return Err(EmrtdError::InvalidFileStructure(name));
        }
        let digest = oid2digestalg(&signer_info.digest_algorithm.algorithm)?;

        if signed_data.crls.is_some() {
            warn!("{name} carries CRLs, they are ignored");
        }

        let mut certificates = Vec::new();
        let mut signer_index = None;
        for choice in signed_data.certificates.iter().flatten() {
            let CertificateChoices::Certificate(cert) = choice else {
                debug!("Skipping a non X.509 certificate choice in {name}");
                continue;
            };
            let issued_to_signer = match &signer_info.sid {
                SignerIdentifier::IssuerAndSerialNumber(id) => {
                    cert.tbs_certificate.serial_number == id.serial_number
                        && cert.tbs_certificate.issuer == id.issuer
                }
                SignerIdentifier::SubjectKeyIdentifier(_) => false,
            };
            let der_bytes = der::encode(cert).map_err(EmrtdError::RasnEncodeError)?;
            let x509 = X509::from_der(&der_bytes).map_err(EmrtdError::OpensslErrorStack)?;
            let issued_to_signer = issued_to_signer
                || match &signer_info.sid {
                    SignerIdentifier::SubjectKeyIdentifier(ski) => x509
                        .subject_key_id()
                        .is_some_and(|id| id.as_slice() == &ski[..]),
                    SignerIdentifier::IssuerAndSerialNumber(_) => false,
                };
            if issued_to_signer && signer_index.is_none() {
                signer_index = Some(certificates.len());
            }
            certificates.push(x509);
        }
        if signer_index.is_none() && !certificates.is_empty() {
            warn!("{name} signer identifier matches no certificate, using the first one");
            signer_index = Some(0);
        }

        Ok(Self {
            content: content.to_vec(),
            certificates,
            signer_index,
            signer_info,
            digest,
        })
    }

    /// The certificate of the signer, if the structure carries it.
    pub(crate) fn signer_certificate(&self) -> Option<&X509> {
        self.certificates.get(self.signer_index?)
    }

    /// Certificates other than the signer's, usable as untrusted intermediates.
    pub(crate) fn other_certificates(&self) -> impl Iterator<Item = &X509> {
        self.certificates
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != self.signer_index)
            .map(|(_, cert)| cert)
    }

    pub(crate) fn digest_algorithm(&self) -> String {
        oid_string(&self.signer_info.digest_algorithm.algorithm)
    }

    pub(crate) fn signature_algorithm(&self) -> String {
        oid_string(&self.signer_info.signature_algorithm.algorithm)
    }

    /// Checks the signed `messageDigest` attribute against the digest of `eContent`.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the attributes are missing or do not bind the content.
    pub(crate) fn check_message_digest(&self, content_type: &Oid) -> Result<(), EmrtdError> {
        let Some(signed_attrs) = &self.signer_info.signed_attrs else {
            error!("SignerInfo has no signed attributes");
            return Err(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"));
        };

        let mut attr_content_type = None;
        let mut message_digest = None;
        for signed_attr in signed_attrs {
            let single = || {
                if signed_attr.values.len() != 1 {
                    error!("Signed attribute must have a single value");
                    return Err(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"));
                }
                signed_attr
                    .values
                    .first()
                    .map(|value| value.as_bytes().to_vec())
                    .ok_or(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"))
            };
            if signed_attr.r#type.eq(ID_CONTENT_TYPE) {
                attr_content_type = Some(
                    der::decode::<ObjectIdentifier>(&single()?).map_err(EmrtdError::RasnDecodeError)?,
                );
            } else if signed_attr.r#type.eq(ID_MESSAGE_DIGEST) {
                message_digest = Some(
                    der::decode::<rasn::types::OctetString>(&single()?)
                        .map_err(EmrtdError::RasnDecodeError)?,
                );
            }
        }

        let (Some(attr_content_type), Some(message_digest)) = (attr_content_type, message_digest) else {
            error!("Signed attributes lack contentType or messageDigest");
            return Err(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"));
        };
        if attr_content_type.ne(content_type) {
            error!("Signed contentType attribute does not match eContentType");
            return Err(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"));
        }
        let content_hash = hash(self.digest, &self.content).map_err(EmrtdError::OpensslErrorStack)?;
        if content_hash.ne(&message_digest[..]) {
            error!("Digest of eContent does not match the messageDigest attribute");
            return Err(EmrtdError::VerifyHashError(
                "eContent digest does not match the signed messageDigest".into(),
            ));
        }
        info!("Digest of eContent matches the signed messageDigest");
        Ok(())
    }

    /// Verifies the signature over the signed attributes with `signer`'s key.
    ///
    /// # Errors
    ///
    /// `EmrtdError` if the key or signature can not be processed.
    pub(crate) fn verify_signature(&self, signer: &X509) -> Result<bool, EmrtdError> {
        let Some(signed_attrs) = &self.signer_info.signed_attrs else {
            error!("SignerInfo has no signed attributes");
            return Err(EmrtdError::InvalidFileStructure("SignerInfo signedAttrs"));
        };
        // The digest covers the attributes as an explicit SET OF, not the implicit [0]
        let mut signed_attrs_bytes = der::encode(signed_attrs).map_err(EmrtdError::RasnEncodeError)?;
        signed_attrs_bytes[0] = 0x31;

        let key = signer.public_key().map_err(EmrtdError::OpensslErrorStack)?;
        let algorithm = &self.signer_info.signature_algorithm.algorithm;
        let signature = &self.signer_info.signature;

        let verified = if algorithm.eq(ID_RSASSA_PSS) {
            debug!("Verifying RSASSA-PSS as SHA-256 with MGF1 and a 32 byte salt");
            let mut verifier =
                Verifier::new(MessageDigest::sha256(), &key).map_err(EmrtdError::OpensslErrorStack)?;
            verifier
                .set_rsa_padding(Padding::PKCS1_PSS)
                .and_then(|()| verifier.set_rsa_pss_saltlen(RsaPssSaltlen::custom(32)))
                .and_then(|()| verifier.set_rsa_mgf1_md(MessageDigest::sha256()))
                .map_err(EmrtdError::OpensslErrorStack)?;
            verifier
                .verify_oneshot(signature, &signed_attrs_bytes)
                .map_err(EmrtdError::OpensslErrorStack)?
        } else {
            let digest = signature_digest(algorithm).unwrap_or(self.digest);
            let signature = if key.id() == Id::EC {
                der_ecdsa_signature(signature)?
            } else {
                signature.to_vec()
            };
            let mut verifier = Verifier::new(digest, &key).map_err(EmrtdError::OpensslErrorStack)?;
            verifier
                .verify_oneshot(&signature, &signed_attrs_bytes)
                .map_err(EmrtdError::OpensslErrorStack)?
        };
        info!("Signature verification with {}: {verified}", oid_string(algorithm));
        Ok(verified)
    }
}
