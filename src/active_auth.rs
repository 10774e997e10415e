//! Active Authentication, ICAO Doc 9303-11 Section 6.1.
//!
//! The chip signs a random challenge with the private key matching DG15. The signature
//! is kept for the caller and not verified here.

use crate::{
    apdu::{EmrtdCard, APDU},
    asn1::unwrap_file,
    comms::EmrtdComms,
    security_info::SecurityInfos,
    status::CheckResult,
    EmrtdError,
};
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use openssl::pkey::{Id, PKey, Public};
use rand::{CryptoRng, RngCore};
use serde::Serialize;
use tracing::{error, info, trace, warn};

/// Decodes the `SubjectPublicKeyInfo` of EF.DG15.
///
/// # Errors
///
/// `EmrtdError` if the file or the key does not decode.
pub fn parse_dg15(dg15: &[u8]) -> Result<PKey<Public>, EmrtdError> {
    let spki = unwrap_file(dg15, &[0x6F], "EF.DG15")?;
    PKey::public_key_from_der(spki).map_err(|e| {
        error!("EF.DG15 public key does not decode: {e}");
        EmrtdError::OpensslErrorStack(e)
    })
}

/// One INTERNAL AUTHENTICATE exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveAuthExchange {
    /// `RSA` or `EC`.
    pub key_type: String,
    pub key_bits: u32,
    /// Algorithm implied by the key, or the OID announced in DG14 for EC keys.
    pub signature_algorithm: String,
    pub challenge: Vec<u8>,
    /// Signature returned by the chip, unverified.
    pub response: Vec<u8>,
}

/// Runs Active Authentication with the key of `dg15`.
///
/// Succeeds when the chip answers the challenge.
pub fn authenticate_active<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    dg15: &[u8],
    dg14: Option<&SecurityInfos>,
) -> (CheckResult, Option<ActiveAuthExchange>) {
    if !comms.state().is_established() {
        warn!("Skipping Active Authentication on a {} channel", comms.state().name());
        return (
            CheckResult::not_checked(format!("channel is {}", comms.state().name())),
            None,
        );
    }
    match internal_authenticate(comms, dg15, dg14) {
        Ok(exchange) => {
            info!(
                "Active Authentication exchange completed, {} byte response",
                exchange.response.len()
            );
            let result = CheckResult::succeeded(format!(
                "{} {} bit key answered the challenge, signature not verified",
                exchange.key_type, exchange.key_bits
            ));
            (result, Some(exchange))
        }
        Err(e) => {
            warn!("Active Authentication failed: {e}");
            (CheckResult::failed(e.to_string()), None)
        }
    }
}

fn internal_authenticate<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    dg15: &[u8],
    dg14: Option<&SecurityInfos>,
) -> Result<ActiveAuthExchange, EmrtdError> {
    let key = parse_dg15(dg15)?;
    let (key_type, signature_algorithm) = match key.id() {
        Id::RSA => ("RSA", "SHA256withRSA".to_string()),
        Id::EC => {
            let announced = dg14
                .and_then(SecurityInfos::active_authentication)
                .map(|info| info.signature_algorithm.clone());
            if announced.is_none() {
                warn!("EF.DG15 holds an EC key but EF.DG14 announces no ActiveAuthenticationInfo");
            }
            ("EC", announced.unwrap_or_else(|| "SHA256withECDSA".to_string()))
        }
        other => {
            error!("Unsupported Active Authentication key type {other:?}");
            return Err(EmrtdError::UnsupportedAlgorithm(format!("{other:?}")));
        }
    };

    let mut challenge = [0u8; 8];
    comms.rng().fill_bytes(&mut challenge);
    trace!("Active Authentication challenge: {}", crate::bytes2hex(&challenge));

    let apdu = APDU::with_data(0x00, 0x88, 0x00, 0x00, challenge.to_vec(), Some(0x00))?;
    let response = comms.send_expect_ok(&apdu, "Internal Authenticate")?;
    if response.is_empty() {
        error!("Chip answered INTERNAL AUTHENTICATE without a signature");
        return Err(EmrtdError::InvalidResponseError());
    }

    Ok(ActiveAuthExchange {
        key_type: key_type.to_string(),
        key_bits: key.bits(),
        signature_algorithm,
        challenge: challenge.to_vec(),
        response,
    })
}
