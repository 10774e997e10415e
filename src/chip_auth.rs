//! Chip Authentication with ECDH, re-keying secure messaging with the chip's static key.
//!
//! ICAO Doc 9303-11 Section 6.2 and BSI TR-03110-3 Section B.1.
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use crate::{
    apdu::{data_object, EmrtdCard, APDU},
    asn1::{encode_oid, encode_tlv},
    comms::{dynamic_auth_data, EmrtdComms, SecureChannelState, SessionKeys},
    crypto::{compute_key, EncryptionAlgorithm, KeyType},
    pace::Curve,
    security_info::{ChipAuthenticationInfo, ChipAuthenticationPublicKeyInfo, KeyAgreement, SecurityInfos},
    status::CheckResult,
    EmrtdError,
};
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};
use openssl::pkey::PKey;
use rand::{CryptoRng, RngCore};
use tracing::{error, info, trace, warn};

/// Key reference `84` as the minimal big endian encoding of the key id.
fn key_reference(key_id: u64) -> Vec<u8> {
    let bytes = key_id.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    bytes[start..].to_vec()
}

/// The `ChipAuthenticationInfo` that belongs to `public_key`.
fn matching_info<'a>(
    infos: &'a SecurityInfos,
    public_key: &ChipAuthenticationPublicKeyInfo,
) -> Option<&'a ChipAuthenticationInfo> {
    infos.chip_authentication_infos().find(|info| {
        info.key_agreement() == public_key.key_agreement()
            && (info.key_id.is_none() || public_key.key_id.is_none() || info.key_id == public_key.key_id)
    })
}

/// Runs Chip Authentication with every announced key until one succeeds.
///
/// A failing key does not stop the attempt with the next one. Succeeding moves the
/// channel to `ChipAuthenticated`.
pub fn authenticate_chip<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    dg14: &SecurityInfos,
) -> CheckResult {
    if !matches!(
        comms.state(),
        SecureChannelState::Bac(_) | SecureChannelState::Pace { .. }
    ) {
        warn!(
            "Skipping Chip Authentication on a {} channel",
            comms.state().name()
        );
        return CheckResult::not_checked(format!("channel is {}", comms.state().name()));
    }

    let mut failures: Vec<String> = Vec::new();
    for public_key in dg14.chip_authentication_public_keys() {
        match authenticate_with_key(comms, public_key, matching_info(dg14, public_key)) {
            Ok(alg) => {
                info!("Chip Authentication succeeded with key {:?}", public_key.key_id);
                return CheckResult::succeeded(format!("{} with {alg:?}", public_key.protocol));
            }
            Err(e) => {
                warn!("Chip Authentication with key {:?} failed: {e}", public_key.key_id);
                failures.push(e.to_string());
            }
        }
    }

    if failures.is_empty() {
        return CheckResult::not_present("EF.DG14 announces no chip authentication key");
    }
    CheckResult::failed(failures.join("; "))
}

fn authenticate_with_key<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    public_key: &ChipAuthenticationPublicKeyInfo,
    info: Option<&ChipAuthenticationInfo>,
) -> Result<EncryptionAlgorithm, EmrtdError> {
    if public_key.key_agreement() != Some(KeyAgreement::Ecdh) {
        error!("Chip Authentication key {} is not an ECDH key", public_key.protocol);
        return Err(EmrtdError::UnsupportedAlgorithm(public_key.protocol.clone()));
    }
    let cipher = info.and_then(|info| info.cipher().map(|alg| (info, alg)));

    let chip_key = PKey::public_key_from_der(&public_key.subject_public_key_info)
        .and_then(|key| key.ec_key())
        .map_err(|e| {
            error!("Chip Authentication public key does not decode: {e}");
            EmrtdError::OpensslErrorStack(e)
        })?;
    let mut curve = Curve::new(chip_key.group())?;
    let private = curve.random_scalar(comms.rng())?;
    let ephemeral = curve.mul_generator(&private)?;
    let ephemeral = curve.encode(&ephemeral)?;
    let shared = curve.mul(chip_key.public_key(), &private)?;
    let secret = curve.x_coordinate(&shared)?;
    trace!("Terminal ephemeral key: {}", crate::bytes2hex(&ephemeral));

    let reference = public_key
        .key_id
        .map(|key_id| data_object(0x84, &key_reference(key_id)))
        .unwrap_or_default();

    let alg = match cipher {
        Some((info, alg)) if alg != EncryptionAlgorithm::DES3 => {
            let mse = [data_object(0x80, &encode_oid(&info.protocol)?), reference].concat();
            comms.send_expect_ok(&APDU::with_data(0x00, 0x22, 0x41, 0xA4, mse, None)?, "MSE:Set AT")?;

            let data = encode_tlv(&[0x7C], &data_object(0x80, &ephemeral));
            let response = comms.send_expect_ok(
                &APDU::with_data(0x00, 0x86, 0x00, 0x00, data, Some(0x00))?,
                "General Authenticate",
            )?;
            // The chip answers an empty template
            dynamic_auth_data(&response)?;
            alg
        }
        _ => {
            let kat = [data_object(0x91, &ephemeral), reference].concat();
            comms.send_expect_ok(&APDU::with_data(0x00, 0x22, 0x41, 0xA6, kat, None)?, "MSE:Set KAT")?;
            EncryptionAlgorithm::DES3
        }
    };

    let ks_enc = compute_key(&secret, KeyType::Encryption, alg)?;
    let ks_mac = compute_key(&secret, KeyType::Mac, alg)?;
    comms.transition(SecureChannelState::ChipAuthenticated(SessionKeys::with_zero_ssc(
        alg, ks_enc, ks_mac,
    )?))?;
    Ok(alg)
}
