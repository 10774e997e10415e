//! Opening the chip: PACE when EF.CardAccess offers it, then an unprotected EF.COM
//! probe, then Basic Access Control.
//!
//! BAC is specified in ICAO Doc 9303-11 Section 4.3 with a worked example in Appendix D.
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use crate::{
    apdu::{EmrtdCard, APDU},
    comms::{EmrtdComms, PaceMapping, SecureChannelState, SessionKeys},
    crypto::{
        compute_key, compute_mac, decrypt, encrypt, generate_key_seed, padding_method_2,
        xor_slices, EncryptionAlgorithm, KeyType, MacAlgorithm,
    },
    error::is_denial_status,
    lds::DataGroupId,
    mrz::MrzSeed,
    pace::establish_pace,
    security_info::{KeyAgreement, PaceInfo, SecurityInfos},
    CardServiceError, ChipError, EmrtdError,
};
use alloc::{format, string::ToString, vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

/// Access protocol that opened the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccessProtocol {
    Bac,
    Pace(PaceMapping),
}

/// Result of opening the chip.
#[derive(Debug)]
pub enum OpenOutcome {
    /// BAC or PACE succeeded, the channel is protected.
    Verified(AccessProtocol),
    /// The chip serves EF.COM without access control.
    UnverifiedFallback,
    Failed(ChipError),
}

impl OpenOutcome {
    #[must_use]
    pub fn is_open(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// What was learnt while opening the chip.
#[derive(Debug)]
pub struct Establishment {
    pub outcome: OpenOutcome,
    /// EF.CardAccess, if the chip has one.
    pub card_access: Option<SecurityInfos>,
    /// EF.COM when it was already read by the unprotected probe.
    pub ef_com: Option<Vec<u8>>,
    /// Whether PACE was tried and failed before falling back.
    pub pace_failed: bool,
}

/// Opens a secure channel with the key material of the MRZ.
#[derive(Debug, Clone, Copy)]
pub struct ChipSessionEstablisher {
    attempt_pace: bool,
}

impl Default for ChipSessionEstablisher {
    fn default() -> Self {
        Self { attempt_pace: true }
    }
}

impl ChipSessionEstablisher {
    #[must_use]
    pub fn new(attempt_pace: bool) -> Self {
        Self { attempt_pace }
    }

    /// Opens the chip.
    ///
    /// PACE is tried first when EF.CardAccess advertises it. A refused password ends
    /// the attempt with `ChipError::AccessDenied`, any other PACE failure falls back.
    /// Without PACE, EF.COM is read in the clear and BAC is only performed when that
    /// read is refused.
    pub fn establish<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
        &self,
        comms: &mut EmrtdComms<C, R>,
        seed: &MrzSeed,
    ) -> Establishment {
        let mut establishment = Establishment {
            outcome: OpenOutcome::UnverifiedFallback,
            card_access: None,
            ef_com: None,
            pace_failed: false,
        };

        let mrz_key = match seed.mrz_key() {
            Ok(mrz_key) => mrz_key,
            Err(e) => {
                error!("Can not build the access key: {e}");
                establishment.outcome = OpenOutcome::Failed(ChipError::BacFailure(e.to_string()));
                return establishment;
            }
        };

        establishment.card_access = read_card_access(comms);

        if self.attempt_pace {
            if let Some(info) = establishment.card_access.as_ref().and_then(preferred_pace_info) {
                match establish_pace(comms, &mrz_key, info) {
                    Ok(()) => {
                        establishment.outcome = match comms.select_emrtd_application() {
                            Ok(()) => OpenOutcome::Verified(AccessProtocol::Pace(PaceMapping::Generic)),
                            Err(e) => OpenOutcome::Failed(e.into()),
                        };
                        return establishment;
                    }
                    Err(e @ ChipError::AccessDenied(_)) => {
                        establishment.outcome = OpenOutcome::Failed(e);
                        return establishment;
                    }
                    Err(e) => {
                        warn!("PACE failed, falling back to BAC: {e}");
                        establishment.pace_failed = true;
                    }
                }
            }
        }

        if let Err(e) = comms.select_emrtd_application() {
            establishment.outcome = OpenOutcome::Failed(e.into());
            return establishment;
        }

        match comms.read_ef(&DataGroupId::Com.fid(), "EF.COM") {
            Ok(ef_com) => {
                warn!("Chip serves EF.COM without access control");
                establishment.outcome = match comms.transition(SecureChannelState::Unprotected) {
                    Ok(()) => OpenOutcome::UnverifiedFallback,
                    Err(e) => OpenOutcome::Failed(e.into()),
                };
                establishment.ef_com = Some(ef_com);
                return establishment;
            }
            Err(e) => debug!("EF.COM is protected, performing BAC: {e}"),
        }

        establishment.outcome = match establish_bac(comms, mrz_key.as_bytes()) {
            Ok(()) => OpenOutcome::Verified(AccessProtocol::Bac),
            Err(e) => OpenOutcome::Failed(classify_bac(e)),
        };
        establishment
    }
}

/// The first advertised PACE protocol this crate implements, else the first one.
fn preferred_pace_info(infos: &SecurityInfos) -> Option<&PaceInfo> {
    infos
        .pace_infos()
        .find(|info| {
            info.mapping() == Some(PaceMapping::Generic)
                && info.key_agreement() == Some(KeyAgreement::Ecdh)
        })
        .or_else(|| infos.pace_infos().next())
}

/// Reads EF.CardAccess from the master file. Absence is normal for BAC only chips.
fn read_card_access<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
) -> Option<SecurityInfos> {
    let data = match comms.read_ef(&DataGroupId::CardAccess.fid(), "EF.CardAccess") {
        Ok(data) => data,
        Err(e) => {
            debug!("No EF.CardAccess: {e}");
            return None;
        }
    };
    match SecurityInfos::from_card_access(&data) {
        Ok(infos) => Some(infos),
        Err(e) => {
            warn!("Ignoring malformed EF.CardAccess: {e}");
            None
        }
    }
}

fn classify_bac(err: EmrtdError) -> ChipError {
    match err {
        EmrtdError::RecvApduError(sw1, sw2) if is_denial_status(sw1, sw2) => {
            ChipError::AccessDenied(format!("chip refused BAC with status {sw1:02X}{sw2:02X}"))
        }
        EmrtdError::PcscError(e) => ChipError::CardService(CardServiceError::Transport(e)),
        other => ChipError::BacFailure(other.to_string()),
    }
}

/// Establishes BAC session keys and moves the channel to `Bac`.
///
/// `secret` is the MRZ key, document number, birth date and expiry date each
/// followed by its check digit.
///
/// # Errors
///
/// * `EmrtdError` in case of failure during BAC session key establishment.
pub fn establish_bac<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    secret: &[u8],
) -> Result<(), EmrtdError> {
    let ba_key_seed = &generate_key_seed(secret)?[..16];

    // Calculate the basic access keys (ba_key_enc and ba_key_mac)
    trace!("Computing basic access keys...");
    let ba_key_enc = compute_key(ba_key_seed, KeyType::Encryption, EncryptionAlgorithm::DES3)?;
    let ba_key_mac = compute_key(ba_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?;

    // AUTHENTICATION AND ESTABLISHMENT OF SESSION KEYS
    trace!("Establishing session keys...");
    let apdu = APDU::new(b'\x00', b'\x84', b'\x00', b'\x00', None, None, Some(vec![b'\x08']))?;
    let rnd_ic = comms.send_expect_ok(&apdu, "Get Challenge")?;
    if rnd_ic.len() != 8 {
        error!("Challenge should be 8 bytes, found {}", rnd_ic.len());
        return Err(EmrtdError::InvalidResponseError());
    }

    let mut rnd_ifd: [u8; 8] = [0; 8];
    comms.rng().fill_bytes(&mut rnd_ifd);
    let mut k_ifd: [u8; 16] = [0; 16];
    comms.rng().fill_bytes(&mut k_ifd);

    let e_ifd = encrypt::<cbc::Encryptor<des::TdesEde3>>(
        &ba_key_enc,
        Some(&[0; 8]),
        &[&rnd_ifd[..], &rnd_ic, &k_ifd[..]].concat(),
    )?;
    let m_ifd = compute_mac(&ba_key_mac, &padding_method_2(&e_ifd, 8)?, MacAlgorithm::DES)?;
    let cmd_data = [e_ifd, m_ifd].concat();

    let apdu = APDU::with_data(b'\x00', b'\x82', b'\x00', b'\x00', cmd_data, Some(b'\x28'))?;
    let resp_data_enc = comms.send_expect_ok(&apdu, "External Authenticate")?;
    if resp_data_enc.len() != 40 {
        error!("External Authenticate response should be 40 bytes, found {}", resp_data_enc.len());
        return Err(EmrtdError::InvalidResponseError());
    }
    let (cryptogram, mac) = resp_data_enc.split_at(32);

    let m_ic = compute_mac(&ba_key_mac, &padding_method_2(cryptogram, 8)?, MacAlgorithm::DES)?;
    if !constant_time_eq(&m_ic, mac) {
        error!("MAC verification failed");
        return Err(EmrtdError::VerifyMacError());
    }

    let resp_data = decrypt::<cbc::Decryptor<des::TdesEde3>>(&ba_key_enc, Some(&[0; 8]), cryptogram)?;

    if !constant_time_eq(&resp_data[..8], &rnd_ic) {
        error!("Chip answered with a different challenge");
        return Err(EmrtdError::InvalidResponseError());
    }
    if !constant_time_eq(&resp_data[8..16], &rnd_ifd) {
        error!("Chip did not return the terminal nonce");
        return Err(EmrtdError::InvalidResponseError());
    }

    let k_ic = &resp_data[16..32];
    let ses_key_seed = xor_slices(&k_ifd, k_ic)?;

    let ks_enc = compute_key(&ses_key_seed, KeyType::Encryption, EncryptionAlgorithm::DES3)?;
    let ks_mac = compute_key(&ses_key_seed, KeyType::Mac, EncryptionAlgorithm::DES3)?;
    let ssc = [&rnd_ic[4..], &rnd_ifd[4..]].concat();

    info!("BAC established");
    let keys = SessionKeys::new(EncryptionAlgorithm::DES3, ks_enc, ks_mac, ssc)?;
    comms.transition(SecureChannelState::Bac(keys))
}
