//! Command transport towards the chip and ISO 7816-4 secure messaging.
//!
//! For more details and examples, see ICAO Doc 9303-11 Section 9.8 and Appendix D.4
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use crate::{
    apdu::{data_object, EmrtdCard, APDU},
    asn1::{get_asn1_child, len2int, next_tlv, next_tlv_raw},
    bytes2hex,
    crypto::{
        compute_mac, decrypt_cbc, encrypt_cbc, padding_method_2, remove_padding,
        secure_messaging_iv, EncryptionAlgorithm,
    },
    int2asn1len, EmrtdError,
};
use alloc::{format, vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use core::fmt;
use pcsc::Attribute::AtrString;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use serde::Serialize;
use tracing::{error, info, trace};

/// Largest READ BINARY chunk whose protected response still fits a short APDU.
pub const DEFAULT_MAX_READ_LENGTH: u8 = 0xDF;

/// Session keys and Send Sequence Counter of an established secure channel.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub(crate) alg: EncryptionAlgorithm,
    ks_enc: Vec<u8>,
    ks_mac: Vec<u8>,
    ssc: Vec<u8>,
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// # Errors
    ///
    /// `EmrtdError::InvalidArgument` if the SSC length does not match the cipher block.
    pub(crate) fn new(
        alg: EncryptionAlgorithm,
        ks_enc: Vec<u8>,
        ks_mac: Vec<u8>,
        ssc: Vec<u8>,
    ) -> Result<Self, EmrtdError> {
        if ssc.len() != alg.block_size() {
            error!(
                "SSC length {} does not match the {alg:?} block size",
                ssc.len()
            );
            return Err(EmrtdError::InvalidArgument("SSC length does not match the cipher"));
        }
        Ok(Self {
            alg,
            ks_enc,
            ks_mac,
            ssc,
        })
    }

    /// Keys with a zeroed SSC, as established by PACE and Chip Authentication.
    pub(crate) fn with_zero_ssc(
        alg: EncryptionAlgorithm,
        ks_enc: Vec<u8>,
        ks_mac: Vec<u8>,
    ) -> Result<Self, EmrtdError> {
        Self::new(alg, ks_enc, ks_mac, vec![0; alg.block_size()])
    }

    #[must_use]
    pub fn algorithm(&self) -> EncryptionAlgorithm {
        self.alg
    }

    pub(crate) fn ks_mac(&self) -> &[u8] {
        &self.ks_mac
    }

    fn increment_ssc(&mut self) -> Result<(), EmrtdError> {
        // Big endian increment with carry, the SSC is 8 or 16 bytes
        for byte in self.ssc.iter_mut().rev() {
            let (value, carry) = byte.overflowing_add(1);
            *byte = value;
            if !carry {
                return Ok(());
            }
        }
        error!("SSC overflew");
        Err(EmrtdError::OverflowSscError())
    }

    fn protect(&mut self, apdu: &APDU) -> Result<Vec<u8>, EmrtdError> {
        self.increment_ssc()?;
        let pad_len = self.alg.block_size();

        let mut apdu = apdu.clone();
        apdu.cla |= 0x0C;

        let mut payload = Vec::new();
        if let Some(cdata) = &apdu.cdata {
            let iv = secure_messaging_iv(self.alg, &self.ks_enc, &self.ssc)?;
            let encrypted_data =
                encrypt_cbc(self.alg, &self.ks_enc, &iv, &padding_method_2(cdata, pad_len)?)?;

            if apdu.ins % 2 == 0 {
                // Even INS, cryptogram with padding content indicator 01
                payload.extend(data_object(0x87, &[&[0x01][..], &encrypted_data[..]].concat()));
            } else {
                payload.extend(data_object(0x85, &encrypted_data));
            }
        }

        let mut extended = false;
        if let Some(le) = &apdu.le {
            let le_value = match le.as_slice() {
                [0x00, hi, lo] | [hi, lo] => {
                    extended = true;
                    vec![*hi, *lo]
                }
                other => other.to_vec(),
            };
            payload.extend(data_object(0x97, &le_value));
        }

        let padded_header = padding_method_2(&apdu.get_command_header(), pad_len)?;
        let n = padding_method_2(&[&self.ssc[..], &padded_header[..], &payload[..]].concat(), pad_len)?;
        let cc = compute_mac(&self.ks_mac, &n, self.alg.mac_algorithm())?;
        payload.extend(data_object(0x8E, &cc));

        if payload.len() > 0xFF {
            extended = true;
        }
        let protected_apdu = if extended {
            let len = u16::try_from(payload.len()).map_err(EmrtdError::IntCastError)?;
            [
                apdu.get_command_header(),
                [&[0x00][..], &len.to_be_bytes()[..]].concat(),
                payload,
                vec![0x00, 0x00],
            ]
            .concat()
        } else {
            [
                apdu.get_command_header(),
                vec![u8::try_from(payload.len()).map_err(EmrtdError::IntCastError)?],
                payload,
                vec![0x00],
            ]
            .concat()
        };
        Ok(protected_apdu)
    }

    fn unprotect(&mut self, rapdu: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        self.increment_ssc()?;
        let pad_len = self.alg.block_size();

        let mut cryptogram: Option<&[u8]> = None;
        let mut has_padding_indicator = false;
        let mut mac_input = self.ssc.clone();
        let mut do8e: Option<&[u8]> = None;

        trace!("R_APDU: {}", bytes2hex(rapdu));

        let mut rest = rapdu;
        while !rest.is_empty() {
            let (tag, value, raw, next) = next_tlv_raw(rest)?;
            match tag {
                0x85 | 0x87 => {
                    cryptogram = Some(value);
                    has_padding_indicator = tag == 0x87;
                    mac_input.extend_from_slice(raw);
                }
                0x99 => mac_input.extend_from_slice(raw),
                0x8E => do8e = Some(value),
                _ => {
                    error!("Tag {tag:02X} not supported in protected R_APDU");
                    return Err(EmrtdError::ParseDataError(format!(
                        "Tag {tag:02X} not supported in protected R_APDU"
                    )));
                }
            }
            rest = next;
        }

        let Some(do8e) = do8e else {
            error!("Protected R_APDU does not contain a MAC");
            return Err(EmrtdError::VerifyMacError());
        };
        let k = padding_method_2(&mac_input, pad_len)?;
        let cc = compute_mac(&self.ks_mac, &k, self.alg.mac_algorithm())?;
        if !constant_time_eq(&cc, do8e) {
            error!("MAC verification failed");
            return Err(EmrtdError::VerifyMacError());
        }

        match cryptogram {
            Some(encrypted) if !encrypted.is_empty() => {
                let encrypted = if has_padding_indicator {
                    &encrypted[1..]
                } else {
                    encrypted
                };
                let iv = secure_messaging_iv(self.alg, &self.ks_enc, &self.ssc)?;
                let decrypted_padded_data = decrypt_cbc(self.alg, &self.ks_enc, &iv, encrypted)?;
                Ok(remove_padding(&decrypted_padded_data).to_vec())
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// PACE mapping of the nonce to ephemeral domain parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaceMapping {
    Generic,
    Integrated,
    ChipAuthentication,
}

/// Protection of the channel to the chip. Transitions only move forward:
/// `Unestablished` to `Unprotected`, `Bac` or `Pace`, then `Bac` or `Pace` to
/// `ChipAuthenticated`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecureChannelState {
    #[default]
    Unestablished,
    /// The chip serves its files without access control.
    Unprotected,
    Bac(SessionKeys),
    Pace {
        keys: SessionKeys,
        mapping: PaceMapping,
    },
    ChipAuthenticated(SessionKeys),
}

impl SecureChannelState {
    #[must_use]
    pub fn is_established(&self) -> bool {
        !matches!(self, Self::Unestablished)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unestablished => "Unestablished",
            Self::Unprotected => "Unprotected",
            Self::Bac(_) => "BAC",
            Self::Pace { .. } => "PACE",
            Self::ChipAuthenticated(_) => "ChipAuthenticated",
        }
    }

    fn keys_mut(&mut self) -> Option<&mut SessionKeys> {
        match self {
            Self::Bac(keys) | Self::Pace { keys, .. } | Self::ChipAuthenticated(keys) => Some(keys),
            Self::Unestablished | Self::Unprotected => None,
        }
    }

    #[must_use]
    pub fn keys(&self) -> Option<&SessionKeys> {
        match self {
            Self::Bac(keys) | Self::Pace { keys, .. } | Self::ChipAuthenticated(keys) => Some(keys),
            Self::Unestablished | Self::Unprotected => None,
        }
    }

    fn allows(&self, next: &Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Unestablished,
                Self::Unprotected | Self::Bac(_) | Self::Pace { .. }
            ) | (Self::Bac(_) | Self::Pace { .. }, Self::ChipAuthenticated(_))
        )
    }
}

/// A session with one chip over one `EmrtdCard`.
pub struct EmrtdComms<C: EmrtdCard, R: RngCore + CryptoRng + Default = OsRng> {
    rng: R,
    card: C,
    state: SecureChannelState,
    max_read_length: u8,
}

impl<C: EmrtdCard, R: RngCore + CryptoRng + Default> EmrtdComms<C, R> {
    #[must_use]
    pub fn new(card: C) -> Self {
        Self {
            rng: R::default(),
            card,
            state: SecureChannelState::Unestablished,
            max_read_length: DEFAULT_MAX_READ_LENGTH,
        }
    }

    /// Overrides the READ BINARY chunk length, `0` is treated as the default.
    pub fn set_max_read_length(&mut self, max_read_length: u8) {
        self.max_read_length = if max_read_length == 0 {
            DEFAULT_MAX_READ_LENGTH
        } else {
            max_read_length
        };
    }

    #[must_use]
    pub fn state(&self) -> &SecureChannelState {
        &self.state
    }

    pub(crate) fn rng(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Moves the channel to `next`.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidState` if the transition would go backwards.
    pub(crate) fn transition(&mut self, next: SecureChannelState) -> Result<(), EmrtdError> {
        if !self.state.allows(&next) {
            error!(
                "Secure channel can not move from {} to {}",
                self.state.name(),
                next.name()
            );
            return Err(EmrtdError::InvalidState("secure channel transition is not allowed"));
        }
        info!(
            "Secure channel moved from {} to {}",
            self.state.name(),
            next.name()
        );
        self.state = next;
        Ok(())
    }

    /// Retrieves the Answer to Reset (ATR) from the smart card.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` wrapping `PcscError` in case of failure.
    pub fn get_atr(&mut self) -> Result<Vec<u8>, EmrtdError> {
        self.card
            .get_attribute_owned(AtrString)
            .map_err(EmrtdError::PcscError)
    }

    fn transmit(&mut self, apdu_bytes: &[u8]) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = self
            .card
            .transmit(apdu_bytes, &mut response_buffer)
            .map_err(|err| {
                error!("Transmitting APDU failed: {err}");
                EmrtdError::PcscError(err)
            })?;
        let [data @ .., sw1, sw2] = response else {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                response.len()
            );
            return Err(EmrtdError::InvalidResponseError());
        };
        Ok((data.to_vec(), [*sw1, *sw2]))
    }

    /// Sends an APDU and receives the response.
    ///
    /// The APDU is wrapped in secure messaging whenever the channel holds session keys,
    /// otherwise it is sent in plaintext.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` in case of failure during sending or receiving an APDU.
    pub fn send(&mut self, apdu: &APDU) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let Some(keys) = self.state.keys_mut() else {
            let apdu_bytes = apdu.to_bytes();
            trace!("Sending APDU: {}", bytes2hex(&apdu_bytes));
            let (data, status) = self.transmit(&apdu_bytes)?;
            trace!(
                "APDU response ({:02X}{:02X}): {}",
                status[0],
                status[1],
                bytes2hex(&data)
            );
            return Ok((data, status));
        };

        let protected_apdu = keys.protect(apdu)?;
        trace!("Sending Protected APDU: {}", bytes2hex(&protected_apdu));
        let (response, status) = self.transmit(&protected_apdu)?;

        let Some(keys) = self.state.keys_mut() else {
            error!("Session keys vanished while sending");
            return Err(EmrtdError::InvalidState("session keys vanished while sending"));
        };

        // Some chips answer errors without secure messaging objects, the SSC still counts the response
        if response.is_empty() && status != [0x90, 0x00] {
            trace!("Unprotected error response ({:02X}{:02X})", status[0], status[1]);
            keys.increment_ssc()?;
            return Ok((Vec::new(), status));
        }

        let data = keys.unprotect(&response)?;
        trace!(
            "APDU response ({:02X}{:02X}): {}",
            status[0],
            status[1],
            bytes2hex(&data)
        );
        Ok((data, status))
    }

    /// Sends an APDU and fails on anything but `9000`.
    pub(crate) fn send_expect_ok(
        &mut self,
        apdu: &APDU,
        context: &str,
    ) -> Result<Vec<u8>, EmrtdError> {
        match self.send(apdu)? {
            (data, [0x90, 0x00]) => Ok(data),
            (_, [sw1, sw2]) => {
                error!("Received invalid SW during {context}: {sw1:02X} {sw2:02X}");
                Err(EmrtdError::RecvApduError(sw1, sw2))
            }
        }
    }

    /// Selects the eMRTD application using AID `A0000002471001`.
    ///
    /// # Errors
    ///
    /// `EmrtdError` in case of failure during sending the APDU.
    pub fn select_emrtd_application(&mut self) -> Result<(), EmrtdError> {
        let aid = b"\xA0\x00\x00\x02\x47\x10\x01";
        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(aid)
        );
        let apdu = APDU::new(
            b'\x00',
            b'\xA4',
            b'\x04',
            b'\x0C',
            Some(int2asn1len(aid.len())),
            Some(aid.to_vec()),
            None,
        )?;
        self.send_expect_ok(&apdu, "Select eMRTD Application")
            .map(|_| ())
    }

    /// Selects an Elementary File by its two byte File Identifier.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` in case of failure during sending the APDU.
    pub fn select_ef(&mut self, fid: &[u8; 2], fname: &str) -> Result<(), EmrtdError> {
        trace!("Selecting File {fname}: {}...", bytes2hex(fid));
        let apdu = APDU::new(
            b'\x00',
            b'\xA4',
            b'\x02',
            b'\x0C',
            Some(int2asn1len(fid.len())),
            Some(fid.to_vec()),
            None,
        )?;
        self.send_expect_ok(&apdu, "Select EF").map(|_| ())
    }

    /// READ BINARY at `offset`. Offsets beyond 15 bits use the odd instruction with an
    /// offset data object.
    fn read_binary(&mut self, offset: usize, le: u8) -> Result<Vec<u8>, EmrtdError> {
        if offset <= 0x7FFF {
            let offset_bytes = u16::try_from(offset)
                .map_err(EmrtdError::IntCastError)?
                .to_be_bytes();
            let apdu = APDU::new(
                0x00,
                0xB0,
                offset_bytes[0],
                offset_bytes[1],
                None,
                None,
                Some(vec![le]),
            )?;
            return self.send_expect_ok(&apdu, "Read Binary");
        }

        let offset_value: Vec<u8> = offset
            .to_be_bytes()
            .into_iter()
            .skip_while(|&b| b == 0)
            .collect();
        let apdu = APDU::with_data(0x00, 0xB1, 0x00, 0x00, data_object(0x54, &offset_value), Some(le))?;
        let response = self.send_expect_ok(&apdu, "Read Binary with offset object")?;
        let (tag, value, _) = next_tlv(&response)?;
        if tag != 0x53 {
            error!("Read Binary with offset object returned tag {tag:02X} instead of 53");
            return Err(EmrtdError::InvalidResponseError());
        }
        Ok(value.to_vec())
    }

    /// Reads the currently selected EF.
    ///
    /// Reads the first four bytes to learn the length of the outer TLV and then
    /// reads the remaining bytes in chunks. `select_ef` must be called first.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` in case of failure.
    pub fn read_data_from_ef(&mut self, fname: &str) -> Result<Vec<u8>, EmrtdError> {
        trace!("Reading first 4 bytes from {fname}...");
        let mut data = self.read_binary(0, 4)?;
        if data.len() != 4 {
            error!(
                "Card response length should be equal to the requested amount 4, found {}",
                data.len()
            );
            return Err(EmrtdError::InvalidResponseError());
        }

        // Lengths of 2^24 and more need more than the first four bytes
        let header_len = if data[1] & 0x80 == 0 {
            2
        } else {
            2 + usize::from(data[1] & 0x7F)
        };
        if header_len > data.len() {
            let le = u8::try_from(header_len - data.len()).map_err(EmrtdError::IntCastError)?;
            let more = self.read_binary(data.len(), le)?;
            data.extend_from_slice(&more);
        }

        let data_len = {
            let (tl, v) = len2int(&data, 1)?;
            tl.checked_add(v)
                .ok_or(EmrtdError::ParseDataError("EF length overflows".into()))?
        };

        let mut offset = data.len();
        trace!("Reading {data_len} bytes from {fname}...");
        while offset < data_len {
            let remaining = data_len - offset;
            let le = if remaining < usize::from(self.max_read_length) {
                u8::try_from(remaining).map_err(EmrtdError::IntCastError)?
            } else {
                self.max_read_length
            };

            let data_read = self.read_binary(offset, le)?;
            if data_read.is_empty() {
                error!("Requested bytes while reading {fname} but received 0 bytes.");
                return Err(EmrtdError::InvalidResponseError());
            }

            data.extend_from_slice(&data_read);
            offset += data_read.len();
        }

        if offset != data_len {
            error!("Error while reading {fname}, expected {data_len} bytes, found {offset}.");
            return Err(EmrtdError::InvalidResponseError());
        }

        Ok(data)
    }

    /// Selects and reads an EF in one go.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if either step fails.
    pub fn read_ef(&mut self, fid: &[u8; 2], fname: &str) -> Result<Vec<u8>, EmrtdError> {
        self.select_ef(fid, fname)?;
        let data = self.read_data_from_ef(fname)?;
        trace!("Data from the {fname}: {}", bytes2hex(&data));
        Ok(data)
    }
}

/// Splits the value off a dynamic authentication data template `7C`.
pub(crate) fn dynamic_auth_data(response: &[u8]) -> Result<&[u8], EmrtdError> {
    if response.first() != Some(&0x7C) {
        error!("Response is not a dynamic authentication data object");
        return Err(EmrtdError::InvalidResponseError());
    }
    get_asn1_child(response, 1).map(|(value, _)| value)
}
