//! Symmetric primitives shared by BAC, PACE, Chip Authentication and secure messaging.
//!
//! Calculations follow ICAO Doc 9303-11 Section 9.7 and 9.8:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use crate::EmrtdError;
use alloc::{format, vec, vec::Vec};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use cmac::{Cmac, Mac};
use core::iter;
use openssl::hash::MessageDigest;
use rasn::types::Oid;
use sha1_checked::Sha1;
use sha2::{Digest, Sha256};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encryption,
    Mac,
    /// PACE password key `K_pi`.
    Password,
}

impl KeyType {
    fn counter(self) -> &'static [u8] {
        match self {
            Self::Encryption => b"\x00\x00\x00\x01",
            Self::Mac => b"\x00\x00\x00\x02",
            Self::Password => b"\x00\x00\x00\x03",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    DES3,
    AES128,
    AES192,
    AES256,
}

impl EncryptionAlgorithm {
    /// Block length, which is also the secure messaging padding length and SSC length.
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::DES3 => 8,
            Self::AES128 | Self::AES192 | Self::AES256 => 16,
        }
    }

    #[must_use]
    pub fn mac_algorithm(self) -> MacAlgorithm {
        match self {
            Self::DES3 => MacAlgorithm::DES,
            Self::AES128 | Self::AES192 | Self::AES256 => MacAlgorithm::AESCMAC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// ISO/IEC 9797-1 MAC algorithm 3 (retail MAC) with DES.
    DES,
    /// AES-CMAC truncated to 8 bytes.
    AESCMAC,
}

/// Generates a key seed from the given secret by taking its SHA-1.
///
/// BAC uses the first 16 bytes of the result, PACE uses all 20.
///
/// # Errors
///
/// `EmrtdError` if SHA-1 detects a collision attack.
pub(crate) fn generate_key_seed(secret: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    let hash_result = Sha1::try_digest(secret);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during generate_key_seed had collision");
        return Err(EmrtdError::CalculateHashError(
            "SHA1 hash calculation during generate_key_seed had collision",
        ));
    }
    Ok(hash_result.hash().as_slice().to_vec())
}

fn check_block_input(
    key_len: usize,
    expected_key_len: usize,
    data_len: usize,
    block_size: usize,
) -> Result<(), EmrtdError> {
    if key_len != expected_key_len {
        error!("Wrong key size for cipher operation, expected {expected_key_len}, found {key_len}");
        return Err(EmrtdError::InvalidArgument("Wrong key size for cipher operation"));
    }
    if data_len % block_size != 0 {
        error!("Wrong data size for cipher operation, expected a multiple of {block_size}, found {data_len}");
        return Err(EmrtdError::InvalidArgument("Wrong data size for cipher operation"));
    }
    Ok(())
}

/// Encrypts block aligned data using the specified block cipher and mode.
///
/// # Errors
///
/// `EmrtdError` if the key, IV or data length does not fit the cipher.
pub(crate) fn encrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    check_block_input(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    let iv = match iv {
        Some(iv) if iv.len() != CM::iv_size() => {
            error!(
                "Wrong IV size for cipher encryption, expected {}, found {}",
                CM::iv_size(),
                iv.len()
            );
            return Err(EmrtdError::InvalidArgument(
                "Wrong IV size for cipher encryption",
            ));
        }
        Some(iv) => iv.to_vec(),
        None => vec![0; CM::iv_size()],
    };

    Ok(CM::new(key.into(), iv.as_slice().into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Encrypts block aligned data in Electronic Codebook (ECB) mode.
pub(crate) fn encrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockEncryptMut + KeyInit,
{
    check_block_input(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts block aligned data using the specified block cipher and mode.
///
/// # Errors
///
/// `EmrtdError` if the key, IV or data length does not fit the cipher.
pub(crate) fn decrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    check_block_input(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    let iv = match iv {
        Some(iv) if iv.len() != CM::iv_size() => {
            error!(
                "Wrong IV size for cipher decryption, expected {}, found {}",
                CM::iv_size(),
                iv.len()
            );
            return Err(EmrtdError::InvalidArgument(
                "Wrong IV size for cipher decryption",
            ));
        }
        Some(iv) => iv.to_vec(),
        None => vec![0; CM::iv_size()],
    };

    CM::new(key.into(), iv.as_slice().into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(EmrtdError::UnpadError)
}

/// Decrypts block aligned data in Electronic Codebook (ECB) mode.
pub(crate) fn decrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, EmrtdError>
where
    CM: BlockDecryptMut + KeyInit,
{
    check_block_input(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    CM::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(EmrtdError::UnpadError)
}

/// CBC encryption with the cipher of the negotiated suite.
pub(crate) fn encrypt_cbc(
    alg: EncryptionAlgorithm,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match alg {
        EncryptionAlgorithm::DES3 => encrypt::<cbc::Encryptor<des::TdesEde3>>(key, Some(iv), data),
        EncryptionAlgorithm::AES128 => encrypt::<cbc::Encryptor<aes::Aes128>>(key, Some(iv), data),
        EncryptionAlgorithm::AES192 => encrypt::<cbc::Encryptor<aes::Aes192>>(key, Some(iv), data),
        EncryptionAlgorithm::AES256 => encrypt::<cbc::Encryptor<aes::Aes256>>(key, Some(iv), data),
    }
}

/// CBC decryption with the cipher of the negotiated suite.
pub(crate) fn decrypt_cbc(
    alg: EncryptionAlgorithm,
    key: &[u8],
    iv: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match alg {
        EncryptionAlgorithm::DES3 => decrypt::<cbc::Decryptor<des::TdesEde3>>(key, Some(iv), data),
        EncryptionAlgorithm::AES128 => decrypt::<cbc::Decryptor<aes::Aes128>>(key, Some(iv), data),
        EncryptionAlgorithm::AES192 => decrypt::<cbc::Decryptor<aes::Aes192>>(key, Some(iv), data),
        EncryptionAlgorithm::AES256 => decrypt::<cbc::Decryptor<aes::Aes256>>(key, Some(iv), data),
    }
}

/// IV for a secure messaging cryptogram.
///
/// 3DES uses a zero IV, AES uses `E(KSenc, SSC)`.
pub(crate) fn secure_messaging_iv(
    alg: EncryptionAlgorithm,
    ks_enc: &[u8],
    ssc: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    match alg {
        EncryptionAlgorithm::DES3 => Ok(vec![0; 8]),
        EncryptionAlgorithm::AES128 => encrypt_ecb::<ecb::Encryptor<aes::Aes128>>(ks_enc, ssc),
        EncryptionAlgorithm::AES192 => encrypt_ecb::<ecb::Encryptor<aes::Aes192>>(ks_enc, ssc),
        EncryptionAlgorithm::AES256 => encrypt_ecb::<ecb::Encryptor<aes::Aes256>>(ks_enc, ssc),
    }
}

/// Derives a 3DES or AES key from a key seed or shared secret.
///
/// For calculation examples see ICAO Doc 9303-11 Appendix D.1 and G.1.
///
/// # Errors
///
/// `EmrtdError` if SHA-1 detects a collision attack.
pub(crate) fn compute_key(
    key_seed: &[u8],
    key_type: KeyType,
    alg: EncryptionAlgorithm,
) -> Result<Vec<u8>, EmrtdError> {
    let d = [key_seed, key_type.counter()].concat();

    match alg {
        EncryptionAlgorithm::DES3 | EncryptionAlgorithm::AES128 => {
            let hash_result = Sha1::try_digest(&d);
            if hash_result.has_collision() {
                error!("SHA1 hash calculation during compute_key had collision");
                return Err(EmrtdError::CalculateHashError(
                    "SHA1 hash calculation during compute_key had collision",
                ));
            }
            let hash_bytes = hash_result.hash();
            if alg == EncryptionAlgorithm::AES128 {
                return Ok(hash_bytes[..16].to_vec());
            }
            let key_1_2 = des3_adjust_parity_bits(hash_bytes[..16].to_vec());
            match key_type {
                KeyType::Mac => Ok(key_1_2),
                // Two key 3DES is expanded to K1 K2 K1 for TdesEde3
                KeyType::Encryption | KeyType::Password => {
                    Ok([&key_1_2[..], &key_1_2[..8]].concat())
                }
            }
        }
        EncryptionAlgorithm::AES192 => Ok(Sha256::digest(&d)[..24].to_vec()),
        EncryptionAlgorithm::AES256 => Ok(Sha256::digest(&d).to_vec()),
    }
}

/// Computes a MAC of data using the given key and MAC algorithm.
///
/// Retail MAC input must already be padded to 8 bytes. AES-CMAC is applied to
/// `data` as given, secure messaging pads it to 16 bytes beforehand.
///
/// # Errors
///
/// * `EmrtdError` if `key` or `data` length is wrong or cipher operation fails.
pub(crate) fn compute_mac(key: &[u8], data: &[u8], alg: MacAlgorithm) -> Result<Vec<u8>, EmrtdError> {
    match alg {
        MacAlgorithm::DES => {
            if key.len() != 16 {
                error!("Can not compute MAC, MAC key is invalid.");
                return Err(EmrtdError::InvalidMacKeyError(16, key.len()));
            }

            if data.is_empty() || data.len() % 8 != 0 {
                error!("Can not compute MAC, data length is invalid.");
                return Err(EmrtdError::ParseDataError(format!(
                    "MAC input length should be a non zero multiple of 8, but found {}",
                    data.len()
                )));
            }

            let key1 = &key[..8];
            let key2 = &key[8..];

            let mut h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &data[..8])?;
            for block in data[8..].chunks(8) {
                h = encrypt_ecb::<ecb::Encryptor<des::Des>>(key1, &xor_slices(&h, block)?)?;
            }

            encrypt_ecb::<ecb::Encryptor<des::Des>>(
                key1,
                &decrypt_ecb::<ecb::Decryptor<des::Des>>(key2, &h)?,
            )
        }
        MacAlgorithm::AESCMAC => {
            let full = match key.len() {
                16 => {
                    let mut mac = <Cmac<aes::Aes128> as Mac>::new_from_slice(key)
                        .map_err(|_| EmrtdError::InvalidMacKeyError(16, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                24 => {
                    let mut mac = <Cmac<aes::Aes192> as Mac>::new_from_slice(key)
                        .map_err(|_| EmrtdError::InvalidMacKeyError(24, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                32 => {
                    let mut mac = <Cmac<aes::Aes256> as Mac>::new_from_slice(key)
                        .map_err(|_| EmrtdError::InvalidMacKeyError(32, key.len()))?;
                    mac.update(data);
                    mac.finalize().into_bytes().to_vec()
                }
                other => {
                    error!("Can not compute CMAC, key length {other} is not an AES key length");
                    return Err(EmrtdError::InvalidMacKeyError(16, other));
                }
            };
            Ok(full[..8].to_vec())
        }
    }
}

/// XORs two byte slices of equal length.
///
/// # Errors
///
/// * `EmrtdError` if input `a` and `b` have different lengths.
pub(crate) fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, EmrtdError> {
    if a.len() == b.len() {
        return Ok(a.iter().zip(b.iter()).map(|(&x, &y)| x ^ y).collect());
    }
    error!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    );
    Err(EmrtdError::ParseDataError(format!(
        "XORed slices must have the same length, found {}, {}",
        a.len(),
        b.len()
    )))
}

/// Pads the input data using ISO/IEC 9797-1 padding method 2.
///
/// # Errors
///
/// * `EmrtdError` if `pad_to` is 0.
pub(crate) fn padding_method_2(data: &[u8], pad_to: usize) -> Result<Vec<u8>, EmrtdError> {
    if pad_to == 0 {
        error!("pad_to must be greater than 0, found {}", pad_to);
        return Err(EmrtdError::InvalidArgument("pad_to must be greater than 0"));
    }

    let mut data = data.to_vec();
    data.push(0x80);
    if data.len() % pad_to != 0 {
        let padding_len = pad_to - (data.len() % pad_to);
        data.extend(iter::repeat(0).take(padding_len));
    }
    Ok(data)
}

/// Removes padding method 2 if present, otherwise returns the data unchanged.
pub(crate) fn remove_padding(data: &[u8]) -> &[u8] {
    let trimmed_len = data.iter().rposition(|&b| b != 0x00);
    match trimmed_len {
        Some(i) if data[i] == 0x80 => &data[..i],
        _ => data,
    }
}

/// Sets odd parity on every byte of a DES key.
pub(crate) fn des3_adjust_parity_bits(mut key: Vec<u8>) -> Vec<u8> {
    for byte in &mut key {
        let upper = *byte & 0xFE;
        *byte = if upper.count_ones() % 2 == 0 { upper | 1 } else { upper };
    }
    key
}

/// Maps a digest algorithm OID to the openssl digest.
///
/// # Errors
///
/// * `EmrtdError` if an unsupported OID is given.
pub(crate) fn oid2digestalg(oid: &rasn::types::ObjectIdentifier) -> Result<MessageDigest, EmrtdError> {
    let digest_alg_oid_dict: [(&Oid, MessageDigest); 6] = [
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 4]),
            MessageDigest::sha224(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 3]),
            MessageDigest::sha512(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 2]),
            MessageDigest::sha384(),
        ),
        (
            Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]),
            MessageDigest::sha256(),
        ),
        (Oid::const_new(&[1, 3, 14, 3, 2, 26]), MessageDigest::sha1()),
        (
            Oid::const_new(&[1, 2, 840, 113549, 2, 5]),
            MessageDigest::md5(),
        ),
    ];
    digest_alg_oid_dict
        .into_iter()
        .find(|(digest_oid, _)| oid.eq(*digest_oid))
        .map(|(_, digest)| digest)
        .ok_or_else(|| {
            error!("Invalid OID while finding a digest algorithm");
            EmrtdError::InvalidOidError()
        })
}
