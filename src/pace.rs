//! PACE with ECDH Generic Mapping.
//!
//! Protocol steps follow ICAO Doc 9303-11 Section 4.4 and the worked example of Appendix G.
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use crate::{
    apdu::{data_object, EmrtdCard, APDU},
    asn1::{encode_oid, encode_tlv, next_tlv},
    bytes2hex,
    comms::{dynamic_auth_data, EmrtdComms, PaceMapping, SecureChannelState, SessionKeys},
    crypto::{
        compute_key, compute_mac, decrypt_cbc, generate_key_seed, padding_method_2,
        EncryptionAlgorithm, KeyType, MacAlgorithm,
    },
    error::is_denial_status,
    security_info::{KeyAgreement, PaceInfo},
    ChipError, EmrtdError,
};
use alloc::{format, string::ToString, vec, vec::Vec};
use constant_time_eq::constant_time_eq;
use openssl::{
    bn::{BigNum, BigNumContext, BigNumRef},
    ec::{EcGroup, EcGroupRef, EcPoint, EcPointRef, PointConversionForm},
    nid::Nid,
};
use rand::{CryptoRng, RngCore};
use tracing::{error, info, trace};

/// Curve of a standardized domain parameter identifier, ICAO Doc 9303-11 Table 6.
///
/// # Errors
///
/// * `EmrtdError::UnsupportedAlgorithm` for DH groups and unknown identifiers.
pub(crate) fn standardized_curve(parameter_id: u64) -> Result<EcGroup, EmrtdError> {
    // openssl names no constants for the brainpool curves, these are the NID_brainpoolP*r1 values
    let nid = match parameter_id {
        8 => Nid::X9_62_PRIME192V1,
        9 => Nid::from_raw(923),
        10 => Nid::SECP224R1,
        11 => Nid::from_raw(925),
        12 => Nid::X9_62_PRIME256V1,
        13 => Nid::from_raw(927),
        14 => Nid::from_raw(929),
        15 => Nid::SECP384R1,
        16 => Nid::from_raw(931),
        17 => Nid::from_raw(933),
        18 => Nid::SECP521R1,
        other => {
            error!("Standardized domain parameters {other} are not an elliptic curve");
            return Err(EmrtdError::UnsupportedAlgorithm(format!(
                "domain parameter id {other}"
            )));
        }
    };
    EcGroup::from_curve_name(nid).map_err(EmrtdError::OpensslErrorStack)
}

/// Elliptic curve arithmetic on one group.
pub(crate) struct Curve<'a> {
    pub(crate) group: &'a EcGroupRef,
    ctx: BigNumContext,
    order: BigNum,
}

impl<'a> Curve<'a> {
    pub(crate) fn new(group: &'a EcGroupRef) -> Result<Self, EmrtdError> {
        let mut ctx = BigNumContext::new().map_err(EmrtdError::OpensslErrorStack)?;
        let mut order = BigNum::new().map_err(EmrtdError::OpensslErrorStack)?;
        group
            .order(&mut order, &mut ctx)
            .map_err(EmrtdError::OpensslErrorStack)?;
        Ok(Self { group, ctx, order })
    }

    /// Length of an encoded field element.
    pub(crate) fn field_len(&self) -> usize {
        (self.group.degree() as usize).div_ceil(8)
    }

    /// Draws a private key in `[1, n - 1]`.
    pub(crate) fn random_scalar<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<BigNum, EmrtdError> {
        let len = usize::try_from(self.order.num_bytes()).map_err(EmrtdError::IntCastError)?;
        let mut bytes = vec![0; len];
        loop {
            rng.fill_bytes(&mut bytes);
            let candidate = BigNum::from_slice(&bytes).map_err(EmrtdError::OpensslErrorStack)?;
            let mut scalar = BigNum::new().map_err(EmrtdError::OpensslErrorStack)?;
            scalar
                .nnmod(&candidate, &self.order, &mut self.ctx)
                .map_err(EmrtdError::OpensslErrorStack)?;
            if scalar.num_bits() > 0 {
                return Ok(scalar);
            }
        }
    }

    /// `scalar * G` on the curve's own generator.
    pub(crate) fn mul_generator(&mut self, scalar: &BigNumRef) -> Result<EcPoint, EmrtdError> {
        let mut point = EcPoint::new(self.group).map_err(EmrtdError::OpensslErrorStack)?;
        point
            .mul_generator(self.group, scalar, &mut self.ctx)
            .map_err(EmrtdError::OpensslErrorStack)?;
        Ok(point)
    }

    /// `scalar * point`.
    pub(crate) fn mul(&mut self, point: &EcPointRef, scalar: &BigNumRef) -> Result<EcPoint, EmrtdError> {
        let mut result = EcPoint::new(self.group).map_err(EmrtdError::OpensslErrorStack)?;
        result
            .mul(self.group, point, scalar, &mut self.ctx)
            .map_err(EmrtdError::OpensslErrorStack)?;
        Ok(result)
    }

    /// `n * G + m * q`.
    pub(crate) fn mul_full(
        &mut self,
        n: &BigNumRef,
        q: &EcPointRef,
        m: &BigNumRef,
    ) -> Result<EcPoint, EmrtdError> {
        let mut result = EcPoint::new(self.group).map_err(EmrtdError::OpensslErrorStack)?;
        result
            .mul_full(self.group, n, q, m, &mut self.ctx)
            .map_err(EmrtdError::OpensslErrorStack)?;
        Ok(result)
    }

    pub(crate) fn encode(&mut self, point: &EcPointRef) -> Result<Vec<u8>, EmrtdError> {
        point
            .to_bytes(self.group, PointConversionForm::UNCOMPRESSED, &mut self.ctx)
            .map_err(EmrtdError::OpensslErrorStack)
    }

    /// Decodes an uncompressed point, rejecting points that are not on the curve.
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> Result<EcPoint, EmrtdError> {
        let point = EcPoint::from_bytes(self.group, bytes, &mut self.ctx).map_err(|e| {
            error!("Invalid public point from the chip: {}", bytes2hex(bytes));
            EmrtdError::OpensslErrorStack(e)
        })?;
        if point.is_infinity(self.group) {
            error!("Chip sent the point at infinity");
            return Err(EmrtdError::InvalidResponseError());
        }
        Ok(point)
    }

    /// x-coordinate of `point`, left padded to the field length.
    pub(crate) fn x_coordinate(&mut self, point: &EcPointRef) -> Result<Vec<u8>, EmrtdError> {
        let mut x = BigNum::new().map_err(EmrtdError::OpensslErrorStack)?;
        let mut y = BigNum::new().map_err(EmrtdError::OpensslErrorStack)?;
        point
            .affine_coordinates(self.group, &mut x, &mut y, &mut self.ctx)
            .map_err(EmrtdError::OpensslErrorStack)?;
        let len = i32::try_from(self.field_len()).map_err(EmrtdError::IntCastError)?;
        x.to_vec_padded(len).map_err(EmrtdError::OpensslErrorStack)
    }
}

/// Authentication token over the other party's ephemeral public key.
pub(crate) fn authentication_token(
    alg: EncryptionAlgorithm,
    ks_mac: &[u8],
    oid: &[u8],
    public_key: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    let template = encode_tlv(
        &[0x7F, 0x49],
        &[encode_tlv(&[0x06], oid), encode_tlv(&[0x86], public_key)].concat(),
    );
    match alg.mac_algorithm() {
        MacAlgorithm::DES => compute_mac(ks_mac, &padding_method_2(&template, 8)?, MacAlgorithm::DES),
        MacAlgorithm::AESCMAC => compute_mac(ks_mac, &template, MacAlgorithm::AESCMAC),
    }
}

/// Value of the single data object `tag` inside a dynamic authentication data response.
fn response_object(response: &[u8], tag: u32) -> Result<Vec<u8>, EmrtdError> {
    let (found, value, _) = next_tlv(dynamic_auth_data(response)?)?;
    if found != tag {
        error!("Expected data object {tag:02X} in General Authenticate response, found {found:02X}");
        return Err(EmrtdError::InvalidResponseError());
    }
    Ok(value.to_vec())
}

fn classify(err: EmrtdError) -> ChipError {
    match err {
        EmrtdError::RecvApduError(sw1, sw2) if is_denial_status(sw1, sw2) => {
            ChipError::AccessDenied(format!("chip refused PACE with status {sw1:02X}{sw2:02X}"))
        }
        other => ChipError::PaceFailure(other.to_string()),
    }
}

/// Runs PACE with the MRZ password and moves the channel to `Pace`.
///
/// # Errors
///
/// * `ChipError::AccessDenied` if the chip refuses the password or its token does not verify.
/// * `ChipError::PaceFailure` for unsupported parameters and any other failure.
pub(crate) fn establish_pace<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    mrz_key: &str,
    info: &PaceInfo,
) -> Result<(), ChipError> {
    let (Some(PaceMapping::Generic), Some(KeyAgreement::Ecdh), Some(alg), Some(parameter_id)) = (
        info.mapping(),
        info.key_agreement(),
        info.cipher(),
        info.parameter_id,
    ) else {
        error!("PACE protocol {} is not supported", info.protocol);
        return Err(ChipError::PaceFailure(format!(
            "unsupported protocol {} with parameters {:?}",
            info.protocol, info.parameter_id
        )));
    };
    info!("Establishing PACE with {} over domain parameters {parameter_id}", info.protocol);

    let group = standardized_curve(parameter_id).map_err(classify)?;
    let keys = run_generic_mapping(comms, mrz_key, &info.protocol, alg, parameter_id, &group)
        .map_err(|e| match e {
            PaceStepError::Token => ChipError::AccessDenied("PACE authentication token mismatch".into()),
            PaceStepError::Emrtd(e) => classify(e),
        })?;

    comms
        .transition(SecureChannelState::Pace {
            keys,
            mapping: PaceMapping::Generic,
        })
        .map_err(classify)
}

enum PaceStepError {
    /// The chip's authentication token did not verify.
    Token,
    Emrtd(EmrtdError),
}

impl From<EmrtdError> for PaceStepError {
    fn from(err: EmrtdError) -> Self {
        Self::Emrtd(err)
    }
}

fn general_authenticate<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    last: bool,
    data: &[u8],
) -> Result<Vec<u8>, EmrtdError> {
    let cla = if last { 0x00 } else { 0x10 };
    let apdu = APDU::with_data(cla, 0x86, 0x00, 0x00, encode_tlv(&[0x7C], data), Some(0x00))?;
    comms.send_expect_ok(&apdu, "General Authenticate")
}

fn run_generic_mapping<C: EmrtdCard, R: RngCore + CryptoRng + Default>(
    comms: &mut EmrtdComms<C, R>,
    mrz_key: &str,
    protocol: &str,
    alg: EncryptionAlgorithm,
    parameter_id: u64,
    group: &EcGroupRef,
) -> Result<SessionKeys, PaceStepError> {
    let oid = encode_oid(protocol)?;
    let parameter_id = u8::try_from(parameter_id).map_err(EmrtdError::IntCastError)?;

    // MSE:Set AT with the MRZ as password
    let mse = [
        data_object(0x80, &oid),
        data_object(0x83, &[0x01]),
        data_object(0x84, &[parameter_id]),
    ]
    .concat();
    comms.send_expect_ok(&APDU::with_data(0x00, 0x22, 0xC1, 0xA4, mse, None)?, "MSE:Set AT")?;

    // Encrypted nonce
    let k_pi = compute_key(&generate_key_seed(mrz_key.as_bytes())?, KeyType::Password, alg)?;
    let response = general_authenticate(comms, false, &[])?;
    let encrypted_nonce = response_object(&response, 0x80)?;
    trace!("Encrypted nonce: {}", bytes2hex(&encrypted_nonce));
    let nonce = decrypt_cbc(alg, &k_pi, &vec![0; alg.block_size()], &encrypted_nonce)?;
    let nonce = BigNum::from_slice(&nonce).map_err(EmrtdError::OpensslErrorStack)?;

    // Generic mapping, G' = s * G + H
    let mut curve = Curve::new(group)?;
    let sk_map = curve.random_scalar(comms.rng())?;
    let pk_map_ifd = curve.mul_generator(&sk_map)?;
    let pk_map_ifd = curve.encode(&pk_map_ifd)?;
    let response = general_authenticate(comms, false, &data_object(0x81, &pk_map_ifd))?;
    let pk_map_ic = curve.decode(&response_object(&response, 0x82)?)?;
    let shared_point = curve.mul(&pk_map_ic, &sk_map)?;
    let one = BigNum::from_u32(1).map_err(EmrtdError::OpensslErrorStack)?;
    let mapped_generator = curve.mul_full(&nonce, &shared_point, &one)?;

    // Key agreement on the mapped generator
    let sk_eph = curve.random_scalar(comms.rng())?;
    let pk_eph_ifd = curve.mul(&mapped_generator, &sk_eph)?;
    let pk_eph_ifd = curve.encode(&pk_eph_ifd)?;
    let response = general_authenticate(comms, false, &data_object(0x83, &pk_eph_ifd))?;
    let pk_eph_ic_bytes = response_object(&response, 0x84)?;
    if constant_time_eq(&pk_eph_ic_bytes, &pk_eph_ifd) {
        error!("Chip returned the terminal's own ephemeral key");
        return Err(EmrtdError::InvalidResponseError().into());
    }
    let pk_eph_ic = curve.decode(&pk_eph_ic_bytes)?;
    let shared_point = curve.mul(&pk_eph_ic, &sk_eph)?;
    let shared_secret = curve.x_coordinate(&shared_point)?;

    let ks_enc = compute_key(&shared_secret, KeyType::Encryption, alg)?;
    let ks_mac = compute_key(&shared_secret, KeyType::Mac, alg)?;

    // Mutual authentication
    let t_ifd = authentication_token(alg, &ks_mac, &oid, &pk_eph_ic_bytes)?;
    let response = general_authenticate(comms, true, &data_object(0x85, &t_ifd))?;
    let t_ic = response_object(&response, 0x86)?;
    let expected = authentication_token(alg, &ks_mac, &oid, &pk_eph_ifd)?;
    if !constant_time_eq(&t_ic, &expected) {
        error!("PACE authentication token of the chip does not verify");
        return Err(PaceStepError::Token);
    }

    info!("PACE established with {alg:?}");
    Ok(SessionKeys::with_zero_ssc(alg, ks_enc, ks_mac)?)
}
