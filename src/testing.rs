//! Card and RNG doubles shared by the unit tests.

use crate::{
    apdu::data_object,
    asn1::{encode_oid, encode_tlv, next_tlv, next_tlv_raw, oid_to_string},
    comms::dynamic_auth_data,
    crypto::{
        compute_key, compute_mac, decrypt, decrypt_cbc, encrypt, encrypt_cbc, generate_key_seed,
        padding_method_2, remove_padding, secure_messaging_iv, xor_slices, EncryptionAlgorithm,
        KeyType, MacAlgorithm,
    },
    lds::DataGroupId,
    pace::Curve,
    security_info::ChipAuthenticationInfo,
    EmrtdCard, EmrtdError,
};
use alloc::{
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    vec,
    vec::Vec,
};
use core::cell::RefCell;
use hex_literal::hex;
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::{hash, MessageDigest},
    nid::Nid,
    pkey::{Id, PKey, Private},
    rsa::{Padding, Rsa},
    sign::{RsaPssSaltlen, Signer},
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509NameBuilder, X509NameRef, X509,
    },
};
use rand::{CryptoRng, RngCore};

/// Replays a fixed list of command/response pairs. An empty expected command
/// matches anything.
pub(crate) struct ScriptedCard {
    exchanges: RefCell<VecDeque<(Vec<u8>, Vec<u8>)>>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl ScriptedCard {
    pub(crate) fn new(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            exchanges: RefCell::new(exchanges.into()),
            sent: Rc::default(),
        }
    }

    /// Every command the card received, in order.
    pub(crate) fn log(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        Rc::clone(&self.sent)
    }
}

impl EmrtdCard for ScriptedCard {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error> {
        if attribute == pcsc::Attribute::AtrString {
            return Ok(hex!("0001020304050607").to_vec());
        }
        Err(pcsc::Error::InvalidAtr)
    }

    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        self.sent.borrow_mut().push(send_buffer.to_vec());
        let Some((expected, response)) = self.exchanges.borrow_mut().pop_front() else {
            return Err(pcsc::Error::RemovedCard);
        };
        if !expected.is_empty() && expected != send_buffer {
            return Err(pcsc::Error::InvalidParameter);
        }
        receive_buffer[..response.len()].copy_from_slice(&response);
        Ok(&receive_buffer[..response.len()])
    }
}

/// Deterministic RNG cycling over the ICAO Doc 9303-11 Appendix D.3 values
/// `RND.IFD` and `K.IFD`.
#[derive(Clone, Debug)]
pub(crate) struct MockRng {
    data: Vec<u8>,
    index: usize,
}

impl Default for MockRng {
    fn default() -> Self {
        Self {
            data: hex!("781723860C06C226
                        0B795240CB7049B01C19B33E32804F0B")
            .to_vec(),
            index: 0,
        }
    }
}

impl CryptoRng for MockRng {}

impl RngCore for MockRng {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0; 4];
        self.fill_bytes(&mut buf);
        u32::from_be_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0; 8];
        self.fill_bytes(&mut buf);
        u64::from_be_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.data[self.index];
            self.index = (self.index + 1) % self.data.len();
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Session keys on the chip side of secure messaging.
struct ChipKeys {
    alg: EncryptionAlgorithm,
    ks_enc: Vec<u8>,
    ks_mac: Vec<u8>,
    ssc: Vec<u8>,
}

impl ChipKeys {
    fn derive(alg: EncryptionAlgorithm, secret: &[u8], ssc: Vec<u8>) -> Result<Self, EmrtdError> {
        Ok(Self {
            alg,
            ks_enc: compute_key(secret, KeyType::Encryption, alg)?,
            ks_mac: compute_key(secret, KeyType::Mac, alg)?,
            ssc,
        })
    }

    fn increment(&mut self) {
        for byte in self.ssc.iter_mut().rev() {
            let (value, carry) = byte.overflowing_add(1);
            *byte = value;
            if !carry {
                break;
            }
        }
    }

    fn mac(&self, data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        compute_mac(
            &self.ks_mac,
            &padding_method_2(data, self.alg.block_size())?,
            self.alg.mac_algorithm(),
        )
    }

    /// Verifies and decrypts a protected command into INS, P1, P2, data and Le.
    fn unwrap_command(&mut self, command: &[u8]) -> Result<PlainCommand, EmrtdError> {
        self.increment();
        let header = command.get(..4).ok_or(EmrtdError::InvalidResponseError())?;
        let body = match command.get(4..) {
            Some([0x00, hi, lo, rest @ ..]) if !rest.is_empty() => {
                rest.get(..usize::from(u16::from_be_bytes([*hi, *lo])))
            }
            Some([lc, rest @ ..]) => rest.get(..usize::from(*lc)),
            _ => Some(&[][..]),
        }
        .ok_or(EmrtdError::InvalidResponseError())?;

        let mut mac_input = [
            self.ssc.clone(),
            padding_method_2(header, self.alg.block_size())?,
        ]
        .concat();
        let mut cryptogram = None;
        let mut le = None;
        let mut mac = None;
        let mut rest = body;
        while !rest.is_empty() {
            let (tag, value, raw, next) = next_tlv_raw(rest)?;
            match tag {
                0x87 => cryptogram = value.get(1..),
                0x85 => cryptogram = Some(value),
                0x97 => le = Some(value),
                0x8E => mac = Some(value),
                _ => return Err(EmrtdError::InvalidResponseError()),
            }
            if tag != 0x8E {
                mac_input.extend_from_slice(raw);
            }
            rest = next;
        }
        if mac != Some(self.mac(&mac_input)?.as_slice()) {
            return Err(EmrtdError::VerifyMacError());
        }

        let data = match cryptogram {
            Some(encrypted) => {
                let iv = secure_messaging_iv(self.alg, &self.ks_enc, &self.ssc)?;
                remove_padding(&decrypt_cbc(self.alg, &self.ks_enc, &iv, encrypted)?).to_vec()
            }
            None => Vec::new(),
        };
        let le = le.map(|le| match le {
            [0x00] => 256,
            [0x00, 0x00] => 65536,
            bytes => bytes.iter().fold(0, |acc, &b| (acc << 8) | usize::from(b)),
        });
        Ok(PlainCommand {
            ins: header[1],
            p1: header[2],
            p2: header[3],
            data,
            le,
        })
    }

    fn wrap_response(&mut self, data: &[u8], sw: [u8; 2]) -> Result<Vec<u8>, EmrtdError> {
        self.increment();
        let do87 = if data.is_empty() {
            Vec::new()
        } else {
            let iv = secure_messaging_iv(self.alg, &self.ks_enc, &self.ssc)?;
            let padded = padding_method_2(data, self.alg.block_size())?;
            let encrypted = encrypt_cbc(self.alg, &self.ks_enc, &iv, &padded)?;
            data_object(0x87, &[&[0x01][..], &encrypted].concat())
        };
        let do99 = data_object(0x99, &sw);
        let mac = self.mac(&[self.ssc.clone(), do87.clone(), do99.clone()].concat())?;
        Ok([do87, do99, data_object(0x8E, &mac), sw.to_vec()].concat())
    }
}

struct PlainCommand {
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<usize>,
}

impl PlainCommand {
    fn parse(command: &[u8]) -> Option<Self> {
        let (data, le) = match command.get(4..)? {
            [] => (Vec::new(), None),
            [le] => (Vec::new(), Some(usize::from(*le))),
            [lc, rest @ ..] => {
                let data = rest.get(..usize::from(*lc))?;
                let le = rest.get(usize::from(*lc)).map(|&le| usize::from(le));
                (data.to_vec(), le)
            }
        };
        Some(Self {
            ins: command[1],
            p1: command[2],
            p2: command[3],
            data,
            le,
        })
    }
}

const OK: [u8; 2] = [0x90, 0x00];
/// ICAO Doc 9303-11 Appendix D.3
const RND_IC: [u8; 8] = hex!("4608F91988702212");
const K_IC: [u8; 16] = hex!("0B4F80323EB3191CB04970CB4052790B");

struct VirtualState {
    ba_key_enc: Vec<u8>,
    ba_key_mac: Vec<u8>,
    files: BTreeMap<[u8; 2], Vec<u8>>,
    access_control: bool,
    selected: Option<[u8; 2]>,
    challenge: Option<Vec<u8>>,
    keys: Option<ChipKeys>,
    pending_keys: Option<ChipKeys>,
    ca_key: Option<EcKey<Private>>,
    ca_cipher: EncryptionAlgorithm,
    aa_signature: Vec<u8>,
}

/// A passport chip in memory: BAC, 3DES and AES secure messaging, chip authentication
/// with an EC key and INTERNAL AUTHENTICATE over a set of elementary files.
pub(crate) struct VirtualPassport {
    state: RefCell<VirtualState>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl VirtualPassport {
    pub(crate) fn new(mrz_key: &str) -> Self {
        let seed = generate_key_seed(mrz_key.as_bytes()).expect("key seed");
        let seed = &seed[..16];
        Self {
            state: RefCell::new(VirtualState {
                ba_key_enc: compute_key(seed, KeyType::Encryption, EncryptionAlgorithm::DES3)
                    .expect("basic access key"),
                ba_key_mac: compute_key(seed, KeyType::Mac, EncryptionAlgorithm::DES3)
                    .expect("basic access key"),
                files: BTreeMap::new(),
                access_control: true,
                selected: None,
                challenge: None,
                keys: None,
                pending_keys: None,
                ca_key: None,
                ca_cipher: EncryptionAlgorithm::DES3,
                aa_signature: vec![0x3C; 128],
            }),
            sent: Rc::default(),
        }
    }

    pub(crate) fn with_file(self, fid: [u8; 2], data: Vec<u8>) -> Self {
        self.state.borrow_mut().files.insert(fid, data);
        self
    }

    pub(crate) fn with_data_group(self, id: DataGroupId, data: Vec<u8>) -> Self {
        self.with_file(id.fid(), data)
    }

    /// Serves every file without BAC.
    pub(crate) fn without_access_control(self) -> Self {
        self.state.borrow_mut().access_control = false;
        self
    }

    pub(crate) fn with_chip_authentication_key(self, key: EcKey<Private>) -> Self {
        self.state.borrow_mut().ca_key = Some(key);
        self
    }

    pub(crate) fn log(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        Rc::clone(&self.sent)
    }
}

impl VirtualState {
    fn answer(&mut self, command: &[u8]) -> Vec<u8> {
        let protected = command.first().is_some_and(|cla| cla & 0x0C == 0x0C);
        let parsed = if protected {
            match self.keys.as_mut().map(|keys| keys.unwrap_command(command)) {
                Some(Ok(parsed)) => parsed,
                Some(Err(_)) => return hex!("6988").to_vec(),
                None => return hex!("6987").to_vec(),
            }
        } else {
            match PlainCommand::parse(command) {
                Some(parsed) => parsed,
                None => return hex!("6700").to_vec(),
            }
        };

        let (data, sw) = self.dispatch(&parsed).unwrap_or((Vec::new(), hex!("6F00")));
        let response = match self.keys.as_mut() {
            Some(keys) if protected && sw == OK => keys
                .wrap_response(&data, sw)
                .unwrap_or_else(|_| hex!("6F00").to_vec()),
            Some(keys) if protected => {
                keys.increment();
                sw.to_vec()
            }
            _ if sw == OK => [data, sw.to_vec()].concat(),
            _ => sw.to_vec(),
        };
        if let Some(keys) = self.pending_keys.take() {
            self.keys = Some(keys);
        }
        response
    }

    fn locked(&self, fid: [u8; 2]) -> bool {
        self.access_control && self.keys.is_none() && fid != DataGroupId::CardAccess.fid()
    }

    fn dispatch(&mut self, command: &PlainCommand) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let reply = |sw: [u8; 2]| Ok((Vec::new(), sw));
        match (command.ins, command.p1, command.p2) {
            (0xA4, 0x04, _) => reply(OK),
            (0xA4, 0x02, _) => {
                let Ok(fid) = <[u8; 2]>::try_from(command.data.as_slice()) else {
                    return reply(hex!("6A80"));
                };
                if self.locked(fid) {
                    return reply(hex!("6982"));
                }
                if !self.files.contains_key(&fid) {
                    return reply(hex!("6A82"));
                }
                self.selected = Some(fid);
                reply(OK)
            }
            (0xB0, p1, p2) => {
                let Some(fid) = self.selected else {
                    return reply(hex!("6986"));
                };
                if self.locked(fid) {
                    return reply(hex!("6982"));
                }
                let file = &self.files[&fid];
                let offset = usize::from(u16::from_be_bytes([p1 & 0x7F, p2]));
                if offset > file.len() {
                    return reply(hex!("6B00"));
                }
                let end = file.len().min(offset + command.le.unwrap_or(256));
                Ok((file[offset..end].to_vec(), OK))
            }
            (0x84, _, _) => {
                self.challenge = Some(RND_IC.to_vec());
                Ok((RND_IC.to_vec(), OK))
            }
            (0x82, _, _) => self.external_authenticate(&command.data),
            (0x22, 0x41, 0xA6) => {
                // MSE:Set KAT, 3DES chip authentication
                let (tag, public_key, _) = next_tlv(&command.data)?;
                if tag != 0x91 {
                    return reply(hex!("6A80"));
                }
                self.pending_keys = Some(self.chip_authentication_keys(EncryptionAlgorithm::DES3, public_key)?);
                reply(OK)
            }
            (0x22, 0x41, 0xA4) => {
                let (tag, oid, _) = next_tlv(&command.data)?;
                let info = ChipAuthenticationInfo {
                    protocol: oid_to_string(oid),
                    version: 1,
                    key_id: None,
                };
                match (tag, info.cipher()) {
                    (0x80, Some(cipher)) => {
                        self.ca_cipher = cipher;
                        reply(OK)
                    }
                    _ => reply(hex!("6A80")),
                }
            }
            (0x86, _, _) => {
                let (tag, public_key, _) = next_tlv(dynamic_auth_data(&command.data)?)?;
                if tag != 0x80 || self.ca_cipher == EncryptionAlgorithm::DES3 {
                    return reply(hex!("6A80"));
                }
                self.pending_keys = Some(self.chip_authentication_keys(self.ca_cipher, public_key)?);
                Ok((hex!("7C00").to_vec(), OK))
            }
            (0x88, _, _) if command.data.len() == 8 => Ok((self.aa_signature.clone(), OK)),
            (0x88, _, _) => reply(hex!("6700")),
            _ => reply(hex!("6D00")),
        }
    }

    fn external_authenticate(&mut self, data: &[u8]) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let denied = Ok((Vec::new(), hex!("6300")));
        let (Some(rnd_ic), 40) = (self.challenge.take(), data.len()) else {
            return denied;
        };
        let (e_ifd, m_ifd) = data.split_at(32);
        let mac = compute_mac(&self.ba_key_mac, &padding_method_2(e_ifd, 8)?, MacAlgorithm::DES)?;
        if mac != m_ifd {
            return denied;
        }
        let s = decrypt::<cbc::Decryptor<des::TdesEde3>>(&self.ba_key_enc, Some(&[0; 8]), e_ifd)?;
        let (rnd_ifd, k_ifd) = (&s[..8], &s[16..32]);
        if s[8..16] != rnd_ic[..] {
            return denied;
        }

        let r = [&RND_IC[..], rnd_ifd, &K_IC[..]].concat();
        let e_ic = encrypt::<cbc::Encryptor<des::TdesEde3>>(&self.ba_key_enc, Some(&[0; 8]), &r)?;
        let m_ic = compute_mac(&self.ba_key_mac, &padding_method_2(&e_ic, 8)?, MacAlgorithm::DES)?;

        let seed = xor_slices(k_ifd, &K_IC)?;
        let ssc = [&rnd_ic[4..], &rnd_ifd[4..]].concat();
        self.pending_keys = Some(ChipKeys::derive(EncryptionAlgorithm::DES3, &seed, ssc)?);
        Ok(([e_ic, m_ic].concat(), OK))
    }

    fn chip_authentication_keys(
        &self,
        alg: EncryptionAlgorithm,
        public_key: &[u8],
    ) -> Result<ChipKeys, EmrtdError> {
        let key = self.ca_key.as_ref().ok_or(EmrtdError::InvalidResponseError())?;
        let mut curve = Curve::new(key.group())?;
        let terminal_key = curve.decode(public_key)?;
        let shared = curve.mul(&terminal_key, key.private_key())?;
        let secret = curve.x_coordinate(&shared)?;
        ChipKeys::derive(alg, &secret, vec![0; alg.block_size()])
    }
}

impl EmrtdCard for VirtualPassport {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error> {
        if attribute == pcsc::Attribute::AtrString {
            return Ok(hex!("3B8880014241434B4F4E45").to_vec());
        }
        Err(pcsc::Error::InvalidAtr)
    }

    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        self.sent.borrow_mut().push(send_buffer.to_vec());
        let response = self.state.borrow_mut().answer(send_buffer);
        receive_buffer[..response.len()].copy_from_slice(&response);
        Ok(&receive_buffer[..response.len()])
    }
}

/// A P-256 key pair and its DER `SubjectPublicKeyInfo`.
pub(crate) fn ec_key_pair() -> (EcKey<Private>, Vec<u8>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("P-256");
    let key = EcKey::generate(&group).expect("EC key");
    let spki = PKey::from_ec_key(key.clone())
        .and_then(|pkey| pkey.public_key_to_der())
        .expect("SubjectPublicKeyInfo");
    (key, spki)
}

/// EF.DG14 announcing one ECDH chip authentication key, with a `ChipAuthenticationInfo`
/// for `protocol` when given.
pub(crate) fn chip_authentication_dg14(spki: &[u8], protocol: Option<&str>) -> Vec<u8> {
    let oid = |dotted: &str| encode_tlv(&[0x06], &encode_oid(dotted).expect("OID"));
    let mut infos = encode_tlv(
        &[0x30],
        &[oid("0.4.0.127.0.7.2.2.1.2"), spki.to_vec(), encode_tlv(&[0x02], &[0x01])].concat(),
    );
    if let Some(protocol) = protocol {
        infos.extend(encode_tlv(
            &[0x30],
            &[oid(protocol), encode_tlv(&[0x02], &[0x01]), encode_tlv(&[0x02], &[0x01])].concat(),
        ));
    }
    encode_tlv(&[0x6E], &encode_tlv(&[0x31], &infos))
}

/// A throwaway CSCA with one document signer below it.
pub(crate) struct TestPki {
    pub(crate) csca_key: PKey<Private>,
    pub(crate) csca: X509,
    pub(crate) ds_key: PKey<Private>,
    pub(crate) ds: X509,
}

impl TestPki {
    pub(crate) fn new() -> Self {
        let csca_key = ec_pkey();
        let csca = certificate("Utopia CSCA", &csca_key, None, 1);
        let ds_key = ec_pkey();
        let ds = certificate("Utopia DS", &ds_key, Some((&csca, &csca_key)), 2);
        Self {
            csca_key,
            csca,
            ds_key,
            ds,
        }
    }

    /// Another CSCA that signed nothing of this PKI.
    pub(crate) fn stranger() -> X509 {
        certificate("Other CSCA", &ec_pkey(), None, 3)
    }
}

pub(crate) fn ec_pkey() -> PKey<Private> {
    PKey::from_ec_key(ec_key_pair().0).expect("EC key")
}

pub(crate) fn rsa_pkey() -> PKey<Private> {
    Rsa::generate(2048)
        .and_then(PKey::from_rsa)
        .expect("RSA key")
}

/// A certificate valid since yesterday, self signed when `issuer` is `None`.
pub(crate) fn certificate(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    serial: u32,
) -> X509 {
    let mut name = X509NameBuilder::new().expect("name");
    name.append_entry_by_nid(Nid::COUNTRYNAME, "UT").expect("country");
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).expect("common name");
    let name = name.build();
    let issuer_name: &X509NameRef = match issuer {
        Some((cert, _)) => cert.subject_name(),
        None => &name,
    };
    let yesterday = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
        - 86_400;

    let mut builder = X509Builder::new().expect("builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(serial)
        .and_then(|bn| bn.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&name).expect("subject");
    builder.set_issuer_name(issuer_name).expect("issuer");
    builder.set_pubkey(key).expect("public key");
    builder
        .set_not_before(&Asn1Time::from_unix(yesterday).expect("time"))
        .expect("not before");
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).expect("time"))
        .expect("not after");
    if issuer.is_none() {
        builder
            .append_extension(BasicConstraints::new().critical().ca().pathlen(0).build().expect("ext"))
            .expect("basic constraints");
        builder
            .append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build().expect("ext"))
            .expect("key usage");
    } else {
        builder
            .append_extension(KeyUsage::new().critical().digital_signature().build().expect("ext"))
            .expect("key usage");
    }
    let signing_key = issuer.map_or(key, |(_, issuer_key)| issuer_key);
    builder.sign(signing_key, MessageDigest::sha256()).expect("sign");
    builder.build()
}

fn oid_tlv(dotted: &str) -> Vec<u8> {
    encode_tlv(&[0x06], &encode_oid(dotted).expect("OID"))
}

fn algorithm(dotted: &str, null_parameters: bool) -> Vec<u8> {
    let parameters = if null_parameters { vec![0x05, 0x00] } else { Vec::new() };
    encode_tlv(&[0x30], &[oid_tlv(dotted), parameters].concat())
}

/// An ICAO `LDSSecurityObject` with SHA-256 hashes of `groups`.
pub(crate) fn lds_security_object(groups: &[(u8, &[u8])]) -> Vec<u8> {
    let hashes: Vec<u8> = groups
        .iter()
        .flat_map(|(number, data)| {
            let digest = hash(MessageDigest::sha256(), data).expect("hash");
            encode_tlv(
                &[0x30],
                &[encode_tlv(&[0x02], &[*number]), encode_tlv(&[0x04], &digest)].concat(),
            )
        })
        .collect();
    encode_tlv(
        &[0x30],
        &[
            encode_tlv(&[0x02], &[0x00]),
            algorithm("2.16.840.1.101.3.4.2.1", true),
            encode_tlv(&[0x30], &hashes),
        ]
        .concat(),
    )
}

/// A DER `CscaMasterList` holding `certificates`.
pub(crate) fn csca_master_list(certificates: &[&X509]) -> Vec<u8> {
    let certs: Vec<u8> = certificates
        .iter()
        .flat_map(|cert| cert.to_der().expect("certificate"))
        .collect();
    encode_tlv(&[0x30], &[encode_tlv(&[0x02], &[0x00]), encode_tlv(&[0x31], &certs)].concat())
}

/// A CMS `ContentInfo` with `SignedData` over `content`, signed by `signer`
/// with ECDSA or PKCS#1 v1.5 depending on its key.
pub(crate) fn signed_data(
    content_type: &str,
    content: &[u8],
    signer: &X509,
    key: &PKey<Private>,
    certificates: &[&X509],
) -> Vec<u8> {
    build_signed_data(content_type, content, signer, key, certificates, false)
}

/// Like [`signed_data`] with an RSASSA-PSS signature, SHA-256 and a 32 byte salt.
pub(crate) fn signed_data_pss(
    content_type: &str,
    content: &[u8],
    signer: &X509,
    key: &PKey<Private>,
) -> Vec<u8> {
    build_signed_data(content_type, content, signer, key, &[], true)
}

fn build_signed_data(
    content_type: &str,
    content: &[u8],
    signer: &X509,
    key: &PKey<Private>,
    certificates: &[&X509],
    pss: bool,
) -> Vec<u8> {
    let sha256 = algorithm("2.16.840.1.101.3.4.2.1", true);
    let digest = hash(MessageDigest::sha256(), content).expect("hash");
    let attributes = [
        encode_tlv(
            &[0x30],
            &[oid_tlv("1.2.840.113549.1.9.3"), encode_tlv(&[0x31], &oid_tlv(content_type))].concat(),
        ),
        encode_tlv(
            &[0x30],
            &[
                oid_tlv("1.2.840.113549.1.9.4"),
                encode_tlv(&[0x31], &encode_tlv(&[0x04], &digest)),
            ]
            .concat(),
        ),
    ]
    .concat();
    let signed_attrs = encode_tlv(&[0x31], &attributes);

    let mut signer_context = Signer::new(MessageDigest::sha256(), key).expect("signer");
    let signature_algorithm = if pss {
        signer_context.set_rsa_padding(Padding::PKCS1_PSS).expect("padding");
        signer_context
            .set_rsa_pss_saltlen(RsaPssSaltlen::custom(32))
            .expect("salt");
        signer_context
            .set_rsa_mgf1_md(MessageDigest::sha256())
            .expect("mgf1");
        algorithm("1.2.840.113549.1.1.10", false)
    } else if key.id() == Id::EC {
        algorithm("1.2.840.10045.4.3.2", false)
    } else {
        algorithm("1.2.840.113549.1.1.11", true)
    };
    let signature = signer_context
        .sign_oneshot_to_vec(&signed_attrs)
        .expect("signature");

    let mut serial = signer
        .serial_number()
        .to_bn()
        .map(|bn| bn.to_vec())
        .expect("serial");
    if serial.first().map_or(true, |b| b & 0x80 != 0) {
        serial.insert(0, 0x00);
    }
    let signer_info = encode_tlv(
        &[0x30],
        &[
            encode_tlv(&[0x02], &[0x01]),
            encode_tlv(
                &[0x30],
                &[
                    signer.issuer_name().to_der().expect("issuer"),
                    encode_tlv(&[0x02], &serial),
                ]
                .concat(),
            ),
            sha256.clone(),
            encode_tlv(&[0xA0], &attributes),
            signature_algorithm,
            encode_tlv(&[0x04], &signature),
        ]
        .concat(),
    );

    let certs: Vec<u8> = core::iter::once(signer)
        .chain(certificates.iter().copied())
        .flat_map(|cert| cert.to_der().expect("certificate"))
        .collect();
    let signed = encode_tlv(
        &[0x30],
        &[
            encode_tlv(&[0x02], &[0x03]),
            encode_tlv(&[0x31], &sha256),
            encode_tlv(
                &[0x30],
                &[
                    oid_tlv(content_type),
                    encode_tlv(&[0xA0], &encode_tlv(&[0x04], content)),
                ]
                .concat(),
            ),
            encode_tlv(&[0xA0], &certs),
            encode_tlv(&[0x31], &signer_info),
        ]
        .concat(),
    );
    encode_tlv(
        &[0x30],
        &[oid_tlv("1.2.840.113549.1.7.2"), encode_tlv(&[0xA0], &signed)].concat(),
    )
}
