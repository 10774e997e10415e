//! BER-TLV helpers and the DER structures signed by issuing states.

use crate::{bytes2hex, EmrtdError};
use alloc::{format, string::String, vec, vec::Vec};
use core::{fmt::Write, mem};
use tracing::error;

/// Generated and edited using `rasn_compiler`
/// <https://librasn.github.io>
/// <https://docs.rs/rasn-compiler/latest/rasn_compiler/>
///
#[allow(clippy::doc_markdown)]
/// LDSSecurityObjectV1 { joint-iso-itu-t(2) international(23) icao(136) mrtd(1) security(1) ldsSecurityObject(1)}
///
/// LDSSecurityObject ::= SEQUENCE {
/// version LDSSecurityObjectVersion,
/// hashAlgorithm DigestAlgorithmIdentifier,
/// dataGroupHashValues SEQUENCE SIZE (2..ub-DataGroups) OF
/// DataGroupHash,
/// ldsVersionInfo LDSVersionInfo OPTIONAL
/// -- If present, version MUST be V1
/// }
/// DataGroupHash ::= SEQUENCE {
/// dataGroupNumber DataGroupNumber,
/// dataGroupHashValue OCTET STRING }
///
/// LDSVersionInfo ::= SEQUENCE {
/// ldsVersion PrintableString
/// unicodeVersion PrintableString }
///
pub mod lds_security_object {
    extern crate alloc;
    use rasn::prelude::*;
    use rasn_cms::AlgorithmIdentifier;

    pub type DataGroupNumber = Integer;
    pub type DigestAlgorithmIdentifier = AlgorithmIdentifier;
    pub type LDSSecurityObjectVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct DataGroupHash {
        pub data_group_number: DataGroupNumber,
        pub data_group_hash_value: OctetString,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LDSSecurityObject {
        pub version: LDSSecurityObjectVersion,
        pub hash_algorithm: DigestAlgorithmIdentifier,
        #[rasn(size("2..=16"))]
        pub data_group_hash_values: SequenceOf<DataGroupHash>,
        pub lds_version_info: Option<LDSVersionInfo>,
    }
    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct LDSVersionInfo {
        pub lds_version: PrintableString,
        pub unicode_version: PrintableString,
    }
}

/// CscaMasterList { joint-iso-itu-t(2) international-organization(23) icao(136) mrtd(1) security(1) masterlist(2)}
///
/// CscaMasterList ::= SEQUENCE {
/// version CscaMasterListVersion,
/// certList SET OF Certificate }
pub mod csca_master_list {
    extern crate alloc;
    use rasn::prelude::*;
    use rasn_pkix::Certificate;

    pub type CscaMasterListCertList = SetOf<Certificate>;
    pub type CscaMasterListVersion = Integer;

    #[derive(AsnType, Debug, Clone, Decode, Encode, PartialEq, Eq)]
    pub struct CscaMasterList {
        pub version: CscaMasterListVersion,
        pub cert_list: CscaMasterListCertList,
    }
}

/// Parses the ASN.1 length field.
///
/// Returns the offset of the value and the value length. With `tag_len` 3 and a one
/// byte length of 42 the result is (4, 42).
///
/// # Errors
///
/// * `EmrtdError` if the data is too short to read the length value.
pub(crate) fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), EmrtdError> {
    if data.len() < tag_len + 1 {
        error!(
            "Error during len2int, `data.len()`: `{}` is less than `tag_len`: `{}`",
            data.len(),
            tag_len
        );
        return Err(EmrtdError::ParseAsn1DataError(tag_len + 1, data.len()));
    }

    if data[tag_len] & 0x80 == 0 {
        Ok((tag_len + 1, data[tag_len] as usize))
    } else {
        let length_of_length = ((1 << 7) ^ data[tag_len]) as usize;
        if length_of_length > mem::size_of::<usize>() {
            error!("Error during len2int, length of length {length_of_length} does not fit");
            return Err(EmrtdError::ParseDataError(format!(
                "ASN.1 length of length {length_of_length} is too large"
            )));
        }

        if data.len() < tag_len + 1 + length_of_length {
            error!("Error during len2int, `data.len()`: `{}` is less than `tag_len + 1 + length_of_length`: `{}`", data.len(), tag_len + 1 + length_of_length);
            return Err(EmrtdError::ParseAsn1DataError(
                tag_len + 1 + length_of_length,
                data.len(),
            ));
        }

        let mut buf = [0_u8; mem::size_of::<usize>()];
        buf[mem::size_of::<usize>() - length_of_length..]
            .copy_from_slice(&data[tag_len + 1..tag_len + 1 + length_of_length]);

        Ok((tag_len + 1 + length_of_length, usize::from_be_bytes(buf)))
    }
}

/// Encodes the length field in ASN.1 format.
///
/// # Examples
///
/// ```
/// use emrtd_verify::int2asn1len;
/// use hex_literal::hex;
///
/// assert_eq!(int2asn1len(42), hex!("2A").to_vec());
/// assert_eq!(int2asn1len(2024), hex!("8207E8").to_vec());
/// assert_eq!(int2asn1len(65536), hex!("83010000").to_vec());
/// ```
#[must_use]
pub fn int2asn1len(length: usize) -> Vec<u8> {
    if length < 128 {
        // Fits in the low seven bits
        vec![(length & 0x7F) as u8]
    } else {
        let octets: Vec<u8> = length
            .to_be_bytes()
            .into_iter()
            .skip_while(|&b| b == 0)
            .collect();
        let mut length_bytes = Vec::with_capacity(octets.len() + 1);
        length_bytes.push(0x80 | (octets.len() & 0x7F) as u8);
        length_bytes.extend_from_slice(&octets);
        length_bytes
    }
}

/// Builds a TLV from a raw tag and a value.
#[must_use]
pub(crate) fn encode_tlv(tag: &[u8], value: &[u8]) -> Vec<u8> {
    [tag, &int2asn1len(value.len()), value].concat()
}

/// Validate the ASN.1 tag of the provided data. Multi-byte tags are supported.
///
/// # Errors
///
/// * `EmrtdError` if the data is incomplete or the tags don't match.
pub(crate) fn validate_asn1_tag(data: &[u8], tag: &[u8]) -> Result<(), EmrtdError> {
    data.get(..tag.len()).map_or_else(
        || {
            error!(
                "Error while validating ASN1 tag, `data.len()`: `{}` is less than `tag.len()`: `{}`",
                data.len(),
                tag.len()
            );
            Err(EmrtdError::ParseAsn1DataError(tag.len(), data.len()))
        },
        |d| {
            if d.starts_with(tag) {
                Ok(())
            } else {
                error!(
                    "Error while validating ASN1 tag, expected: {}, found {}",
                    bytes2hex(tag),
                    bytes2hex(d)
                );
                Err(EmrtdError::ParseAsn1TagError(bytes2hex(tag), bytes2hex(d)))
            }
        },
    )
}

/// Retrieve the ASN.1 child from the provided data.
///
/// Returns the value of the first TLV and the bytes that follow it.
///
/// # Errors
///
/// * `EmrtdError` if the data is incomplete.
pub(crate) fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), EmrtdError> {
    if data.len() < tag_len {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tag_len`: `{}`",
            data.len(),
            tag_len
        );
        return Err(EmrtdError::ParseAsn1DataError(tag_len, data.len()));
    }

    let (tl, v) = len2int(data, tag_len)?;
    let Some(end) = tl.checked_add(v).filter(|&end| end <= data.len()) else {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{}`",
            data.len(),
            tl.saturating_add(v)
        );
        return Err(EmrtdError::ParseAsn1DataError(tl.saturating_add(v), data.len()));
    };
    Ok((&data[tl..end], &data[end..]))
}

/// Reads a BER tag, returning it as an integer together with its encoded length.
///
/// # Errors
///
/// * `EmrtdError` if the tag is truncated or longer than four bytes.
pub(crate) fn read_tag(data: &[u8]) -> Result<(u32, usize), EmrtdError> {
    let Some(&first) = data.first() else {
        error!("Can not read an ASN.1 tag from empty data");
        return Err(EmrtdError::ParseAsn1DataError(1, 0));
    };
    let mut tag = u32::from(first);
    let mut tag_len = 1;
    if first & 0x1F == 0x1F {
        loop {
            let Some(&b) = data.get(tag_len) else {
                error!("ASN.1 tag is truncated after {tag_len} bytes");
                return Err(EmrtdError::ParseAsn1DataError(tag_len + 1, data.len()));
            };
            tag = (tag << 8) | u32::from(b);
            tag_len += 1;
            if b & 0x80 == 0 {
                break;
            }
            if tag_len == 4 {
                error!("ASN.1 tags longer than four bytes are not supported");
                return Err(EmrtdError::ParseDataError(
                    "ASN.1 tag longer than four bytes".into(),
                ));
            }
        }
    }
    Ok((tag, tag_len))
}

/// Splits one TLV off the front of `data`, returning tag, value and the rest.
///
/// # Errors
///
/// * `EmrtdError` if the TLV is truncated.
pub(crate) fn next_tlv(data: &[u8]) -> Result<(u32, &[u8], &[u8]), EmrtdError> {
    let (tag, tag_len) = read_tag(data)?;
    let (value, rest) = get_asn1_child(data, tag_len)?;
    Ok((tag, value, rest))
}

/// Like [`next_tlv`] but also returns the complete encoding of the TLV.
pub(crate) fn next_tlv_raw(data: &[u8]) -> Result<(u32, &[u8], &[u8], &[u8]), EmrtdError> {
    let (tag, value, rest) = next_tlv(data)?;
    let raw = &data[..data.len() - rest.len()];
    Ok((tag, value, raw, rest))
}

/// Iterates over a run of concatenated TLVs.
pub(crate) struct TlvIter<'a> {
    data: &'a [u8],
}

impl<'a> TlvIter<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Result<(u32, &'a [u8]), EmrtdError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Some issuers pad files with 0x00 or 0xFF after the last object
        if self.data.iter().all(|&b| b == 0x00 || b == 0xFF) {
            return None;
        }
        match next_tlv(self.data) {
            Ok((tag, value, rest)) => {
                self.data = rest;
                Some(Ok((tag, value)))
            }
            Err(e) => {
                self.data = &[];
                Some(Err(e))
            }
        }
    }
}

/// Strips the outer TLV of a file and checks that nothing trails it.
pub(crate) fn unwrap_file<'a>(
    data: &'a [u8],
    tag: &[u8],
    fname: &'static str,
) -> Result<&'a [u8], EmrtdError> {
    validate_asn1_tag(data, tag)?;
    let (value, rest) = get_asn1_child(data, tag.len())?;
    if rest.iter().any(|&b| b != 0x00 && b != 0xFF) {
        error!("{fname} has trailing data after the outer tag");
        return Err(EmrtdError::InvalidFileStructure(fname));
    }
    Ok(value)
}

/// Reads a DER INTEGER value that fits into a `u64`.
pub(crate) fn der_uint(value: &[u8]) -> Result<u64, EmrtdError> {
    let trimmed: &[u8] = match value {
        [0x00, rest @ ..] if !rest.is_empty() => rest,
        _ => value,
    };
    if value.is_empty() || trimmed.len() > 8 {
        error!("INTEGER of {} bytes does not fit into u64", value.len());
        return Err(EmrtdError::ParseDataError(format!(
            "INTEGER {} does not fit into u64",
            bytes2hex(value)
        )));
    }
    Ok(trimmed
        .iter()
        .fold(0_u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Renders the content octets of an OBJECT IDENTIFIER in dotted notation.
#[must_use]
pub fn oid_to_string(content: &[u8]) -> String {
    let mut arcs: Vec<u64> = Vec::new();
    let mut current: u64 = 0;
    for &b in content {
        current = (current << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (current / 40).min(2);
                arcs.push(first);
                arcs.push(current - first * 40);
            } else {
                arcs.push(current);
            }
            current = 0;
        }
    }
    let mut out = String::new();
    for (i, arc) in arcs.iter().enumerate() {
        if i > 0 {
            out.push('.');
        }
        let _ = write!(out, "{arc}");
    }
    out
}

/// Encodes a dotted OBJECT IDENTIFIER into its content octets.
///
/// # Errors
///
/// * `EmrtdError::InvalidOidError` if the text is not a valid OID.
pub(crate) fn encode_oid(dotted: &str) -> Result<Vec<u8>, EmrtdError> {
    let arcs: Vec<u64> = dotted
        .split('.')
        .map(str::parse::<u64>)
        .collect::<Result<_, _>>()
        .map_err(|_| {
            error!("Invalid OID: {dotted}");
            EmrtdError::InvalidOidError()
        })?;
    let [first, second, rest @ ..] = arcs.as_slice() else {
        error!("OID {dotted} needs at least two arcs");
        return Err(EmrtdError::InvalidOidError());
    };
    if *first > 2 || (*first < 2 && *second >= 40) {
        error!("Invalid OID: {dotted}");
        return Err(EmrtdError::InvalidOidError());
    }

    let mut out = Vec::new();
    for arc in core::iter::once(first * 40 + second).chain(rest.iter().copied()) {
        let mut chunk = vec![(arc & 0x7F) as u8];
        let mut remaining = arc >> 7;
        while remaining > 0 {
            chunk.push(0x80 | (remaining & 0x7F) as u8);
            remaining >>= 7;
        }
        out.extend(chunk.iter().rev());
    }
    Ok(out)
}
