//! Image bearing data groups: DG2 face, DG3 fingerprints, DG5 portrait and DG7 signature.
//!
//! DG2 and DG3 wrap ISO/IEC 19794-5 and 19794-4 records in CBEFF biometric information
//! templates, see ICAO Doc 9303-10 Section 4.7.2.
//! <https://www.icao.int/publications/Documents/9303_p10_cons_en.pdf>

use crate::{
    asn1::{unwrap_file, TlvIter},
    lds::DataGroupId,
    EmrtdError,
};
use alloc::vec::Vec;
use serde::Serialize;
use tracing::{error, trace, warn};

/// Encoding of an embedded image, recognised from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageEncoding {
    Jpeg,
    Jpeg2000,
    Wsq,
    Unknown,
}

impl ImageEncoding {
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        match data {
            [0xFF, 0xD8, 0xFF, ..] => Self::Jpeg,
            // JP2 signature box or a raw codestream
            [0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, ..] | [0xFF, 0x4F, 0xFF, 0x51, ..] => {
                Self::Jpeg2000
            }
            [0xFF, 0xA0, ..] => Self::Wsq,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Jpeg2000 => "image/jp2",
            Self::Wsq => "image/x-wsq",
            Self::Unknown => "application/octet-stream",
        }
    }

    /// File name extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Jpeg2000 => "jp2",
            Self::Wsq => "wsq",
            Self::Unknown => "bin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BiometricFeature {
    Face,
    /// ISO/IEC 19794-4 finger position code.
    Finger(u8),
    Portrait,
    Signature,
}

/// One image taken out of a data group.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct BiometricImage {
    pub feature: BiometricFeature,
    pub encoding: ImageEncoding,
    pub width: Option<u16>,
    pub height: Option<u16>,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl core::fmt::Debug for BiometricImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BiometricImage")
            .field("feature", &self.feature)
            .field("encoding", &self.encoding)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.data.len())
            .finish()
    }
}

impl BiometricImage {
    fn new(feature: BiometricFeature, declared: ImageEncoding, data: &[u8]) -> Self {
        let encoding = match ImageEncoding::sniff(data) {
            ImageEncoding::Unknown => declared,
            sniffed => sniffed,
        };
        Self {
            feature,
            encoding,
            width: None,
            height: None,
            data: data.to_vec(),
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    fname: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8], fname: &'static str) -> Self {
        Self { data, pos: 0, fname }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EmrtdError> {
        let Some(bytes) = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
        else {
            error!(
                "{} biometric record is truncated at byte {}, {len} more expected",
                self.fname, self.pos
            );
            return Err(EmrtdError::InvalidFileStructure(self.fname));
        };
        self.pos += len;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), EmrtdError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, EmrtdError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EmrtdError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, EmrtdError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

fn usize_from(value: u32) -> Result<usize, EmrtdError> {
    usize::try_from(value).map_err(EmrtdError::IntCastError)
}

/// Biometric data blocks of every biometric information template of DG2 or DG3,
/// in the order they appear.
fn biometric_data_blocks<'a>(
    data: &'a [u8],
    id: DataGroupId,
) -> Result<Vec<&'a [u8]>, EmrtdError> {
    let content = unwrap_file(data, &[id.tag()], id.name())?;
    let mut blocks = Vec::new();
    for tlv in TlvIter::new(content) {
        let (tag, group) = tlv?;
        if tag != 0x7F61 {
            trace!("Skipping tag {tag:04X} of {id}");
            continue;
        }
        for tlv in TlvIter::new(group) {
            match tlv? {
                (0x02, count) => trace!("{id} announces {count:02X?} biometric templates"),
                (0x7F60, template) => {
                    for tlv in TlvIter::new(template) {
                        match tlv? {
                            (0x5F2E | 0x7F2E, block) => blocks.push(block),
                            (0xA1, _) => {}
                            (other, _) => trace!("Skipping tag {other:04X} of a {id} template"),
                        }
                    }
                }
                (other, _) => trace!("Skipping tag {other:04X} of {id}"),
            }
        }
    }
    Ok(blocks)
}

/// Face images of an ISO/IEC 19794-5 facial record.
fn parse_facial_record(block: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    let fname = "EF.DG2";
    let mut cursor = Cursor::new(block, fname);
    if cursor.take(4)? != b"FAC\x00" {
        error!("EF.DG2 biometric data block is not a facial record");
        return Err(EmrtdError::InvalidFileStructure(fname));
    }
    // Version and record length
    cursor.skip(8)?;
    let faces = cursor.u16()?;

    let mut images = Vec::new();
    for _ in 0..faces {
        let start = cursor.pos;
        let block_len = usize_from(cursor.u32()?)?;
        let feature_points = cursor.u16()?;
        // Gender, eye and hair colour, feature mask, expression, pose angle and uncertainty
        cursor.skip(14)?;
        cursor.skip(usize::from(feature_points) * 8)?;

        // Face image type, then image data type 0 JPEG 1 JPEG 2000
        cursor.skip(1)?;
        let declared = match cursor.u8()? {
            0 => ImageEncoding::Jpeg,
            1 => ImageEncoding::Jpeg2000,
            _ => ImageEncoding::Unknown,
        };
        let width = cursor.u16()?;
        let height = cursor.u16()?;
        // Colour space, source type, device type and quality
        cursor.skip(6)?;

        let Some(image_len) = block_len.checked_sub(cursor.pos - start) else {
            error!("EF.DG2 facial record block length {block_len} is too small");
            return Err(EmrtdError::InvalidFileStructure(fname));
        };
        let mut image = BiometricImage::new(BiometricFeature::Face, declared, cursor.take(image_len)?);
        image.width = Some(width);
        image.height = Some(height);
        images.push(image);
    }
    Ok(images)
}

/// Finger images of an ISO/IEC 19794-4 finger image record.
fn parse_finger_record(block: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    let fname = "EF.DG3";
    let mut cursor = Cursor::new(block, fname);
    if cursor.take(4)? != b"FIR\x00" {
        error!("EF.DG3 biometric data block is not a finger image record");
        return Err(EmrtdError::InvalidFileStructure(fname));
    }
    // Version, record length, capture device and acquisition level
    cursor.skip(14)?;
    let fingers = cursor.u8()?;
    // Scale units and resolutions, pixel depth
    cursor.skip(10)?;
    // 0 uncompressed, 1 bit packed, 2 WSQ, 3 JPEG, 4 JPEG 2000, 5 PNG
    let declared = match cursor.u8()? {
        2 => ImageEncoding::Wsq,
        3 => ImageEncoding::Jpeg,
        4 => ImageEncoding::Jpeg2000,
        _ => ImageEncoding::Unknown,
    };
    cursor.skip(2)?;

    let mut images = Vec::new();
    for _ in 0..fingers {
        let start = cursor.pos;
        let block_len = usize_from(cursor.u32()?)?;
        let position = cursor.u8()?;
        // View count and number, quality, impression type
        cursor.skip(4)?;
        let width = cursor.u16()?;
        let height = cursor.u16()?;
        cursor.skip(1)?;

        let Some(image_len) = block_len.checked_sub(cursor.pos - start) else {
            error!("EF.DG3 finger image block length {block_len} is too small");
            return Err(EmrtdError::InvalidFileStructure(fname));
        };
        let mut image = BiometricImage::new(BiometricFeature::Finger(position), declared, cursor.take(image_len)?);
        image.width = Some(width);
        image.height = Some(height);
        images.push(image);
    }
    Ok(images)
}

/// Face images of DG2 in encounter order.
///
/// # Errors
///
/// `EmrtdError` if the file or one of its facial records is malformed.
pub fn parse_dg2(dg2: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    let mut images = Vec::new();
    for block in biometric_data_blocks(dg2, DataGroupId::Dg2)? {
        images.extend(parse_facial_record(block)?);
    }
    if images.is_empty() {
        warn!("EF.DG2 holds no face image");
    }
    Ok(images)
}

/// Finger images of DG3 in encounter order.
///
/// # Errors
///
/// `EmrtdError` if the file or one of its finger records is malformed.
pub fn parse_dg3(dg3: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    let mut images = Vec::new();
    for block in biometric_data_blocks(dg3, DataGroupId::Dg3)? {
        images.extend(parse_finger_record(block)?);
    }
    Ok(images)
}

/// Displayed images of DG5 (portrait, tag `5F40`) or DG7 (signature, tag `5F43`).
fn parse_displayed_images(
    data: &[u8],
    id: DataGroupId,
    image_tag: u32,
    feature: BiometricFeature,
) -> Result<Vec<BiometricImage>, EmrtdError> {
    let content = unwrap_file(data, &[id.tag()], id.name())?;
    let mut images = Vec::new();
    for tlv in TlvIter::new(content) {
        match tlv? {
            (tag, image) if tag == image_tag => {
                images.push(BiometricImage::new(feature, ImageEncoding::Unknown, image));
            }
            (0x02, _) => {}
            (other, _) => trace!("Skipping tag {other:04X} of {id}"),
        }
    }
    Ok(images)
}

/// # Errors
///
/// `EmrtdError` if the file is malformed.
pub fn parse_dg5(dg5: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    parse_displayed_images(dg5, DataGroupId::Dg5, 0x5F40, BiometricFeature::Portrait)
}

/// # Errors
///
/// `EmrtdError` if the file is malformed.
pub fn parse_dg7(dg7: &[u8]) -> Result<Vec<BiometricImage>, EmrtdError> {
    parse_displayed_images(dg7, DataGroupId::Dg7, 0x5F43, BiometricFeature::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asn1::encode_tlv;
    use hex_literal::hex;

    const JPEG: [u8; 6] = hex!("FFD8FFE00010");
    const JP2: [u8; 12] = hex!("0000000C6A5020200D0A870A");
    const WSQ: [u8; 4] = hex!("FFA0FFA8");

    fn facial_block(images: &[(&[u8], u8)]) -> Vec<u8> {
        let mut faces = Vec::new();
        for (image, data_type) in images {
            let mut face = Vec::new();
            face.extend_from_slice(&u32::try_from(32 + image.len()).unwrap_or(0).to_be_bytes());
            face.extend_from_slice(&hex!("0000")); // no feature points
            face.extend_from_slice(&[0; 14]);
            face.push(0x01);
            face.push(*data_type);
            face.extend_from_slice(&hex!("01E0 0280"));
            face.extend_from_slice(&[0; 6]);
            face.extend_from_slice(image);
            faces.push(face);
        }
        let body: Vec<u8> = faces.concat();
        [
            b"FAC\x00010\x00".to_vec(),
            u32::try_from(14 + body.len()).unwrap_or(0).to_be_bytes().to_vec(),
            u16::try_from(images.len()).unwrap_or(0).to_be_bytes().to_vec(),
            body,
        ]
        .concat()
    }

    fn biometric_group(tag: u8, blocks: &[Vec<u8>], block_tag: &[u8]) -> Vec<u8> {
        let templates: Vec<u8> = blocks
            .iter()
            .map(|block| {
                encode_tlv(
                    &[0x7F, 0x60],
                    &[encode_tlv(&[0xA1], &hex!("810102")), encode_tlv(block_tag, block)].concat(),
                )
            })
            .collect::<Vec<_>>()
            .concat();
        let count = u8::try_from(blocks.len()).unwrap_or(0);
        encode_tlv(
            &[tag],
            &encode_tlv(&[0x7F, 0x61], &[encode_tlv(&[0x02], &[count]), templates].concat()),
        )
    }

    #[test]
    fn test_sniff() {
        assert_eq!(ImageEncoding::sniff(&JPEG), ImageEncoding::Jpeg);
        assert_eq!(ImageEncoding::sniff(&JP2), ImageEncoding::Jpeg2000);
        assert_eq!(ImageEncoding::sniff(&hex!("FF4FFF51")), ImageEncoding::Jpeg2000);
        assert_eq!(ImageEncoding::sniff(&WSQ), ImageEncoding::Wsq);
        assert_eq!(ImageEncoding::sniff(&hex!("89504E47")), ImageEncoding::Unknown);
        assert_eq!(ImageEncoding::Jpeg2000.mime_type(), "image/jp2");
        assert_eq!(ImageEncoding::Wsq.extension(), "wsq");
    }

    #[test]
    fn test_parse_dg2_keeps_encounter_order() -> Result<(), EmrtdError> {
        let dg2 = biometric_group(
            0x75,
            &[facial_block(&[(&JP2, 1), (&JPEG, 0)]), facial_block(&[(&JPEG, 0)])],
            &[0x5F, 0x2E],
        );
        let images = parse_dg2(&dg2)?;
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].encoding, ImageEncoding::Jpeg2000);
        assert_eq!(images[0].data, JP2.to_vec());
        assert_eq!(images[0].width, Some(480));
        assert_eq!(images[0].height, Some(640));
        assert_eq!(images[1].encoding, ImageEncoding::Jpeg);
        assert_eq!(images[2].feature, BiometricFeature::Face);
        Ok(())
    }

    #[test]
    fn test_parse_dg2_rejects_truncated_record() {
        let mut block = facial_block(&[(&JPEG, 0)]);
        block.truncate(block.len() - 2);
        let dg2 = biometric_group(0x75, &[block], &[0x7F, 0x2E]);
        assert!(parse_dg2(&dg2).is_err());

        let dg2 = biometric_group(0x75, &[b"XYZ\x00".to_vec()], &[0x5F, 0x2E]);
        assert!(parse_dg2(&dg2).is_err());
    }

    #[test]
    fn test_parse_dg3() -> Result<(), EmrtdError> {
        let mut record = Vec::new();
        record.extend_from_slice(b"FIR\x00010\x00");
        record.extend_from_slice(&[0; 10]);
        record.push(0x01); // one finger
        record.extend_from_slice(&[0; 10]);
        record.push(0x02); // WSQ
        record.extend_from_slice(&[0; 2]);
        record.extend_from_slice(&u32::try_from(14 + WSQ.len()).unwrap_or(0).to_be_bytes());
        record.push(0x07); // left index finger
        record.extend_from_slice(&[0; 4]);
        record.extend_from_slice(&hex!("0100 0190"));
        record.push(0x00);
        record.extend_from_slice(&WSQ);

        let images = parse_dg3(&biometric_group(0x63, &[record], &[0x5F, 0x2E]))?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].feature, BiometricFeature::Finger(7));
        assert_eq!(images[0].encoding, ImageEncoding::Wsq);
        assert_eq!(images[0].width, Some(256));
        assert_eq!(images[0].height, Some(400));
        Ok(())
    }

    #[test]
    fn test_parse_dg5_and_dg7() -> Result<(), EmrtdError> {
        let dg5 = encode_tlv(
            &[0x65],
            &[encode_tlv(&[0x02], &[0x01]), encode_tlv(&[0x5F, 0x40], &JPEG)].concat(),
        );
        let portraits = parse_dg5(&dg5)?;
        assert_eq!(portraits.len(), 1);
        assert_eq!(portraits[0].feature, BiometricFeature::Portrait);
        assert_eq!(portraits[0].encoding, ImageEncoding::Jpeg);

        let dg7 = encode_tlv(
            &[0x67],
            &[encode_tlv(&[0x02], &[0x01]), encode_tlv(&[0x5F, 0x43], &JP2)].concat(),
        );
        let signatures = parse_dg7(&dg7)?;
        assert_eq!(signatures[0].feature, BiometricFeature::Signature);
        assert_eq!(signatures[0].encoding, ImageEncoding::Jpeg2000);

        assert!(parse_dg7(&dg5).is_err());
        Ok(())
    }
}
