use crate::{int2asn1len, EmrtdError};
use alloc::{vec, vec::Vec};
use tracing::error;

/// An Application Protocol Data Unit (APDU) used in smart card communication.
#[derive(Debug, Clone)]
pub struct APDU {
    pub(crate) cla: u8,
    pub(crate) ins: u8,
    pub(crate) p1: u8,
    pub(crate) p2: u8,
    /// Length of the command data field (Lc), one byte or extended three bytes
    pub(crate) lc: Option<Vec<u8>>,
    pub(crate) cdata: Option<Vec<u8>>,
    /// Expected length of the response data field (Le)
    pub(crate) le: Option<Vec<u8>>,
}

impl APDU {
    /// Constructs a new APDU.
    ///
    /// # Errors
    ///
    /// `EmrtdError::InvalidArgument` if the lengths of `lc` and `le` violate ISO/IEC 7816-4,
    /// or if `lc` does not describe `cdata`.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_verify::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_verify::APDU;
    /// use hex_literal::hex;
    ///
    /// let apdu = APDU::new(b'\x00', b'\x84', b'\x00', b'\x00', None, None, Some(vec![b'\x08']))?;
    /// assert_eq!(apdu.get_command_header(), hex!("00840000"));
    /// assert_eq!(apdu.to_bytes(), hex!("0084000008"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        lc: Option<Vec<u8>>,
        cdata: Option<Vec<u8>>,
        le: Option<Vec<u8>>,
    ) -> Result<Self, EmrtdError> {
        match (lc.as_ref().map(Vec::len), le.as_ref().map(Vec::len)) {
            (None | Some(1 | 3), None)
            | (None | Some(1), Some(1))
            | (Some(3), Some(2))
            | (None, Some(3)) => { /* Valid */ }
            (lc_len, le_len) => {
                error!("Invalid APDU, Lc length {lc_len:?} can not be combined with Le length {le_len:?}");
                return Err(EmrtdError::InvalidArgument("lc and le length error"));
            }
        }
        if lc.is_some() != cdata.is_some() {
            error!("Invalid APDU, Lc and command data must be given together");
            return Err(EmrtdError::InvalidArgument(
                "lc and cdata must be given together",
            ));
        }

        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            lc,
            cdata,
            le,
        })
    }

    /// Builds a short or extended APDU with Lc derived from `cdata`.
    pub(crate) fn with_data(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        cdata: Vec<u8>,
        le: Option<u8>,
    ) -> Result<Self, EmrtdError> {
        if cdata.is_empty() {
            return Self::new(cla, ins, p1, p2, None, None, le.map(|le| vec![le]));
        }
        if cdata.len() <= 0xFF {
            let lc = vec![u8::try_from(cdata.len()).map_err(EmrtdError::IntCastError)?];
            return Self::new(cla, ins, p1, p2, Some(lc), Some(cdata), le.map(|le| vec![le]));
        }
        let len = u16::try_from(cdata.len()).map_err(EmrtdError::IntCastError)?;
        let [hi, lo] = len.to_be_bytes();
        Self::new(
            cla,
            ins,
            p1,
            p2,
            Some(vec![0x00, hi, lo]),
            Some(cdata),
            le.map(|le| vec![0x00, le]),
        )
    }

    /// Retrieves the command header, CLA INS P1 P2.
    #[must_use]
    pub fn get_command_header(&self) -> Vec<u8> {
        vec![self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the plain APDU.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        [
            self.get_command_header(),
            self.lc.clone().unwrap_or_default(),
            self.cdata.clone().unwrap_or_default(),
            self.le.clone().unwrap_or_default(),
        ]
        .concat()
    }

    #[must_use]
    pub fn ins(&self) -> u8 {
        self.ins
    }
}

/// Encodes a data object for the command data field.
pub(crate) fn data_object(tag: u8, value: &[u8]) -> Vec<u8> {
    [&[tag][..], &int2asn1len(value.len()), value].concat()
}

/// PC/SC card functions used by `EmrtdComms`. Implemented for `pcsc::Card` and by test doubles.
pub trait EmrtdCard {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error>;
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error>;
}

impl EmrtdCard for pcsc::Card {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error> {
        self.get_attribute_owned(attribute)
    }
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        self.transmit(send_buffer, receive_buffer)
    }
}
