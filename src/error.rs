use alloc::string::String;
use core::fmt;
use std::num::TryFromIntError;

/// Low level failures raised while talking to the chip or decoding what it returned.
#[derive(Debug)]
#[non_exhaustive]
pub enum EmrtdError {
    RecvApduError(u8, u8),
    ParseAsn1DataError(usize, usize),
    InvalidMacKeyError(usize, usize),
    ParseDataError(String),
    InvalidArgument(&'static str),
    InvalidState(&'static str),
    VerifyMacError(),
    InvalidResponseError(),
    OverflowSscError(),
    InvalidOidError(),
    UnsupportedAlgorithm(String),
    ParseAsn1TagError(String, String),
    InvalidFileStructure(&'static str),
    VerifySignatureError(&'static str),
    VerifyHashError(String),
    CalculateHashError(&'static str),
    PcscError(pcsc::Error),
    OpensslErrorStack(openssl::error::ErrorStack),
    RasnEncodeError(rasn::error::EncodeError),
    RasnDecodeError(rasn::error::DecodeError),
    UnpadError(cipher::block_padding::UnpadError),
    IntCastError(TryFromIntError),
    JsonError(serde_json::Error),
}

impl fmt::Display for EmrtdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RecvApduError(ref sw1, ref sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::ParseAsn1DataError(ref e_len, ref f_len) => write!(
                f,
                "ASN.1 data is incomplete, expected len: {e_len}, found len: {f_len}"
            ),
            Self::InvalidMacKeyError(ref e_len, ref f_len) => write!(
                f,
                "Invalid MAC key, expected len: {e_len}, found len: {f_len}"
            ),
            Self::ParseDataError(ref error) => write!(f, "Invalid data: {error}"),
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::InvalidState(error_msg) => write!(f, "Invalid channel state: {error_msg}"),
            Self::VerifyMacError() => {
                write!(f, "Encrypted message MAC is not correct")
            }
            Self::InvalidResponseError() => {
                write!(f, "Card response is invalid")
            }
            Self::OverflowSscError() => write!(f, "SSC overflew error"),
            Self::InvalidOidError() => write!(f, "Invalid OID given"),
            Self::UnsupportedAlgorithm(ref name) => write!(f, "Unsupported algorithm: {name}"),
            Self::ParseAsn1TagError(ref expected, ref found) => {
                write!(f, "Invalid ASN.1 tag, expected: {expected}, found: {found}")
            }
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid EF structure: {error_msg}")
            }
            Self::VerifySignatureError(error_msg) => {
                write!(f, "Signature verification failure: {error_msg}")
            }
            Self::VerifyHashError(ref error_msg) => {
                write!(f, "Failure during comparison of hashes: {error_msg}")
            }
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
            Self::PcscError(ref e) => fmt::Display::fmt(&e, f),
            Self::OpensslErrorStack(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnEncodeError(ref e) => fmt::Display::fmt(&e, f),
            Self::RasnDecodeError(ref e) => fmt::Display::fmt(&e, f),
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
            Self::IntCastError(ref e) => fmt::Display::fmt(&e, f),
            Self::JsonError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}

impl std::error::Error for EmrtdError {}

/// Rejection of a scanned MRZ. Always recoverable by scanning another frame.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MrzError {
    /// The text does not start with a document type letter or has no filler.
    NotMrzLike,
    /// The text has this many line breaks, only 1 or 2 are accepted.
    WrongLineCount(usize),
    /// Neither the individual check digits nor the composite one hold.
    /// `repeated` is set when the same text was rejected by the previous frame too.
    InvalidCheckDigits { mrz: String, repeated: bool },
    UnsupportedLayout { rows: usize, columns: usize },
    InvalidCharacter(char),
    InvalidField(&'static str, String),
}

impl fmt::Display for MrzError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::NotMrzLike => write!(f, "Text does not look like an MRZ"),
            Self::WrongLineCount(ref count) => {
                write!(f, "Wrong number of lines, found {count} line breaks")
            }
            Self::InvalidCheckDigits { ref mrz, repeated } => {
                if repeated {
                    write!(f, "Invalid check digits (same reading as before): {mrz}")
                } else {
                    write!(f, "Invalid check digits: {mrz}")
                }
            }
            Self::UnsupportedLayout {
                ref rows,
                ref columns,
            } => write!(f, "Unsupported MRZ layout of {rows} rows by {columns} columns"),
            Self::InvalidCharacter(ref c) => write!(f, "MRZ can not contain the character: {c}"),
            Self::InvalidField(field, ref value) => {
                write!(f, "MRZ field {field} is invalid: {value}")
            }
        }
    }
}

impl std::error::Error for MrzError {}

/// Card communication failure that is neither an access denial nor a protocol mismatch.
#[derive(Debug)]
pub enum CardServiceError {
    /// The chip answered with a non success status word.
    Status(u8, u8),
    /// The reader or the contactless link failed, including timeouts.
    Transport(pcsc::Error),
    /// The chip answered but the answer could not be processed.
    Protocol(EmrtdError),
}

impl CardServiceError {
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(pcsc::Error::Timeout))
    }

    /// User facing hint for the transport and status word cases that have one.
    #[must_use]
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::Transport(
                pcsc::Error::Timeout
                | pcsc::Error::RemovedCard
                | pcsc::Error::ResetCard
                | pcsc::Error::NoSmartcard
                | pcsc::Error::UnpoweredCard,
            ) => Some("Hold the document steady against the reader"),
            Self::Status(0x6E, 0x00) => Some("Move the document away from the reader and tap it again"),
            Self::Status(0x68, 0x82) | Self::Status(0x69, 0x87 | 0x88) => {
                Some("The secure channel was lost, tap the document again")
            }
            _ => None,
        }
    }
}

impl fmt::Display for CardServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Status(sw1, sw2) => write!(f, "card returned status {sw1:02X} {sw2:02X}"),
            Self::Transport(ref e) => write!(f, "transport failure: {e}"),
            Self::Protocol(ref e) => write!(f, "protocol failure: {e}"),
        }
    }
}

/// Failure of the chip facing flow.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChipError {
    /// The access key derived from the MRZ does not match the chip.
    AccessDenied(String),
    PaceFailure(String),
    BacFailure(String),
    CardService(CardServiceError),
    /// The caller cancelled between two reads.
    Cancelled,
    /// A data group read was attempted before an access protocol succeeded.
    NotEstablished,
}

impl ChipError {
    /// Access denials need a new MRZ, everything else may succeed on another tap.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AccessDenied(_) | Self::NotEstablished)
    }

    #[must_use]
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::AccessDenied(_) => Some("The printed MRZ does not match the chip, scan it again"),
            Self::CardService(e) => e.guidance(),
            _ => None,
        }
    }
}

impl fmt::Display for ChipError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::AccessDenied(ref reason) => write!(f, "Access denied: {reason}"),
            Self::PaceFailure(ref reason) => write!(f, "PACE failed: {reason}"),
            Self::BacFailure(ref reason) => write!(f, "BAC failed: {reason}"),
            Self::CardService(ref e) => write!(f, "Card service error: {e}"),
            Self::Cancelled => write!(f, "Reading was cancelled"),
            Self::NotEstablished => write!(f, "No access protocol has been established"),
        }
    }
}

impl std::error::Error for ChipError {}

impl From<EmrtdError> for ChipError {
    fn from(err: EmrtdError) -> Self {
        match err {
            EmrtdError::RecvApduError(sw1, sw2) => Self::CardService(CardServiceError::Status(sw1, sw2)),
            EmrtdError::PcscError(e) => Self::CardService(CardServiceError::Transport(e)),
            other => Self::CardService(CardServiceError::Protocol(other)),
        }
    }
}

/// Status words with which a chip refuses an authentication attempt.
#[must_use]
pub(crate) fn is_denial_status(sw1: u8, sw2: u8) -> bool {
    matches!((sw1, sw2), (0x63, _) | (0x69, 0x82 | 0x83 | 0x84))
}
