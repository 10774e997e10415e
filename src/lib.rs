//! Reads and verifies eMRTDs.
//!
//! A library that reads an eMRTD (Electronic Machine Readable Travel Document) over
//! PC/SC and tells how far its content can be trusted.
//!
//! The `emrtd_verify` crate covers the whole path from the text an OCR engine read off
//! the machine readable zone to a verified chip read:
//!
//! * [`normalize`] and [`MrzRecord`] turn noisy OCR output into a checked MRZ record
//!   and the [`MrzSeed`] the chip expects.
//! * [`ChipSessionEstablisher`] opens the chip with PACE or BAC.
//! * [`DataGroupReader`] reads the elementary files of the LDS.
//! * Chip Authentication, Passive Authentication against a [`TrustStore`] and Active
//!   Authentication each produce a verdict in the [`VerificationStatus`].
//! * [`PassportReader`] runs all of the above in order and returns a [`Passport`].
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! Terminal Authentication is **not** supported, so DG3 and DG4 of EAC protected
//! documents can not be read.
//!
//! # Quick Start
//!
//! ```no_run
//! use emrtd_verify::{
//!     CancellationToken, EmrtdComms, EmrtdError, MrzSeed, PassportReader, ReaderConfig,
//!     TrustStore,
//! };
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), EmrtdError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::INFO)
//!         .init();
//!
//!     // Establish a PC/SC context.
//!     let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
//!         Ok(ctx) => ctx,
//!         Err(err) => {
//!             error!("Failed to establish context: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     // Use the first reader.
//!     let mut readers_buf = [0; 2048];
//!     let mut readers = ctx.list_readers(&mut readers_buf).map_err(EmrtdError::PcscError)?;
//!     let Some(reader) = readers.next() else {
//!         error!("No readers are connected.");
//!         return Ok(());
//!     };
//!     let card = ctx
//!         .connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
//!         .map_err(EmrtdError::PcscError)?;
//!     let mut comms = EmrtdComms::<pcsc::Card>::new(card);
//!
//!     let seed = match MrzSeed::new("L898902C", "690806", "940623") {
//!         Ok(seed) => seed,
//!         Err(e) => {
//!             error!("Invalid MRZ: {e}");
//!             return Ok(());
//!         }
//!     };
//!
//!     let mut trust_store = TrustStore::new();
//!     trust_store.add_file_contents(&std::fs::read("csca.ml").unwrap_or_default())?;
//!
//!     let outcome = PassportReader::new(ReaderConfig::default()).read(
//!         &mut comms,
//!         &seed,
//!         &trust_store,
//!         &CancellationToken::new(),
//!     );
//!     if let Some(e) = &outcome.error {
//!         error!("{e}. {}", e.guidance().unwrap_or("Try again"));
//!     }
//!     info!("{}", outcome.passport.verification);
//!     info!("{}", outcome.passport.to_json()?);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

extern crate alloc;

pub mod active_auth;
pub mod apdu;
pub mod asn1;
pub mod biometrics;
pub mod chip_auth;
pub(crate) mod cms;
pub mod comms;
pub mod config;
pub mod crypto;
pub mod details;
pub mod error;
pub mod lds;
pub mod mrz;
pub(crate) mod pace;
pub mod passive_auth;
pub mod passport;
pub mod reader;
pub mod record;
pub mod security_info;
pub mod session;
pub mod status;
pub mod trust_store;

#[cfg(test)]
mod testing;

pub use active_auth::{authenticate_active, parse_dg15, ActiveAuthExchange};
pub use apdu::{EmrtdCard, APDU};
pub use asn1::{int2asn1len, oid_to_string};
pub use biometrics::{BiometricImage, ImageEncoding};
pub use chip_auth::authenticate_chip;
pub use comms::{EmrtdComms, PaceMapping, SecureChannelState};
pub use config::ReaderConfig;
pub use error::{CardServiceError, ChipError, EmrtdError, MrzError};
pub use lds::{DataGroupId, DataGroupReader, DataGroupSet, EfCom};
pub use mrz::{calculate_check_digit, normalize, MrzFormat, MrzScanSession, MrzSeed, NormalizedMrz};
pub use passive_auth::{PassiveAuthOutcome, PassiveAuthenticator, SecurityObject};
pub use passport::Passport;
pub use reader::{CancellationToken, PassportReader, ReadOutcome};
pub use record::{MrzRecord, TravelDocumentRecord};
pub use security_info::SecurityInfos;
pub use session::{establish_bac, AccessProtocol, ChipSessionEstablisher, OpenOutcome};
pub use status::{CheckResult, FeatureStatus, Verdict, VerificationStatus};
pub use trust_store::TrustStore;

use alloc::string::String;
use core::fmt::Write;

/// Converts a byte slice to an uppercase hexadecimal string.
///
/// # Arguments
///
/// * `bytes` - A slice of bytes to be converted.
///
/// # Returns
///
/// A `String` containing the hexadecimal representation of the input bytes.
///
/// # Examples
///
/// ```
/// use emrtd_verify::bytes2hex;
///
/// assert_eq!(bytes2hex(&[0x6F, 0x0A, 0xFF]), "6F0AFF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, byte| {
        // Writing into a String can not fail
        let _ = write!(acc, "{byte:02X}");
        acc
    })
}
