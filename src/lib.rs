//! ISO/IEC 14443-4 transport and eMRTD Basic Access Control.
//!
//! The `emrtd_tcl` crate talks to contactless cards at two levels:
//!
//! * [`ChainingTransport`] runs the ISO 14443-4 block transmission protocol
//!   (T=CL) on top of any reader implementing [`link::Link`]. It splits long
//!   command APDUs into chained I-blocks, reassembles chained responses,
//!   answers waiting time extension requests and selects the card with RATS
//!   when needed.
//! * [`run_bac`] and [`SecureMessagingSession`] implement Basic Access
//!   Control and secure messaging for eMRTDs as specified in ICAO Doc 9303-11.
//!   [`EmrtdReader`] uses them to read EF.COM and the data groups, and
//!   checks data groups against the hashes in EF.SOD ([`SecurityObject`]).
//!
//! Everything above the frame level works over an [`ApduTransport`], which is
//! implemented for [`ChainingTransport`] as well as for PC/SC cards.
//!
//! [`find_apdus`] enumerates the command space of a card over the chaining
//! transport and tallies the status words it answers with.
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! PACE, EAC, Active Authentication and Chip Authentication are **not**
//! supported. The signature over EF.SOD is not verified.
//!
//! # Quick Start
//!
//! ```no_run
//! use emrtd_tcl::{bytes2hex, DataGroup, EmrtdReader, Error, MrzInfo};
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), Error> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     // Document number, birth date and expiry date from the MRZ
//!     let mrz = MrzInfo::new("L898902C3", "740812", "120415")?;
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
//!     let Some(reader) = ctx.list_readers(&mut readers_buf)?.next() else {
//!         error!("No readers are connected.");
//!         return Ok(());
//!     };
//!
//!     let card = ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
//!     let mut reader = EmrtdReader::<pcsc::Card>::new(card);
//!
//!     // Runs BAC when the chip enforces it
//!     reader.authenticate(Some(&mrz))?;
//!
//!     let ef_com = reader.read_data_group(DataGroup::Com)?;
//!     for dg in emrtd_tcl::data_groups_from_ef_com(&ef_com)? {
//!         info!("{} is present: {}", dg.name(), dg.description());
//!     }
//!
//!     let ef_dg1 = reader.read_data_group(DataGroup::Dg1)?;
//!     info!("Data from the EF.DG1: {}", bytes2hex(&ef_dg1));
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

use std::fmt::{self, Write};

pub mod apdu;
pub mod asn1;
pub mod bac;
pub mod chaining;
pub mod crypto;
pub mod emrtd;
pub mod finder;
pub mod link;
pub mod mrz;
pub mod sm;
pub mod sod;
pub mod transport;

pub use apdu::{ApduError, CommandApdu, ResponseApdu};
pub use asn1::Asn1Error;
pub use bac::{run_bac, BacError};
pub use chaining::{ChainingConfig, ChainingError, ChainingTransport};
pub use crypto::CryptoError;
pub use emrtd::{data_groups_from_ef_com, DataGroup, EmrtdReader};
pub use finder::{find_apdus, FinderConfig, FinderReport, FoundApdu};
pub use link::{CardSession, FrameOptions, Link, LinkError, SelectStatus};
pub use mrz::{MrzError, MrzInfo};
pub use sm::{SecureError, SecureMessagingSession};
pub use sod::{HashAlgorithm, SecurityObject, SodError};
pub use transport::{ApduTransport, TransportError};

/// Errors of the eMRTD reader and the APDU finder, wrapping the errors of
/// the layers below.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The card answered with a status word other than `90 00`.
    RecvApdu(u8, u8),
    InvalidFileStructure(&'static str),
    InvalidArgument(&'static str),
    Link(LinkError),
    Apdu(ApduError),
    Asn1(Asn1Error),
    Chaining(ChainingError),
    Transport(TransportError),
    Crypto(CryptoError),
    Mrz(MrzError),
    Bac(BacError),
    Secure(SecureError),
    Sod(SodError),
    Pcsc(pcsc::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RecvApdu(sw1, sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::InvalidFileStructure(error_msg) => {
                write!(f, "Invalid EF structure: {error_msg}")
            }
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::Link(ref e) => fmt::Display::fmt(&e, f),
            Self::Apdu(ref e) => fmt::Display::fmt(&e, f),
            Self::Asn1(ref e) => fmt::Display::fmt(&e, f),
            Self::Chaining(ref e) => fmt::Display::fmt(&e, f),
            Self::Transport(ref e) => fmt::Display::fmt(&e, f),
            Self::Crypto(ref e) => fmt::Display::fmt(&e, f),
            Self::Mrz(ref e) => fmt::Display::fmt(&e, f),
            Self::Bac(ref e) => fmt::Display::fmt(&e, f),
            Self::Secure(ref e) => fmt::Display::fmt(&e, f),
            Self::Sod(ref e) => fmt::Display::fmt(&e, f),
            Self::Pcsc(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::RecvApdu(..) | Self::InvalidFileStructure(_) | Self::InvalidArgument(_) => None,
            Self::Link(ref e) => Some(e),
            Self::Apdu(ref e) => Some(e),
            Self::Asn1(ref e) => Some(e),
            Self::Chaining(ref e) => Some(e),
            Self::Transport(ref e) => Some(e),
            Self::Crypto(ref e) => Some(e),
            Self::Mrz(ref e) => Some(e),
            Self::Bac(ref e) => Some(e),
            Self::Secure(ref e) => Some(e),
            Self::Sod(ref e) => Some(e),
            Self::Pcsc(ref e) => Some(e),
        }
    }
}

macro_rules! impl_from_error {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(err: $source) -> Self {
                    Self::$variant(err)
                }
            }
        )*
    };
}

impl_from_error! {
    LinkError => Link,
    ApduError => Apdu,
    Asn1Error => Asn1,
    ChainingError => Chaining,
    TransportError => Transport,
    CryptoError => Crypto,
    MrzError => Mrz,
    BacError => Bac,
    SecureError => Secure,
    SodError => Sod,
    pcsc::Error => Pcsc,
}

/// Converts a byte slice to an upper-case hexadecimal string.
///
/// # Example
///
/// ```
/// use emrtd_tcl::bytes2hex;
/// let bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
/// let hex_string = bytes2hex(&bytes);
/// assert_eq!(hex_string, "DEADBEEF");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, &byte| {
        // Writing to a String can not fail
        let _ = write!(&mut acc, "{byte:02X}");
        acc
    })
}
