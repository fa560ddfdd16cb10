//! Interface to the ISO 14443-A reader hardware.
//!
//! The reader driver owns RF modulation, anticollision and CRC. This crate
//! only needs a synchronous frame exchange, card selection and a way to
//! switch the field off.

use std::fmt;
use std::time::Duration;

/// Frame Size for proximity Card, indexed by FSCI.
pub const FSC_TABLE: [u16; 9] = [16, 24, 32, 40, 48, 64, 96, 128, 256];

/// Request for Answer To Select with FSDI=8 (FSD=256) and CID=0.
pub const RATS: [u8; 2] = [0xE0, 0x80];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkError {
    /// The card did not answer in time.
    Timeout,
    NoCardInField,
    /// The card does not speak ISO 14443-4.
    UnsupportedMode,
    /// The reader received a frame with a bad CRC.
    Crc,
}
impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Timeout => write!(f, "Reply timeout"),
            Self::NoCardInField => write!(f, "No card in field"),
            Self::UnsupportedMode => write!(f, "Card is not in ISO 14443-4 mode"),
            Self::Crc => write!(f, "ISO 14443-A CRC error"),
        }
    }
}
impl std::error::Error for LinkError {}

/// Options for a single raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOptions {
    /// Let the reader append CRC_A.
    pub append_crc: bool,
    /// Number of valid bits in the last byte, `0` for whole bytes.
    pub bit_count: u16,
    /// How long to wait for the card.
    pub timeout: Duration,
    /// Keep the RF field on after the exchange.
    pub keep_field_on: bool,
}

impl FrameOptions {
    /// Whole-byte frame with CRC, field kept on.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self {
            append_crc: true,
            bit_count: 0,
            timeout,
            keep_field_on: true,
        }
    }

    #[must_use]
    pub const fn with_keep_field_on(mut self, keep_field_on: bool) -> Self {
        self.keep_field_on = keep_field_on;
        self
    }
}

/// Outcome of anticollision and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectStatus {
    /// Selected, the ATS was read during selection.
    WithAts,
    /// Selected, RATS was skipped.
    WithoutAts,
    /// Proprietary anticollision, no ISO 14443-4.
    Proprietary,
}

/// The card currently selected in the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSession {
    /// 4, 7 or 10 bytes
    pub uid: Vec<u8>,
    pub atqa: [u8; 2],
    pub sak: u8,
    /// Answer To Select, at most 254 bytes, empty when not yet requested
    pub ats: Vec<u8>,
    pub select_status: SelectStatus,
    /// Negotiated FSC, `0` when unknown
    pub frame_size: u16,
}

/// Synchronous ISO 14443-A reader.
///
/// Responses returned by [`Link::exchange_raw_frame`] include the protocol
/// control byte at index 0 and have the CRC already checked and stripped.
pub trait Link {
    /// Sends one frame and waits for the answer.
    ///
    /// # Errors
    ///
    /// * `LinkError` on timeout, CRC failure or when no card answers.
    fn exchange_raw_frame(
        &mut self,
        frame: &[u8],
        options: &FrameOptions,
    ) -> Result<Vec<u8>, LinkError>;

    /// Runs anticollision and selects a card, leaving the field on.
    ///
    /// # Errors
    ///
    /// * `LinkError::NoCardInField` if nothing answered.
    fn select_card(&mut self, skip_rats: bool) -> Result<CardSession, LinkError>;

    /// Switches the RF field off.
    fn drop_field(&mut self);
}

/// Looks up the FSC for an FSCI, `None` past the end of the table.
#[must_use]
pub fn frame_size_from_fsci(fsci: u8) -> Option<u16> {
    FSC_TABLE.get(usize::from(fsci)).copied()
}

/// Extracts the FSC from the format byte of an ATS.
#[must_use]
pub fn frame_size_from_ats(ats: &[u8]) -> Option<u16> {
    match ats {
        [_, format, ..] => frame_size_from_fsci(format & 0x0F),
        _ => None,
    }
}
