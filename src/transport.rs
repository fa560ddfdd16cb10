//! APDU level transports.
//!
//! Secure messaging and the eMRTD reader only need to send a serialized
//! command APDU and receive the serialized response. [`ApduTransport`] is
//! implemented for PC/SC cards and for the ISO 14443-4 [`ChainingTransport`].

use crate::bytes2hex;
use crate::chaining::{ChainingError, ChainingTransport};
use crate::link::Link;
use std::fmt;
use tracing::{error, trace};

#[derive(Debug)]
#[non_exhaustive]
pub enum TransportError {
    Chaining(ChainingError),
    Pcsc(pcsc::Error),
    /// The card answered with less than a status word.
    ShortResponse(usize),
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Chaining(ref e) => fmt::Display::fmt(&e, f),
            Self::Pcsc(ref e) => fmt::Display::fmt(&e, f),
            Self::ShortResponse(len) => write!(
                f,
                "Card response length should be greater than or equal to 2, found {len}"
            ),
        }
    }
}
impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::Chaining(ref e) => Some(e),
            Self::Pcsc(ref e) => Some(e),
            Self::ShortResponse(_) => None,
        }
    }
}

impl From<ChainingError> for TransportError {
    fn from(err: ChainingError) -> Self {
        Self::Chaining(err)
    }
}

impl From<pcsc::Error> for TransportError {
    fn from(err: pcsc::Error) -> Self {
        Self::Pcsc(err)
    }
}

/// Sends serialized command APDUs and returns serialized responses,
/// status word included.
pub trait ApduTransport {
    /// # Errors
    ///
    /// * `TransportError` if the command could not be delivered or the
    ///   response is malformed.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;
}

impl<T: ApduTransport + ?Sized> ApduTransport for &mut T {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        (**self).transmit(command)
    }
}

impl ApduTransport for pcsc::Card {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        trace!("Sending APDU: {}", bytes2hex(command));
        let mut response_buffer = vec![0; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = pcsc::Card::transmit(self, command, &mut response_buffer)?;
        if response.len() < 2 {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                response.len()
            );
            return Err(TransportError::ShortResponse(response.len()));
        }
        trace!("APDU response: {}", bytes2hex(response));
        Ok(response.to_vec())
    }
}

/// The first command switches the field on and selects the card. The field
/// stays on between commands and is dropped after a failed exchange, so the
/// next command selects the card again.
impl<L: Link> ApduTransport for ChainingTransport<L> {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
        let activate_field = !self.is_field_on();
        self.exchange_apdu(command, activate_field, true)
            .map_err(|err| {
                self.drop_field();
                TransportError::Chaining(err)
            })
    }
}
