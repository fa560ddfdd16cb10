//! BAC secure messaging, ICAO Doc 9303-11 Section 9.8.
//!
//! A [`SecureMessagingSession`] is created by [`crate::run_bac`] and then
//! protects every command sent to the chip. Each wrapped command and each
//! unwrapped response advances the Send Sequence Counter once; after an
//! integrity failure the session refuses further use.

use crate::apdu::{ApduError, CommandApdu, ResponseApdu, MAX_EXTENDED_LE, MAX_SHORT_DATA, MAX_SHORT_LE};
use crate::asn1::{int2asn1len, len2int, Asn1Error};
use crate::bytes2hex;
use crate::crypto::{padding_method_2, remove_padding, retail_mac, tdes_decrypt, tdes_encrypt, CryptoError};
use crate::transport::{ApduTransport, TransportError};
use constant_time_eq::constant_time_eq;
use std::fmt;
use tracing::{error, trace};

const TAG_ODD_INS_DATA: u8 = 0x85;
const TAG_ENCRYPTED_DATA: u8 = 0x87;
const TAG_LE: u8 = 0x97;
const TAG_STATUS: u8 = 0x99;
const TAG_MAC: u8 = 0x8E;
const PADDING_INDICATOR: u8 = 0x01;

#[derive(Debug)]
#[non_exhaustive]
pub enum SecureError {
    /// The response MAC is missing or wrong.
    IntegrityFailure,
    /// Response data could not be decrypted or unpadded.
    DecryptionFailure,
    /// A previous failure ended the session, BAC has to be run again.
    SessionInvalidated,
    MalformedResponse(String),
    /// The Send Sequence Counter would wrap around.
    SscOverflow,
    Transport(TransportError),
    Crypto(CryptoError),
    Apdu(ApduError),
}
impl fmt::Display for SecureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::IntegrityFailure => write!(f, "MAC verification failed"),
            Self::DecryptionFailure => write!(f, "Secure response data could not be decrypted"),
            Self::SessionInvalidated => write!(
                f,
                "Secure messaging session is no longer valid, authenticate again"
            ),
            Self::MalformedResponse(ref reason) => {
                write!(f, "Malformed secure response: {reason}")
            }
            Self::SscOverflow => write!(f, "Send Sequence Counter overflow"),
            Self::Transport(ref e) => fmt::Display::fmt(&e, f),
            Self::Crypto(ref e) => fmt::Display::fmt(&e, f),
            Self::Apdu(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
impl std::error::Error for SecureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::Transport(ref e) => Some(e),
            Self::Crypto(ref e) => Some(e),
            Self::Apdu(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SecureError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<CryptoError> for SecureError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

impl From<ApduError> for SecureError {
    fn from(err: ApduError) -> Self {
        Self::Apdu(err)
    }
}

impl From<Asn1Error> for SecureError {
    fn from(err: Asn1Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

/// Session keys and Send Sequence Counter established by BAC.
pub struct SecureMessagingSession {
    ks_enc: [u8; 16],
    ks_mac: [u8; 16],
    ssc: [u8; 8],
    invalidated: bool,
}

impl fmt::Debug for SecureMessagingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessagingSession")
            .field("ssc", &bytes2hex(&self.ssc))
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}

impl SecureMessagingSession {
    /// Starts a session with the keys and counter agreed by BAC.
    ///
    /// For the derivation, see ICAO Doc 9303-11 Section 9.7.4 and Appendix D.3
    /// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
    ///
    /// # Arguments
    ///
    /// * `ks_enc` - 3DES session key for DO'85' / DO'87' encryption.
    /// * `ks_mac` - 3DES session key for the retail MAC.
    /// * `ssc` - Send Sequence Counter, `rnd.IC[4..8] || rnd.IFD[4..8]`.
    ///
    /// # Returns
    ///
    /// A usable session. Every exchange advances `ssc` by two.
    #[must_use]
    pub const fn new(ks_enc: [u8; 16], ks_mac: [u8; 16], ssc: [u8; 8]) -> Self {
        Self {
            ks_enc,
            ks_mac,
            ssc,
            invalidated: false,
        }
    }

    #[must_use]
    pub const fn ssc(&self) -> [u8; 8] {
        self.ssc
    }

    #[must_use]
    pub const fn ks_enc(&self) -> &[u8; 16] {
        &self.ks_enc
    }

    #[must_use]
    pub const fn ks_mac(&self) -> &[u8; 16] {
        &self.ks_mac
    }

    #[must_use]
    pub const fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    fn ensure_valid(&self) -> Result<(), SecureError> {
        if self.invalidated {
            error!("Secure messaging session was invalidated by an earlier failure");
            return Err(SecureError::SessionInvalidated);
        }
        Ok(())
    }

    /// The counter value following the current one. Overflow ends the
    /// session.
    fn next_ssc(&mut self) -> Result<[u8; 8], SecureError> {
        let Some(next) = u64::from_be_bytes(self.ssc).checked_add(1) else {
            error!("SSC can not be incremented past {}", bytes2hex(&self.ssc));
            self.invalidated = true;
            return Err(SecureError::SscOverflow);
        };
        Ok(next.to_be_bytes())
    }

    fn increment_ssc(&mut self) -> Result<(), SecureError> {
        self.ssc = self.next_ssc()?;
        trace!("SSC: {}", bytes2hex(&self.ssc));
        Ok(())
    }

    /// Protects a command APDU.
    ///
    /// Command data is encrypted into DO'87' (even INS) or DO'85' (odd INS),
    /// Le is carried in DO'97' and DO'8E' holds the retail MAC over
    /// `SSC || padded header || data objects`.
    ///
    /// # Arguments
    ///
    /// * `command` - Plaintext command APDU, Le of 256 or 65536 included.
    ///
    /// # Returns
    ///
    /// The protected command. The SSC is advanced only when this succeeds.
    ///
    /// # Errors
    ///
    /// * `SecureError::SessionInvalidated` after an earlier failure.
    /// * `SecureError::SscOverflow` if the counter is exhausted.
    /// * `SecureError::Apdu` if Le is above 65536 or the protected command
    ///   does not fit in an extended APDU.
    /// * `SecureError::Crypto` if encryption fails.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_tcl::sm::SecureError;
    /// #
    /// # fn main() -> Result<(), SecureError> {
    /// use emrtd_tcl::{CommandApdu, SecureMessagingSession};
    /// use hex_literal::hex;
    ///
    /// let mut session = SecureMessagingSession::new(
    ///     hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"),
    ///     hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"),
    ///     hex!("887022120C06C226"),
    /// );
    /// let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, hex!("011E").to_vec(), 0);
    /// let protected = session.wrap(&select)?;
    /// assert_eq!(
    ///     protected.encode()?,
    ///     hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800")
    /// );
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn wrap(&mut self, command: &CommandApdu) -> Result<CommandApdu, SecureError> {
        self.ensure_valid()?;
        if command.le > MAX_EXTENDED_LE {
            error!("Can not protect APDU, Le {} exceeds {MAX_EXTENDED_LE}", command.le);
            return Err(SecureError::Apdu(ApduError::LeTooLarge {
                maximum: MAX_EXTENDED_LE,
                found: command.le,
            }));
        }
        // The counter only moves once the protected command is known to encode
        let ssc = self.next_ssc()?;

        let header = [command.cla | 0x0C, command.ins, command.p1, command.p2];

        let mut payload = Vec::new();
        if !command.data.is_empty() {
            let encrypted_data = tdes_encrypt(&self.ks_enc, &padding_method_2(&command.data))?;
            if command.ins % 2 == 0 {
                payload.push(TAG_ENCRYPTED_DATA);
                payload.extend(int2asn1len(encrypted_data.len() + 1));
                payload.push(PADDING_INDICATOR);
            } else {
                payload.push(TAG_ODD_INS_DATA);
                payload.extend(int2asn1len(encrypted_data.len()));
            }
            payload.extend(encrypted_data);
        }

        if command.le > 0 {
            let le = if command.le <= MAX_SHORT_LE {
                // 256 is encoded as 00
                vec![command.le as u8]
            } else {
                ((command.le % MAX_EXTENDED_LE) as u16).to_be_bytes().to_vec()
            };
            payload.push(TAG_LE);
            payload.extend(int2asn1len(le.len()));
            payload.extend(le);
        }

        let mut mac_input = Vec::with_capacity(8 + 8 + payload.len());
        mac_input.extend_from_slice(&ssc);
        mac_input.extend(padding_method_2(&header));
        mac_input.extend_from_slice(&payload);
        let cc = retail_mac(&self.ks_mac, &mac_input)?;

        payload.push(TAG_MAC);
        payload.extend(int2asn1len(cc.len()));
        payload.extend_from_slice(&cc);

        let extended = command.extended || payload.len() > MAX_SHORT_DATA;
        let le = if extended { MAX_EXTENDED_LE } else { MAX_SHORT_LE };
        let protected = CommandApdu {
            cla: header[0],
            ins: header[1],
            p1: header[2],
            p2: header[3],
            data: payload,
            le,
            extended,
        };
        protected.encode()?;

        self.ssc = ssc;
        trace!("SSC: {}", bytes2hex(&self.ssc));
        trace!("Protected APDU data: {}", bytes2hex(&protected.data));
        Ok(protected)
    }

    /// Verifies and decrypts a protected response APDU.
    ///
    /// # Arguments
    ///
    /// * `response` - Protected response bytes, status word included.
    ///
    /// # Returns
    ///
    /// The plaintext response with the status word of the protected one.
    ///
    /// # Errors
    ///
    /// * `SecureError::IntegrityFailure` if DO'8E' is missing or wrong. The
    ///   session is invalidated.
    /// * `SecureError::MalformedResponse` on unknown or truncated data
    ///   objects.
    /// * `SecureError::DecryptionFailure` if the data does not decrypt to a
    ///   padded plaintext.
    pub fn unwrap(&mut self, response: &[u8]) -> Result<ResponseApdu, SecureError> {
        self.ensure_valid()?;
        self.increment_ssc()?;

        let protected = ResponseApdu::decode(response)?;
        trace!("R_APDU: {}", bytes2hex(&protected.data));

        let mut mac_input = self.ssc.to_vec();
        let mut encrypted: Option<(u8, &[u8])> = None;
        let mut mac: Option<&[u8]> = None;

        let mut rest = protected.data.as_slice();
        while let Some(&tag) = rest.first() {
            let (tl_len, value_len) = len2int(rest, 1)?;
            let Some(object) = rest.get(..tl_len + value_len) else {
                error!(
                    "Data object {tag:02X} needs {} bytes, found {}",
                    tl_len + value_len,
                    rest.len()
                );
                return Err(SecureError::MalformedResponse(format!(
                    "data object {tag:02X} is truncated"
                )));
            };
            let value = &object[tl_len..];
            match tag {
                TAG_ODD_INS_DATA | TAG_ENCRYPTED_DATA => {
                    mac_input.extend_from_slice(object);
                    encrypted = Some((tag, value));
                }
                TAG_STATUS => mac_input.extend_from_slice(object),
                TAG_MAC => mac = Some(value),
                _ => {
                    error!("Tag {tag:02X} not supported in encrypted R_APDU");
                    return Err(SecureError::MalformedResponse(format!(
                        "tag {tag:02X} not supported in encrypted R_APDU"
                    )));
                }
            }
            rest = &rest[tl_len + value_len..];
        }

        let Some(mac) = mac else {
            error!("Secure response has no MAC");
            self.invalidated = true;
            return Err(SecureError::IntegrityFailure);
        };
        let cc = retail_mac(&self.ks_mac, &mac_input)?;
        if !constant_time_eq(&cc, mac) {
            error!("MAC verification failed");
            self.invalidated = true;
            return Err(SecureError::IntegrityFailure);
        }

        let data = match encrypted {
            None => Vec::new(),
            Some((tag, value)) => {
                let ciphertext = if tag == TAG_ENCRYPTED_DATA {
                    match value.split_first() {
                        Some((&PADDING_INDICATOR, ciphertext)) => ciphertext,
                        _ => {
                            error!("DO'87' without padding content indicator");
                            return Err(SecureError::DecryptionFailure);
                        }
                    }
                } else {
                    value
                };
                let padded = tdes_decrypt(&self.ks_enc, ciphertext).map_err(|err| {
                    error!("Can not decrypt response data: {err}");
                    SecureError::DecryptionFailure
                })?;
                let Some(plaintext) = remove_padding(&padded) else {
                    error!("Decrypted response data is not padded");
                    return Err(SecureError::DecryptionFailure);
                };
                plaintext.to_vec()
            }
        };

        trace!(
            "APDU response ({:02X}{:02X}): {}",
            protected.sw1,
            protected.sw2,
            bytes2hex(&data)
        );
        Ok(ResponseApdu {
            data,
            sw1: protected.sw1,
            sw2: protected.sw2,
        })
    }

    /// Wraps `command`, sends it and unwraps the answer.
    ///
    /// A transport failure leaves the counters of card and reader out of
    /// step, so it invalidates the session as well.
    ///
    /// # Arguments
    ///
    /// * `transport` - Where the protected command is sent.
    /// * `command` - Plaintext command APDU.
    ///
    /// # Returns
    ///
    /// The verified plaintext response.
    ///
    /// # Errors
    ///
    /// * `SecureError::Transport` if sending fails. The session is
    ///   invalidated.
    /// * `SecureError` if wrapping or unwrapping fails, see [`Self::wrap`]
    ///   and [`Self::unwrap`].
    pub fn transmit<T: ApduTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: &CommandApdu,
    ) -> Result<ResponseApdu, SecureError> {
        let protected = self.wrap(command)?.encode()?;
        trace!("Sending Protected APDU: {}", bytes2hex(&protected));
        let response = transport.transmit(&protected).map_err(|err| {
            error!("Protected APDU exchange failed: {err}");
            self.invalidated = true;
            SecureError::Transport(err)
        })?;
        self.unwrap(&response)
    }

    /// Serialized form of [`Self::transmit`], plaintext command bytes in,
    /// plaintext response bytes with status word out.
    ///
    /// # Arguments
    ///
    /// * `transport` - Where the protected command is sent.
    /// * `command` - Serialized plaintext command APDU.
    ///
    /// # Returns
    ///
    /// The plaintext response data followed by SW1 SW2.
    ///
    /// # Errors
    ///
    /// * `SecureError::Apdu` if `command` is not a valid APDU.
    /// * `SecureError` if wrapping, sending or unwrapping fails, see
    ///   [`Self::transmit`].
    pub fn secure_exchange<T: ApduTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: &[u8],
    ) -> Result<Vec<u8>, SecureError> {
        let command = CommandApdu::decode(command)?;
        Ok(self.transmit(transport, &command)?.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::MockCard;
    use hex_literal::hex;

    // ICAO Doc 9303-11 Appendix D.4
    const KS_ENC: [u8; 16] = hex!("979EC13B1CBFE9DCD01AB0FED307EAE5");
    const KS_MAC: [u8; 16] = hex!("F1CB1F1FB5ADF208806B89DC579DC1F8");
    const SSC: [u8; 8] = hex!("887022120C06C226");

    fn session() -> SecureMessagingSession {
        SecureMessagingSession::new(KS_ENC, KS_MAC, SSC)
    }

    #[test]
    fn test_icao_worked_example() -> Result<(), SecureError> {
        let mut session = session();

        // Select EF.COM
        let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, hex!("011E").to_vec(), 0);
        assert_eq!(
            session.wrap(&select)?.encode()?,
            hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800")
        );
        assert_eq!(session.ssc(), hex!("887022120C06C227"));
        let response = session.unwrap(&hex!("990290008E08FA855A5D4C50A8ED9000"))?;
        assert!(response.data.is_empty());
        assert_eq!(response.sw(), 0x9000);
        assert_eq!(session.ssc(), hex!("887022120C06C228"));

        // Read the first four bytes of EF.COM
        let read = CommandApdu::new(0x00, 0xB0, 0x00, 0x00, vec![], 4);
        assert_eq!(
            session.wrap(&read)?.encode()?,
            hex!("0CB000000D9701048E08ED6705417E96BA5500")
        );
        let response = session.unwrap(&hex!(
            "8709019FF0EC34F9922651990290008E08AD55CC17140B2DED9000"
        ))?;
        assert_eq!(response.data, hex!("60145F01"));

        // Read the remaining 18 bytes
        let read = CommandApdu::new(0x00, 0xB0, 0x00, 0x04, vec![], 0x12);
        assert_eq!(
            session.wrap(&read)?.encode()?,
            hex!("0CB000040D9701128E082EA28A70F3C7B53500")
        );
        let response = session.unwrap(&hex!(
            "871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A
             990290008E08C8B2787EAEA07D74 9000"
        ))?;
        assert_eq!(response.data, hex!("04303130365F36063034303030305C026175"));
        assert_eq!(session.ssc(), hex!("887022120C06C22C"));
        Ok(())
    }

    #[test]
    fn test_secure_exchange_over_transport() -> Result<(), SecureError> {
        let mut card = MockCard::new(&[
            (
                &hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
                &hex!("990290008E08FA855A5D4C50A8ED9000"),
            ),
            (
                &hex!("0CB000000D9701048E08ED6705417E96BA5500"),
                &hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED9000"),
            ),
        ]);
        let mut session = session();
        assert_eq!(
            session.secure_exchange(&mut card, &hex!("00A4020C02011E"))?,
            hex!("9000")
        );
        assert_eq!(
            session.secure_exchange(&mut card, &hex!("00B0000004"))?,
            hex!("60145F01 9000")
        );
        Ok(())
    }

    #[test]
    fn test_odd_ins_uses_do85() -> Result<(), SecureError> {
        let mut session = session();
        let command = CommandApdu::new(0x00, 0xB1, 0x00, 0x00, hex!("5402001E").to_vec(), 0);
        let protected = session.wrap(&command)?;
        assert_eq!(protected.data[..2], hex!("8508"));
        assert_eq!(protected.data.len(), 2 + 8 + 10);
        assert_eq!(protected.data[10..12], hex!("8E08"));
        Ok(())
    }

    #[test]
    fn test_flipped_mac_byte_is_an_integrity_failure() {
        let valid = hex!("990290008E08FA855A5D4C50A8ED9000");
        for position in 6..14 {
            let mut session = session();
            session
                .wrap(&CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, hex!("011E").to_vec(), 0))
                .expect("wrap");

            let mut tampered = valid;
            tampered[position] ^= 0x01;
            assert!(matches!(
                session.unwrap(&tampered),
                Err(SecureError::IntegrityFailure)
            ));
            assert!(session.is_invalidated());
            assert!(matches!(
                session.unwrap(&valid),
                Err(SecureError::SessionInvalidated)
            ));
            assert!(matches!(
                session.wrap(&CommandApdu::new(0x00, 0xB0, 0x00, 0x00, vec![], 4)),
                Err(SecureError::SessionInvalidated)
            ));
        }
    }

    #[test]
    fn test_missing_mac_is_an_integrity_failure() {
        let mut session = session();
        assert!(matches!(
            session.unwrap(&hex!("99029000 9000")),
            Err(SecureError::IntegrityFailure)
        ));
        assert!(session.is_invalidated());
    }

    #[test]
    fn test_malformed_responses() {
        let mut session = session();
        assert!(matches!(
            session.unwrap(&hex!("5C02 6175 9000")),
            Err(SecureError::MalformedResponse(_))
        ));
        let mut session = self::session();
        assert!(matches!(
            session.unwrap(&hex!("990A9000 9000")),
            Err(SecureError::MalformedResponse(_))
        ));
        let mut session = self::session();
        assert!(matches!(session.unwrap(&hex!("90")), Err(SecureError::Apdu(_))));
    }

    #[test]
    fn test_ssc_carries_and_overflows() -> Result<(), SecureError> {
        let mut session = SecureMessagingSession::new(KS_ENC, KS_MAC, hex!("00000000FFFFFFFF"));
        session.wrap(&CommandApdu::new(0x00, 0xB0, 0x00, 0x00, vec![], 4))?;
        assert_eq!(session.ssc(), hex!("0000000100000000"));

        let mut session = SecureMessagingSession::new(KS_ENC, KS_MAC, [0xFF; 8]);
        assert!(matches!(
            session.wrap(&CommandApdu::new(0x00, 0xB0, 0x00, 0x00, vec![], 4)),
            Err(SecureError::SscOverflow)
        ));
        assert!(session.is_invalidated());
        Ok(())
    }

    #[test]
    fn test_oversized_command_leaves_counter_in_step() -> Result<(), SecureError> {
        let mut card = MockCard::new(&[(
            &hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
            &hex!("990290008E08FA855A5D4C50A8ED9000"),
        )]);
        let mut session = session();

        let oversized = CommandApdu::new(0x00, 0xD6, 0x00, 0x00, vec![0x5A; 65_520], 0);
        assert!(matches!(
            session.transmit(&mut card, &oversized),
            Err(SecureError::Apdu(ApduError::DataTooLong { .. }))
        ));
        assert!(card.sent.is_empty());
        assert_eq!(session.ssc(), SSC);
        assert!(!session.is_invalidated());

        let select = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, hex!("011E").to_vec(), 0);
        assert_eq!(session.transmit(&mut card, &select)?.sw(), 0x9000);
        assert_eq!(session.ssc(), hex!("887022120C06C228"));
        Ok(())
    }

    #[test]
    fn test_le_above_extended_maximum_is_rejected() {
        let mut session = session();
        let read = CommandApdu {
            cla: 0x00,
            ins: 0xB0,
            p1: 0x00,
            p2: 0x00,
            data: vec![],
            le: 70_000,
            extended: true,
        };
        assert!(matches!(
            session.wrap(&read),
            Err(SecureError::Apdu(ApduError::LeTooLarge {
                maximum: 65_536,
                found: 70_000
            }))
        ));
        assert_eq!(session.ssc(), SSC);

        // 65536 is still carried, as 0000
        let read = CommandApdu { le: 65_536, ..read };
        let protected = session.wrap(&read).expect("wrap");
        assert_eq!(protected.data[..4], hex!("97020000"));
    }

    #[test]
    fn test_transport_failure_invalidates_session() {
        let mut card = MockCard::new(&[]);
        let mut session = session();
        assert!(matches!(
            session.secure_exchange(&mut card, &hex!("00B0000004")),
            Err(SecureError::Transport(_))
        ));
        assert!(session.is_invalidated());
    }

    #[test]
    fn test_session_debug_hides_keys() {
        let debug = format!("{:?}", session());
        assert!(debug.contains("887022120C06C226"));
        assert!(!debug.contains("979EC13B"));
    }
}
