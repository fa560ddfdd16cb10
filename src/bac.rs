//! Basic Access Control, ICAO Doc 9303-11 Section 4.3.
//!
//! Mutual authentication between reader and chip using keys derived from
//! the MRZ. A successful run yields the [`SecureMessagingSession`] used for
//! everything sent afterwards.

use crate::apdu::{ApduError, CommandApdu, ResponseApdu};
use crate::bytes2hex;
use crate::crypto::{
    derive_key, generate_key_seed, retail_mac, tdes_decrypt, tdes_encrypt, xor_slices, CryptoError,
    KeyType,
};
use crate::mrz::{MrzError, MrzInfo};
use crate::sm::SecureMessagingSession;
use crate::transport::{ApduTransport, TransportError};
use constant_time_eq::constant_time_eq;
use rand::{CryptoRng, RngCore};
use std::fmt;
use tracing::{debug, error, info, trace};

#[derive(Debug)]
#[non_exhaustive]
pub enum BacError {
    /// BAC is required but no MRZ was given.
    MissingMrzData,
    InvalidMrz(MrzError),
    /// GET CHALLENGE did not return a nonce.
    ChallengeFailed(&'static str),
    /// The chip refused EXTERNAL AUTHENTICATE or answered with a cryptogram
    /// that does not match the reader's keys and nonces.
    AuthenticationRejected(&'static str),
    Transport(TransportError),
    Crypto(CryptoError),
    Apdu(ApduError),
}
impl fmt::Display for BacError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::MissingMrzData => write!(f, "eMRTD requires BAC but no MRZ data was supplied"),
            Self::InvalidMrz(ref e) => fmt::Display::fmt(&e, f),
            Self::ChallengeFailed(reason) => write!(f, "GET CHALLENGE failed: {reason}"),
            Self::AuthenticationRejected(reason) => {
                write!(f, "BAC authentication failed: {reason}")
            }
            Self::Transport(ref e) => fmt::Display::fmt(&e, f),
            Self::Crypto(ref e) => fmt::Display::fmt(&e, f),
            Self::Apdu(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
impl std::error::Error for BacError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::InvalidMrz(ref e) => Some(e),
            Self::Transport(ref e) => Some(e),
            Self::Crypto(ref e) => Some(e),
            Self::Apdu(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<MrzError> for BacError {
    fn from(err: MrzError) -> Self {
        match err {
            MrzError::MissingField(_) => Self::MissingMrzData,
            err => Self::InvalidMrz(err),
        }
    }
}

impl From<TransportError> for BacError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<CryptoError> for BacError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

impl From<ApduError> for BacError {
    fn from(err: ApduError) -> Self {
        Self::Apdu(err)
    }
}

fn send_plain<T: ApduTransport + ?Sized>(
    transport: &mut T,
    command: &CommandApdu,
) -> Result<ResponseApdu, BacError> {
    let response = transport.transmit(&command.encode()?)?;
    Ok(ResponseApdu::decode(&response)?)
}

/// Runs BAC with the keys derived from `mrz`.
///
/// The chip's nonce is fetched with GET CHALLENGE, the reader's nonce and
/// key material come from `rng`. Besides rnd.IFD the chip's MAC and echoed
/// rnd.IC are verified.
///
/// For more details and examples, see ICAO Doc 9303-11 Section 4.3 and Appendix D.3
/// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
///
/// # Arguments
///
/// * `transport` - Card with the eMRTD application already selected.
/// * `rng` - Source of rnd.IFD and K.IFD.
/// * `mrz` - Document number, birth date and expiry date of the document.
///
/// # Returns
///
/// The session keys with the SSC set to `rnd.IC[4..8] || rnd.IFD[4..8]`.
///
/// # Errors
///
/// * `BacError::InvalidMrz` if the MRZ data does not form a key seed.
/// * `BacError::ChallengeFailed` if GET CHALLENGE fails.
/// * `BacError::AuthenticationRejected` if EXTERNAL AUTHENTICATE fails or
///   the chip's answer does not verify, usually because of wrong MRZ data.
/// * `BacError::Transport` on communication failures.
///
/// # Example
///
/// ```no_run
/// # use emrtd_tcl::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use emrtd_tcl::{run_bac, EmrtdReader, MrzInfo};
/// use rand::rngs::OsRng;
///
/// let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
/// let mut readers_buf = [0; 2048];
/// let Some(reader) = ctx.list_readers(&mut readers_buf)?.next() else {
///     return Ok(());
/// };
/// let card = ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
///
/// let mut emrtd = EmrtdReader::<pcsc::Card>::new(card);
/// emrtd.select_emrtd_application()?;
///
/// let mrz = MrzInfo::new("L898902C3", "740812", "120415")?;
/// let mut card = emrtd.into_transport();
/// let session = run_bac(&mut card, &mut OsRng, &mrz)?;
/// println!("SSC: {}", emrtd_tcl::bytes2hex(&session.ssc()));
/// #
/// #     Ok(())
/// # }
/// ```
pub fn run_bac<T, R>(
    transport: &mut T,
    rng: &mut R,
    mrz: &MrzInfo,
) -> Result<SecureMessagingSession, BacError>
where
    T: ApduTransport + ?Sized,
    R: RngCore + CryptoRng,
{
    let secret = mrz.secret()?;
    let ba_key_seed = generate_key_seed(secret.as_bytes())?;

    trace!("Computing basic access keys...");
    let ba_key_enc = derive_key(&ba_key_seed, KeyType::Encryption)?;
    let ba_key_mac = derive_key(&ba_key_seed, KeyType::Mac)?;

    trace!("Establishing session keys...");
    let response = send_plain(transport, &CommandApdu::new(0x00, 0x84, 0x00, 0x00, vec![], 8))?;
    if !response.is_success() {
        error!(
            "Received invalid SW during GET CHALLENGE: {:02X} {:02X}",
            response.sw1, response.sw2
        );
        return Err(BacError::ChallengeFailed("card rejected GET CHALLENGE"));
    }
    let Ok(rnd_ic) = <[u8; 8]>::try_from(response.data.as_slice()) else {
        error!(
            "GET CHALLENGE returned {} bytes instead of 8",
            response.data.len()
        );
        return Err(BacError::ChallengeFailed("challenge is not 8 bytes long"));
    };
    debug!("rnd.IC: {}", bytes2hex(&rnd_ic));

    let mut rnd_ifd = [0; 8];
    rng.fill_bytes(&mut rnd_ifd);
    let mut k_ifd = [0; 16];
    rng.fill_bytes(&mut k_ifd);

    let mut s = Vec::with_capacity(32);
    s.extend_from_slice(&rnd_ifd);
    s.extend_from_slice(&rnd_ic);
    s.extend_from_slice(&k_ifd);
    let e_ifd = tdes_encrypt(&ba_key_enc, &s)?;
    let m_ifd = retail_mac(&ba_key_mac, &e_ifd)?;

    let mut cmd_data = e_ifd;
    cmd_data.extend_from_slice(&m_ifd);
    let response = send_plain(
        transport,
        &CommandApdu::new(0x00, 0x82, 0x00, 0x00, cmd_data, 0x28),
    )?;
    if !response.is_success() {
        error!(
            "Received invalid SW during EXTERNAL AUTHENTICATE: {:02X} {:02X}",
            response.sw1, response.sw2
        );
        return Err(BacError::AuthenticationRejected(
            "card rejected EXTERNAL AUTHENTICATE",
        ));
    }
    if response.data.len() != 40 {
        error!(
            "EXTERNAL AUTHENTICATE returned {} bytes instead of 40",
            response.data.len()
        );
        return Err(BacError::AuthenticationRejected(
            "cryptogram is not 40 bytes long",
        ));
    }

    let (e_ic, m_ic) = response.data.split_at(32);
    if !constant_time_eq(&retail_mac(&ba_key_mac, e_ic)?, m_ic) {
        error!("MAC verification failed");
        return Err(BacError::AuthenticationRejected("MAC of the card cryptogram"));
    }

    let r = tdes_decrypt(&ba_key_enc, e_ic)?;
    if !constant_time_eq(&r[..8], &rnd_ic) {
        error!("Card cryptogram does not contain rnd.IC");
        return Err(BacError::AuthenticationRejected("rnd.IC mismatch"));
    }
    if !constant_time_eq(&r[8..16], &rnd_ifd) {
        error!("Card cryptogram does not contain rnd.IFD");
        return Err(BacError::AuthenticationRejected("rnd.IFD mismatch"));
    }
    let k_ic = &r[16..32];

    let ses_key_seed = xor_slices(&k_ifd, k_ic)?;
    let ks_enc = derive_key(&ses_key_seed, KeyType::Encryption)?;
    let ks_mac = derive_key(&ses_key_seed, KeyType::Mac)?;

    let mut ssc = [0; 8];
    ssc[..4].copy_from_slice(&rnd_ic[4..]);
    ssc[4..].copy_from_slice(&rnd_ifd[4..]);

    info!("BAC session established");
    Ok(SecureMessagingSession::new(ks_enc, ks_mac, ssc))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::tests::MockCard;
    use hex_literal::hex;

    // ICAO Doc 9303-11 Appendix D.3
    pub(crate) const GET_CHALLENGE: ([u8; 5], [u8; 10]) =
        (hex!("0084000008"), hex!("4608F91988702212 9000"));
    pub(crate) const EXTERNAL_AUTHENTICATE: ([u8; 46], [u8; 42]) = (
        hex!(
            "0082000028 72C29C2371CC9BDB65B779B8E8D37B29ECC154AA
             56A8799FAE2F498F76ED92F25F1448EEA8AD90A7 28"
        ),
        hex!(
            "46B9342A41396CD7386BF5803104D7CEDC122B91
             32139BAF2EEDC94EE178534F2F2D235D074D7449 9000"
        ),
    );

    #[derive(Clone, Debug)]
    pub(crate) struct MockRng {
        data: Vec<u8>,
        index: usize,
    }

    impl Default for MockRng {
        fn default() -> MockRng {
            MockRng {
                data: hex!(
                    "781723860C06C226
                     0B795240CB7049B01C19B33E32804F0B"
                )
                .to_vec(),
                index: 0,
            }
        }
    }

    impl CryptoRng for MockRng {}

    impl RngCore for MockRng {
        fn next_u32(&mut self) -> u32 {
            unimplemented!()
        }

        fn next_u64(&mut self) -> u64 {
            unimplemented!()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest.iter_mut() {
                *byte = self.data[self.index];
                self.index = (self.index + 1) % self.data.len();
            }
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            unimplemented!()
        }
    }

    fn mrz() -> MrzInfo {
        MrzInfo::new("L898902C", "690806", "940623").expect("valid MRZ")
    }

    #[test]
    fn test_run_bac() -> Result<(), BacError> {
        let mut card = MockCard::new(&[
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &EXTERNAL_AUTHENTICATE.1),
        ]);
        let session = run_bac(&mut card, &mut MockRng::default(), &mrz())?;

        assert_eq!(session.ks_enc(), &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"));
        assert_eq!(session.ks_mac(), &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"));
        assert_eq!(session.ssc(), hex!("887022120C06C226"));
        assert_eq!(card.sent.len(), 2);
        Ok(())
    }

    #[test]
    fn test_run_bac_rejects_tampered_cryptogram() {
        let mut tampered = EXTERNAL_AUTHENTICATE.1;
        tampered[39] ^= 0x80;
        let mut card = MockCard::new(&[
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &tampered),
        ]);
        assert!(matches!(
            run_bac(&mut card, &mut MockRng::default(), &mrz()),
            Err(BacError::AuthenticationRejected(_))
        ));
    }

    #[test]
    fn test_run_bac_card_refusals() {
        let mut card = MockCard::new(&[(&GET_CHALLENGE.0, &hex!("6985"))]);
        assert!(matches!(
            run_bac(&mut card, &mut MockRng::default(), &mrz()),
            Err(BacError::ChallengeFailed(_))
        ));

        let mut card = MockCard::new(&[(&GET_CHALLENGE.0, &hex!("4608F919 9000"))]);
        assert!(matches!(
            run_bac(&mut card, &mut MockRng::default(), &mrz()),
            Err(BacError::ChallengeFailed(_))
        ));

        // Wrong MRZ data, the chip does not accept the reader cryptogram
        let mut card = MockCard::new(&[
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &hex!("6300")),
        ]);
        assert!(matches!(
            run_bac(&mut card, &mut MockRng::default(), &mrz()),
            Err(BacError::AuthenticationRejected(_))
        ));
    }

    #[test]
    fn test_run_bac_with_wrong_mrz_does_not_reach_the_card_script() {
        let mut card = MockCard::new(&[
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &EXTERNAL_AUTHENTICATE.1),
        ]);
        let mrz = MrzInfo::new("L898902C", "690806", "940624").expect("valid MRZ");
        assert!(matches!(
            run_bac(&mut card, &mut MockRng::default(), &mrz),
            Err(BacError::Transport(_))
        ));
    }

    #[test]
    fn test_missing_mrz_field_maps_to_missing_mrz_data() {
        let err = BacError::from(MrzError::MissingField("Birth date"));
        assert!(matches!(err, BacError::MissingMrzData));
        let err = BacError::from(MrzError::InvalidCharacter('*'));
        assert!(matches!(err, BacError::InvalidMrz(_)));
    }
}
