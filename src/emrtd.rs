//! Reading files from an eMRTD.
//!
//! [`EmrtdReader`] selects the eMRTD application, runs BAC when the chip
//! enforces it and reads elementary files, protected by secure messaging
//! once a session exists.

use crate::apdu::{CommandApdu, ResponseApdu};
use crate::asn1::{get_data_by_tag, len2int, tag_len};
use crate::bac::{run_bac, BacError};
use crate::mrz::MrzInfo;
use crate::sm::SecureMessagingSession;
use crate::sod::SecurityObject;
use crate::transport::ApduTransport;
use crate::{bytes2hex, Error};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{debug, error, info, trace};

/// `International AID` of the eMRTD application.
pub const EMRTD_AID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Largest chunk requested with one READ BINARY.
pub const MAX_READ_CHUNK: usize = 118;

/// Elementary files of the LDS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataGroup {
    Com,
    Dg1,
    Dg2,
    Dg3,
    Dg4,
    Dg5,
    Dg6,
    Dg7,
    Dg8,
    Dg9,
    Dg10,
    Dg11,
    Dg12,
    Dg13,
    Dg14,
    Dg15,
    Dg16,
    Sod,
    CardAccess,
    CardSecurity,
}

impl DataGroup {
    pub const ALL: [Self; 20] = [
        Self::Com,
        Self::Dg1,
        Self::Dg2,
        Self::Dg3,
        Self::Dg4,
        Self::Dg5,
        Self::Dg6,
        Self::Dg7,
        Self::Dg8,
        Self::Dg9,
        Self::Dg10,
        Self::Dg11,
        Self::Dg12,
        Self::Dg13,
        Self::Dg14,
        Self::Dg15,
        Self::Dg16,
        Self::Sod,
        Self::CardAccess,
        Self::CardSecurity,
    ];

    /// LDS tag of the file. EF.CardAccess and EF.CardSecurity have none and
    /// report `FF`.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Com => 0x60,
            Self::Dg1 => 0x61,
            Self::Dg2 => 0x75,
            Self::Dg3 => 0x63,
            Self::Dg4 => 0x76,
            Self::Dg5 => 0x65,
            Self::Dg6 => 0x66,
            Self::Dg7 => 0x67,
            Self::Dg8 => 0x68,
            Self::Dg9 => 0x69,
            Self::Dg10 => 0x6A,
            Self::Dg11 => 0x6B,
            Self::Dg12 => 0x6C,
            Self::Dg13 => 0x6D,
            Self::Dg14 => 0x6E,
            Self::Dg15 => 0x6F,
            Self::Dg16 => 0x70,
            Self::Sod => 0x77,
            Self::CardAccess | Self::CardSecurity => 0xFF,
        }
    }

    #[must_use]
    pub const fn file_id(self) -> [u8; 2] {
        match self {
            Self::Com => [0x01, 0x1E],
            Self::Dg1 => [0x01, 0x01],
            Self::Dg2 => [0x01, 0x02],
            Self::Dg3 => [0x01, 0x03],
            Self::Dg4 => [0x01, 0x04],
            Self::Dg5 => [0x01, 0x05],
            Self::Dg6 => [0x01, 0x06],
            Self::Dg7 => [0x01, 0x07],
            Self::Dg8 => [0x01, 0x08],
            Self::Dg9 => [0x01, 0x09],
            Self::Dg10 => [0x01, 0x0A],
            Self::Dg11 => [0x01, 0x0B],
            Self::Dg12 => [0x01, 0x0C],
            Self::Dg13 => [0x01, 0x0D],
            Self::Dg14 => [0x01, 0x0E],
            Self::Dg15 => [0x01, 0x0F],
            Self::Dg16 => [0x01, 0x10],
            // EF.CardSecurity lives in the master file, EF.SOD in the application
            Self::Sod | Self::CardSecurity => [0x01, 0x1D],
            Self::CardAccess => [0x01, 0x1C],
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Com => "EF.COM",
            Self::Dg1 => "EF.DG1",
            Self::Dg2 => "EF.DG2",
            Self::Dg3 => "EF.DG3",
            Self::Dg4 => "EF.DG4",
            Self::Dg5 => "EF.DG5",
            Self::Dg6 => "EF.DG6",
            Self::Dg7 => "EF.DG7",
            Self::Dg8 => "EF.DG8",
            Self::Dg9 => "EF.DG9",
            Self::Dg10 => "EF.DG10",
            Self::Dg11 => "EF.DG11",
            Self::Dg12 => "EF.DG12",
            Self::Dg13 => "EF.DG13",
            Self::Dg14 => "EF.DG14",
            Self::Dg15 => "EF.DG15",
            Self::Dg16 => "EF.DG16",
            Self::Sod => "EF.SOD",
            Self::CardAccess => "EF.CardAccess",
            Self::CardSecurity => "EF.CardSecurity",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Com => "Header and Data Group Presence Information",
            Self::Dg1 => "Details recorded in MRZ",
            Self::Dg2 => "Encoded Face",
            Self::Dg3 => "Encoded Finger(s)",
            Self::Dg4 => "Encoded Eye(s)",
            Self::Dg5 => "Displayed Portrait",
            Self::Dg6 => "Reserved for Future Use",
            Self::Dg7 => "Displayed Signature or Usual Mark",
            Self::Dg8 => "Data Feature(s)",
            Self::Dg9 => "Structure Feature(s)",
            Self::Dg10 => "Substance Feature(s)",
            Self::Dg11 => "Additional Personal Detail(s)",
            Self::Dg12 => "Additional Document Detail(s)",
            Self::Dg13 => "Optional Detail(s)",
            Self::Dg14 => "Security Options",
            Self::Dg15 => "Active Authentication Public Key Info",
            Self::Dg16 => "Person(s) to Notify",
            Self::Sod => "Document Security Object",
            Self::CardAccess => "PACE SecurityInfos",
            Self::CardSecurity => "PACE SecurityInfos for Chip Authentication Mapping",
        }
    }

    /// Data group number used by EF.SOD, `None` outside EF.DG1 to EF.DG16.
    #[must_use]
    pub const fn number(self) -> Option<u8> {
        match self {
            Self::Dg1 => Some(1),
            Self::Dg2 => Some(2),
            Self::Dg3 => Some(3),
            Self::Dg4 => Some(4),
            Self::Dg5 => Some(5),
            Self::Dg6 => Some(6),
            Self::Dg7 => Some(7),
            Self::Dg8 => Some(8),
            Self::Dg9 => Some(9),
            Self::Dg10 => Some(10),
            Self::Dg11 => Some(11),
            Self::Dg12 => Some(12),
            Self::Dg13 => Some(13),
            Self::Dg14 => Some(14),
            Self::Dg15 => Some(15),
            Self::Dg16 => Some(16),
            Self::Com | Self::Sod | Self::CardAccess | Self::CardSecurity => None,
        }
    }

    #[must_use]
    pub const fn requires_pace(self) -> bool {
        matches!(self, Self::CardAccess | Self::CardSecurity)
    }

    /// DG3 and DG4 hold biometrics protected by Extended Access Control.
    #[must_use]
    pub const fn requires_eac(self) -> bool {
        matches!(self, Self::Dg3 | Self::Dg4)
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        if tag == 0xFF {
            return None;
        }
        Self::ALL.into_iter().find(|dg| dg.tag() == tag)
    }

    /// Looks up a file by its identifier. `01 1D` resolves to EF.SOD.
    #[must_use]
    pub fn from_file_id(file_id: [u8; 2]) -> Option<Self> {
        Self::ALL.into_iter().find(|dg| dg.file_id() == file_id)
    }
}

/// Lists the files present according to EF.COM.
///
/// The tag list `5C` of EF.COM names the data groups, EF.SOD is always
/// appended. Unknown tags are skipped.
///
/// # Errors
///
/// * `Error::InvalidFileStructure` if EF.COM has no tag list.
/// * `Error::Asn1` if EF.COM is malformed.
///
/// # Example
///
/// ```
/// # use emrtd_tcl::Error;
/// #
/// # fn main() -> Result<(), Error> {
/// use emrtd_tcl::{data_groups_from_ef_com, DataGroup};
/// use hex_literal::hex;
///
/// let ef_com = hex!("60145F0104303130365F36063034303030305C026175");
/// assert_eq!(
///     data_groups_from_ef_com(&ef_com)?,
///     vec![DataGroup::Dg1, DataGroup::Dg2, DataGroup::Sod]
/// );
/// #
/// #     Ok(())
/// # }
/// ```
pub fn data_groups_from_ef_com(ef_com: &[u8]) -> Result<Vec<DataGroup>, Error> {
    let Some(tag_list) = get_data_by_tag(ef_com, &[0x5C], true, 0)? else {
        error!("EF.COM does not contain a tag list");
        return Err(Error::InvalidFileStructure("EF.COM does not contain a tag list"));
    };
    debug!("File List: {}", bytes2hex(tag_list));

    let mut data_groups = Vec::with_capacity(tag_list.len() + 1);
    for &tag in tag_list {
        match DataGroup::from_tag(tag) {
            Some(dg) if !data_groups.contains(&dg) => data_groups.push(dg),
            Some(_) => {}
            None => info!("File tag not found, skipping: {tag:02X}"),
        }
    }
    if !data_groups.contains(&DataGroup::Sod) {
        data_groups.push(DataGroup::Sod);
    }
    Ok(data_groups)
}

/// Reads an eMRTD over any [`ApduTransport`].
pub struct EmrtdReader<T: ApduTransport, R: RngCore + CryptoRng + Default = OsRng> {
    transport: T,
    rng: R,
    session: Option<SecureMessagingSession>,
}

impl<T: ApduTransport, R: RngCore + CryptoRng + Default> EmrtdReader<T, R> {
    /// Constructs a reader without a secure messaging session.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            rng: R::default(),
            session: None,
        }
    }

    /// Constructs a reader drawing BAC nonces and key material from `rng`.
    #[must_use]
    pub const fn with_rng(transport: T, rng: R) -> Self {
        Self {
            transport,
            rng,
            session: None,
        }
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    #[must_use]
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// The secure messaging session, present after BAC.
    #[must_use]
    pub const fn session(&self) -> Option<&SecureMessagingSession> {
        self.session.as_ref()
    }

    /// Sends a command, through secure messaging when a session exists.
    ///
    /// # Errors
    ///
    /// * `Error` in case of failure during sending or receiving an APDU.
    pub fn send(&mut self, command: &CommandApdu) -> Result<ResponseApdu, Error> {
        if let Some(session) = self.session.as_mut() {
            return Ok(session.transmit(&mut self.transport, command)?);
        }
        let command = command.encode()?;
        trace!("Sending APDU: {}", bytes2hex(&command));
        let response = ResponseApdu::decode(&self.transport.transmit(&command)?)?;
        trace!(
            "APDU response ({:02X}{:02X}): {}",
            response.sw1,
            response.sw2,
            bytes2hex(&response.data)
        );
        Ok(response)
    }

    fn send_expect_success(&mut self, command: &CommandApdu, context: &str) -> Result<Vec<u8>, Error> {
        let response = self.send(command)?;
        if !response.is_success() {
            error!(
                "Received invalid SW during {context}: {:02X} {:02X}",
                response.sw1, response.sw2
            );
            return Err(Error::RecvApdu(response.sw1, response.sw2));
        }
        Ok(response.data)
    }

    /// Selects the eMRTD application using AID `A0000002471001`.
    ///
    /// # Errors
    ///
    /// `Error` in case of failure during sending the APDU.
    pub fn select_emrtd_application(&mut self) -> Result<(), Error> {
        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(&EMRTD_AID)
        );
        let command = CommandApdu::new(0x00, 0xA4, 0x04, 0x0C, EMRTD_AID.to_vec(), 0);
        self.send_expect_success(&command, "Select eMRTD Application command")?;
        Ok(())
    }

    /// Selects an elementary file by its identifier.
    ///
    /// # Arguments
    ///
    /// * `fid` - File identifier of the EF to select.
    /// * `fname` - Name of the file, used for logging.
    ///
    /// # Errors
    ///
    /// * `Error::RecvApdu` if the card refuses the selection.
    pub fn select_ef(&mut self, fid: [u8; 2], fname: &str) -> Result<(), Error> {
        trace!("Selecting File {fname}: {}...", bytes2hex(&fid));
        let command = CommandApdu::new(0x00, 0xA4, 0x02, 0x0C, fid.to_vec(), 0);
        self.send_expect_success(&command, "Select EF command")?;
        Ok(())
    }

    /// Reads `length` bytes at `offset` of the selected EF.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidArgument` if `offset` does not fit in 15 bits or
    ///   `length` is not in `1..=256`.
    /// * `Error::RecvApdu` if the card refuses the read.
    pub fn read_binary(&mut self, offset: usize, length: usize) -> Result<Vec<u8>, Error> {
        if offset > 0x7FFF {
            error!("READ BINARY offset {offset} does not fit in P1-P2");
            return Err(Error::InvalidArgument("READ BINARY offset must be below 32768"));
        }
        if !(1..=256).contains(&length) {
            error!("READ BINARY length {length} is not in 1..=256");
            return Err(Error::InvalidArgument("READ BINARY length must be in 1..=256"));
        }
        let [_, _, p1, p2] = (offset as u32).to_be_bytes();
        let command = CommandApdu::new(0x00, 0xB0, p1, p2, vec![], length as u32);
        self.send_expect_success(&command, "Read Binary command")
    }

    /// Reads the whole selected EF.
    ///
    /// The first four bytes give the tag and length of the file, the rest is
    /// read in chunks of at most [`MAX_READ_CHUNK`] bytes. [`Self::select_ef`]
    /// must be called before calling this function.
    ///
    /// # Errors
    ///
    /// * `Error` in case of failure during reading or if the card returns
    ///   less data than the file announces.
    pub fn read_data_from_ef(&mut self) -> Result<Vec<u8>, Error> {
        trace!("Reading first 4 bytes from EF...");
        let mut data = self.read_binary(0, 4)?;
        if data.len() != 4 {
            error!(
                "Card response length should be equal to the requested amount 4, found {}",
                data.len()
            );
            return Err(Error::InvalidFileStructure("EF header is not 4 bytes long"));
        }

        let (tl, v) = len2int(&data, tag_len(data[0]))?;
        let data_len = tl + v;

        trace!("Reading {data_len} bytes from EF...");
        while data.len() < data_len {
            let to_read = (data_len - data.len()).min(MAX_READ_CHUNK);
            let chunk = self.read_binary(data.len(), to_read)?;
            if chunk.is_empty() {
                error!("Requested bytes while reading EF but received 0 bytes.");
                return Err(Error::InvalidFileStructure("card returned no data"));
            }
            data.extend_from_slice(&chunk);
        }

        if data.len() != data_len {
            error!(
                "Error while parsing EF data from the card, expected {data_len}, found {}.",
                data.len()
            );
            return Err(Error::InvalidFileStructure("EF is longer than announced"));
        }
        Ok(data)
    }

    /// Runs BAC and protects every following command with secure messaging.
    ///
    /// For more details and examples, see ICAO Doc 9303-11 Section 4.3 and
    /// Appendix D.3
    /// <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
    ///
    /// # Errors
    ///
    /// * `Error::Bac` in case of failure during BAC session key
    ///   establishment.
    pub fn establish_bac_session_keys(&mut self, mrz: &MrzInfo) -> Result<(), Error> {
        self.session = None;
        let session = run_bac(&mut self.transport, &mut self.rng, mrz)?;
        self.session = Some(session);
        Ok(())
    }

    /// Selects the eMRTD application and runs BAC if the chip enforces it.
    ///
    /// BAC is considered enforced when EF.COM can not be selected, or
    /// EF.DG1 can not be read, without secure messaging.
    ///
    /// # Returns
    ///
    /// Whether BAC was run.
    ///
    /// # Errors
    ///
    /// * `Error::Bac` wrapping `BacError::MissingMrzData` if BAC is enforced
    ///   and `mrz` is `None`.
    /// * `Error` if the application can not be selected or BAC fails.
    pub fn authenticate(&mut self, mrz: Option<&MrzInfo>) -> Result<bool, Error> {
        self.session = None;
        self.select_emrtd_application()?;

        let bac_required = match self.select_ef(DataGroup::Com.file_id(), DataGroup::Com.name()) {
            Err(Error::RecvApdu(..)) => true,
            Err(err) => return Err(err),
            Ok(()) => {
                // A refused selection is detected by the read that follows
                match self.select_ef(DataGroup::Dg1.file_id(), DataGroup::Dg1.name()) {
                    Ok(()) | Err(Error::RecvApdu(..)) => {}
                    Err(err) => return Err(err),
                }
                match self.read_data_from_ef() {
                    Ok(_) => false,
                    Err(Error::RecvApdu(..) | Error::InvalidFileStructure(_) | Error::Asn1(_)) => true,
                    Err(err) => return Err(err),
                }
            }
        };

        if !bac_required {
            info!("Basic Access Control is not enforced.");
            return Ok(false);
        }
        info!("Basic Access Control is enforced. Will attempt external authentication.");

        let Some(mrz) = mrz else {
            error!("This eMRTD enforces Basic Access Control, but no MRZ data was supplied. Cannot proceed.");
            return Err(Error::Bac(BacError::MissingMrzData));
        };
        self.establish_bac_session_keys(mrz)?;
        Ok(true)
    }

    /// Selects and reads a file of the eMRTD application.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidArgument` for files behind PACE or EAC.
    /// * `Error` in case of failure during selecting or reading.
    pub fn read_data_group(&mut self, dg: DataGroup) -> Result<Vec<u8>, Error> {
        if dg.requires_pace() || dg.requires_eac() {
            error!("{} can not be read without PACE or EAC", dg.name());
            return Err(Error::InvalidArgument("file requires PACE or EAC"));
        }
        self.select_ef(dg.file_id(), dg.name())?;
        let data = self.read_data_from_ef()?;
        info!("Read {}, len: {}", dg.name(), data.len());
        Ok(data)
    }

    /// Reads EF.SOD and parses the data group hashes it lists.
    ///
    /// # Errors
    ///
    /// * `Error::Sod` if EF.SOD is malformed or uses an unknown digest.
    /// * `Error` in case of failure during selecting or reading.
    pub fn read_security_object(&mut self) -> Result<SecurityObject, Error> {
        let ef_sod = self.read_data_group(DataGroup::Sod)?;
        Ok(SecurityObject::parse(&ef_sod)?)
    }

    /// Reads a data group and checks it against its hash in EF.SOD.
    ///
    /// # Arguments
    ///
    /// * `dg` - Data group to read, one of EF.DG1 to EF.DG16.
    /// * `sod` - Hashes from [`EmrtdReader::read_security_object`].
    ///
    /// # Returns
    ///
    /// The file content, only if its hash matches.
    ///
    /// # Errors
    ///
    /// * `Error::Sod` if the hash is missing or does not match.
    /// * `Error` in case of failure during selecting or reading.
    pub fn read_and_verify_data_group(
        &mut self,
        dg: DataGroup,
        sod: &SecurityObject,
    ) -> Result<Vec<u8>, Error> {
        let data = self.read_data_group(dg)?;
        sod.verify_data_group(dg, &data)?;
        Ok(data)
    }
}

impl<T: ApduTransport, R: RngCore + CryptoRng + Default> std::fmt::Debug for EmrtdReader<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmrtdReader")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bac::tests::{MockRng, EXTERNAL_AUTHENTICATE, GET_CHALLENGE};
    use crate::chaining::tests::ScriptedLink;
    use crate::chaining::{ChainingConfig, ChainingError, ChainingTransport};
    use crate::sm::SecureError;
    use crate::sod::{HashAlgorithm, SodError};
    use crate::transport::tests::MockCard;
    use crate::transport::TransportError;
    use hex_literal::hex;

    const SELECT_APPLICATION: [u8; 12] = hex!("00A4040C07A0000002471001");
    const SELECT_EF_COM: [u8; 7] = hex!("00A4020C02011E");
    const EF_COM: [u8; 22] = hex!("60145F0104303130365F36063034303030305C026175");

    fn mrz() -> MrzInfo {
        MrzInfo::new("L898902C", "690806", "940623").expect("valid MRZ")
    }

    #[test]
    fn test_data_group_table() {
        for dg in DataGroup::ALL {
            assert_eq!(DataGroup::from_file_id(dg.file_id()).map(DataGroup::file_id), Some(dg.file_id()));
            if dg.tag() != 0xFF {
                assert_eq!(DataGroup::from_tag(dg.tag()), Some(dg));
            }
        }
        assert_eq!(DataGroup::from_tag(0x61), Some(DataGroup::Dg1));
        assert_eq!(DataGroup::from_tag(0xFF), None);
        assert_eq!(DataGroup::from_tag(0x5C), None);
        assert_eq!(DataGroup::from_file_id([0x01, 0x1D]), Some(DataGroup::Sod));
        assert_eq!(DataGroup::from_file_id([0x01, 0x1C]), Some(DataGroup::CardAccess));
        assert_eq!(DataGroup::Dg1.description(), "Details recorded in MRZ");
        assert!(DataGroup::Dg3.requires_eac());
        assert!(DataGroup::CardAccess.requires_pace());
        assert!(!DataGroup::Dg2.requires_eac());
        assert_eq!(DataGroup::Dg1.number(), Some(1));
        assert_eq!(DataGroup::Dg16.number(), Some(16));
        assert_eq!(DataGroup::Sod.number(), None);
    }

    #[test]
    fn test_data_groups_from_ef_com() -> Result<(), Error> {
        assert_eq!(
            data_groups_from_ef_com(&EF_COM)?,
            vec![DataGroup::Dg1, DataGroup::Dg2, DataGroup::Sod]
        );
        // Unknown tag 01 is skipped, EF.SOD is not listed twice
        assert_eq!(
            data_groups_from_ef_com(&hex!("600C 5F0104303130365C03610177"))?,
            vec![DataGroup::Dg1, DataGroup::Sod]
        );
        assert!(matches!(
            data_groups_from_ef_com(&hex!("6007 5F010430313036")),
            Err(Error::InvalidFileStructure(_))
        ));
        Ok(())
    }

    #[test]
    fn test_authenticate_and_read_ef_com_with_bac() -> Result<(), Error> {
        let card = MockCard::new(&[
            (&SELECT_APPLICATION, &hex!("9000")),
            // Security status not satisfied
            (&SELECT_EF_COM, &hex!("6982")),
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &EXTERNAL_AUTHENTICATE.1),
            // ICAO Doc 9303-11 Appendix D.4
            (
                &hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
                &hex!("990290008E08FA855A5D4C50A8ED9000"),
            ),
            (
                &hex!("0CB000000D9701048E08ED6705417E96BA5500"),
                &hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED9000"),
            ),
            (
                &hex!("0CB000040D9701128E082EA28A70F3C7B53500"),
                &hex!(
                    "871901FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A
                     990290008E08C8B2787EAEA07D749000"
                ),
            ),
        ]);
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(card);

        assert!(reader.authenticate(Some(&mrz()))?);
        assert_eq!(
            reader.session().map(SecureMessagingSession::ssc),
            Some(hex!("887022120C06C226"))
        );

        let ef_com = reader.read_data_group(DataGroup::Com)?;
        assert_eq!(ef_com, EF_COM);
        assert_eq!(
            reader.session().map(SecureMessagingSession::ssc),
            Some(hex!("887022120C06C22C"))
        );
        Ok(())
    }

    #[test]
    fn test_authenticate_without_bac() -> Result<(), Error> {
        let script: [(&[u8], &[u8]); 6] = [
            (&SELECT_APPLICATION, &hex!("9000")),
            (&SELECT_EF_COM, &hex!("9000")),
            (&hex!("00A4020C020101"), &hex!("9000")),
            (&hex!("00B0000004"), &hex!("61045F1F 9000")),
            (&hex!("00B0000402"), &hex!("0141 9000")),
            (&hex!("0084000008"), &hex!("6D00")),
        ];
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(MockCard::new(&script));

        assert!(!reader.authenticate(None)?);
        assert!(reader.session().is_none());
        assert_eq!(reader.read_data_group(DataGroup::Dg1)?, hex!("61045F1F0141"));
        assert!(!reader
            .transport()
            .sent
            .iter()
            .any(|command| command.as_slice() == hex!("0084000008")));
        Ok(())
    }

    #[test]
    fn test_bac_enforced_without_mrz() {
        let card = MockCard::new(&[
            (&SELECT_APPLICATION, &hex!("9000")),
            (&SELECT_EF_COM, &hex!("6982")),
        ]);
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(card);
        assert!(matches!(
            reader.authenticate(None),
            Err(Error::Bac(BacError::MissingMrzData))
        ));
    }

    #[test]
    fn test_link_failure_during_detection_is_reported() {
        let link = ScriptedLink::with_ats(&hex!("0578807002"))
            .respond(&[&hex!("02 9000"), &hex!("03 9000")]);
        let transport = ChainingTransport::new(link, ChainingConfig::default());
        let mut reader = EmrtdReader::<_, MockRng>::new(transport);

        // The DG1 selection times out
        assert!(matches!(
            reader.authenticate(None),
            Err(Error::Transport(TransportError::Chaining(
                ChainingError::ConnectionTimeout
            )))
        ));
        assert_eq!(reader.transport().link().selects, 1);
        assert_eq!(reader.transport().link().sent.len(), 3);
        assert!(reader.session().is_none());
    }

    #[test]
    fn test_application_selection_failure() {
        let card = MockCard::new(&[(&SELECT_APPLICATION, &hex!("6A82"))]);
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(card);
        assert!(matches!(
            reader.authenticate(Some(&mrz())),
            Err(Error::RecvApdu(0x6A, 0x82))
        ));
    }

    #[test]
    fn test_read_data_from_ef_in_chunks() -> Result<(), Error> {
        // 4 + 300 byte EF.DG2 read as 4, 118, 118, 64
        let mut file = vec![0x75, 0x82, 0x01, 0x2C];
        file.extend((0..300).map(|i| (i % 256) as u8));

        let mut script = Vec::new();
        let mut offset = 0;
        for length in [4, 118, 118, 64] {
            let [_, _, p1, p2] = (offset as u32).to_be_bytes();
            let command = CommandApdu::new(0x00, 0xB0, p1, p2, vec![], length as u32).encode()?;
            let mut response = file[offset..offset + length].to_vec();
            response.extend_from_slice(&hex!("9000"));
            script.push((command, response));
            offset += length;
        }
        let script: Vec<(&[u8], &[u8])> = script
            .iter()
            .map(|(command, response)| (command.as_slice(), response.as_slice()))
            .collect();

        let mut reader = EmrtdReader::<MockCard, MockRng>::new(MockCard::new(&script));
        assert_eq!(reader.read_data_from_ef()?, file);
        assert_eq!(reader.transport().sent.len(), 4);
        Ok(())
    }

    #[test]
    fn test_read_and_verify_data_group() -> Result<(), Error> {
        let ef_sod = crate::sod::tests::EF_SOD;
        let mut first = ef_sod[..4].to_vec();
        first.extend_from_slice(&hex!("9000"));
        let mut middle = ef_sod[4..122].to_vec();
        middle.extend_from_slice(&hex!("9000"));
        let mut last = ef_sod[122..].to_vec();
        last.extend_from_slice(&hex!("9000"));
        let script: [(&[u8], &[u8]); 4] = [
            (&hex!("00A4020C02011D"), &hex!("9000")),
            (&hex!("00B0000004"), first.as_slice()),
            (&hex!("00B0000476"), middle.as_slice()),
            (&hex!("00B0007A28"), last.as_slice()),
        ];
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(MockCard::new(&script));
        let sod = reader.read_security_object()?;
        assert_eq!(sod.hash_algorithm(), HashAlgorithm::Sha256);

        // EF.DG2 from the card, then with one altered byte
        for (tail, verified) in [(hex!("050201010100 9000"), true), (hex!("050201010101 9000"), false)] {
            let script: [(&[u8], &[u8]); 3] = [
                (&hex!("00A4020C020102"), &hex!("9000")),
                (&hex!("00B0000004"), &hex!("75087F61 9000")),
                (&hex!("00B0000406"), &tail),
            ];
            let mut reader = EmrtdReader::<MockCard, MockRng>::new(MockCard::new(&script));
            let result = reader.read_and_verify_data_group(DataGroup::Dg2, &sod);
            if verified {
                assert_eq!(result?, hex!("75087F61050201010100"));
            } else {
                assert!(matches!(result, Err(Error::Sod(SodError::HashMismatch(2)))));
            }
        }
        Ok(())
    }

    #[test]
    fn test_read_binary_arguments() {
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(MockCard::new(&[]));
        assert!(matches!(
            reader.read_binary(0x8000, 4),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            reader.read_binary(0, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            reader.read_data_group(DataGroup::Dg3),
            Err(Error::InvalidArgument(_))
        ));
        assert!(reader.transport().sent.is_empty());
    }

    #[test]
    fn test_integrity_failure_ends_the_session() {
        let card = MockCard::new(&[
            (&SELECT_APPLICATION, &hex!("9000")),
            (&SELECT_EF_COM, &hex!("6982")),
            (&GET_CHALLENGE.0, &GET_CHALLENGE.1),
            (&EXTERNAL_AUTHENTICATE.0, &EXTERNAL_AUTHENTICATE.1),
            (
                &hex!("0CA4020C158709016375432908C044F68E08BF8B92D635FF24F800"),
                &hex!("990290008E08FA855A5D4C50A8EE9000"),
            ),
        ]);
        let mut reader = EmrtdReader::<MockCard, MockRng>::new(card);
        assert!(reader.authenticate(Some(&mrz())).is_ok());
        assert!(matches!(
            reader.read_data_group(DataGroup::Com),
            Err(Error::Secure(SecureError::IntegrityFailure))
        ));
        assert!(matches!(
            reader.read_data_group(DataGroup::Com),
            Err(Error::Secure(SecureError::SessionInvalidated))
        ));
    }
}
