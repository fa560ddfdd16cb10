//! ISO/IEC 7816-4 command and response APDUs.
//!
//! Encoding and decoding of Command-APDUs in short and extended length form,
//! covering the four cases of ISO/IEC 7816-3 § 12.1.3, and of Response-APDUs.

use std::fmt;
use tracing::error;

/// Maximum data length of a short Command-APDU.
pub const MAX_SHORT_DATA: usize = 255;
/// Maximum data length of an extended Command-APDU.
pub const MAX_EXTENDED_DATA: usize = 65_535;
/// Maximum expected response length of a short Command-APDU.
pub const MAX_SHORT_LE: u32 = 256;
/// Maximum expected response length of an extended Command-APDU.
pub const MAX_EXTENDED_LE: u32 = 65_536;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApduError {
    /// Command data does not fit the selected length form.
    DataTooLong { maximum: usize, found: usize },
    /// Expected response length does not fit the selected length form.
    LeTooLarge { maximum: u32, found: u32 },
    /// Extended form requested for a command without data and without Le.
    ExtendedWithoutBody,
    /// Response is shorter than the two status bytes.
    TooShort(usize),
    /// Command bytes do not match any of the ISO/IEC 7816-4 cases.
    Malformed(&'static str),
}
impl fmt::Display for ApduError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::DataTooLong { maximum, found } => {
                write!(f, "APDU data too long, maximum: {maximum}, found: {found}")
            }
            Self::LeTooLarge { maximum, found } => {
                write!(f, "APDU Le too large, maximum: {maximum}, found: {found}")
            }
            Self::ExtendedWithoutBody => {
                write!(f, "Extended APDU must carry data or Le")
            }
            Self::TooShort(len) => {
                write!(f, "Response APDU must be at least 2 bytes, found {len}")
            }
            Self::Malformed(reason) => write!(f, "Malformed command APDU: {reason}"),
        }
    }
}
impl std::error::Error for ApduError {}

/// A Command-APDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandApdu {
    /// Class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data field, may be empty
    pub data: Vec<u8>,
    /// Expected response length, `0` means Le is absent
    pub le: u32,
    /// Use extended length fields
    pub extended: bool,
}

impl CommandApdu {
    /// Constructs a Command-APDU, using the short length form when both the
    /// data and `le` can be represented with it, the extended form otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// use emrtd_tcl::CommandApdu;
    /// use hex_literal::hex;
    ///
    /// let apdu = CommandApdu::new(0x00, 0x84, 0x00, 0x00, vec![], 8);
    /// assert_eq!(apdu.encode().unwrap(), hex!("0084000008"));
    /// ```
    #[must_use]
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>, le: u32) -> Self {
        let extended = data.len() > MAX_SHORT_DATA || le > MAX_SHORT_LE;
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
            le,
            extended,
        }
    }

    /// Retrieves the command header (CLA, INS, P1, P2).
    #[must_use]
    pub const fn header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the APDU.
    ///
    /// # Errors
    ///
    /// * `ApduError` if the data or `le` can not be represented in the
    ///   selected length form.
    pub fn encode(&self) -> Result<Vec<u8>, ApduError> {
        let (max_data, max_le) = if self.extended {
            (MAX_EXTENDED_DATA, MAX_EXTENDED_LE)
        } else {
            (MAX_SHORT_DATA, MAX_SHORT_LE)
        };
        if self.data.len() > max_data {
            error!(
                "Can not encode APDU, data length {} exceeds {max_data}",
                self.data.len()
            );
            return Err(ApduError::DataTooLong {
                maximum: max_data,
                found: self.data.len(),
            });
        }
        if self.le > max_le {
            error!("Can not encode APDU, Le {} exceeds {max_le}", self.le);
            return Err(ApduError::LeTooLarge {
                maximum: max_le,
                found: self.le,
            });
        }
        if self.extended && self.data.is_empty() && self.le == 0 {
            error!("Can not encode extended APDU without data and Le");
            return Err(ApduError::ExtendedWithoutBody);
        }

        let mut out = Vec::with_capacity(4 + 3 + self.data.len() + 3);
        out.extend_from_slice(&self.header());

        if !self.data.is_empty() {
            // Lengths were checked above, truncating casts are exact here.
            if self.extended {
                out.push(0x00);
                out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            } else {
                out.push(self.data.len() as u8);
            }
            out.extend_from_slice(&self.data);
        }

        if self.le > 0 {
            if self.extended {
                if self.data.is_empty() {
                    out.push(0x00);
                }
                // 65536 is sent as 0x0000
                out.extend_from_slice(&((self.le & 0xFFFF) as u16).to_be_bytes());
            } else {
                // 256 is sent as 0x00
                out.push((self.le & 0xFF) as u8);
            }
        }

        Ok(out)
    }

    /// Parses a serialized Command-APDU.
    ///
    /// # Errors
    ///
    /// * `ApduError::Malformed` if the bytes match none of the ISO/IEC 7816-4 cases.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApduError> {
        let Some((header, body)) = bytes.split_first_chunk::<4>() else {
            error!("Command APDU is shorter than its header: {} bytes", bytes.len());
            return Err(ApduError::Malformed("missing header"));
        };
        let [cla, ins, p1, p2] = *header;
        let mut apdu = Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: 0,
            extended: false,
        };

        match body {
            // Case 1
            [] => {}
            // Case 2S
            [le] => apdu.le = short_le(*le),
            // Extended form, case 2E, 3E or 4E
            [0x00, rest @ ..] if rest.len() >= 2 => {
                apdu.extended = true;
                let first = u16::from_be_bytes([rest[0], rest[1]]);
                let rest = &rest[2..];
                if rest.is_empty() {
                    apdu.le = extended_le(first);
                } else {
                    let lc = usize::from(first);
                    if lc == 0 {
                        return Err(ApduError::Malformed("extended Lc of zero"));
                    }
                    match rest.len().checked_sub(lc) {
                        Some(0) => apdu.data = rest.to_vec(),
                        Some(2) => {
                            apdu.data = rest[..lc].to_vec();
                            apdu.le = extended_le(u16::from_be_bytes([rest[lc], rest[lc + 1]]));
                        }
                        _ => {
                            error!(
                                "Extended Lc {lc} does not match remaining length {}",
                                rest.len()
                            );
                            return Err(ApduError::Malformed("extended Lc mismatch"));
                        }
                    }
                }
            }
            [0x00, ..] => return Err(ApduError::Malformed("truncated extended length")),
            // Short form, case 3S or 4S
            [lc, rest @ ..] => {
                let lc = usize::from(*lc);
                match rest.len().checked_sub(lc) {
                    Some(0) => apdu.data = rest.to_vec(),
                    Some(1) => {
                        apdu.data = rest[..lc].to_vec();
                        apdu.le = short_le(rest[lc]);
                    }
                    _ => {
                        error!("Short Lc {lc} does not match remaining length {}", rest.len());
                        return Err(ApduError::Malformed("short Lc mismatch"));
                    }
                }
            }
        }

        Ok(apdu)
    }
}

fn short_le(byte: u8) -> u32 {
    if byte == 0 {
        MAX_SHORT_LE
    } else {
        u32::from(byte)
    }
}

fn extended_le(word: u16) -> u32 {
    if word == 0 {
        MAX_EXTENDED_LE
    } else {
        u32::from(word)
    }
}

/// A Response-APDU, data followed by the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl ResponseApdu {
    /// Splits a raw response into data and status word.
    ///
    /// # Errors
    ///
    /// * `ApduError::TooShort` if fewer than 2 bytes are given.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApduError> {
        let Some((data, [sw1, sw2])) = bytes.split_last_chunk::<2>() else {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                bytes.len()
            );
            return Err(ApduError::TooShort(bytes.len()));
        };
        Ok(Self {
            data: data.to_vec(),
            sw1: *sw1,
            sw2: *sw2,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 2);
        out.extend_from_slice(&self.data);
        out.push(self.sw1);
        out.push(self.sw2);
        out
    }

    /// Status word as a big-endian integer.
    #[must_use]
    pub const fn sw(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }
}
