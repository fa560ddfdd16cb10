//! Data group hashes of the Document Security Object, EF.SOD.
//!
//! EF.SOD wraps a CMS `SignedData` whose encapsulated content is the
//! `LDSSecurityObject` of ICAO Doc 9303-10 Section 4.6.2:
//!
//! ```text
//! LDSSecurityObject ::= SEQUENCE {
//!     version                LDSSecurityObjectVersion,
//!     hashAlgorithm          DigestAlgorithmIdentifier,
//!     dataGroupHashValues    SEQUENCE SIZE (2..ub-DataGroups) OF DataGroupHash,
//!     ldsVersionInfo         LDSVersionInfo OPTIONAL }
//! ```
//!
//! The signature over the object is not checked, only the data group hashes
//! it lists.

use crate::asn1::{get_asn1_child, get_data_by_tag, validate_asn1_tag, Asn1Error};
use crate::crypto::{sha1, CryptoError};
use crate::emrtd::DataGroup;
use crate::bytes2hex;
use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, trace};

#[derive(Debug)]
#[non_exhaustive]
pub enum SodError {
    Asn1(Asn1Error),
    Crypto(CryptoError),
    /// A mandatory element of EF.SOD is missing.
    MissingElement(&'static str),
    /// The hash algorithm OID, hex encoded, is not supported.
    UnsupportedHashAlgorithm(String),
    /// The data group number is not in `1..=16`.
    InvalidDataGroupNumber(String),
    /// EF.SOD lists no hash for the data group.
    HashNotFound(u8),
    /// The data group does not match the hash in EF.SOD.
    HashMismatch(u8),
    /// The file is not one of EF.DG1 to EF.DG16.
    NotADataGroup(&'static str),
}
impl fmt::Display for SodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Asn1(ref e) => fmt::Display::fmt(&e, f),
            Self::Crypto(ref e) => fmt::Display::fmt(&e, f),
            Self::MissingElement(element) => write!(f, "Failed to read {element} from EF.SOD"),
            Self::UnsupportedHashAlgorithm(ref oid) => {
                write!(f, "Unsupported hash algorithm OID: {oid}")
            }
            Self::InvalidDataGroupNumber(ref number) => {
                write!(f, "Invalid Data Group number in EF.SOD: {number}")
            }
            Self::HashNotFound(number) => write!(
                f,
                "EF.DG{number} file hash is not found inside EF.SOD"
            ),
            Self::HashMismatch(number) => write!(
                f,
                "Potentially cloned document, EF.DG{number} hash does not match"
            ),
            Self::NotADataGroup(name) => write!(f, "{name} is not a data group"),
        }
    }
}
impl std::error::Error for SodError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::Asn1(ref e) => Some(e),
            Self::Crypto(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<Asn1Error> for SodError {
    fn from(err: Asn1Error) -> Self {
        Self::Asn1(err)
    }
}

impl From<CryptoError> for SodError {
    fn from(err: CryptoError) -> Self {
        Self::Crypto(err)
    }
}

/// Digest algorithms allowed for the data group hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    const ALL: [Self; 5] = [
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Content octets of the algorithm's OBJECT IDENTIFIER.
    #[must_use]
    pub const fn oid(self) -> &'static [u8] {
        match self {
            // 1.3.14.3.2.26
            Self::Sha1 => &[0x2B, 0x0E, 0x03, 0x02, 0x1A],
            // 2.16.840.1.101.3.4.2.x
            Self::Sha224 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x04],
            Self::Sha256 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01],
            Self::Sha384 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02],
            Self::Sha512 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03],
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha224 => "SHA-224",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    #[must_use]
    pub const fn output_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// Looks up an algorithm by the content octets of its OID.
    #[must_use]
    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|alg| alg.oid() == oid)
    }

    /// Hashes `data`.
    ///
    /// # Errors
    ///
    /// * `CryptoError::HashCollision` if SHA-1 detects a collision attack.
    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(match self {
            Self::Sha1 => sha1(data, "data group hash")?.to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        })
    }
}

/// Hash algorithm and data group hashes listed in EF.SOD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityObject {
    hash_algorithm: HashAlgorithm,
    hashes: BTreeMap<u8, Vec<u8>>,
}

fn required<'a>(
    found: Option<&'a [u8]>,
    element: &'static str,
) -> Result<&'a [u8], SodError> {
    found.ok_or_else(|| {
        error!("Failed to read {element} from EF.SOD.");
        SodError::MissingElement(element)
    })
}

impl SecurityObject {
    /// Parses the `LDSSecurityObject` out of EF.SOD.
    ///
    /// # Arguments
    ///
    /// * `ef_sod` - The complete EF.SOD, starting with tag `77`.
    ///
    /// # Returns
    ///
    /// The hash algorithm and the hashes by data group number.
    ///
    /// # Errors
    ///
    /// * `SodError::MissingElement` if the CMS structure is incomplete.
    /// * `SodError::UnsupportedHashAlgorithm` for digests other than SHA-1
    ///   and SHA-2.
    /// * `SodError::Asn1` if an element is malformed.
    pub fn parse(ef_sod: &[u8]) -> Result<Self, SodError> {
        let content_info = required(get_data_by_tag(ef_sod, &[0x30], true, 0)?, "top")?;
        let signed_data = required(
            get_data_by_tag(content_info, &[0xA0], false, 0)?,
            "signedData",
        )?;
        // First SEQUENCE of SignedData after version and digestAlgorithms
        let encap_content_info = required(
            get_data_by_tag(signed_data, &[0x30], true, 0)?,
            "eMRTDSignature container",
        )?;
        let e_content = required(
            get_data_by_tag(encap_content_info, &[0xA0], false, 0)?,
            "eMRTDSignature",
        )?;
        let lds_security_object = required(
            get_data_by_tag(e_content, &[0x04], false, 0)?,
            "eMRTDSignature (text)",
        )?;
        trace!("LDSSecurityObject: {}", bytes2hex(lds_security_object));

        let algorithm_identifier = required(
            get_data_by_tag(lds_security_object, &[0x30], true, 0)?,
            "hash algo set",
        )?;
        // Parameters, usually `05 00`, are ignored
        let oid = required(
            get_data_by_tag(algorithm_identifier, &[0x06], false, 0)?,
            "hash algo OID",
        )?;
        let Some(hash_algorithm) = HashAlgorithm::from_oid(oid) else {
            error!(
                "Failed to parse hash list (Unknown algo: {}).",
                bytes2hex(oid)
            );
            return Err(SodError::UnsupportedHashAlgorithm(bytes2hex(oid)));
        };
        debug!("EF.SOD hash algorithm: {}", hash_algorithm.name());

        let mut rest = required(
            get_data_by_tag(lds_security_object, &[0x30], true, 1)?,
            "hash list",
        )?;
        let mut hashes = BTreeMap::new();
        while !rest.is_empty() {
            validate_asn1_tag(rest, &[0x30])?;
            let (data_group_hash, next) = get_asn1_child(rest, 1)?;
            rest = next;

            validate_asn1_tag(data_group_hash, &[0x02])?;
            let (number, hash_value) = get_asn1_child(data_group_hash, 1)?;
            validate_asn1_tag(hash_value, &[0x04])?;
            let (hash, _) = get_asn1_child(hash_value, 1)?;

            let number = match *number {
                [n @ 1..=16] => n,
                _ => {
                    error!("Invalid Data Group number: {}", bytes2hex(number));
                    return Err(SodError::InvalidDataGroupNumber(bytes2hex(number)));
                }
            };
            trace!("EF.DG{number} hash on EF.SOD: {}", bytes2hex(hash));
            hashes.insert(number, hash.to_vec());
        }

        Ok(Self {
            hash_algorithm,
            hashes,
        })
    }

    #[must_use]
    pub const fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    /// Hash listed for data group `number`.
    #[must_use]
    pub fn data_group_hash(&self, number: u8) -> Option<&[u8]> {
        self.hashes.get(&number).map(Vec::as_slice)
    }

    /// Checks a data group read from the chip against its hash.
    ///
    /// # Arguments
    ///
    /// * `dg` - Which data group `data` is.
    /// * `data` - The complete file content.
    ///
    /// # Errors
    ///
    /// * `SodError::NotADataGroup` for EF.COM, EF.SOD and the PACE files.
    /// * `SodError::HashNotFound` if EF.SOD lists no hash for `dg`.
    /// * `SodError::HashMismatch` if the hashes differ.
    pub fn verify_data_group(&self, dg: DataGroup, data: &[u8]) -> Result<(), SodError> {
        let Some(number) = dg.number() else {
            error!("{} has no hash in EF.SOD", dg.name());
            return Err(SodError::NotADataGroup(dg.name()));
        };
        let Some(expected) = self.data_group_hash(number) else {
            error!("Potentially cloned document, EF.DG{number} file hash is not found inside EF.SOD");
            return Err(SodError::HashNotFound(number));
        };

        let calculated = self.hash_algorithm.digest(data)?;
        trace!("EF.DG{number} hash calc: {}", bytes2hex(&calculated));
        if !constant_time_eq(expected, &calculated) {
            error!("Hash verification failed for EF.DG{number}.");
            return Err(SodError::HashMismatch(number));
        }
        info!("Hash verification passed for EF.DG{number}.");
        Ok(())
    }
}
