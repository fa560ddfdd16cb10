//! Minimal BER-TLV helpers.
//!
//! Only what the transport and secure messaging layers need: length fields,
//! child extraction and a flat tag lookup for LDS files such as EF.COM.

use crate::bytes2hex;
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Asn1Error {
    /// Data ended before the announced length.
    Incomplete { expected: usize, found: usize },
    /// Long form length field with an unsupported number of octets.
    UnsupportedLength(u8),
    /// The data does not start with the expected tag.
    TagMismatch { expected: String, found: String },
}
impl fmt::Display for Asn1Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Incomplete { expected, found } => write!(
                f,
                "ASN.1 data is incomplete, expected len: {expected}, found len: {found}"
            ),
            Self::UnsupportedLength(byte) => {
                write!(f, "ASN.1 length field {byte:02X} is not supported")
            }
            Self::TagMismatch {
                ref expected,
                ref found,
            } => write!(f, "Invalid ASN.1 tag, expected: {expected}, found: {found}"),
        }
    }
}
impl std::error::Error for Asn1Error {}

/// A decoded length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asn1Length {
    /// Number of octets taken by the length field itself.
    pub header_len: usize,
    /// Length of the value.
    pub value_len: usize,
    /// Set when the field was `0x80`.
    pub indefinite: bool,
}

/// Parses the length field starting at `offset`.
///
/// Supports the short form and the long forms `81` to `84`. The indefinite
/// form `80` is not decoded as BER would; the value is taken to be the rest
/// of the buffer after the length byte, which is how some eMRTD chips lay
/// out EF.SOD.
///
/// # Errors
///
/// * `Asn1Error::Incomplete` if `data` is too short for the length field.
/// * `Asn1Error::UnsupportedLength` for long forms above four octets.
pub fn parse_length(data: &[u8], offset: usize) -> Result<Asn1Length, Asn1Error> {
    let Some(&first) = data.get(offset) else {
        error!(
            "Error during parse_length, `data.len()`: `{}` has no length byte at `{offset}`",
            data.len()
        );
        return Err(Asn1Error::Incomplete {
            expected: offset + 1,
            found: data.len(),
        });
    };

    match first {
        0x00..=0x7F => Ok(Asn1Length {
            header_len: 1,
            value_len: usize::from(first),
            indefinite: false,
        }),
        0x80 => {
            debug!("Indefinite ASN.1 length at offset {offset}, using rest of the buffer");
            Ok(Asn1Length {
                header_len: 1,
                value_len: data.len() - offset - 1,
                indefinite: true,
            })
        }
        0x81..=0x84 => {
            let octets = usize::from(first & 0x7F);
            let Some(bytes) = data.get(offset + 1..offset + 1 + octets) else {
                error!(
                    "Error during parse_length, `data.len()`: `{}` is less than `{}`",
                    data.len(),
                    offset + 1 + octets
                );
                return Err(Asn1Error::Incomplete {
                    expected: offset + 1 + octets,
                    found: data.len(),
                });
            };
            let value_len = bytes
                .iter()
                .fold(0_usize, |acc, &b| (acc << 8) | usize::from(b));
            Ok(Asn1Length {
                header_len: 1 + octets,
                value_len,
                indefinite: false,
            })
        }
        _ => {
            error!("Unsupported ASN.1 length field: {first:02X}");
            Err(Asn1Error::UnsupportedLength(first))
        }
    }
}

/// Parses the ASN.1 length field following a tag of `tag_len` bytes.
///
/// # Returns
///
/// A tuple of the offset where the value starts and the value length.
/// With `tag_len` 1 and a length field `82 07 E8` the result is `(4, 2024)`.
///
/// # Errors
///
/// * `Asn1Error` if the data is too short to read the length value.
pub fn len2int(data: &[u8], tag_len: usize) -> Result<(usize, usize), Asn1Error> {
    let length = parse_length(data, tag_len)?;
    Ok((tag_len + length.header_len, length.value_len))
}

/// Encodes a length field in ASN.1 format.
///
/// # Examples
///
/// ```
/// use emrtd_tcl::asn1::int2asn1len;
/// use hex_literal::hex;
///
/// assert_eq!(int2asn1len(42), hex!("2A"));
/// assert_eq!(int2asn1len(2024), hex!("8207E8"));
/// assert_eq!(int2asn1len(65536), hex!("83010000"));
/// ```
#[must_use]
pub fn int2asn1len(length: usize) -> Vec<u8> {
    if length < 0x80 {
        return vec![(length & 0x7F) as u8];
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let significant = &bytes[skip..];
    let mut out = Vec::with_capacity(1 + significant.len());
    // At most size_of::<usize>() octets, always fits in the low 7 bits
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
    out
}

/// Length of an LDS tag given its first byte.
#[must_use]
pub const fn tag_len(first: u8) -> usize {
    if first == 0x5F || first == 0x7F {
        2
    } else {
        1
    }
}

/// Checks that `data` starts with `tag`.
///
/// # Errors
///
/// * `Asn1Error` if the data is incomplete or the tags don't match.
pub fn validate_asn1_tag(data: &[u8], tag: &[u8]) -> Result<(), Asn1Error> {
    let Some(found) = data.get(..tag.len()) else {
        error!(
            "Error while validating ASN1 tag, `data.len()`: `{}` is less than `tag.len()`: `{}`",
            data.len(),
            tag.len()
        );
        return Err(Asn1Error::Incomplete {
            expected: tag.len(),
            found: data.len(),
        });
    };
    if found == tag {
        Ok(())
    } else {
        error!(
            "Error while validating ASN1 tag, expected: {}, found {}",
            bytes2hex(tag),
            bytes2hex(found)
        );
        Err(Asn1Error::TagMismatch {
            expected: bytes2hex(tag),
            found: bytes2hex(found),
        })
    }
}

/// Splits the first TLV element off `data`.
///
/// # Returns
///
/// The value of the first element and the bytes following it.
///
/// # Errors
///
/// * `Asn1Error` if the data is incomplete.
pub fn get_asn1_child(data: &[u8], tag_len: usize) -> Result<(&[u8], &[u8]), Asn1Error> {
    let (tl, v) = len2int(data, tag_len)?;
    let Some(end) = tl.checked_add(v).filter(|&end| end <= data.len()) else {
        error!(
            "Error during get_asn1_child, `data.len()`: `{}` is less than `tl + v`: `{}`",
            data.len(),
            tl.saturating_add(v)
        );
        return Err(Asn1Error::Incomplete {
            expected: tl.saturating_add(v),
            found: data.len(),
        });
    };
    Ok((&data[tl..end], &data[end..]))
}

/// Finds the value of the element tagged `tag` in a flat run of LDS elements.
///
/// With `enter_top_tag` the outer template (for example `60` of EF.COM) is
/// stepped into first. `skip` matching elements are passed over before one is
/// returned.
///
/// # Returns
///
/// The element value, or `None` when no such element exists.
///
/// # Errors
///
/// * `Asn1Error` if an element length runs past the end of `data`.
pub fn get_data_by_tag<'a>(
    data: &'a [u8],
    tag: &[u8],
    enter_top_tag: bool,
    skip: usize,
) -> Result<Option<&'a [u8]>, Asn1Error> {
    let mut offset = 0;
    if enter_top_tag {
        let Some(&first) = data.first() else {
            return Ok(None);
        };
        let top_tag_len = tag_len(first);
        offset = top_tag_len + parse_length(data, top_tag_len)?.header_len;
    }

    let mut skipped = 0;
    while offset < data.len() {
        let id_len = tag_len(data[offset]);
        let element = &data[offset..];
        let (value_start, value_len) = len2int(element, id_len)?;
        let Some(value) = element.get(value_start..value_start + value_len) else {
            error!(
                "Element at offset {offset} is out of bounds, needs {} bytes, found {}",
                value_start + value_len,
                element.len()
            );
            return Err(Asn1Error::Incomplete {
                expected: value_start + value_len,
                found: element.len(),
            });
        };

        if element.get(..id_len) == Some(tag) {
            if skipped < skip {
                skipped += 1;
            } else {
                return Ok(Some(value));
            }
        }
        offset += value_start + value_len;
    }
    Ok(None)
}
