//! DES based primitives used by Basic Access Control.
//!
//! For the constructions see ICAO Doc 9303-11 Section 9.7 and Appendix D:
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>

use cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use sha1_checked::Sha1;
use std::fmt;
use tracing::error;

/// DES block size, also the padding boundary for secure messaging.
pub const BLOCK_SIZE: usize = 8;

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

#[derive(Debug)]
#[non_exhaustive]
pub enum CryptoError {
    InvalidKeyLength { expected: usize, found: usize },
    InvalidIvLength { expected: usize, found: usize },
    /// Cipher input is not a whole number of blocks.
    InvalidDataLength { block_size: usize, found: usize },
    /// XOR operands differ in length.
    LengthMismatch(usize, usize),
    /// SHA-1 detected a collision attack.
    HashCollision(&'static str),
    UnpadError(cipher::block_padding::UnpadError),
}
impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::InvalidKeyLength { expected, found } => write!(
                f,
                "Invalid key, expected len: {expected}, found len: {found}"
            ),
            Self::InvalidIvLength { expected, found } => {
                write!(f, "Invalid IV, expected len: {expected}, found len: {found}")
            }
            Self::InvalidDataLength { block_size, found } => write!(
                f,
                "Cipher data length must be a multiple of {block_size}, found {found}"
            ),
            Self::LengthMismatch(a, b) => {
                write!(f, "XORed slices must have the same length, found {a}, {b}")
            }
            Self::HashCollision(context) => {
                write!(f, "SHA1 hash calculation had collision during {context}")
            }
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
impl std::error::Error for CryptoError {}

/// Which key [`derive_key`] produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Encryption,
    Mac,
}

impl KeyType {
    const fn counter(self) -> [u8; 4] {
        match self {
            Self::Encryption => [0x00, 0x00, 0x00, 0x01],
            Self::Mac => [0x00, 0x00, 0x00, 0x02],
        }
    }
}

pub(crate) fn sha1(data: &[u8], context: &'static str) -> Result<[u8; 20], CryptoError> {
    let hash_result = Sha1::try_digest(data);
    if hash_result.has_collision() {
        error!("SHA1 hash calculation during {context} had collision");
        return Err(CryptoError::HashCollision(context));
    }
    let mut out = [0; 20];
    out.copy_from_slice(hash_result.hash().as_slice());
    Ok(out)
}

/// Generates the BAC key seed, the first 16 bytes of SHA-1 over the MRZ
/// information.
///
/// # Errors
///
/// `CryptoError` if SHA-1 detects a collision.
pub fn generate_key_seed(secret: &[u8]) -> Result<[u8; 16], CryptoError> {
    let hash = sha1(secret, "generate_key_seed")?;
    let mut seed = [0; 16];
    seed.copy_from_slice(&hash[..16]);
    Ok(seed)
}

/// Derives a two-key 3DES key from a key seed.
///
/// `SHA-1(seed || counter)` truncated to 16 bytes with DES parity bits
/// adjusted, see ICAO Doc 9303-11 Section 9.7.1.
///
/// # Errors
///
/// `CryptoError` if SHA-1 detects a collision.
pub fn derive_key(seed: &[u8], key_type: KeyType) -> Result<[u8; 16], CryptoError> {
    let mut d = Vec::with_capacity(seed.len() + 4);
    d.extend_from_slice(seed);
    d.extend_from_slice(&key_type.counter());

    let hash = sha1(&d, "derive_key")?;
    let mut key = [0; 16];
    key.copy_from_slice(&hash[..16]);
    des3_adjust_parity_bits(&mut key);
    Ok(key)
}

/// Sets the least significant bit of every byte for odd parity.
pub fn des3_adjust_parity_bits(key: &mut [u8]) {
    for byte in key {
        let ones = (*byte >> 1).count_ones();
        *byte = (*byte & 0xFE) | u8::from(ones % 2 == 0);
    }
}

/// XORs two byte slices of equal length.
///
/// # Errors
///
/// * `CryptoError` if `a` and `b` have different lengths.
pub fn xor_slices(a: &[u8], b: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if a.len() != b.len() {
        error!(
            "XORed slices must have the same length, found {}, {}",
            a.len(),
            b.len()
        );
        return Err(CryptoError::LengthMismatch(a.len(), b.len()));
    }
    Ok(a.iter().zip(b).map(|(&x, &y)| x ^ y).collect())
}

/// Pads `data` to a multiple of 8 bytes with ISO/IEC 9797-1 padding method 2.
///
/// <https://en.wikipedia.org/wiki/ISO/IEC_9797-1#Padding_method_2>
#[must_use]
pub fn padding_method_2(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / BLOCK_SIZE + 1) * BLOCK_SIZE;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(data);
    out.push(0x80);
    out.resize(padded_len, 0x00);
    out
}

/// Strips ISO/IEC 9797-1 padding method 2.
///
/// Returns `None` when the data does not end in `80 00 .. 00`.
#[must_use]
pub fn remove_padding(data: &[u8]) -> Option<&[u8]> {
    let pad_start = data.iter().rposition(|&b| b != 0x00)?;
    (data[pad_start] == 0x80).then(|| &data[..pad_start])
}

fn check_key_and_data(
    key_len: usize,
    key_size: usize,
    data_len: usize,
    block_size: usize,
) -> Result<(), CryptoError> {
    if key_len != key_size {
        error!("Wrong key size for cipher operation, expected {key_size}, found {key_len}");
        return Err(CryptoError::InvalidKeyLength {
            expected: key_size,
            found: key_len,
        });
    }
    if data_len % block_size != 0 {
        error!("Wrong data size for cipher operation, expected multiple of {block_size}, found {data_len}");
        return Err(CryptoError::InvalidDataLength {
            block_size,
            found: data_len,
        });
    }
    Ok(())
}

fn check_iv(iv: Option<&[u8]>, iv_size: usize) -> Result<(), CryptoError> {
    match iv {
        Some(iv) if iv.len() != iv_size => {
            error!(
                "Wrong IV size for cipher operation, expected {iv_size}, found {}",
                iv.len()
            );
            Err(CryptoError::InvalidIvLength {
                expected: iv_size,
                found: iv.len(),
            })
        }
        _ => Ok(()),
    }
}

/// Encrypts block-aligned data using the specified block cipher mode.
///
/// # Errors
///
/// `CryptoError` if the key, IV or data has the wrong size.
pub fn encrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    CM: BlockEncryptMut + KeyIvInit,
{
    check_key_and_data(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    check_iv(iv, CM::iv_size())?;

    let zero_iv = vec![0; CM::iv_size()];
    Ok(CM::new(key.into(), iv.unwrap_or(zero_iv.as_slice()).into())
        .encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts block-aligned data using the specified block cipher mode.
///
/// # Errors
///
/// `CryptoError` if the key, IV or data has the wrong size.
pub fn decrypt<CM>(key: &[u8], iv: Option<&[u8]>, data: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    CM: BlockDecryptMut + KeyIvInit,
{
    check_key_and_data(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    check_iv(iv, CM::iv_size())?;

    let zero_iv = vec![0; CM::iv_size()];
    CM::new(key.into(), iv.unwrap_or(zero_iv.as_slice()).into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(CryptoError::UnpadError)
}

/// Encrypts block-aligned data in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `CryptoError` if the key or data has the wrong size.
pub fn encrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    CM: BlockEncryptMut + KeyInit,
{
    check_key_and_data(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    Ok(CM::new(key.into()).encrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data))
}

/// Decrypts block-aligned data in Electronic Codebook (ECB) mode.
///
/// # Errors
///
/// `CryptoError` if the key or data has the wrong size.
pub fn decrypt_ecb<CM>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError>
where
    CM: BlockDecryptMut + KeyInit,
{
    check_key_and_data(key.len(), CM::key_size(), data.len(), CM::block_size())?;
    CM::new(key.into())
        .decrypt_padded_vec_mut::<cipher::block_padding::NoPadding>(data)
        .map_err(CryptoError::UnpadError)
}

/// Two-key 3DES in CBC mode with a zero IV.
///
/// # Errors
///
/// `CryptoError` if `data` is not block-aligned.
pub fn tdes_encrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt::<cbc::Encryptor<des::TdesEde2>>(key, Some(&ZERO_IV), data)
}

/// Two-key 3DES in CBC mode with a zero IV.
///
/// # Errors
///
/// `CryptoError` if `data` is not block-aligned.
pub fn tdes_decrypt(key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    decrypt::<cbc::Decryptor<des::TdesEde2>>(key, Some(&ZERO_IV), data)
}

/// Computes the ISO/IEC 9797-1 MAC algorithm 3 ("retail MAC") with DES.
///
/// `message` is padded with padding method 2 here, callers pass it
/// unpadded.
///
/// # Errors
///
/// * `CryptoError` if `key` is not 16 bytes long.
pub fn retail_mac(key: &[u8], message: &[u8]) -> Result<[u8; 8], CryptoError> {
    if key.len() != 16 {
        error!("Can not compute MAC, MAC key is invalid.");
        return Err(CryptoError::InvalidKeyLength {
            expected: 16,
            found: key.len(),
        });
    }
    let (k0, k1) = key.split_at(8);

    let chained = encrypt::<cbc::Encryptor<des::Des>>(k0, Some(&ZERO_IV), &padding_method_2(message))?;
    let last = &chained[chained.len() - BLOCK_SIZE..];

    let mac = encrypt_ecb::<ecb::Encryptor<des::Des>>(
        k0,
        &decrypt_ecb::<ecb::Decryptor<des::Des>>(k1, last)?,
    )?;

    let mut out = [0; 8];
    out.copy_from_slice(&mac);
    Ok(out)
}
