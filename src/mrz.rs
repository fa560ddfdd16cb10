//! Machine Readable Zone fields used as the BAC secret.

use std::fmt;
use tracing::error;

const MRZ_CHARSET: &str = "0123456789<ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MrzError {
    InvalidCharacter(char),
    InvalidField(&'static str, String),
    MissingField(&'static str),
}
impl fmt::Display for MrzError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::InvalidCharacter(c) => write!(f, "MRZ can not contain the character: {c}"),
            Self::InvalidField(field, ref value) => {
                write!(f, "MRZ field {field} is invalid: {value}")
            }
            Self::MissingField(field) => write!(f, "MRZ field {field} is missing"),
        }
    }
}
impl std::error::Error for MrzError {}

/// Calculates an MRZ check digit.
///
/// Weights 7, 3, 1 repeat over the characters; digits count as their value,
/// `A` to `Z` as 10 to 35 and the filler `<` as 0. The result is the weighted
/// sum modulo 10.
///
/// # Errors
///
/// * `MrzError` if an invalid character is given.
///
/// # Example
///
/// ```
/// # use emrtd_tcl::mrz::MrzError;
/// #
/// # fn main() -> Result<(), MrzError> {
/// use emrtd_tcl::mrz::calculate_check_digit;
/// assert_eq!(calculate_check_digit("L898902C3")?, '6');
/// #
/// #     Ok(())
/// # }
/// ```
pub fn calculate_check_digit(data: &str) -> Result<char, MrzError> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let mut total = 0;
    for (counter, c) in data.chars().enumerate() {
        let value = match c {
            '0'..='9' | 'A'..='Z' => c.to_digit(36),
            '<' => Some(0),
            _ => None,
        };
        let Some(value) = value else {
            error!("Can not calculate check digit for invalid character: `{c}`");
            return Err(MrzError::InvalidCharacter(c));
        };
        total += WEIGHTS[counter % 3] * value;
    }

    // total % 10 is a single decimal digit
    Ok(char::from(b'0' + (total % 10) as u8))
}

/// Checks `field` against a printed check digit.
///
/// # Errors
///
/// * `MrzError` if `field` contains an invalid character.
pub fn verify_check_digit(field: &str, expected: char) -> Result<bool, MrzError> {
    Ok(calculate_check_digit(field)? == expected)
}

/// The three MRZ fields BAC keys are derived from.
#[derive(Clone, PartialEq, Eq)]
pub struct MrzInfo {
    document_number: String,
    date_of_birth: String,
    date_of_expiry: String,
}

impl fmt::Debug for MrzInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MrzInfo").finish_non_exhaustive()
    }
}

fn validate_field(
    field: &'static str,
    value: &str,
    length: std::ops::RangeInclusive<usize>,
) -> Result<(), MrzError> {
    if value.is_empty() {
        error!("MRZ field {field} was not supplied");
        return Err(MrzError::MissingField(field));
    }
    if !length.contains(&value.len()) || value.chars().any(|c| !MRZ_CHARSET.contains(c)) {
        error!("MRZ field {field} must be {length:?} characters long and should not contain illegal characters, received {value}");
        return Err(MrzError::InvalidField(field, value.to_owned()));
    }
    Ok(())
}

impl MrzInfo {
    /// Validates the fields and pads the document number with `<` to 9
    /// characters.
    ///
    /// The document number is up to 9 characters on TD3 documents and up to
    /// 22 on TD1 documents (ICAO Doc 9303-5 Section 4.2.2). Dates are
    /// `YYMMDD`.
    ///
    /// # Errors
    ///
    /// * `MrzError::MissingField` if a field is empty.
    /// * `MrzError::InvalidField` on wrong length or characters.
    pub fn new(
        document_number: &str,
        date_of_birth: &str,
        date_of_expiry: &str,
    ) -> Result<Self, MrzError> {
        validate_field("Document number", document_number, 1..=22)?;
        validate_field("Birth date", date_of_birth, 6..=6)?;
        validate_field("Expiry date", date_of_expiry, 6..=6)?;

        Ok(Self {
            document_number: format!("{document_number:<<9}"),
            date_of_birth: date_of_birth.to_owned(),
            date_of_expiry: date_of_expiry.to_owned(),
        })
    }

    #[must_use]
    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    /// Builds the MRZ information used as the BAC key seed input,
    /// `document number || cd || birth date || cd || expiry date || cd`.
    ///
    /// # Errors
    ///
    /// Does not fail for a validated `MrzInfo`, the `Result` mirrors
    /// [`calculate_check_digit`].
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_tcl::mrz::MrzError;
    /// #
    /// # fn main() -> Result<(), MrzError> {
    /// use emrtd_tcl::MrzInfo;
    /// let mrz = MrzInfo::new("L898902C3", "740812", "120415")?;
    /// assert_eq!(mrz.secret()?, "L898902C3674081221204159");
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn secret(&self) -> Result<String, MrzError> {
        Ok(format!(
            "{}{}{}{}{}{}",
            self.document_number,
            calculate_check_digit(&self.document_number)?,
            self.date_of_birth,
            calculate_check_digit(&self.date_of_birth)?,
            self.date_of_expiry,
            calculate_check_digit(&self.date_of_expiry)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_check_digit_valid_data() -> Result<(), MrzError> {
        // ICAO Doc 9303-3 Appendix A
        assert_eq!(calculate_check_digit("520727")?, '3');
        assert_eq!(calculate_check_digit("AB2134<<<")?, '5');
        assert_eq!(
            calculate_check_digit("HA672242<658022549601086<<<<<<<<<<<<<<0")?,
            '8'
        );
        assert_eq!(calculate_check_digit("L898902C3")?, '6');
        assert_eq!(calculate_check_digit("L898902C<")?, '3');
        assert_eq!(calculate_check_digit("")?, '0');
        assert_eq!(calculate_check_digit("1")?, '7');
        Ok(())
    }

    #[test]
    fn test_calculate_check_digit_invalid_character() {
        assert_eq!(
            calculate_check_digit("ABC*123"),
            Err(MrzError::InvalidCharacter('*'))
        );
        assert_eq!(
            calculate_check_digit("l898902c3"),
            Err(MrzError::InvalidCharacter('l'))
        );
    }

    #[test]
    fn test_verify_check_digit() -> Result<(), MrzError> {
        assert!(verify_check_digit("740812", '2')?);
        assert!(!verify_check_digit("740812", '3')?);
        Ok(())
    }

    #[test]
    fn test_secret_valid_input() -> Result<(), MrzError> {
        // ICAO Doc 9303-4 Appendix B
        let mrz = MrzInfo::new("L898902C3", "740812", "120415")?;
        assert_eq!(mrz.secret()?, "L898902C3674081221204159");
        // ICAO Doc 9303-11 Appendix D.2
        let mrz = MrzInfo::new("D23145890734", "340712", "950712")?;
        assert_eq!(mrz.secret()?, "D23145890734934071279507122");
        let mrz = MrzInfo::new("L898902C<", "690806", "940623")?;
        assert_eq!(mrz.secret()?, "L898902C<369080619406236");
        // ICAO Doc 9303-11 Appendix G
        let mrz = MrzInfo::new("T22000129", "640812", "101031")?;
        assert_eq!(mrz.secret()?, "T22000129364081251010318");
        Ok(())
    }

    #[test]
    fn test_short_document_number_is_padded() -> Result<(), MrzError> {
        let mrz = MrzInfo::new("L898902C", "690806", "940623")?;
        assert_eq!(mrz.document_number(), "L898902C<");
        assert_eq!(mrz.secret()?, "L898902C<369080619406236");
        Ok(())
    }

    #[test]
    fn test_invalid_input() {
        assert!(matches!(
            MrzInfo::new("L898902C300000000000000", "740812", "120415"),
            Err(MrzError::InvalidField("Document number", _))
        ));
        assert!(matches!(
            MrzInfo::new("L898902C3", "7408121", "120415"),
            Err(MrzError::InvalidField("Birth date", _))
        ));
        assert!(matches!(
            MrzInfo::new("L898902C3", "740812", "1204-5"),
            Err(MrzError::InvalidField("Expiry date", _))
        ));
        assert_eq!(
            MrzInfo::new("", "740812", "120415"),
            Err(MrzError::MissingField("Document number"))
        );
        assert_eq!(
            MrzInfo::new("L898902C3", "740812", ""),
            Err(MrzError::MissingField("Expiry date"))
        );
    }
}
