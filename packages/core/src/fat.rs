//! FAT volume label validation.

use crate::error::RequestError;

/// Maximum label length in bytes.
pub const LABEL_LENGTH: usize = 11;

/// Characters a label may never contain.
const INVALID_CHARS: &[u8] = b"\\/:*?\"<>|";

/// Bytes rejected in short directory entries.
const BAD_BYTES: &[u8] = &[
    0x22, 0x2A, 0x2B, 0x2C, 0x2E, 0x2F, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, 0x5B, 0x5C, 0x5D,
    0x7C,
];

/// Why a label was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelError {
    TooLong,
    IllegalChars,
}

impl From<LabelError> for RequestError {
    fn from(e: LabelError) -> Self {
        match e {
            LabelError::TooLong => RequestError::TooLongName,
            LabelError::IllegalChars => RequestError::InvalidCharacters,
        }
    }
}

/// Label used when a request carries an empty one.
pub fn blank_label() -> String {
    " ".repeat(LABEL_LENGTH)
}

/// Validates a label against the FAT short-name rules.
///
/// Bytes are checked in order, and the length limit is hit at the first byte
/// past [`LABEL_LENGTH`], so `"TOO LONG VOL"` reports [`LabelError::TooLong`]
/// while an over-long label with a bad byte early on reports
/// [`LabelError::IllegalChars`].
pub fn validate_label(label: &str) -> Result<(), LabelError> {
    let bytes = label.as_bytes();
    if bytes.is_empty() || bytes[0] == 0xE5 {
        return Err(LabelError::IllegalChars);
    }

    for (i, &b) in bytes.iter().enumerate() {
        if i >= LABEL_LENGTH {
            return Err(LabelError::TooLong);
        }
        if INVALID_CHARS.contains(&b) || BAD_BYTES.contains(&b) {
            return Err(LabelError::IllegalChars);
        }
        // 0x05 stands in for 0xE5 as a leading byte.
        if b < 0x20 && !(i == 0 && b == 0x05) {
            return Err(LabelError::IllegalChars);
        }
        if !b.is_ascii() || b.is_ascii_lowercase() {
            return Err(LabelError::IllegalChars);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upper_case_label_is_valid() {
        assert_eq!(validate_label("UPPER CASE "), Ok(()));
        assert_eq!(validate_label("504753 1234"), Ok(()));
    }

    #[test]
    fn test_lower_case_label_is_rejected() {
        assert_eq!(validate_label("lower case "), Err(LabelError::IllegalChars));
    }

    #[test]
    fn test_long_label_is_rejected() {
        assert_eq!(validate_label("TOO LONG VOL"), Err(LabelError::TooLong));
        assert_eq!(validate_label(&" ".repeat(12)), Err(LabelError::TooLong));
    }

    #[test]
    fn test_forbidden_byte_is_rejected() {
        assert_eq!(validate_label("TEST=      "), Err(LabelError::IllegalChars));
        assert_eq!(validate_label("A:B"), Err(LabelError::IllegalChars));
        assert_eq!(validate_label("DOT.NAME"), Err(LabelError::IllegalChars));
    }

    #[test]
    fn test_leading_kanji_escape_is_allowed() {
        assert_eq!(validate_label("\x05          "), Ok(()));
        assert_eq!(validate_label(" \x05"), Err(LabelError::IllegalChars));
    }

    #[test]
    fn test_empty_and_non_ascii_are_rejected() {
        assert_eq!(validate_label(""), Err(LabelError::IllegalChars));
        assert_eq!(validate_label("KÄSE"), Err(LabelError::IllegalChars));
    }

    #[test]
    fn test_blank_label_is_valid() {
        assert_eq!(blank_label().len(), LABEL_LENGTH);
        assert_eq!(validate_label(&blank_label()), Ok(()));
    }

    #[test]
    fn test_request_error_mapping() {
        assert_eq!(
            RequestError::from(LabelError::TooLong),
            RequestError::TooLongName
        );
        assert_eq!(
            RequestError::from(LabelError::IllegalChars),
            RequestError::InvalidCharacters
        );
    }
}
