//! Flash address literals
//!
//! Addresses in profile tables are written as integer literals with the usual
//! base prefixes: `0x` (hex), `0o` (octal), `0b` (binary) or plain decimal.
//! Underscores may separate digits. A decimal literal other than zero may not
//! start with `0`, so `010` is rejected instead of being read as ten or eight.
//!
//! [`parse_address`] is a `const fn`, so the built-in table is checked at
//! compile time.

use thiserror::Error;

/// Malformed address literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    /// No digits at all
    #[error("empty address literal")]
    Empty,
    /// Character outside the literal's base, or a misplaced underscore
    #[error("invalid digit in address literal")]
    InvalidDigit,
    /// Decimal literal with a leading zero
    #[error("leading zeros are not allowed in decimal address literals")]
    LeadingZero,
    /// Value does not fit in 32 bits
    #[error("address literal does not fit in 32 bits")]
    Overflow,
}

/// Parse a base-prefixed integer literal into a flash address
pub const fn parse_address(literal: &str) -> Result<u32, AddressError> {
    let bytes = literal.as_bytes();
    if bytes.is_empty() {
        return Err(AddressError::Empty);
    }

    let (radix, start) = if bytes.len() > 1 && bytes[0] == b'0' {
        match bytes[1] {
            b'x' | b'X' => (16, 2),
            b'o' | b'O' => (8, 2),
            b'b' | b'B' => (2, 2),
            _ => (10, 0),
        }
    } else {
        (10, 0)
    };

    if start == bytes.len() {
        return Err(AddressError::Empty);
    }

    let mut value: u32 = 0;
    let mut digits = 0;
    // A prefix may be followed by an underscore ("0x_1000"), a bare number may not
    let mut after_digit = start != 0;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;

        if b == b'_' {
            if !after_digit {
                return Err(AddressError::InvalidDigit);
            }
            after_digit = false;
            continue;
        }

        let digit = match b {
            b'0'..=b'9' => (b - b'0') as u32,
            b'a'..=b'f' => (b - b'a') as u32 + 10,
            b'A'..=b'F' => (b - b'A') as u32 + 10,
            _ => return Err(AddressError::InvalidDigit),
        };
        if digit >= radix {
            return Err(AddressError::InvalidDigit);
        }

        value = match value.checked_mul(radix) {
            Some(v) => v,
            None => return Err(AddressError::Overflow),
        };
        value = match value.checked_add(digit) {
            Some(v) => v,
            None => return Err(AddressError::Overflow),
        };
        digits += 1;
        after_digit = true;
    }

    if digits == 0 || !after_digit {
        return Err(AddressError::InvalidDigit);
    }
    if radix == 10 && bytes[0] == b'0' && value != 0 {
        return Err(AddressError::LeadingZero);
    }

    Ok(value)
}

/// Parse an address literal in a constant table
///
/// Panics on a malformed literal, which turns into a compile error when used
/// to initialize a `const`.
pub(crate) const fn address(literal: &str) -> u32 {
    match parse_address(literal) {
        Ok(addr) => addr,
        Err(_) => panic!("malformed address literal in firmware profile table"),
    }
}
