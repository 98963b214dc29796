//! # Table Numbers
//!
//! Waiters type "5", the floor plan says "05", an old import stored "005".
//! Every lookup and every uniqueness check goes through
//! [`canonical_table_number`] so those are all the same table.
//!
//! ```text
//!   input        canonical
//!   ─────        ─────────
//!   "5"     ──►  "05"
//!   " 005 " ──►  "05"
//!   "123"   ──►  "123"
//!   "b2"    ──►  "B2"
//!   "  "    ──►  InvalidInput
//! ```

use crate::error::{CoreError, CoreResult};

/// Minimum width of a purely numeric table number.
const NUMERIC_WIDTH: usize = 2;

/// Returns the canonical form of a table number.
///
/// Purely numeric input is parsed and zero-padded to two digits; anything
/// else is upper-cased as typed.
pub fn canonical_table_number(raw: &str) -> CoreResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput(
            "table number is required".to_string(),
        ));
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let digits = trimmed.trim_start_matches('0');
        // Keep the digits as text so very long numbers don't overflow
        let digits = if digits.is_empty() { "0" } else { digits };
        return Ok(format!("{:0>width$}", digits, width = NUMERIC_WIDTH));
    }

    Ok(trimmed.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_input_is_padded() {
        assert_eq!(canonical_table_number("1").unwrap(), "01");
        assert_eq!(canonical_table_number("01").unwrap(), "01");
        assert_eq!(canonical_table_number("001").unwrap(), "01");
        assert_eq!(canonical_table_number(" 5 ").unwrap(), "05");
        assert_eq!(canonical_table_number("123").unwrap(), "123");
        assert_eq!(canonical_table_number("0").unwrap(), "00");
    }

    #[test]
    fn test_other_input_is_uppercased() {
        assert_eq!(canonical_table_number("b2").unwrap(), "B2");
        assert_eq!(canonical_table_number("Varanda").unwrap(), "VARANDA");
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(
            canonical_table_number("   "),
            Err(CoreError::InvalidInput(_))
        ));
    }
}
