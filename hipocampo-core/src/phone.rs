//! Brazilian phone number masking.
//!
//! The mask is applied progressively while the user types:
//! `(DD`, `(DD) DDDD`, `(DD) DDDD-DDDD`, then `(DD) DDDDD-DDDD` once an
//! eleventh digit shows up. Anything past the eleventh digit is dropped.

/// Maximum number of digits a masked number can hold (area code + 9-digit line).
pub const MAX_DIGITS: usize = 11;

/// Format raw input as a masked phone number.
pub fn format_phone(raw: &str) -> String {
    let digits = clean_phone(raw);
    let d = digits.as_str();
    let n = d.len();

    if n <= 2 {
        format!("({d}")
    } else if n <= 6 {
        format!("({}) {}", &d[..2], &d[2..])
    } else if n <= 10 {
        format!("({}) {}-{}", &d[..2], &d[2..6], &d[6..])
    } else {
        format!("({}) {}-{}", &d[..2], &d[2..7], &d[7..MAX_DIGITS])
    }
}

/// Strip everything except ASCII digits.
pub fn clean_phone(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}
