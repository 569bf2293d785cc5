use crate::error::{Result, ShepherdError};

const KIB: u64 = 1024;

/// Parse a memory ceiling such as `"1G"`, `"300M"`, `"512kb"` or `"1048576"`
/// into bytes. Suffixes are binary (K/M/G = 1024^n) and case-insensitive.
pub fn parse_memory(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let invalid = || ShepherdError::InvalidMemoryLimit(input.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let upper = trimmed.to_ascii_uppercase();
    let without_b = match upper.strip_suffix('B') {
        // A bare "B" suffix only makes sense after digits or a unit letter
        Some(rest) if !rest.is_empty() => rest,
        Some(_) => return Err(invalid()),
        None => upper.as_str(),
    };

    let (digits, multiplier) = match without_b.chars().last() {
        Some('K') => (&without_b[..without_b.len() - 1], KIB),
        Some('M') => (&without_b[..without_b.len() - 1], KIB * KIB),
        Some('G') => (&without_b[..without_b.len() - 1], KIB * KIB * KIB),
        _ => (without_b, 1),
    };

    let digits = digits.trim();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let bytes = value.checked_mul(multiplier).ok_or_else(invalid)?;

    if bytes == 0 {
        return Err(invalid());
    }

    Ok(bytes)
}
