//! Kubernetes resource quantities.
//!
//! Only what the coordinator needs: exact comparison of two quantity strings
//! and binary-SI formatting of a byte count.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::SnapshotError;

/// A parsed quantity, held in nano-units so every suffix compares exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(i128);

const NANOS_PER_UNIT: i128 = 1_000_000_000;

impl Quantity {
    /// Parse a quantity such as `10Gi`, `1.5G`, `500m`, or `1e3`.
    ///
    /// Fractions that do not land on a whole nano-unit are rounded up.
    pub fn parse(raw: &str) -> Result<Self, SnapshotError> {
        let invalid = || SnapshotError::InvalidQuantity(raw.to_owned());
        let s = raw.trim();

        let (negative, s) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };

        let number_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_end);
        if number.is_empty() || number == "." {
            return Err(invalid());
        }

        let (whole, frac) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if frac.contains('.') {
            return Err(invalid());
        }
        let digits = format!("{whole}{frac}");
        let mantissa: i128 = digits.parse().map_err(|_| invalid())?;

        // value = mantissa * 2^bin * 10^dec / 10^frac.len(), in nano units.
        let (bin, dec) = suffix_scale(suffix).ok_or_else(invalid)?;
        let frac_digits = i32::try_from(frac.len()).map_err(|_| invalid())?;
        let dec = dec
            .checked_add(9)
            .and_then(|d| d.checked_sub(frac_digits))
            .ok_or_else(invalid)?;

        let mut value = mantissa
            .checked_mul(1i128.checked_shl(bin).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;
        if dec >= 0 {
            let scale = 10i128.checked_pow(dec.unsigned_abs()).ok_or_else(invalid)?;
            value = value.checked_mul(scale).ok_or_else(invalid)?;
        } else {
            value = match 10i128.checked_pow(dec.unsigned_abs()) {
                Some(scale) => value / scale + i128::from(value % scale != 0),
                // Smaller than any representable scale: the smallest unit.
                None => i128::from(value > 0),
            };
        }

        Ok(Self(if negative { -value } else { value }))
    }

    /// Whole units, rounded up.
    pub fn value(&self) -> i128 {
        let q = self.0.div_euclid(NANOS_PER_UNIT);
        if self.0.rem_euclid(NANOS_PER_UNIT) == 0 { q } else { q + 1 }
    }
}

impl FromStr for Quantity {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returns `(binary exponent, decimal exponent)` for a suffix.
fn suffix_scale(suffix: &str) -> Option<(u32, i32)> {
    let scale = match suffix {
        "" => (0, 0),
        "Ki" => (10, 0),
        "Mi" => (20, 0),
        "Gi" => (30, 0),
        "Ti" => (40, 0),
        "Pi" => (50, 0),
        "Ei" => (60, 0),
        "n" => (0, -9),
        "u" => (0, -6),
        "m" => (0, -3),
        "k" => (0, 3),
        "M" => (0, 6),
        "G" => (0, 9),
        "T" => (0, 12),
        "P" => (0, 15),
        "E" => (0, 18),
        _ => {
            let exp = suffix.strip_prefix(['e', 'E'])?;
            (0, exp.parse::<i32>().ok()?)
        }
    };
    Some(scale)
}

/// Format a byte count the way Kubernetes prints a binary-SI quantity:
/// the largest power-of-1024 suffix that divides the count evenly.
pub fn format_binary_si(bytes: i64) -> String {
    const SUFFIXES: [&str; 6] = ["Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];
    if bytes == 0 {
        return "0".to_owned();
    }
    let mut value = bytes;
    let mut idx = None;
    for (i, _) in SUFFIXES.iter().enumerate() {
        if value % 1024 != 0 {
            break;
        }
        value /= 1024;
        idx = Some(i);
    }
    match idx {
        Some(i) => format!("{value}{}", SUFFIXES[i]),
        None => value.to_string(),
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % NANOS_PER_UNIT == 0 {
            if let Ok(whole) = i64::try_from(self.0 / NANOS_PER_UNIT) {
                return f.write_str(&format_binary_si(whole));
            }
        }
        write!(f, "{}n", self.0)
    }
}

/// Compare two quantity strings.
pub fn compare(a: &str, b: &str) -> Result<Ordering, SnapshotError> {
    Ok(Quantity::parse(a)?.cmp(&Quantity::parse(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_suffixes() {
        assert_eq!(Quantity::parse("1Ki").unwrap().value(), 1024);
        assert_eq!(Quantity::parse("10Gi").unwrap().value(), 10 * (1 << 30));
        assert_eq!(Quantity::parse("1G").unwrap().value(), 1_000_000_000);
        assert_eq!(Quantity::parse("1.5Gi").unwrap().value(), 3 * (1 << 29));
        assert_eq!(Quantity::parse("500m").unwrap().value(), 1);
        assert_eq!(Quantity::parse("1e3").unwrap().value(), 1000);
        assert_eq!(Quantity::parse("-2k").unwrap().value(), -2000);
    }

    #[test]
    fn rejects_malformed() {
        for raw in [
            "",
            "Gi",
            "1.2.3",
            "10Xi",
            "abc",
            "1e",
            "1e2147483647",
            "1.5e2147483647",
            "1e40",
        ] {
            assert!(Quantity::parse(raw).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn extreme_exponents_do_not_overflow() {
        assert!(matches!(
            compare("1e2147483647", "10Gi"),
            Err(SnapshotError::InvalidQuantity(_))
        ));
        assert_eq!(Quantity::parse("1e-2147483648").unwrap(), Quantity(1));
        assert_eq!(Quantity::parse("0e-2147483648").unwrap(), Quantity(0));
    }

    #[test]
    fn binary_and_decimal_compare_exactly() {
        assert_eq!(compare("1Gi", "1G").unwrap(), Ordering::Greater);
        assert_eq!(compare("1024Mi", "1Gi").unwrap(), Ordering::Equal);
        assert_eq!(compare("10Gi", "20Gi").unwrap(), Ordering::Less);
    }

    #[test]
    fn binary_si_formatting() {
        assert_eq!(format_binary_si(0), "0");
        assert_eq!(format_binary_si(1000), "1000");
        assert_eq!(format_binary_si(2048), "2Ki");
        assert_eq!(format_binary_si(10 * (1 << 30)), "10Gi");
        assert_eq!(format_binary_si(1536 * (1 << 20)), "1536Mi");
    }
}
