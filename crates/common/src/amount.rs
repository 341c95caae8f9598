//! Exact decimal arithmetic for resource counters.
//!
//! Idle games overflow every fixed-width type, so counters travel as decimal
//! strings. `Amount` parses them losslessly and supports exact addition and
//! subtraction. There is no floating point anywhere in this module.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Errors from parsing a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("empty amount")]
    Empty,
    #[error("invalid decimal amount: {0:?}")]
    Invalid(String),
}

/// A signed decimal number of unbounded precision.
///
/// Stored as little-endian base-10 digits of the unscaled magnitude plus a
/// scale (count of fractional digits). Always normalized: no leading or
/// trailing zeros, and zero is never negative, so derived equality is
/// numeric equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount {
    negative: bool,
    magnitude: Vec<u8>,
    scale: u32,
}

impl Amount {
    pub fn zero() -> Self {
        Self {
            negative: false,
            magnitude: Vec::new(),
            scale: 0,
        }
    }

    /// Parse `[+-]digits[.digits]`. Exponents and whitespace are rejected.
    pub fn parse(input: &str) -> Result<Self, AmountError> {
        if input.is_empty() {
            return Err(AmountError::Empty);
        }
        let invalid = || AmountError::Invalid(input.to_string());

        let (negative, body) = match input.as_bytes()[0] {
            b'-' => (true, &input[1..]),
            b'+' => (false, &input[1..]),
            _ => (false, input),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => {
                if f.is_empty() {
                    return Err(invalid());
                }
                (i, f)
            }
            None => (body, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let magnitude = int_part
            .bytes()
            .chain(frac_part.bytes())
            .rev()
            .map(|b| b - b'0')
            .collect();
        let mut amount = Self {
            negative,
            magnitude,
            scale: frac_part.len() as u32,
        };
        amount.normalize();
        Ok(amount)
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn negated(&self) -> Self {
        let mut out = self.clone();
        out.negative = !out.negative && !out.is_zero();
        out
    }

    /// Exact sum.
    pub fn plus(&self, other: &Self) -> Self {
        let scale = self.scale.max(other.scale);
        let a = self.rescaled(scale);
        let b = other.rescaled(scale);

        let (negative, magnitude) = if a.negative == b.negative {
            (a.negative, add_magnitudes(&a.magnitude, &b.magnitude))
        } else {
            match cmp_magnitudes(&a.magnitude, &b.magnitude) {
                Ordering::Equal => (false, Vec::new()),
                Ordering::Greater => (a.negative, sub_magnitudes(&a.magnitude, &b.magnitude)),
                Ordering::Less => (b.negative, sub_magnitudes(&b.magnitude, &a.magnitude)),
            }
        };

        let mut out = Self {
            negative,
            magnitude,
            scale,
        };
        out.normalize();
        out
    }

    /// Exact difference `self - other`.
    pub fn minus(&self, other: &Self) -> Self {
        self.plus(&other.negated())
    }

    fn rescaled(&self, scale: u32) -> Self {
        let shift = (scale - self.scale) as usize;
        let mut magnitude = vec![0; shift];
        magnitude.extend_from_slice(&self.magnitude);
        Self {
            negative: self.negative,
            magnitude,
            scale,
        }
    }

    fn normalize(&mut self) {
        let trailing = self
            .magnitude
            .iter()
            .take(self.scale as usize)
            .take_while(|d| **d == 0)
            .count();
        self.magnitude.drain(..trailing);
        self.scale -= trailing as u32;
        while self.magnitude.last() == Some(&0) {
            self.magnitude.pop();
        }
        if self.magnitude.is_empty() {
            self.negative = false;
            self.scale = 0;
        }
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::zero()
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Amount {
    type Error = AmountError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Amount> for String {
    fn from(value: Amount) -> Self {
        value.to_string()
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        let mut amount = Self {
            negative: false,
            magnitude: value
                .to_string()
                .bytes()
                .rev()
                .map(|b| b - b'0')
                .collect(),
            scale: 0,
        };
        amount.normalize();
        amount
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        let scale = self.scale as usize;
        let mut digits: Vec<u8> = self.magnitude.iter().rev().map(|d| d + b'0').collect();
        if digits.len() <= scale {
            let mut padded = vec![b'0'; scale + 1 - digits.len()];
            padded.extend_from_slice(&digits);
            digits = padded;
        }
        if self.negative {
            f.write_str("-")?;
        }
        let split = digits.len() - scale;
        // Digits are ASCII by construction.
        f.write_str(&String::from_utf8_lossy(&digits[..split]))?;
        if scale > 0 {
            f.write_str(".")?;
            f.write_str(&String::from_utf8_lossy(&digits[split..]))?;
        }
        Ok(())
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.negative, other.negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (negative, _) => {
                let scale = self.scale.max(other.scale);
                let ord = cmp_magnitudes(
                    &self.rescaled(scale).magnitude,
                    &other.rescaled(scale).magnitude,
                );
                if negative { ord.reverse() } else { ord }
            }
        }
    }
}

/// Compare little-endian digit vectors without leading zeros.
fn cmp_magnitudes(a: &[u8], b: &[u8]) -> Ordering {
    let a = trim(a);
    let b = trim(b);
    a.len()
        .cmp(&b.len())
        .then_with(|| a.iter().rev().cmp(b.iter().rev()))
}

fn trim(digits: &[u8]) -> &[u8] {
    let len = digits.iter().rposition(|&d| d != 0).map_or(0, |i| i + 1);
    &digits[..len]
}

fn add_magnitudes(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len().max(b.len()) + 1);
    let mut carry = 0;
    for i in 0..a.len().max(b.len()) {
        let sum = a.get(i).copied().unwrap_or(0) + b.get(i).copied().unwrap_or(0) + carry;
        out.push(sum % 10);
        carry = sum / 10;
    }
    if carry > 0 {
        out.push(carry);
    }
    out
}

/// `a - b` where `a >= b`.
fn sub_magnitudes(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i8;
    for (i, &digit) in a.iter().enumerate() {
        let mut diff = digit as i8 - b.get(i).copied().unwrap_or(0) as i8 - borrow;
        borrow = 0;
        if diff < 0 {
            diff += 10;
            borrow = 1;
        }
        out.push(diff as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amt(s: &str) -> Amount {
        Amount::parse(s).unwrap()
    }

    #[test]
    fn parse_and_display_canonical() {
        assert_eq!(amt("150").to_string(), "150");
        assert_eq!(amt("007").to_string(), "7");
        assert_eq!(amt("1.500").to_string(), "1.5");
        assert_eq!(amt(".25").to_string(), "0.25");
        assert_eq!(amt("-0.0").to_string(), "0");
        assert_eq!(amt("+12").to_string(), "12");
        assert_eq!(amt("-0.05").to_string(), "-0.05");
    }

    #[test]
    fn long_zero_fraction_normalizes() {
        let raw = format!("42.{}", "0".repeat(200_000));
        assert_eq!(amt(&raw), amt("42"));
        let raw = format!("0.5{}", "0".repeat(200_000));
        assert_eq!(amt(&raw).to_string(), "0.5");
        assert!(amt(&format!("0.{}", "0".repeat(200_000))).is_zero());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Amount::parse(""), Err(AmountError::Empty));
        for bad in ["abc", "1e5", "1.", "-", ".", "1.2.3", " 1", "NaN", "1_000"] {
            assert!(Amount::parse(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn addition_is_exact() {
        assert_eq!(amt("100").plus(&amt("50")), amt("150"));
        assert_eq!(amt("0.1").plus(&amt("0.2")), amt("0.3"));
        assert_eq!(amt("999").plus(&amt("1")).to_string(), "1000");
        let huge = "123456789012345678901234567890";
        assert_eq!(
            amt(huge).plus(&amt(huge)).to_string(),
            "246913578024691357802469135780"
        );
    }

    #[test]
    fn subtraction_crosses_zero() {
        assert_eq!(amt("5").minus(&amt("8")).to_string(), "-3");
        assert_eq!(amt("-5").plus(&amt("5")), Amount::zero());
        assert_eq!(amt("10.5").minus(&amt("0.75")).to_string(), "9.75");
        assert!(amt("1").minus(&amt("2")).is_negative());
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(amt("10") > amt("9.99"));
        assert!(amt("-1") < amt("0"));
        assert!(amt("-10") < amt("-2"));
        assert_eq!(amt("2.50").cmp(&amt("2.5")), Ordering::Equal);
    }

    #[test]
    fn serde_uses_strings() {
        let json = serde_json::to_string(&amt("42.10")).unwrap();
        assert_eq!(json, "\"42.1\"");
        let back: Amount = serde_json::from_str("\"0042.1\"").unwrap();
        assert_eq!(back, amt("42.1"));
        assert!(serde_json::from_str::<Amount>("\"oops\"").is_err());
    }

    #[test]
    fn from_u64_matches_parse() {
        assert_eq!(Amount::from(0), Amount::zero());
        assert_eq!(Amount::from(1200), amt("1200"));
    }
}
