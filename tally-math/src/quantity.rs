//! Exact signed decimal arithmetic with an explicit scale
//!
//! A [`Quantity`] stores a big-integer numerator together with a decimal
//! scale, denoting `numerator / 10^scale`. All arithmetic is exact; rounding
//! only ever happens through the explicit rescaling entry points, so callers
//! decide when precision is given up.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::amount::{AmountError, AmountResult, Precision, EXTEND_BY_DIGITS};

/// Upper bound on the internal scale; matches the sanity limit used by
/// `Amount::valid`.
pub(crate) const MAX_PRECISION: Precision = 1024;

/// An arbitrary-precision signed decimal: `num / 10^prec`.
///
/// The scale is the *internal precision* of the value. It is never reduced
/// implicitly: `2.50` keeps scale 2 even though it equals `2.5`. Equality and
/// ordering are mathematical, so values at different scales compare equal
/// when they denote the same number.
#[derive(Clone)]
pub struct Quantity {
    num: BigInt,
    prec: Precision,
}

fn pow10(exp: Precision) -> BigInt {
    BigInt::from(10u32).pow(u32::from(exp))
}

impl Quantity {
    /// Create a quantity from a raw numerator and scale.
    pub fn new(num: BigInt, prec: Precision) -> Self {
        Self { num, prec }
    }

    /// Create an integral quantity at scale zero.
    pub fn from_integer(num: impl Into<BigInt>) -> Self {
        Self { num: num.into(), prec: 0 }
    }

    /// Zero at scale zero.
    pub fn zero() -> Self {
        Self::from_integer(0)
    }

    /// The numerator.
    pub fn numerator(&self) -> &BigInt {
        &self.num
    }

    /// The internal precision (decimal scale).
    pub fn precision(&self) -> Precision {
        self.prec
    }

    /// True when the numerator is zero, at any scale.
    pub fn is_zero(&self) -> bool {
        self.num.is_zero()
    }

    /// Sign of the value: -1, 0 or 1.
    pub fn sign(&self) -> i32 {
        match self.num.sign() {
            num_bigint::Sign::Minus => -1,
            num_bigint::Sign::NoSign => 0,
            num_bigint::Sign::Plus => 1,
        }
    }

    /// Negate in place.
    pub fn negate(&mut self) {
        self.num = -std::mem::take(&mut self.num);
    }

    /// Negated copy.
    pub fn negated(&self) -> Self {
        Self { num: -&self.num, prec: self.prec }
    }

    /// Absolute value.
    pub fn abs(&self) -> Self {
        Self { num: self.num.abs(), prec: self.prec }
    }

    /// Pad the numerator so the scale becomes exactly `prec`. Only widens;
    /// a smaller target is ignored.
    fn padded_to(&self, prec: Precision) -> Self {
        if prec <= self.prec {
            self.clone()
        } else {
            Self { num: &self.num * pow10(prec - self.prec), prec }
        }
    }

    /// Add, aligning both operands to the larger scale.
    pub fn add(&self, other: &Quantity) -> Quantity {
        let prec = self.prec.max(other.prec);
        Quantity { num: self.padded_to(prec).num + other.padded_to(prec).num, prec }
    }

    /// Subtract, aligning both operands to the larger scale.
    pub fn sub(&self, other: &Quantity) -> Quantity {
        let prec = self.prec.max(other.prec);
        Quantity { num: self.padded_to(prec).num - other.padded_to(prec).num, prec }
    }

    /// Multiply; the scales add. Past the sanity bound the result is
    /// rescaled back down rather than left with a runaway scale.
    pub fn mul(&self, other: &Quantity) -> Quantity {
        let product = Quantity { num: &self.num * &other.num, prec: self.prec + other.prec };
        if product.prec > MAX_PRECISION {
            product.rescale(MAX_PRECISION)
        } else {
            product
        }
    }

    /// Divide, truncating toward zero.
    ///
    /// The dividend is extended by [`EXTEND_BY_DIGITS`] fractional digits
    /// beyond its own scale, so quotients representable within that margin
    /// come out exact and anything longer is cut off, not rounded.
    pub fn div(&self, other: &Quantity) -> AmountResult<Quantity> {
        if other.is_zero() {
            return Err(AmountError::DivideByZero);
        }
        let prec = (self.prec + EXTEND_BY_DIGITS).min(MAX_PRECISION);
        let shift = prec - self.prec + other.prec;
        let num = (&self.num * pow10(shift)) / &other.num;
        Ok(Quantity { num, prec })
    }

    /// Compare mathematically, without mutating either side.
    pub fn compare(&self, other: &Quantity) -> Ordering {
        let prec = self.prec.max(other.prec);
        self.padded_to(prec).num.cmp(&other.padded_to(prec).num)
    }

    /// Rescale to precision `prec`.
    ///
    /// Widening pads with zeros; narrowing rounds half-to-even, the policy
    /// used for internal precision adjustments. Display output goes through
    /// [`Quantity::display_rounded`] instead.
    pub fn rescale(&self, prec: Precision) -> Quantity {
        if prec >= self.prec {
            return self.padded_to(prec);
        }
        let divisor = pow10(self.prec - prec);
        let (mut quot, rem) = self.num.abs().div_rem(&divisor);
        let twice = &rem * BigInt::from(2);
        match twice.cmp(&divisor) {
            Ordering::Greater => quot += 1,
            Ordering::Equal => {
                if quot.is_odd() {
                    quot += 1;
                }
            }
            Ordering::Less => {}
        }
        if self.num.is_negative() {
            quot = -quot;
        }
        Quantity { num: quot, prec }
    }

    /// Rescale to precision `prec`, rounding half away from zero.
    ///
    /// This is the rounding amounts display with, so `.005` becomes `.01`
    /// rather than the banker's `.00`.
    pub fn display_rounded(&self, prec: Precision) -> Quantity {
        if prec >= self.prec {
            return self.padded_to(prec);
        }
        let divisor = pow10(self.prec - prec);
        let (mut quot, rem) = self.num.abs().div_rem(&divisor);
        if &rem * BigInt::from(2) >= divisor {
            quot += 1;
        }
        if self.num.is_negative() {
            quot = -quot;
        }
        Quantity { num: quot, prec }
    }

    /// The smallest-scale quantity denoting the same value: trailing zeros
    /// of the fraction are dropped. `2.50` canonicalizes to `2.5`.
    pub fn canonical(&self) -> Quantity {
        let mut num = self.num.clone();
        let mut prec = self.prec;
        let ten = BigInt::from(10);
        while prec > 0 {
            let (quot, rem) = num.div_rem(&ten);
            if !rem.is_zero() {
                break;
            }
            num = quot;
            prec -= 1;
        }
        Quantity { num, prec }
    }

    /// Convert to `i64`; fails with `PrecisionLoss` when the value has a
    /// fractional part and with `NotConvertible` when it overflows.
    pub fn to_i64(&self) -> AmountResult<i64> {
        let canon = self.canonical();
        if canon.prec != 0 {
            return Err(AmountError::PrecisionLoss(self.to_string()));
        }
        canon.num.to_i64().ok_or_else(|| AmountError::NotConvertible(self.to_string()))
    }

    /// Convert to `f64`, silently losing precision past what the mantissa
    /// can hold.
    pub fn to_f64(&self) -> AmountResult<f64> {
        let num = self
            .num
            .to_f64()
            .ok_or_else(|| AmountError::NotConvertible(self.to_string()))?;
        let value = num / 10f64.powi(i32::from(self.prec));
        if value.is_finite() {
            Ok(value)
        } else {
            Err(AmountError::NotConvertible(self.to_string()))
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut digits = self.num.abs().to_string();
        if digits.len() <= self.prec as usize {
            let pad = self.prec as usize + 1 - digits.len();
            digits = format!("{}{}", "0".repeat(pad), digits);
        }
        if self.num.is_negative() {
            f.write_str("-")?;
        }
        if self.prec > 0 {
            let split = digits.len() - self.prec as usize;
            write!(f, "{}.{}", &digits[..split], &digits[split..])
        } else {
            f.write_str(&digits)
        }
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QUANTITY({} @ {})", self, self.prec)
    }
}

impl FromStr for Quantity {
    type Err = AmountError;

    /// Parse `[sign] digits [. digits]`, with no separators. The scale is
    /// the number of digits after the point.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AmountError::ParseError(format!("invalid quantity: {s:?}"));
        let (negative, rest) = match s.as_bytes().first() {
            Some(&b'-') => (true, &s[1..]),
            Some(&b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (int_part, frac_part) = match rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (rest, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(err());
        }
        if frac_part.len() > MAX_PRECISION as usize {
            return Err(err());
        }
        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        let mut num = BigInt::from_str(&digits).map_err(|_| err())?;
        if negative {
            num = -num;
        }
        Ok(Quantity { num, prec: frac_part.len() as Precision })
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Quantity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the canonical form so mathematically equal values collide.
        let canon = self.canonical();
        canon.num.hash(state);
        canon.prec.hash(state);
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(q("123.45").to_string(), "123.45");
        assert_eq!(q("-0.001").to_string(), "-0.001");
        assert_eq!(q("42").to_string(), "42");
        assert_eq!(q("+7.50").to_string(), "7.50");
        assert_eq!(q(".5").to_string(), "0.5");
        assert!("1,000".parse::<Quantity>().is_err());
        assert!("".parse::<Quantity>().is_err());
        assert!("12a".parse::<Quantity>().is_err());
    }

    #[test]
    fn test_scale_preserved() {
        assert_eq!(q("2.50").precision(), 2);
        assert_eq!(q("2.50").canonical().precision(), 1);
        assert_eq!(q("2.50"), q("2.5"));
        assert_eq!(q("0.00"), Quantity::zero());
    }

    #[test]
    fn test_add_sub_align() {
        let sum = q("100.00").add(&q("0.001"));
        assert_eq!(sum.to_string(), "100.001");
        assert_eq!(sum.precision(), 3);

        let diff = q("1").sub(&q("0.25"));
        assert_eq!(diff.to_string(), "0.75");
    }

    #[test]
    fn test_mul_scales_add() {
        let prod = q("1.5").mul(&q("2.25"));
        assert_eq!(prod.precision(), 3);
        assert_eq!(prod.to_string(), "3.375");
    }

    #[test]
    fn test_div_exact_and_truncated() {
        let quot = q("100.00").div(&q("2")).unwrap();
        assert_eq!(quot.precision(), 8);
        assert_eq!(quot, q("50"));

        // 1/3 truncates toward zero at the extended scale
        let third = q("1").div(&q("3")).unwrap();
        assert_eq!(third.to_string(), "0.333333");
        let neg_third = q("-1").div(&q("3")).unwrap();
        assert_eq!(neg_third.to_string(), "-0.333333");

        assert!(matches!(q("1").div(&q("0")), Err(AmountError::DivideByZero)));
        assert!(matches!(q("1").div(&q("0.00")), Err(AmountError::DivideByZero)));
    }

    #[test]
    fn test_rescale_half_to_even() {
        assert_eq!(q("2.5").rescale(0).to_string(), "2");
        assert_eq!(q("3.5").rescale(0).to_string(), "4");
        assert_eq!(q("-2.5").rescale(0).to_string(), "-2");
        assert_eq!(q("2.51").rescale(0).to_string(), "3");
        assert_eq!(q("1.25").rescale(1).to_string(), "1.2");
        assert_eq!(q("1.35").rescale(1).to_string(), "1.4");
        // widening pads
        assert_eq!(q("5").rescale(2).to_string(), "5.00");
    }

    #[test]
    fn test_display_rounding_half_away() {
        assert_eq!(q("100.005").display_rounded(2).to_string(), "100.01");
        assert_eq!(q("-100.005").display_rounded(2).to_string(), "-100.01");
        assert_eq!(q("2.5").display_rounded(0).to_string(), "3");
        assert_eq!(q("2.4").display_rounded(0).to_string(), "2");
        assert_eq!(q("0.0001").display_rounded(2).to_string(), "0.00");
    }

    #[test]
    fn test_compare_across_scales() {
        assert_eq!(q("1.0").compare(&q("1.00")), Ordering::Equal);
        assert!(q("1.01") > q("1.0"));
        assert!(q("-2") < q("0.0001"));
    }

    #[test]
    fn test_sign_and_negate() {
        assert_eq!(q("5").sign(), 1);
        assert_eq!(q("-5").sign(), -1);
        assert_eq!(q("0.00").sign(), 0);
        assert_eq!(q("5").negated().to_string(), "-5");
        assert_eq!(q("-1.2").abs().to_string(), "1.2");
    }

    #[test]
    fn test_to_i64() {
        assert_eq!(q("42").to_i64().unwrap(), 42);
        assert_eq!(q("42.00").to_i64().unwrap(), 42);
        assert!(matches!(q("42.5").to_i64(), Err(AmountError::PrecisionLoss(_))));
    }

    #[test]
    fn test_to_f64() {
        assert!((q("123.45").to_f64().unwrap() - 123.45).abs() < 1e-9);
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        use std::collections::hash_map::DefaultHasher;

        let hash = |v: &Quantity| {
            let mut h = DefaultHasher::new();
            v.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&q("2.50")), hash(&q("2.5")));
    }
}
