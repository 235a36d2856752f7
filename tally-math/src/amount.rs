//! Commoditized arbitrary-precision amounts
//!
//! An [`Amount`] couples an exact [`Quantity`] with an optional commodity
//! handle. Arithmetic stays exact at an internal precision that only grows;
//! rounding happens at display time, using the conventions the commodity
//! learned from the amounts parsed against it.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use num_bigint::BigInt;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commodity::{
    Annotation, CommodityFlags, CommodityPool, CommodityRef, KeepDetails,
};
use crate::datetime::{self, Moment};
use crate::quantity::{Quantity, MAX_PRECISION};

/// Precision type for tracking decimal places.
pub type Precision = u16;

/// Extra digits of precision carried past an operand's own scale during
/// division, so quotients stay exact whenever they fit.
pub const EXTEND_BY_DIGITS: Precision = 6;

/// Errors that can occur during amount operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    /// Malformed numeric or annotation syntax.
    #[error("Cannot parse amount: {0}")]
    ParseError(String),
    /// Arithmetic or comparison across distinct, non-anonymous commodities.
    #[error("Amounts with commodities {0:?} and {1:?} are incompatible")]
    IncompatibleCommodities(String, String),
    /// Division by a zero or uninitialized divisor.
    #[error("Divide by zero")]
    DivideByZero,
    /// Integral conversion of a value with a fractional part.
    #[error("Precision would be lost converting {0}")]
    PrecisionLoss(String),
    /// The value does not fit the requested representation.
    #[error("Value not convertible: {0}")]
    NotConvertible(String),
    /// Deserialization referenced a commodity identifier the pool lacks.
    #[error("Unknown commodity identifier {0}")]
    UnknownCommodity(u32),
    /// A symbol was created twice in the same pool.
    #[error("Commodity symbol {0:?} already exists")]
    DuplicateSymbol(String),
    /// An internal invariant was violated.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// An I/O failure at the serialization boundary.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AmountError {
    fn from(err: std::io::Error) -> Self {
        AmountError::Io(err.to_string())
    }
}

/// Result type for amount operations.
pub type AmountResult<T> = Result<T, AmountError>;

bitflags! {
    /// Flags controlling how an amount is parsed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParseFlags: u8 {
        /// Do not teach the commodity the observed precision and style; the
        /// parsed amount is marked to display at full internal precision.
        const NO_MIGRATE = 0x01;
        /// Do not reduce the result through its commodity's `smaller` links.
        const NO_REDUCE = 0x02;
    }
}

// Process-wide state. The default pool backs the convenience parse entry
// points; the boolean toggles alter annotation equivalence and display, per
// the behavior hosts of this kernel expect to configure globally.
static DEFAULT_POOL: Lazy<RwLock<Option<Arc<CommodityPool>>>> = Lazy::new(|| RwLock::new(None));
static KEEP_PRICE: AtomicBool = AtomicBool::new(false);
static KEEP_DATE: AtomicBool = AtomicBool::new(false);
static KEEP_TAG: AtomicBool = AtomicBool::new(false);
static KEEP_BASE: AtomicBool = AtomicBool::new(true);
static FULL_STRINGS: AtomicBool = AtomicBool::new(false);

/// Ready the amount subsystem: install a fresh default pool.
pub fn initialize() {
    *DEFAULT_POOL.write() = Some(CommodityPool::new());
}

/// Release the default pool. Amounts still holding commodities from it must
/// not be used afterwards.
pub fn shutdown() {
    *DEFAULT_POOL.write() = None;
}

/// The current default pool, if [`initialize`] has been called.
pub fn default_pool() -> Option<Arc<CommodityPool>> {
    DEFAULT_POOL.read().clone()
}

/// Whether lot prices participate in commodity equivalence.
pub fn keep_price() -> bool {
    KEEP_PRICE.load(AtomicOrdering::Relaxed)
}

/// Set whether lot prices participate in commodity equivalence.
pub fn set_keep_price(keep: bool) {
    KEEP_PRICE.store(keep, AtomicOrdering::Relaxed);
}

/// Whether lot dates participate in commodity equivalence.
pub fn keep_date() -> bool {
    KEEP_DATE.load(AtomicOrdering::Relaxed)
}

/// Set whether lot dates participate in commodity equivalence.
pub fn set_keep_date(keep: bool) {
    KEEP_DATE.store(keep, AtomicOrdering::Relaxed);
}

/// Whether lot tags participate in commodity equivalence.
pub fn keep_tag() -> bool {
    KEEP_TAG.load(AtomicOrdering::Relaxed)
}

/// Set whether lot tags participate in commodity equivalence.
pub fn set_keep_tag(keep: bool) {
    KEEP_TAG.store(keep, AtomicOrdering::Relaxed);
}

/// Whether scalable commodities display in their reduced base form rather
/// than unreducing to the most compact unit.
pub fn keep_base() -> bool {
    KEEP_BASE.load(AtomicOrdering::Relaxed)
}

/// Set whether display keeps the reduced base form.
pub fn set_keep_base(keep: bool) {
    KEEP_BASE.store(keep, AtomicOrdering::Relaxed);
}

/// Whether stream display uses full internal precision.
pub fn full_strings() -> bool {
    FULL_STRINGS.load(AtomicOrdering::Relaxed)
}

/// Set whether stream display uses full internal precision.
pub fn set_full_strings(full: bool) {
    FULL_STRINGS.store(full, AtomicOrdering::Relaxed);
}

/// An arbitrary-precision number with an optional commodity.
///
/// A default-constructed amount is *null*: it has no value and no commodity,
/// and acts as the additive identity when combined with any other amount.
#[derive(Clone)]
pub struct Amount {
    quantity: Option<Quantity>,
    commodity: Option<CommodityRef>,
    keep_precision: bool,
}

impl Amount {
    /// The null amount.
    pub fn null() -> Self {
        Self { quantity: None, commodity: None, keep_precision: false }
    }

    /// An anonymous amount from a raw quantity.
    pub fn from_quantity(quantity: Quantity) -> Self {
        Self { quantity: Some(quantity), commodity: None, keep_precision: false }
    }

    /// An anonymous integral amount.
    pub fn from_i64(value: i64) -> Self {
        Self::from_quantity(Quantity::from_integer(value))
    }

    /// An anonymous amount from a float, via the shortest decimal
    /// representation that round-trips the IEEE value.
    pub fn from_f64(value: f64) -> AmountResult<Self> {
        if !value.is_finite() {
            return Err(AmountError::NotConvertible(value.to_string()));
        }
        let decimal =
            Decimal::try_from(value).map_err(|e| AmountError::NotConvertible(e.to_string()))?;
        Ok(Self::from_decimal(decimal))
    }

    /// An anonymous amount from a `Decimal`, preserving its scale.
    pub fn from_decimal(value: Decimal) -> Self {
        Self::from_quantity(Quantity::new(BigInt::from(value.mantissa()), value.scale() as Precision))
    }

    /// Parse an amount against the default pool.
    pub fn parse(input: &str) -> AmountResult<Self> {
        Self::parse_with(input, ParseFlags::empty())
    }

    /// Parse an amount against the default pool with explicit flags.
    pub fn parse_with(input: &str, flags: ParseFlags) -> AmountResult<Self> {
        let pool = default_pool()
            .ok_or(AmountError::InvalidState("amount subsystem not initialized"))?;
        parse_with_pool(&pool, input, flags)
    }

    /// Parse an amount against an explicit pool.
    pub fn parse_in(
        pool: &CommodityPool,
        input: &str,
        flags: ParseFlags,
    ) -> AmountResult<Self> {
        parse_with_pool(pool, input, flags)
    }

    /// Parse an amount whose display is never truncated to the commodity's
    /// precision, and which leaves the commodity's metadata untouched.
    pub fn exact(input: &str) -> AmountResult<Self> {
        Self::parse_with(input, ParseFlags::NO_MIGRATE)
    }

    /// [`Amount::exact`] against an explicit pool.
    pub fn exact_in(pool: &CommodityPool, input: &str) -> AmountResult<Self> {
        parse_with_pool(pool, input, ParseFlags::NO_MIGRATE)
    }

    /// Record a scaling relationship between two commodities, so that for
    /// example `1.0m` and `60s` establish a minutes/seconds ladder usable by
    /// [`Amount::reduce`] and [`Amount::unreduce`].
    pub fn parse_conversion(larger: &str, smaller: &str) -> AmountResult<()> {
        let pool = default_pool()
            .ok_or(AmountError::InvalidState("amount subsystem not initialized"))?;
        Self::parse_conversion_in(&pool, larger, smaller)
    }

    /// [`Amount::parse_conversion`] against an explicit pool.
    pub fn parse_conversion_in(
        pool: &CommodityPool,
        larger: &str,
        smaller: &str,
    ) -> AmountResult<()> {
        let larger = scan(pool, larger)?;
        let smaller = scan(pool, smaller)?;
        let (Some(larger_symbol), Some(smaller_symbol)) = (&larger.symbol, &smaller.symbol)
        else {
            return Err(AmountError::ParseError(
                "a conversion needs a commodity on both sides".to_string(),
            ));
        };

        let smaller_comm = pool.find_or_create(smaller_symbol)?;
        smaller_comm.add_flags(smaller.style | CommodityFlags::NOMARKET);
        let larger_comm = pool.find_or_create(larger_symbol)?;
        larger_comm.add_flags(larger.style | smaller_comm.flags() | CommodityFlags::NOMARKET);

        let smaller_amount = Amount {
            quantity: Some(smaller.quantity.clone()),
            commodity: Some(smaller_comm.clone()),
            keep_precision: false,
        };
        let larger_amount = Amount {
            quantity: Some(larger.quantity.mul(&smaller.quantity)),
            commodity: Some(larger_comm.clone()),
            keep_precision: false,
        };

        larger_comm.set_smaller(Some(smaller_amount));
        smaller_comm.set_larger(Some(larger_amount));
        Ok(())
    }

    /// True when this amount has neither value nor commodity.
    pub fn is_null(&self) -> bool {
        self.quantity.is_none()
    }

    /// True when the actual internal value is zero. `$0.0001` is not
    /// really zero.
    pub fn is_realzero(&self) -> bool {
        match &self.quantity {
            None => true,
            Some(q) => q.is_zero(),
        }
    }

    /// True when the display value is zero: the amount rounded to its
    /// commodity's precision has a zero numerator. `$0.0001` is zero when
    /// `$` displays two digits.
    pub fn is_zero(&self) -> bool {
        match (&self.quantity, &self.commodity) {
            (None, _) => true,
            (Some(q), Some(comm)) => {
                if self.keep_precision || q.precision() <= comm.precision() {
                    q.is_zero()
                } else {
                    q.display_rounded(comm.precision()).is_zero()
                }
            }
            (Some(q), None) => q.is_zero(),
        }
    }

    /// True when the display value is not zero.
    pub fn is_nonzero(&self) -> bool {
        !self.is_zero()
    }

    /// Sign of the internal value: -1, 0 or 1.
    pub fn sign(&self) -> i32 {
        self.quantity.as_ref().map_or(0, Quantity::sign)
    }

    /// The internal precision of the value.
    pub fn precision(&self) -> Precision {
        self.quantity.as_ref().map_or(0, Quantity::precision)
    }

    /// The precision this amount would display at.
    pub fn display_precision(&self) -> Precision {
        match (&self.quantity, &self.commodity) {
            (Some(q), _) if self.keep_precision => q.precision(),
            (_, Some(comm)) => comm.precision(),
            (Some(q), None) => q.precision(),
            (None, None) => 0,
        }
    }

    /// True when display rounding is suppressed for this amount.
    pub fn keeps_precision(&self) -> bool {
        self.keep_precision
    }

    /// The underlying quantity, when one is present.
    pub fn quantity(&self) -> Option<&Quantity> {
        self.quantity.as_ref()
    }

    /// Negate in place.
    pub fn in_place_negate(&mut self) {
        if let Some(q) = &mut self.quantity {
            q.negate();
        }
    }

    /// Negated copy.
    pub fn negated(&self) -> Self {
        let mut result = self.clone();
        result.in_place_negate();
        result
    }

    /// Absolute value.
    pub fn abs(&self) -> Self {
        if self.sign() < 0 {
            self.negated()
        } else {
            self.clone()
        }
    }

    /// Round to the commodity's display precision, in place. Anonymous
    /// amounts are left untouched. Clears any keep-precision mark.
    pub fn in_place_round(&mut self) {
        let Some(precision) = self.commodity.as_ref().map(|c| c.precision()) else {
            self.keep_precision = false;
            return;
        };
        self.in_place_roundto(precision);
    }

    /// Round half away from zero to `precision` digits, in place. The scale
    /// only shrinks; a wider target leaves the value as it is. Clears any
    /// keep-precision mark.
    pub fn in_place_roundto(&mut self, precision: Precision) {
        if let Some(q) = self.quantity.take() {
            self.quantity = Some(if q.precision() > precision {
                q.display_rounded(precision)
            } else {
                q
            });
        }
        self.keep_precision = false;
    }

    /// Copy rounded to the commodity's display precision.
    pub fn rounded(&self) -> Self {
        let mut result = self.clone();
        result.in_place_round();
        result
    }

    /// Copy rounded to `precision` digits.
    pub fn roundto(&self, precision: Precision) -> Self {
        let mut result = self.clone();
        result.in_place_roundto(precision);
        result
    }

    /// Mark this amount to display at full internal precision, in place.
    pub fn in_place_unround(&mut self) {
        self.keep_precision = true;
    }

    /// Copy whose display is never truncated to the commodity's precision.
    pub fn unrounded(&self) -> Self {
        let mut result = self.clone();
        result.in_place_unround();
        result
    }

    /// Reduce to the most basic scaled unit: `1h` becomes `3600s` when the
    /// hour/minute/second ladder is registered. A fixed point when the
    /// commodity has no `smaller` link.
    pub fn in_place_reduce(&mut self) {
        while let Some(comm) = self.commodity.clone() {
            let Some(smaller) = comm.smaller() else { break };
            let Some(sq) = smaller.quantity() else { break };
            // a ladder that loops back on itself would never terminate
            if smaller.commodity().is_some_and(|c| c.ident() == comm.ident()) {
                break;
            }
            if let Some(q) = self.quantity.take() {
                self.quantity = Some(q.mul(sq));
            }
            self.commodity = smaller.commodity().cloned();
        }
    }

    /// Reduced copy.
    pub fn reduce(&self) -> Self {
        let mut result = self.clone();
        result.in_place_reduce();
        result
    }

    /// Unreduce to the most compact scaled unit no smaller than one:
    /// `3600s` becomes `1h`, while `3599s` stops at `59.983333m`.
    pub fn in_place_unreduce(&mut self) {
        let (Some(start_q), Some(start_c)) = (&self.quantity, &self.commodity) else {
            return;
        };
        let mut quantity = start_q.clone();
        let mut commodity = start_c.clone();
        let one = Quantity::from_integer(1);
        let mut shifted = false;

        loop {
            let Some(larger) = commodity.larger() else { break };
            let (Some(lq), Some(lc)) = (larger.quantity(), larger.commodity()) else { break };
            if lc.ident() == commodity.ident() {
                break;
            }
            let Ok(next) = quantity.div(lq) else { break };
            if next.abs().compare(&one) == Ordering::Less {
                break;
            }
            quantity = next;
            commodity = lc.clone();
            shifted = true;
        }

        if shifted {
            self.quantity = Some(quantity);
            self.commodity = Some(commodity);
        }
    }

    /// Unreduced copy.
    pub fn unreduce(&self) -> Self {
        let mut result = self.clone();
        result.in_place_unreduce();
        result
    }

    /// The historical value of this amount at `moment` (or per the latest
    /// known price when omitted): the commodity's unit price applied by
    /// multiplication, yielding an amount in the price's commodity. `None`
    /// when no price is known.
    pub fn value(&self, moment: Option<Moment>) -> Option<Amount> {
        let comm = self.commodity.as_ref()?;
        let price = comm.value(moment)?;
        let q = self.quantity.as_ref()?;
        let pq = price.quantity.as_ref()?;
        Some(Amount {
            quantity: Some(q.mul(pq)),
            commodity: price.commodity.clone(),
            keep_precision: false,
        })
    }

    fn check_compatibility(&self, other: &Amount) -> AmountResult<()> {
        match (&self.commodity, &other.commodity) {
            (Some(a), Some(b)) if !a.equivalent_to(b, &KeepDetails::from_globals()) => Err(
                AmountError::IncompatibleCommodities(a.symbol(), b.symbol()),
            ),
            _ => Ok(()),
        }
    }

    /// Add another amount in place. A null operand acts as the identity; an
    /// anonymous side adopts the other's commodity; distinct commodities
    /// fail with [`AmountError::IncompatibleCommodities`].
    pub fn add_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            *self = other.clone();
            return Ok(());
        }
        self.check_compatibility(other)?;
        if let (Some(a), Some(b)) = (&self.quantity, &other.quantity) {
            let sum = a.add(b);
            self.quantity = Some(sum);
        }
        if self.commodity.is_none() {
            self.commodity = other.commodity.clone();
        }
        Ok(())
    }

    /// Subtract another amount in place, under the same commodity rules as
    /// addition.
    pub fn sub_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            *self = other.negated();
            return Ok(());
        }
        self.check_compatibility(other)?;
        if let (Some(a), Some(b)) = (&self.quantity, &other.quantity) {
            let diff = a.sub(b);
            self.quantity = Some(diff);
        }
        if self.commodity.is_none() {
            self.commodity = other.commodity.clone();
        }
        Ok(())
    }

    /// Multiply by another amount in place. The result carries the left
    /// operand's commodity (an anonymous left side adopts the right's); the
    /// internal precision is the sum of the operands'. When the left
    /// commodity is present and not annotated, its display precision widens
    /// to cover the left operand's precision plus the division extension.
    pub fn mul_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if other.is_null() {
            return Ok(());
        }
        if self.is_null() {
            *self = other.clone();
            return Ok(());
        }
        let left_commodity = self.commodity.clone();
        let left_precision = self.precision();
        if let (Some(a), Some(b)) = (&self.quantity, &other.quantity) {
            let product = a.mul(b);
            self.quantity = Some(product);
        }
        if self.commodity.is_none() {
            self.commodity = other.commodity.clone();
        }
        if let Some(comm) = &left_commodity {
            if !comm.is_annotated() {
                let widened = (left_precision + EXTEND_BY_DIGITS).min(MAX_PRECISION);
                if comm.precision() < widened {
                    comm.set_precision(widened);
                }
            }
        }
        Ok(())
    }

    /// Divide by another amount in place. Fails with
    /// [`AmountError::DivideByZero`] when the divisor is null or zero; the
    /// result precision is the dividend's plus the extension, truncated
    /// toward zero.
    pub fn div_amount(&mut self, other: &Amount) -> AmountResult<()> {
        if other.is_null() || other.is_realzero() {
            return Err(AmountError::DivideByZero);
        }
        if self.is_null() {
            return Ok(());
        }
        if let (Some(a), Some(b)) = (&self.quantity, &other.quantity) {
            let quotient = a.div(b)?;
            self.quantity = Some(quotient);
        }
        if self.commodity.is_none() {
            self.commodity = other.commodity.clone();
        }
        Ok(())
    }

    /// Compare two amounts. Null sides compare as zero; distinct
    /// non-anonymous commodities fail with
    /// [`AmountError::IncompatibleCommodities`].
    pub fn compare(&self, other: &Amount) -> AmountResult<Ordering> {
        self.check_compatibility(other)?;
        let zero = Quantity::zero();
        let a = self.quantity.as_ref().unwrap_or(&zero);
        let b = other.quantity.as_ref().unwrap_or(&zero);
        Ok(a.compare(b))
    }

    /// Convert to `i64`; fails with [`AmountError::PrecisionLoss`] when the
    /// value is not integral.
    pub fn to_long(&self) -> AmountResult<i64> {
        match &self.quantity {
            None => Ok(0),
            Some(q) => q.to_i64(),
        }
    }

    /// Convert to `f64`. Precision past the mantissa is silently lost.
    pub fn to_double(&self) -> AmountResult<f64> {
        match &self.quantity {
            None => Ok(0.0),
            Some(q) => q.to_f64(),
        }
    }

    /// The display value as a string: rounded to the commodity's precision,
    /// commodity included.
    #[allow(clippy::inherent_to_string_shadow_display)]
    pub fn to_string(&self) -> String {
        let mut out = String::new();
        let _ = self.print(&mut out, false, false);
        out
    }

    /// The internal value as a string: full precision, commodity included.
    pub fn to_fullstring(&self) -> String {
        let mut out = String::new();
        let _ = self.print(&mut out, false, true);
        out
    }

    /// The display value without its commodity, but still using the
    /// commodity's precision and separators.
    pub fn quantity_string(&self) -> String {
        let mut out = String::new();
        let _ = self.print(&mut out, true, false);
        out
    }

    /// Print this amount. `omit_commodity` drops the symbol while keeping
    /// the commodity-driven formatting; `full_precision` prints the full
    /// internal scale instead of the display precision.
    pub fn print<W: fmt::Write>(
        &self,
        out: &mut W,
        omit_commodity: bool,
        full_precision: bool,
    ) -> fmt::Result {
        let config = crate::formatting::FormatConfig {
            omit_commodity,
            full_precision,
            ..Default::default()
        };
        out.write_str(&crate::formatting::format_amount(self, &config))
    }

    /// True when a non-anonymous commodity is attached.
    pub fn has_commodity(&self) -> bool {
        self.commodity.is_some()
    }

    /// The attached commodity, if any.
    pub fn commodity(&self) -> Option<&CommodityRef> {
        self.commodity.as_ref()
    }

    /// Attach a commodity without observing anything about the amount. The
    /// pool's null commodity detaches instead. A null amount acquires a
    /// zero quantity so the commodity has something to qualify.
    pub fn set_commodity(&mut self, commodity: CommodityRef) {
        if self.quantity.is_none() {
            self.quantity = Some(Quantity::zero());
        }
        self.commodity = if commodity.is_null() { None } else { Some(commodity) };
    }

    /// Detach the commodity.
    pub fn clear_commodity(&mut self) {
        self.commodity = None;
    }

    /// A copy of this amount without its commodity.
    pub fn number(&self) -> Self {
        let mut result = self.clone();
        result.clear_commodity();
        result
    }

    /// Replace this amount's commodity with the annotated variant carrying
    /// `details`, interned through the pool. A no-op for empty details or
    /// anonymous amounts.
    pub fn annotate_commodity(&mut self, details: &Annotation) -> AmountResult<()> {
        if details.is_empty() {
            return Ok(());
        }
        let Some(comm) = &self.commodity else { return Ok(()) };
        let pool = comm
            .pool()
            .ok_or(AmountError::InvalidState("commodity outlived its pool"))?;
        let annotated = pool.find_or_create_annotated(&comm.base_symbol(), details)?;
        self.commodity = Some(annotated);
        Ok(())
    }

    /// True when the attached commodity carries a lot annotation.
    pub fn commodity_annotated(&self) -> bool {
        self.commodity.as_ref().is_some_and(|c| c.is_annotated())
    }

    /// The commodity's lot annotation; empty when un-annotated.
    pub fn annotation_details(&self) -> Annotation {
        self.commodity
            .as_ref()
            .map(|c| c.annotation_details())
            .unwrap_or_default()
    }

    /// A copy whose commodity retains only the annotation details selected
    /// by `keep`; when nothing remains, the plain referent is used.
    pub fn strip_annotations(&self, keep: &KeepDetails) -> Amount {
        let Some(comm) = &self.commodity else { return self.clone() };
        if !comm.is_annotated() || keep.keep_all() {
            return self.clone();
        }
        let mut result = self.clone();
        let stripped = comm.annotation_details().stripped(keep);
        if stripped.is_empty() {
            if let Some(referent) = comm.referent() {
                result.commodity = Some(referent);
            }
        } else if let Some(pool) = comm.pool() {
            if let Ok(annotated) = pool.find_or_create_annotated(&comm.base_symbol(), &stripped) {
                result.commodity = Some(annotated);
            }
        }
        result
    }

    /// [`Amount::strip_annotations`] with the process-wide keep toggles.
    pub fn strip_annotations_default(&self) -> Amount {
        self.strip_annotations(&KeepDetails::from_globals())
    }

    /// Serialize to the compact binary form: a presence byte, then the
    /// quantity as little-endian scale and length followed by big-endian
    /// two's-complement numerator bytes, then the commodity's pool
    /// identifier (zero for anonymous amounts).
    pub fn write<W: Write>(&self, out: &mut W) -> AmountResult<()> {
        let Some(q) = &self.quantity else {
            out.write_all(&[0u8])?;
            return Ok(());
        };
        out.write_all(&[1u8])?;
        out.write_all(&i32::from(q.precision()).to_le_bytes())?;
        let bytes = q.numerator().to_signed_bytes_be();
        out.write_all(&(bytes.len() as u32).to_le_bytes())?;
        out.write_all(&bytes)?;
        let ident = self.commodity.as_ref().map_or(0, |c| c.ident());
        out.write_all(&ident.to_le_bytes())?;
        Ok(())
    }

    /// Deserialize an amount written by [`Amount::write`], resolving the
    /// commodity identifier against `pool` — which must be the pool (or a
    /// snapshot of the pool) the amount was written under.
    pub fn read<R: Read>(pool: &CommodityPool, input: &mut R) -> AmountResult<Amount> {
        if read_u8(input)? == 0 {
            return Ok(Amount::null());
        }
        let scale = i32::from_le_bytes(read_bytes::<4, _>(input)?);
        if scale < 0 || scale > i32::from(MAX_PRECISION) {
            return Err(AmountError::ParseError(format!("invalid amount scale {scale}")));
        }
        let len = read_u32(input)? as usize;
        if len > (1 << 20) {
            return Err(AmountError::ParseError(format!("oversized numerator ({len} bytes)")));
        }
        let mut buf = vec![0u8; len];
        input.read_exact(&mut buf)?;
        let num = BigInt::from_signed_bytes_be(&buf);
        let ident = read_u32(input)?;
        let commodity = if ident == 0 {
            None
        } else {
            Some(
                pool.find_by_ident(ident)
                    .ok_or(AmountError::UnknownCommodity(ident))?,
            )
        };
        Ok(Amount {
            quantity: Some(Quantity::new(num, scale as Precision)),
            commodity,
            keep_precision: false,
        })
    }

    /// Structural sanity check.
    pub fn valid(&self) -> bool {
        if self.quantity.is_none() && self.commodity.is_some() {
            return false;
        }
        if let Some(q) = &self.quantity {
            if q.precision() > MAX_PRECISION {
                return false;
            }
        }
        match &self.commodity {
            Some(comm) => comm.valid(),
            None => true,
        }
    }

    /// A compact, re-parseable rendering used for annotation text: minimal
    /// digits with the symbol placed per the commodity's style when
    /// `styled`, or in the fixed `digits symbol` form otherwise.
    pub(crate) fn canonical_token(&self, styled: bool) -> String {
        let digits = match &self.quantity {
            None => "0".to_string(),
            Some(q) => q.canonical().to_string(),
        };
        let Some(comm) = &self.commodity else { return digits };
        let symbol = comm.symbol();
        if symbol.is_empty() {
            return digits;
        }
        if !styled {
            return format!("{digits} {symbol}");
        }
        let flags = comm.flags();
        let sep = if flags.contains(CommodityFlags::STYLE_SEPARATED) { " " } else { "" };
        if flags.contains(CommodityFlags::STYLE_SUFFIXED) {
            format!("{digits}{sep}{symbol}")
        } else {
            let (sign, magnitude) = match digits.strip_prefix('-') {
                Some(rest) => ("-", rest.to_string()),
                None => ("", digits),
            };
            format!("{sign}{symbol}{sep}{magnitude}")
        }
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for Amount {
    /// Mathematical equality of the quantities when the commodities match;
    /// mismatched commodities compare unequal rather than failing, so
    /// amounts can live in hash tables and sets.
    fn eq(&self, other: &Self) -> bool {
        match (&self.commodity, &other.commodity) {
            (None, None) => {}
            (Some(a), Some(b)) if **a == **b => {}
            _ => return false,
        }
        match (&self.quantity, &other.quantity) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Amount {}

impl Hash for Amount {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.quantity {
            None => 0u8.hash(state),
            Some(q) => {
                1u8.hash(state);
                q.hash(state);
            }
        }
        if let Some(comm) = &self.commodity {
            comm.mapping_key().hash(state);
        }
    }
}

impl PartialOrd for Amount {
    /// Ordering is only defined between compatible commodities; `None`
    /// otherwise.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.compare(other).ok()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = crate::formatting::FormatConfig {
            full_precision: full_strings(),
            precision: f.precision().map(|p| p as Precision),
            min_width: f.width(),
            right_justify: matches!(f.align(), Some(fmt::Alignment::Right)),
            ..Default::default()
        };
        f.write_str(&crate::formatting::format_amount(self, &config))
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "AMOUNT(<null>)")
        } else {
            write!(f, "AMOUNT({})", self)?;
            if f.alternate() {
                write!(f, " [prec:{}, keep:{}", self.precision(), self.keep_precision)?;
                if let Some(q) = &self.quantity {
                    write!(f, ", raw:{}", q)?;
                }
                write!(f, "]")?;
            }
            Ok(())
        }
    }
}

impl From<i32> for Amount {
    fn from(value: i32) -> Self {
        Self::from_i64(i64::from(value))
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self::from_i64(value)
    }
}

impl From<u32> for Amount {
    fn from(value: u32) -> Self {
        Self::from_i64(i64::from(value))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self::from_quantity(Quantity::from_integer(BigInt::from(value)))
    }
}

impl From<BigInt> for Amount {
    fn from(value: BigInt) -> Self {
        Self::from_quantity(Quantity::from_integer(value))
    }
}

impl From<Quantity> for Amount {
    fn from(value: Quantity) -> Self {
        Self::from_quantity(value)
    }
}

impl TryFrom<f64> for Amount {
    type Error = AmountError;

    fn try_from(value: f64) -> AmountResult<Self> {
        Self::from_f64(value)
    }
}

impl TryFrom<&str> for Amount {
    type Error = AmountError;

    fn try_from(value: &str) -> AmountResult<Self> {
        Self::parse(value)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Add for Amount {
    type Output = AmountResult<Amount>;

    fn add(mut self, other: Amount) -> Self::Output {
        self.add_amount(&other)?;
        Ok(self)
    }
}

impl Add<&Amount> for Amount {
    type Output = AmountResult<Amount>;

    fn add(mut self, other: &Amount) -> Self::Output {
        self.add_amount(other)?;
        Ok(self)
    }
}

impl Add<Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn add(self, other: Amount) -> Self::Output {
        let mut result = self.clone();
        result.add_amount(&other)?;
        Ok(result)
    }
}

impl Add<&Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn add(self, other: &Amount) -> Self::Output {
        let mut result = self.clone();
        result.add_amount(other)?;
        Ok(result)
    }
}

impl Sub for Amount {
    type Output = AmountResult<Amount>;

    fn sub(mut self, other: Amount) -> Self::Output {
        self.sub_amount(&other)?;
        Ok(self)
    }
}

impl Sub<&Amount> for Amount {
    type Output = AmountResult<Amount>;

    fn sub(mut self, other: &Amount) -> Self::Output {
        self.sub_amount(other)?;
        Ok(self)
    }
}

impl Sub<Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn sub(self, other: Amount) -> Self::Output {
        let mut result = self.clone();
        result.sub_amount(&other)?;
        Ok(result)
    }
}

impl Sub<&Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn sub(self, other: &Amount) -> Self::Output {
        let mut result = self.clone();
        result.sub_amount(other)?;
        Ok(result)
    }
}

impl Mul for Amount {
    type Output = AmountResult<Amount>;

    fn mul(mut self, other: Amount) -> Self::Output {
        self.mul_amount(&other)?;
        Ok(self)
    }
}

impl Mul<&Amount> for Amount {
    type Output = AmountResult<Amount>;

    fn mul(mut self, other: &Amount) -> Self::Output {
        self.mul_amount(other)?;
        Ok(self)
    }
}

impl Mul<Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn mul(self, other: Amount) -> Self::Output {
        let mut result = self.clone();
        result.mul_amount(&other)?;
        Ok(result)
    }
}

impl Mul<&Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn mul(self, other: &Amount) -> Self::Output {
        let mut result = self.clone();
        result.mul_amount(other)?;
        Ok(result)
    }
}

impl Div for Amount {
    type Output = AmountResult<Amount>;

    fn div(mut self, other: Amount) -> Self::Output {
        self.div_amount(&other)?;
        Ok(self)
    }
}

impl Div<&Amount> for Amount {
    type Output = AmountResult<Amount>;

    fn div(mut self, other: &Amount) -> Self::Output {
        self.div_amount(other)?;
        Ok(self)
    }
}

impl Div<Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn div(self, other: Amount) -> Self::Output {
        let mut result = self.clone();
        result.div_amount(&other)?;
        Ok(result)
    }
}

impl Div<&Amount> for &Amount {
    type Output = AmountResult<Amount>;

    fn div(self, other: &Amount) -> Self::Output {
        let mut result = self.clone();
        result.div_amount(other)?;
        Ok(result)
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Self::Output {
        self.negated()
    }
}

impl Neg for &Amount {
    type Output = Amount;

    fn neg(self) -> Self::Output {
        self.negated()
    }
}

#[derive(Serialize, Deserialize)]
struct AmountRepr {
    quantity: Option<String>,
    commodity: Option<String>,
    keep_precision: bool,
}

impl Serialize for Amount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AmountRepr {
            quantity: self.quantity.as_ref().map(|q| q.to_string()),
            commodity: self.commodity.as_ref().map(|c| c.base_symbol()),
            keep_precision: self.keep_precision,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Amount {
    /// The commodity is re-attached through the default pool when one is
    /// initialized; otherwise it is dropped.
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = AmountRepr::deserialize(deserializer)?;
        let quantity = repr
            .quantity
            .map(|s| s.parse::<Quantity>())
            .transpose()
            .map_err(serde::de::Error::custom)?;
        let commodity = match (&quantity, repr.commodity, default_pool()) {
            (Some(_), Some(symbol), Some(pool)) => {
                pool.find_or_create(&symbol).ok()
            }
            _ => None,
        };
        Ok(Amount { quantity, commodity, keep_precision: repr.keep_precision })
    }
}

// Low-level readers shared with the pool serializer.

pub(crate) fn read_bytes<const N: usize, R: Read>(input: &mut R) -> AmountResult<[u8; N]> {
    let mut buf = [0u8; N];
    input.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn read_u8<R: Read>(input: &mut R) -> AmountResult<u8> {
    Ok(read_bytes::<1, _>(input)?[0])
}

pub(crate) fn read_u16<R: Read>(input: &mut R) -> AmountResult<u16> {
    Ok(u16::from_le_bytes(read_bytes::<2, _>(input)?))
}

pub(crate) fn read_u32<R: Read>(input: &mut R) -> AmountResult<u32> {
    Ok(u32::from_le_bytes(read_bytes::<4, _>(input)?))
}

pub(crate) fn write_string<W: Write>(out: &mut W, value: &str) -> AmountResult<()> {
    out.write_all(&(value.len() as u32).to_le_bytes())?;
    out.write_all(value.as_bytes())?;
    Ok(())
}

pub(crate) fn read_string<R: Read>(input: &mut R) -> AmountResult<String> {
    let len = read_u32(input)? as usize;
    if len > (1 << 20) {
        return Err(AmountError::ParseError(format!("oversized string ({len} bytes)")));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| AmountError::ParseError(e.to_string()))
}

// Text parsing.

struct Scanned {
    quantity: Quantity,
    symbol: Option<String>,
    style: CommodityFlags,
    details: Annotation,
}

const RESERVED_SYMBOL_CHARS: &str = ".,;:?!-+*/^&|=<>{}[]()@\"";

fn is_bare_symbol_char(c: char) -> bool {
    !c.is_ascii_digit() && !c.is_whitespace() && !RESERVED_SYMBOL_CHARS.contains(c)
}

fn scan_symbol(input: &str) -> AmountResult<Option<(String, &str)>> {
    if let Some(rest) = input.strip_prefix('"') {
        let end = rest.find('"').ok_or_else(|| {
            AmountError::ParseError("quoted commodity symbol lacks a closing quote".to_string())
        })?;
        let symbol = rest[..end].to_string();
        if symbol.is_empty() {
            return Err(AmountError::ParseError("empty quoted commodity symbol".to_string()));
        }
        return Ok(Some((symbol, &rest[end + 1..])));
    }
    let end = input
        .char_indices()
        .find(|(_, c)| !is_bare_symbol_char(*c))
        .map_or(input.len(), |(i, _)| i);
    if end == 0 {
        return Ok(None);
    }
    Ok(Some((input[..end].to_string(), &input[end..])))
}

fn scan_digits(input: &str) -> Option<(&str, &str)> {
    let end = input
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.' && *c != ',')
        .map_or(input.len(), |(i, _)| i);
    let text = &input[..end];
    if !text.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((text, &input[end..]))
}

/// Interpret a run of digits and separator marks. When both marks appear the
/// later one is the decimal mark; a lone mark is read against the
/// commodity's known European style. Returns the quantity (unsigned) and the
/// observed style bits.
fn interpret_digits(text: &str, known: CommodityFlags) -> AmountResult<(Quantity, CommodityFlags)> {
    let known_european = known.contains(CommodityFlags::STYLE_EUROPEAN);
    let last_comma = text.rfind(',');
    let last_period = text.rfind('.');

    // When both marks appear the later one is the decimal mark; a lone mark
    // is read against the commodity's known style.
    let decimal_pos = match (last_comma, last_period) {
        (Some(comma), Some(period)) => Some(comma.max(period)),
        (Some(comma), None) => known_european.then_some(comma),
        (None, Some(period)) => (!known_european).then_some(period),
        (None, None) => None,
    };

    let (int_part, frac_part) = match decimal_pos {
        Some(pos) => {
            if text[pos + 1..].contains(['.', ',']) {
                return Err(AmountError::ParseError(format!(
                    "separator after the decimal mark in {text:?}"
                )));
            }
            (&text[..pos], &text[pos + 1..])
        }
        None => (text, ""),
    };
    let mut style = CommodityFlags::empty();
    if decimal_pos.is_some_and(|pos| text.as_bytes()[pos] == b',') {
        style |= CommodityFlags::STYLE_EUROPEAN;
    }
    if int_part.contains(['.', ',']) {
        style |= CommodityFlags::STYLE_THOUSANDS;
    }

    if frac_part.len() > MAX_PRECISION as usize {
        return Err(AmountError::ParseError(format!("too many fractional digits in {text:?}")));
    }
    let mut digits = String::with_capacity(text.len());
    digits.extend(int_part.chars().filter(char::is_ascii_digit));
    digits.push_str(frac_part);
    if digits.is_empty() {
        return Err(AmountError::ParseError(format!("no digits in {text:?}")));
    }
    let num = BigInt::from_str(&digits)
        .map_err(|_| AmountError::ParseError(format!("invalid number {text:?}")))?;
    Ok((Quantity::new(num, frac_part.len() as Precision), style))
}

fn scan_annotations<'a>(
    pool: &CommodityPool,
    mut input: &'a str,
) -> AmountResult<(Annotation, &'a str)> {
    let mut details = Annotation::new();
    loop {
        let trimmed = input.trim_start();
        if let Some(rest) = trimmed.strip_prefix('{') {
            let end = rest.find('}').ok_or_else(|| {
                AmountError::ParseError("lot price lacks a closing brace".to_string())
            })?;
            let price = parse_with_pool(pool, &rest[..end], ParseFlags::NO_MIGRATE)?;
            details.set_price(Some(price));
            input = &rest[end + 1..];
        } else if let Some(rest) = trimmed.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| {
                AmountError::ParseError("lot date lacks a closing bracket".to_string())
            })?;
            let date = datetime::parse_date(&rest[..end])
                .map_err(|e| AmountError::ParseError(e.to_string()))?;
            details.set_date(Some(date));
            input = &rest[end + 1..];
        } else if let Some(rest) = trimmed.strip_prefix('(') {
            let end = rest.find(')').ok_or_else(|| {
                AmountError::ParseError("lot tag lacks a closing parenthesis".to_string())
            })?;
            details.set_tag(Some(rest[..end].to_string()));
            input = &rest[end + 1..];
        } else {
            return Ok((details, trimmed));
        }
    }
}

fn scan(pool: &CommodityPool, input: &str) -> AmountResult<Scanned> {
    let mut rest = input.trim_start();
    let mut negative = false;
    if let Some(r) = rest.strip_prefix('-') {
        negative = true;
        rest = r.trim_start();
    } else if let Some(r) = rest.strip_prefix('+') {
        rest = r.trim_start();
    }

    let mut style = CommodityFlags::empty();
    let symbol;
    let number_text;

    if rest.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == ',') {
        let (text, after) =
            scan_digits(rest).ok_or_else(|| AmountError::ParseError(input.to_string()))?;
        number_text = text;
        let trimmed = after.trim_start();
        let separated = trimmed.len() != after.len();
        if !trimmed.is_empty() && !trimmed.starts_with(['{', '[', '(']) {
            match scan_symbol(trimmed)? {
                Some((sym, r)) => {
                    symbol = Some(sym);
                    style |= CommodityFlags::STYLE_SUFFIXED;
                    if separated {
                        style |= CommodityFlags::STYLE_SEPARATED;
                    }
                    rest = r;
                }
                None => {
                    symbol = None;
                    rest = trimmed;
                }
            }
        } else {
            symbol = None;
            rest = trimmed;
        }
    } else {
        let (sym, after) = scan_symbol(rest)?
            .ok_or_else(|| AmountError::ParseError(format!("expected an amount in {input:?}")))?;
        symbol = Some(sym);
        let trimmed = after.trim_start();
        if trimmed.len() != after.len() {
            style |= CommodityFlags::STYLE_SEPARATED;
        }
        let mut number_input = trimmed;
        if let Some(r) = number_input.strip_prefix('-') {
            if negative {
                return Err(AmountError::ParseError(input.to_string()));
            }
            negative = true;
            number_input = r;
        }
        let (text, after_number) = scan_digits(number_input)
            .ok_or_else(|| AmountError::ParseError(format!("expected a number in {input:?}")))?;
        number_text = text;
        rest = after_number;
    }

    let (details, rest) = scan_annotations(pool, rest)?;
    if !rest.trim().is_empty() {
        return Err(AmountError::ParseError(format!(
            "unexpected trailing input {:?}",
            rest.trim()
        )));
    }

    let known = symbol
        .as_deref()
        .and_then(|s| pool.find(s))
        .map(|c| c.flags())
        .unwrap_or(CommodityFlags::empty());
    let (mut quantity, number_style) = interpret_digits(number_text, known)?;
    style |= number_style;
    if negative {
        quantity.negate();
    }

    Ok(Scanned { quantity, symbol, style, details })
}

/// Parse an amount from text against `pool`, observing the commodity's
/// display conventions unless `NO_MIGRATE` is given and reducing through
/// scaling links unless `NO_REDUCE` is given.
pub(crate) fn parse_with_pool(
    pool: &CommodityPool,
    input: &str,
    flags: ParseFlags,
) -> AmountResult<Amount> {
    let scanned = scan(pool, input)?;
    let mut amount = Amount {
        quantity: Some(scanned.quantity),
        commodity: None,
        keep_precision: flags.contains(ParseFlags::NO_MIGRATE),
    };

    if let Some(symbol) = &scanned.symbol {
        let commodity = pool.find_or_create(symbol)?;
        if !flags.contains(ParseFlags::NO_MIGRATE) {
            let observed = amount.precision();
            if observed > commodity.precision() {
                debug!("widening {} display precision to {}", symbol, observed);
                commodity.set_precision(observed);
            }
            commodity.add_flags(scanned.style);
        }
        amount.commodity = if scanned.details.is_empty() {
            Some(commodity)
        } else {
            Some(pool.find_or_create_annotated(symbol, &scanned.details)?)
        };
    }

    if !flags.contains(ParseFlags::NO_REDUCE) {
        amount.in_place_reduce();
    }
    Ok(amount)
}
