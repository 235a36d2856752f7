//! Arbitrary-precision commoditized amounts
//!
//! This crate implements the numeric kernel of a double-entry accounting
//! engine: exact decimal arithmetic over [`Quantity`], the [`Amount`] facade
//! coupling a quantity to a commodity, and the [`CommodityPool`] that owns
//! and interns every commodity along with its learned display conventions,
//! lot annotations, and price history.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod amount;
pub mod commodity;
pub mod datetime;
pub mod formatting;
pub mod quantity;

// Re-export main types
pub use amount::{
    default_pool, full_strings, initialize, keep_base, keep_date, keep_price, keep_tag,
    set_full_strings, set_keep_base, set_keep_date, set_keep_price, set_keep_tag, shutdown,
    Amount, AmountError, AmountResult, ParseFlags, Precision, EXTEND_BY_DIGITS,
};
pub use commodity::{
    Annotation, Commodity, CommodityFlags, CommodityPool, CommodityRef, Ident, KeepDetails,
    PriceHistory, QuoteSource,
};
pub use datetime::{
    format_date, parse_date, Date, DateTimeError, DateTimeResult, Moment,
};
pub use formatting::{apply_width_formatting, format_amount, FormatConfig};
pub use quantity::Quantity;

// Re-export for convenience
pub use num_bigint::BigInt;
pub use rust_decimal::Decimal;
