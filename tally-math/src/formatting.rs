//! Display formatting for amounts
//!
//! Turns an amount into text using the conventions its commodity learned
//! while parsing: symbol placement, separation, thousands grouping, the
//! European separator pair, and the display precision. Internal precision is
//! only shown on request (or for amounts marked to keep it).

use crate::amount::{Amount, Precision};
use crate::commodity::CommodityFlags;
use crate::quantity::Quantity;

/// Options controlling amount formatting.
#[derive(Debug, Clone, Default)]
pub struct FormatConfig {
    /// Drop the commodity symbol, while still using the commodity's
    /// precision and separators.
    pub omit_commodity: bool,

    /// Print the full internal precision instead of the display precision.
    pub full_precision: bool,

    /// Explicit precision override.
    pub precision: Option<Precision>,

    /// Minimum output width; shorter output is padded.
    pub min_width: Option<usize>,

    /// Pad on the left rather than the right.
    pub right_justify: bool,
}

impl FormatConfig {
    /// A default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the commodity symbol.
    pub fn without_commodity(mut self) -> Self {
        self.omit_commodity = true;
        self
    }

    /// Print full internal precision.
    pub fn with_full_precision(mut self) -> Self {
        self.full_precision = true;
        self
    }

    /// Override the display precision.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Pad output to at least `width` characters.
    pub fn with_width(mut self, width: usize) -> Self {
        self.min_width = Some(width);
        self
    }

    /// Right-justify within the minimum width.
    pub fn right_justify(mut self) -> Self {
        self.right_justify = true;
        self
    }
}

/// Insert `separator` every three digits, counting from the right.
fn group_digits(digits: &str, separator: char) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in chars.iter().enumerate() {
        result.push(*c);
        let remaining = chars.len() - i - 1;
        if remaining > 0 && remaining % 3 == 0 {
            result.push(separator);
        }
    }
    result
}

/// Format the magnitude of `quantity` at exactly `precision` fractional
/// digits, grouped and marked per the style flags. The sign is the caller's
/// concern.
fn format_magnitude(
    quantity: &Quantity,
    precision: Precision,
    european: bool,
    thousands: bool,
) -> String {
    let text = quantity.abs().to_string();
    let (int_part, frac_part) = match text.split_once('.') {
        Some((i, f)) => (i.to_string(), f.to_string()),
        None => (text, String::new()),
    };
    let mut result = if thousands {
        group_digits(&int_part, if european { '.' } else { ',' })
    } else {
        int_part
    };
    if precision > 0 {
        result.push(if european { ',' } else { '.' });
        result.push_str(&frac_part);
    }
    result
}

/// Pad `text` to the configured minimum width.
pub fn apply_width_formatting(text: &str, config: &FormatConfig) -> String {
    let min_width = config.min_width.unwrap_or(0);
    if text.len() >= min_width {
        return text.to_string();
    }
    let padding = " ".repeat(min_width - text.len());
    if config.right_justify {
        format!("{padding}{text}")
    } else {
        format!("{text}{padding}")
    }
}

/// Format an amount.
pub fn format_amount(amount: &Amount, config: &FormatConfig) -> String {
    // Scalable commodities display in their most compact unit unless the
    // host asked to keep the base form.
    let unreduced;
    let amount = if !crate::amount::keep_base()
        && amount.commodity().is_some_and(|c| c.larger().is_some())
    {
        unreduced = amount.unreduce();
        &unreduced
    } else {
        amount
    };

    let Some(quantity) = amount.quantity() else {
        return apply_width_formatting("<null>", config);
    };

    let commodity = amount.commodity();
    let flags = commodity.map_or(CommodityFlags::empty(), |c| c.flags());
    let precision = config.precision.unwrap_or_else(|| {
        if config.full_precision || amount.keeps_precision() {
            quantity.precision()
        } else {
            match commodity {
                Some(c) => c.precision(),
                // uncommoditized numbers are never display-truncated
                None => quantity.precision(),
            }
        }
    });

    let rounded = if precision < quantity.precision() {
        quantity.display_rounded(precision)
    } else {
        quantity.rescale(precision)
    };
    let magnitude = format_magnitude(
        &rounded,
        precision,
        flags.contains(CommodityFlags::STYLE_EUROPEAN),
        flags.contains(CommodityFlags::STYLE_THOUSANDS),
    );

    let mut result = String::new();
    if rounded.sign() < 0 {
        result.push('-');
    }
    match commodity.filter(|_| !config.omit_commodity) {
        None => result.push_str(&magnitude),
        Some(c) => {
            let symbol = c.symbol();
            if symbol.is_empty() {
                result.push_str(&magnitude);
            } else if flags.contains(CommodityFlags::STYLE_SUFFIXED) {
                result.push_str(&magnitude);
                if flags.contains(CommodityFlags::STYLE_SEPARATED) {
                    result.push(' ');
                }
                result.push_str(&symbol);
            } else {
                result.push_str(&symbol);
                if flags.contains(CommodityFlags::STYLE_SEPARATED) {
                    result.push(' ');
                }
                result.push_str(&magnitude);
            }
            if c.is_annotated() {
                result.push_str(&c.annotation_details().display_suffix());
            }
        }
    }

    apply_width_formatting(&result, config)
}
