//! Commodity metadata, annotations, and the interning pool
//!
//! A commodity is a unit label (currency, share, time unit) whose display
//! conventions are learned from the amounts that mention it. The mutable
//! display state lives in a [`CommodityBase`] shared by every handle to the
//! same symbol; [`Commodity`] handles themselves are immutable and cheap to
//! clone. Annotated handles carry lot details on top of the same base.
//!
//! All commodities are owned by a [`CommodityPool`], which interns them both
//! by a dense numeric identifier and by mapping key, and which dispatches
//! price-quote lookups to host-registered callbacks.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use log::debug;
use parking_lot::RwLock;

use crate::amount::{
    read_bytes, read_string, read_u16, read_u32, read_u8, write_string, Amount, AmountError,
    AmountResult, Precision,
};
use crate::datetime::{self, Date, Moment};

/// Numeric identifier of a commodity within its pool. Dense and monotonic;
/// identifier 0 is always the null commodity.
pub type Ident = u32;

/// Reference-counted commodity handle.
pub type CommodityRef = Arc<Commodity>;

bitflags! {
    /// Commodity style and behavior flags. The bit values are stable and
    /// preserved across binary serialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommodityFlags: u32 {
        /// No style information observed yet.
        const STYLE_DEFAULTS = 0x0000;
        /// The symbol appears after the number (`100 EUR`).
        const STYLE_SUFFIXED = 0x0001;
        /// Whitespace separates symbol and number (`100 EUR`, `$ 100`).
        const STYLE_SEPARATED = 0x0002;
        /// European number style: `,` is the decimal mark, `.` groups.
        const STYLE_EUROPEAN = 0x0004;
        /// Thousands separators were observed.
        const STYLE_THOUSANDS = 0x0008;
        /// Suppress automatic quote lookups for this commodity.
        const NOMARKET = 0x0010;
        /// Built-in commodity (the pool's own sentinels).
        const BUILTIN = 0x0020;
    }
}

/// Ordered price history of a commodity, keyed by moment. Duplicate
/// timestamps overwrite (last write wins).
#[derive(Clone, Default)]
pub struct PriceHistory {
    prices: BTreeMap<Moment, Amount>,
    last_lookup: Option<Moment>,
}

impl PriceHistory {
    /// The recorded prices, oldest first.
    pub fn prices(&self) -> &BTreeMap<Moment, Amount> {
        &self.prices
    }

    /// When a quote source was last consulted for this commodity.
    pub fn last_lookup(&self) -> Option<Moment> {
        self.last_lookup
    }
}

/// Shared, mutable metadata for a commodity symbol.
///
/// Exactly one base exists per plain symbol in a pool; annotated variants
/// share the base of their referent, so a display-precision change made
/// through any handle is visible through all of them.
pub struct CommodityBase {
    symbol: String,
    precision: Precision,
    flags: CommodityFlags,
    name: Option<String>,
    note: Option<String>,
    history: Option<PriceHistory>,
    smaller: Option<Amount>,
    larger: Option<Amount>,
}

impl CommodityBase {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            precision: 0,
            flags: CommodityFlags::STYLE_DEFAULTS,
            name: None,
            note: None,
            history: None,
            smaller: None,
            larger: None,
        }
    }
}

/// Lot annotation attached to a commodity: the price it was purchased at,
/// the acquisition date, and/or a free-form tag.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Annotation {
    price: Option<Amount>,
    date: Option<Date>,
    tag: Option<String>,
}

impl Annotation {
    /// An empty annotation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Annotation carrying the given details.
    pub fn with_details(price: Option<Amount>, date: Option<Date>, tag: Option<String>) -> Self {
        Self { price, date, tag }
    }

    /// Annotation with only a lot price.
    pub fn with_price(price: Amount) -> Self {
        Self { price: Some(price), ..Self::default() }
    }

    /// Annotation with only an acquisition date.
    pub fn with_date(date: Date) -> Self {
        Self { date: Some(date), ..Self::default() }
    }

    /// Annotation with only a tag.
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: Some(tag.into()), ..Self::default() }
    }

    /// True when no detail is present.
    pub fn is_empty(&self) -> bool {
        self.price.is_none() && self.date.is_none() && self.tag.is_none()
    }

    /// The lot price, if any.
    pub fn price(&self) -> Option<&Amount> {
        self.price.as_ref()
    }

    /// The acquisition date, if any.
    pub fn date(&self) -> Option<Date> {
        self.date
    }

    /// The lot tag, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Set the lot price.
    pub fn set_price(&mut self, price: Option<Amount>) {
        self.price = price;
    }

    /// Set the acquisition date.
    pub fn set_date(&mut self, date: Option<Date>) {
        self.date = date;
    }

    /// Set the lot tag.
    pub fn set_tag(&mut self, tag: Option<String>) {
        self.tag = tag;
    }

    /// Keep only the details selected by `keep`.
    pub fn stripped(&self, keep: &KeepDetails) -> Annotation {
        Annotation {
            price: if keep.keep_price { self.price.clone() } else { None },
            date: if keep.keep_date { self.date } else { None },
            tag: if keep.keep_tag { self.tag.clone() } else { None },
        }
    }

    /// Render the ` {price} [date] (tag)` suffix in the commodity's display
    /// style; empty annotations render as nothing.
    pub(crate) fn display_suffix(&self) -> String {
        let mut out = String::new();
        if let Some(price) = &self.price {
            out.push_str(&format!(" {{{}}}", price.canonical_token(true)));
        }
        if let Some(date) = &self.date {
            out.push_str(&format!(" [{}]", datetime::format_date(date)));
        }
        if let Some(tag) = &self.tag {
            out.push_str(&format!(" ({tag})"));
        }
        out
    }

    /// Render the suffix in the style-independent normalized form used for
    /// pool mapping keys, stable across display-style and precision drift.
    fn normalized_suffix(&self) -> String {
        let mut out = String::new();
        if let Some(price) = &self.price {
            out.push_str(&format!(" {{{}}}", price.canonical_token(false)));
        }
        if let Some(date) = &self.date {
            out.push_str(&format!(" [{}]", datetime::format_date(date)));
        }
        if let Some(tag) = &self.tag {
            out.push_str(&format!(" ({tag})"));
        }
        out
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_suffix().trim_start())
    }
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ANNOTATION({})", self)
    }
}

impl PartialOrd for Annotation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Annotation {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.price, &other.price) {
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(a), Some(b)) => {
                if let Some(ord) = a.partial_cmp(b) {
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
            (None, None) => {}
        }
        match self.date.cmp(&other.date) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.tag.cmp(&other.tag)
    }
}

/// Selects which annotation details survive a strip operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepDetails {
    /// Keep lot prices.
    pub keep_price: bool,
    /// Keep acquisition dates.
    pub keep_date: bool,
    /// Keep lot tags.
    pub keep_tag: bool,
}

impl KeepDetails {
    /// Keep nothing.
    pub fn none() -> Self {
        Self { keep_price: false, keep_date: false, keep_tag: false }
    }

    /// Keep everything.
    pub fn all() -> Self {
        Self { keep_price: true, keep_date: true, keep_tag: true }
    }

    /// Keep whatever the process-wide toggles currently select.
    pub fn from_globals() -> Self {
        Self {
            keep_price: crate::amount::keep_price(),
            keep_date: crate::amount::keep_date(),
            keep_tag: crate::amount::keep_tag(),
        }
    }

    /// True when any detail is kept.
    pub fn keep_any(&self) -> bool {
        self.keep_price || self.keep_date || self.keep_tag
    }

    /// True when every detail is kept.
    pub fn keep_all(&self) -> bool {
        self.keep_price && self.keep_date && self.keep_tag
    }
}

impl Default for KeepDetails {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Clone)]
struct AnnotatedDetails {
    details: Annotation,
    referent: Ident,
}

/// A handle to a pooled commodity.
///
/// Handles are immutable with respect to identity; only the shared
/// [`CommodityBase`] behind them is mutable. An annotated handle carries its
/// lot [`Annotation`] and the pool identifier of its plain referent, while
/// sharing the referent's base.
pub struct Commodity {
    base: Arc<RwLock<CommodityBase>>,
    pool: Weak<CommodityPool>,
    ident: Ident,
    qualified_symbol: Option<String>,
    mapping_key: Option<String>,
    annotation: Option<AnnotatedDetails>,
}

impl Commodity {
    /// True if `symbol` must be quoted to parse back unambiguously: it
    /// contains a digit, whitespace, or reserved punctuation.
    pub fn symbol_needs_quotes(symbol: &str) -> bool {
        symbol.chars().any(|c| {
            c.is_ascii_digit()
                || c.is_whitespace()
                || ".,;:?!-+*/^&|=<>{}[]()@".contains(c)
        })
    }

    /// The pool identifier of this commodity.
    pub fn ident(&self) -> Ident {
        self.ident
    }

    /// The owning pool, while it is still alive.
    pub fn pool(&self) -> Option<Arc<CommodityPool>> {
        self.pool.upgrade()
    }

    /// The raw symbol, without quoting.
    pub fn base_symbol(&self) -> String {
        self.base.read().symbol.clone()
    }

    /// The display symbol: quoted when the raw symbol needs quotes.
    pub fn symbol(&self) -> String {
        self.qualified_symbol.clone().unwrap_or_else(|| self.base_symbol())
    }

    /// The key this commodity is indexed under in its pool.
    pub fn mapping_key(&self) -> String {
        self.mapping_key.clone().unwrap_or_else(|| self.base_symbol())
    }

    /// True for the pool's anonymous sentinel (identifier 0).
    pub fn is_null(&self) -> bool {
        self.ident == 0
    }

    /// True when this handle carries a lot annotation.
    pub fn is_annotated(&self) -> bool {
        self.annotation.is_some()
    }

    /// The lot annotation; empty for plain commodities.
    pub fn annotation_details(&self) -> Annotation {
        self.annotation.as_ref().map(|a| a.details.clone()).unwrap_or_default()
    }

    /// The plain commodity sharing this base. Plain handles are their own
    /// referent.
    pub fn referent(&self) -> Option<CommodityRef> {
        let pool = self.pool.upgrade()?;
        match &self.annotation {
            None => pool.find_by_ident(self.ident),
            Some(ann) => pool.find_by_ident(ann.referent),
        }
    }

    /// Display precision (fractional digits shown when printing).
    pub fn precision(&self) -> Precision {
        self.base.read().precision
    }

    /// Set the display precision on the shared base.
    pub fn set_precision(&self, precision: Precision) {
        self.base.write().precision = precision;
    }

    /// Current style/behavior flags.
    pub fn flags(&self) -> CommodityFlags {
        self.base.read().flags
    }

    /// True when all of `flags` are set.
    pub fn has_flags(&self, flags: CommodityFlags) -> bool {
        self.base.read().flags.contains(flags)
    }

    /// Replace the flag set.
    pub fn set_flags(&self, flags: CommodityFlags) {
        self.base.write().flags = flags;
    }

    /// OR flags into the shared base.
    pub fn add_flags(&self, flags: CommodityFlags) {
        self.base.write().flags |= flags;
    }

    /// Clear flags on the shared base.
    pub fn drop_flags(&self, flags: CommodityFlags) {
        self.base.write().flags &= !flags;
    }

    /// Optional long name.
    pub fn name(&self) -> Option<String> {
        self.base.read().name.clone()
    }

    /// Set or clear the long name.
    pub fn set_name(&self, name: Option<String>) {
        self.base.write().name = name;
    }

    /// Optional free-form note.
    pub fn note(&self) -> Option<String> {
        self.base.read().note.clone()
    }

    /// Set or clear the note.
    pub fn set_note(&self, note: Option<String>) {
        self.base.write().note = note;
    }

    /// The next-smaller scaled unit, as an amount of that unit per one of
    /// this one (`1m` has smaller `60s`).
    pub fn smaller(&self) -> Option<Amount> {
        self.base.read().smaller.clone()
    }

    /// Set or clear the smaller-unit link.
    pub fn set_smaller(&self, smaller: Option<Amount>) {
        self.base.write().smaller = smaller;
    }

    /// The next-larger scaled unit.
    pub fn larger(&self) -> Option<Amount> {
        self.base.read().larger.clone()
    }

    /// Set or clear the larger-unit link.
    pub fn set_larger(&self, larger: Option<Amount>) {
        self.base.write().larger = larger;
    }

    /// A snapshot of the price history, if any prices were recorded.
    pub fn history(&self) -> Option<PriceHistory> {
        self.base.read().history.clone()
    }

    /// Record a price at the given moment. A later write to the same moment
    /// replaces the earlier one.
    pub fn add_price(&self, moment: Moment, price: Amount) {
        let mut base = self.base.write();
        let history = base.history.get_or_insert_with(PriceHistory::default);
        history.prices.insert(moment, price);
    }

    /// Remove the price recorded at `moment`; true if one was present.
    pub fn remove_price(&self, moment: &Moment) -> bool {
        let mut base = self.base.write();
        match &mut base.history {
            Some(history) => history.prices.remove(moment).is_some(),
            None => false,
        }
    }

    /// The unit price of this commodity at `moment` (or the latest known
    /// price when omitted).
    ///
    /// Returns the greatest history entry not after `moment` when one
    /// exists. Otherwise, unless the commodity is marked `NOMARKET`, the
    /// pool's quote sources are consulted once; a successful quote is
    /// recorded into the history and the lookup time is remembered.
    pub fn value(&self, moment: Option<Moment>) -> Option<Amount> {
        {
            let base = self.base.read();
            if let Some(history) = &base.history {
                let found = match moment {
                    Some(at) => history.prices.range(..=at).next_back(),
                    None => history.prices.iter().next_back(),
                };
                if let Some((_, price)) = found {
                    return Some(price.clone());
                }
            }
            if base.flags.contains(CommodityFlags::NOMARKET) {
                return None;
            }
        }

        let pool = self.pool.upgrade()?;
        let now = datetime::now();
        let last = self.base.read().history.as_ref().and_then(|h| h.last_lookup);
        let quote = pool.dispatch_quote(self, moment, Some(now), last);
        debug!("quote lookup for {}: {:?}", self.symbol(), quote.is_some());

        let mut base = self.base.write();
        let history = base.history.get_or_insert_with(PriceHistory::default);
        history.last_lookup = Some(now);
        if let Some(price) = &quote {
            history.prices.insert(moment.unwrap_or(now), price.clone());
        }
        quote
    }

    /// Structural sanity check over the handle and its base.
    pub fn valid(&self) -> bool {
        if self.ident == 0 {
            return !self.is_annotated();
        }
        if self.base.read().symbol.is_empty() {
            return false;
        }
        match &self.annotation {
            Some(ann) => !ann.details.is_empty() && ann.referent != self.ident,
            None => true,
        }
    }

    /// Equivalence for arithmetic: same base, and every annotation detail
    /// selected by `keep` matches. With all keeps off, a lot of `AAPL` is
    /// interchangeable with plain `AAPL`.
    pub(crate) fn equivalent_to(&self, other: &Commodity, keep: &KeepDetails) -> bool {
        if !Arc::ptr_eq(&self.base, &other.base) {
            return false;
        }
        let a = self.annotation_details();
        let b = other.annotation_details();
        (!keep.keep_price || a.price == b.price)
            && (!keep.keep_date || a.date == b.date)
            && (!keep.keep_tag || a.tag == b.tag)
    }
}

impl PartialEq for Commodity {
    fn eq(&self, other: &Self) -> bool {
        match (&self.annotation, &other.annotation) {
            (None, None) => Arc::ptr_eq(&self.base, &other.base),
            (Some(a), Some(b)) => {
                Arc::ptr_eq(&self.base, &other.base) && a.details == b.details
            }
            // An annotated commodity never equals a plain one, even over
            // the same base.
            _ => false,
        }
    }
}

impl Eq for Commodity {}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())?;
        if let Some(ann) = &self.annotation {
            f.write_str(&ann.details.display_suffix())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COMMODITY(#{} {})", self.ident, self)
    }
}

/// A host-supplied price-quote callback.
///
/// Arguments are the commodity, the moment the price is wanted for, the
/// current moment, and the time of the previous lookup. The first source to
/// return `Some` wins.
pub type QuoteSource = Box<
    dyn Fn(&Commodity, Option<Moment>, Option<Moment>, Option<Moment>) -> Option<Amount>
        + Send
        + Sync,
>;

struct PoolInner {
    by_ident: Vec<CommodityRef>,
    by_key: HashMap<String, Ident>,
    default_commodity: Option<CommodityRef>,
}

/// The owner of all commodities.
///
/// Interns by symbol (mapping key) and by dense numeric identifier, holds
/// the anonymous null commodity at identifier 0, and is the only way to
/// create commodities. Dropping the pool drops every commodity with it;
/// amounts hold non-owning references and must not outlive it.
pub struct CommodityPool {
    self_weak: Weak<CommodityPool>,
    inner: RwLock<PoolInner>,
    quote_sources: RwLock<Vec<QuoteSource>>,
}

impl CommodityPool {
    /// Create an empty pool containing only the null commodity.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|pool: &Weak<CommodityPool>| {
            let base = Arc::new(RwLock::new(CommodityBase::new("")));
            base.write().flags = CommodityFlags::BUILTIN;
            let null = Arc::new(Commodity {
                base,
                pool: pool.clone(),
                ident: 0,
                qualified_symbol: None,
                mapping_key: None,
                annotation: None,
            });
            CommodityPool {
                self_weak: pool.clone(),
                inner: RwLock::new(PoolInner {
                    by_ident: vec![null],
                    by_key: HashMap::from([(String::new(), 0)]),
                    default_commodity: None,
                }),
                quote_sources: RwLock::new(Vec::new()),
            }
        })
    }

    /// The anonymous sentinel used for plain numeric amounts.
    pub fn null_commodity(&self) -> CommodityRef {
        self.inner.read().by_ident[0].clone()
    }

    /// The host-selected default commodity, if any.
    pub fn default_commodity(&self) -> Option<CommodityRef> {
        self.inner.read().default_commodity.clone()
    }

    /// Select the default commodity.
    pub fn set_default_commodity(&self, commodity: Option<CommodityRef>) {
        self.inner.write().default_commodity = commodity;
    }

    /// Number of commodities in the pool, the null commodity included.
    pub fn len(&self) -> usize {
        self.inner.read().by_ident.len()
    }

    /// True when only the null commodity exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }

    /// Snapshot of every commodity, in identifier order.
    pub fn commodities(&self) -> Vec<CommodityRef> {
        self.inner.read().by_ident.clone()
    }

    /// Create a fresh commodity for `symbol`.
    pub fn create(&self, symbol: &str) -> AmountResult<CommodityRef> {
        let mut inner = self.inner.write();
        if inner.by_key.contains_key(symbol) {
            return Err(AmountError::DuplicateSymbol(symbol.to_string()));
        }
        let ident = inner.by_ident.len() as Ident;
        let qualified = Commodity::symbol_needs_quotes(symbol).then(|| format!("\"{symbol}\""));
        let commodity = Arc::new(Commodity {
            base: Arc::new(RwLock::new(CommodityBase::new(symbol))),
            pool: self.self_weak.clone(),
            ident,
            qualified_symbol: qualified,
            mapping_key: None,
            annotation: None,
        });
        debug!("created commodity #{ident} {symbol:?}");
        inner.by_ident.push(commodity.clone());
        inner.by_key.insert(symbol.to_string(), ident);
        Ok(commodity)
    }

    /// Look up a commodity by mapping key.
    pub fn find(&self, symbol: &str) -> Option<CommodityRef> {
        let inner = self.inner.read();
        let ident = *inner.by_key.get(symbol)?;
        Some(inner.by_ident[ident as usize].clone())
    }

    /// Look up a commodity by identifier.
    pub fn find_by_ident(&self, ident: Ident) -> Option<CommodityRef> {
        self.inner.read().by_ident.get(ident as usize).cloned()
    }

    /// Look up `symbol`, creating it when absent.
    pub fn find_or_create(&self, symbol: &str) -> AmountResult<CommodityRef> {
        if let Some(commodity) = self.find(symbol) {
            return Ok(commodity);
        }
        self.create(symbol)
    }

    /// Create the annotated variant of `symbol` with `details`, creating the
    /// plain referent first if needed.
    pub fn create_annotated(
        &self,
        symbol: &str,
        details: &Annotation,
    ) -> AmountResult<CommodityRef> {
        let referent = self.find_or_create(symbol)?;
        self.create_annotated_from(&referent, details)
    }

    fn create_annotated_from(
        &self,
        referent: &CommodityRef,
        details: &Annotation,
    ) -> AmountResult<CommodityRef> {
        let key = Self::make_qualified_name(referent, details);
        let mut inner = self.inner.write();
        if inner.by_key.contains_key(&key) {
            return Err(AmountError::DuplicateSymbol(key));
        }
        let ident = inner.by_ident.len() as Ident;
        let commodity = Arc::new(Commodity {
            base: referent.base.clone(),
            pool: self.self_weak.clone(),
            ident,
            qualified_symbol: referent.qualified_symbol.clone(),
            mapping_key: Some(key.clone()),
            annotation: Some(AnnotatedDetails { details: details.clone(), referent: referent.ident }),
        });
        debug!("created annotated commodity #{ident} {key:?}");
        inner.by_ident.push(commodity.clone());
        inner.by_key.insert(key, ident);
        Ok(commodity)
    }

    /// Look up the annotated variant of `symbol` with `details`.
    pub fn find_annotated(&self, symbol: &str, details: &Annotation) -> Option<CommodityRef> {
        let referent = self.find(symbol)?;
        self.find(&Self::make_qualified_name(&referent, details))
    }

    /// Look up or intern the annotated variant of `symbol` with `details`.
    /// Equal annotations always resolve to the same handle; empty details
    /// resolve to the plain commodity itself.
    pub fn find_or_create_annotated(
        &self,
        symbol: &str,
        details: &Annotation,
    ) -> AmountResult<CommodityRef> {
        if details.is_empty() {
            return self.find_or_create(symbol);
        }
        let referent = self.find_or_create(symbol)?;
        if let Some(existing) = self.find(&Self::make_qualified_name(&referent, details)) {
            return Ok(existing);
        }
        self.create_annotated_from(&referent, details)
    }

    /// The canonical mapping key of an annotated commodity: the referent's
    /// symbol followed by ` {price} [date] (tag)` in fixed order, with the
    /// price in normalized (style-independent, trailing-zero-free) form.
    fn make_qualified_name(referent: &CommodityRef, details: &Annotation) -> String {
        format!("{}{}", referent.symbol(), details.normalized_suffix())
    }

    /// Parse an amount from text against this pool.
    pub fn parse_amount(
        &self,
        input: &str,
        flags: crate::amount::ParseFlags,
    ) -> AmountResult<Amount> {
        crate::amount::parse_with_pool(self, input, flags)
    }

    /// Register a quote source. Sources are consulted in registration order
    /// and the first `Some` wins. Register them at pool construction; they
    /// are never serialized.
    pub fn add_quote_source(&self, source: QuoteSource) {
        self.quote_sources.write().push(source);
    }

    pub(crate) fn dispatch_quote(
        &self,
        commodity: &Commodity,
        date: Option<Moment>,
        moment: Option<Moment>,
        last: Option<Moment>,
    ) -> Option<Amount> {
        for source in self.quote_sources.read().iter() {
            if let Some(price) = source(commodity, date, moment, last) {
                return Some(price);
            }
        }
        None
    }
}

// Binary serialization of a pool snapshot.
//
// The stream has two sections so that amounts embedded in commodity
// metadata (smaller/larger links, price histories, lot prices) can refer to
// commodities by identifier: section one registers every commodity handle in
// identifier order, section two carries the per-base metadata. Lot prices
// appear in section one because they are part of an annotated commodity's
// identity; the commodities they reference always have lower identifiers,
// since a price amount must exist before the lot can be interned.
impl CommodityPool {
    /// Serialize the pool. Quote sources and the default-commodity choice
    /// are host state and are not written.
    pub fn write<W: Write>(&self, out: &mut W) -> AmountResult<()> {
        let commodities = self.commodities();
        out.write_all(&(commodities.len() as u32).to_le_bytes())?;

        for commodity in commodities.iter().skip(1) {
            match &commodity.annotation {
                None => {
                    out.write_all(&[0u8])?;
                    write_string(out, &commodity.base_symbol())?;
                }
                Some(ann) => {
                    out.write_all(&[1u8])?;
                    write_string(out, &commodity.base_symbol())?;
                    out.write_all(&ann.referent.to_le_bytes())?;
                    write_annotation(out, &ann.details)?;
                }
            }
        }

        for commodity in &commodities {
            if commodity.is_annotated() {
                continue;
            }
            let base = commodity.base.read();
            out.write_all(&base.precision.to_le_bytes())?;
            out.write_all(&base.flags.bits().to_le_bytes())?;
            write_opt_string(out, base.name.as_deref())?;
            write_opt_string(out, base.note.as_deref())?;
            write_opt_amount(out, base.smaller.as_ref())?;
            write_opt_amount(out, base.larger.as_ref())?;
            match &base.history {
                None => out.write_all(&[0u8])?,
                Some(history) => {
                    out.write_all(&[1u8])?;
                    out.write_all(&(history.prices.len() as u32).to_le_bytes())?;
                    for (moment, price) in &history.prices {
                        write_moment(out, moment)?;
                        price.write(out)?;
                    }
                    match &history.last_lookup {
                        None => out.write_all(&[0u8])?,
                        Some(moment) => {
                            out.write_all(&[1u8])?;
                            write_moment(out, moment)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconstruct a pool written by [`CommodityPool::write`].
    pub fn read<R: Read>(input: &mut R) -> AmountResult<Arc<Self>> {
        let pool = CommodityPool::new();
        let count = read_u32(input)? as usize;

        for expected in 1..count {
            let kind = read_u8(input)?;
            let symbol = read_string(input)?;
            let commodity = match kind {
                0 => pool.create(&symbol)?,
                1 => {
                    let referent_ident = read_u32(input)?;
                    let details = read_annotation(&pool, input)?;
                    let referent = pool
                        .find_by_ident(referent_ident)
                        .ok_or(AmountError::UnknownCommodity(referent_ident))?;
                    pool.create_annotated_from(&referent, &details)?
                }
                _ => {
                    return Err(AmountError::ParseError(format!(
                        "unknown commodity record kind {kind}"
                    )))
                }
            };
            if commodity.ident() as usize != expected {
                return Err(AmountError::InvalidState("commodity identifiers out of order"));
            }
        }

        for ident in 0..count {
            let commodity = pool
                .find_by_ident(ident as Ident)
                .ok_or(AmountError::UnknownCommodity(ident as Ident))?;
            if commodity.is_annotated() {
                continue;
            }
            let precision = read_u16(input)?;
            let flags = CommodityFlags::from_bits_truncate(read_u32(input)?);
            let name = read_opt_string(input)?;
            let note = read_opt_string(input)?;
            let smaller = read_opt_amount(&pool, input)?;
            let larger = read_opt_amount(&pool, input)?;
            let history = match read_u8(input)? {
                0 => None,
                _ => {
                    let entries = read_u32(input)? as usize;
                    let mut prices = BTreeMap::new();
                    for _ in 0..entries {
                        let moment = read_moment(input)?;
                        let price = Amount::read(&pool, input)?;
                        prices.insert(moment, price);
                    }
                    let last_lookup = match read_u8(input)? {
                        0 => None,
                        _ => Some(read_moment(input)?),
                    };
                    Some(PriceHistory { prices, last_lookup })
                }
            };
            let mut base = commodity.base.write();
            base.precision = precision;
            base.flags = flags;
            base.name = name;
            base.note = note;
            base.smaller = smaller;
            base.larger = larger;
            base.history = history;
        }

        Ok(pool)
    }
}

fn write_opt_string<W: Write>(out: &mut W, value: Option<&str>) -> AmountResult<()> {
    match value {
        None => out.write_all(&[0u8]).map_err(Into::into),
        Some(s) => {
            out.write_all(&[1u8])?;
            write_string(out, s)
        }
    }
}

fn read_opt_string<R: Read>(input: &mut R) -> AmountResult<Option<String>> {
    match read_u8(input)? {
        0 => Ok(None),
        _ => Ok(Some(read_string(input)?)),
    }
}

fn write_opt_amount<W: Write>(out: &mut W, value: Option<&Amount>) -> AmountResult<()> {
    match value {
        None => out.write_all(&[0u8]).map_err(Into::into),
        Some(amount) => {
            out.write_all(&[1u8])?;
            amount.write(out)
        }
    }
}

fn read_opt_amount<R: Read>(
    pool: &CommodityPool,
    input: &mut R,
) -> AmountResult<Option<Amount>> {
    match read_u8(input)? {
        0 => Ok(None),
        _ => Ok(Some(Amount::read(pool, input)?)),
    }
}

fn write_annotation<W: Write>(out: &mut W, details: &Annotation) -> AmountResult<()> {
    write_opt_amount(out, details.price())?;
    match details.date() {
        None => out.write_all(&[0u8])?,
        Some(date) => {
            out.write_all(&[1u8])?;
            out.write_all(&chrono::Datelike::num_days_from_ce(&date).to_le_bytes())?;
        }
    }
    write_opt_string(out, details.tag())
}

fn read_annotation<R: Read>(
    pool: &CommodityPool,
    input: &mut R,
) -> AmountResult<Annotation> {
    let price = read_opt_amount(pool, input)?;
    let date = match read_u8(input)? {
        0 => None,
        _ => {
            let days = i32::from_le_bytes(read_bytes::<4, _>(input)?);
            Some(
                Date::from_num_days_from_ce_opt(days)
                    .ok_or_else(|| AmountError::ParseError(format!("invalid date: {days}")))?,
            )
        }
    };
    let tag = read_opt_string(input)?;
    Ok(Annotation::with_details(price, date, tag))
}

fn write_moment<W: Write>(out: &mut W, moment: &Moment) -> AmountResult<()> {
    out.write_all(&moment.and_utc().timestamp().to_le_bytes())
        .map_err(Into::into)
}

fn read_moment<R: Read>(input: &mut R) -> AmountResult<Moment> {
    let secs = i64::from_le_bytes(read_bytes::<8, _>(input)?);
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| AmountError::ParseError(format!("invalid timestamp: {secs}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_needs_quotes() {
        assert!(!Commodity::symbol_needs_quotes("USD"));
        assert!(!Commodity::symbol_needs_quotes("$"));
        assert!(Commodity::symbol_needs_quotes("A B"));
        assert!(Commodity::symbol_needs_quotes("X12"));
        assert!(Commodity::symbol_needs_quotes("a@b"));
        assert!(Commodity::symbol_needs_quotes("a{b"));
    }

    #[test]
    fn test_pool_interning() {
        let pool = CommodityPool::new();
        let usd1 = pool.find_or_create("USD").unwrap();
        let usd2 = pool.find_or_create("USD").unwrap();
        assert!(Arc::ptr_eq(&usd1, &usd2));
        assert_eq!(usd1.ident(), 1);
        assert_eq!(pool.len(), 2);

        assert!(matches!(
            pool.create("USD"),
            Err(AmountError::DuplicateSymbol(_))
        ));
    }

    #[test]
    fn test_find_by_ident() {
        let pool = CommodityPool::new();
        let eur = pool.create("EUR").unwrap();
        assert!(Arc::ptr_eq(&pool.find_by_ident(eur.ident()).unwrap(), &eur));
        assert!(pool.find_by_ident(99).is_none());
        assert!(pool.find_by_ident(0).unwrap().is_null());
    }

    #[test]
    fn test_qualified_symbol() {
        let pool = CommodityPool::new();
        let odd = pool.create("A B").unwrap();
        assert_eq!(odd.base_symbol(), "A B");
        assert_eq!(odd.symbol(), "\"A B\"");

        let plain = pool.create("EUR").unwrap();
        assert_eq!(plain.symbol(), "EUR");
    }

    #[test]
    fn test_shared_base_metadata() {
        let pool = CommodityPool::new();
        let a = pool.find_or_create("CAD").unwrap();
        let b = pool.find_or_create("CAD").unwrap();
        a.set_precision(4);
        assert_eq!(b.precision(), 4);
        a.add_flags(CommodityFlags::STYLE_SUFFIXED);
        assert!(b.has_flags(CommodityFlags::STYLE_SUFFIXED));
        a.set_name(Some("Canadian dollar".to_string()));
        assert_eq!(b.name().as_deref(), Some("Canadian dollar"));
    }

    #[test]
    fn test_annotated_interning() {
        let pool = CommodityPool::new();
        let price = pool.parse_amount("$20", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let details = Annotation::with_price(price);

        let a = pool.find_or_create_annotated("AAPL", &details).unwrap();
        let b = pool.find_or_create_annotated("AAPL", &details).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_annotated());
        assert_eq!(a.base_symbol(), "AAPL");
        // mapping keys use the style-independent normalized price form
        assert_eq!(a.mapping_key(), "AAPL {20 $}");

        let plain = pool.find("AAPL").unwrap();
        assert!(!plain.is_annotated());
        assert!(Arc::ptr_eq(&a.referent().unwrap(), &plain));

        // same base, so metadata changes are visible both ways
        plain.set_precision(3);
        assert_eq!(a.precision(), 3);
    }

    #[test]
    fn test_annotated_interning_ignores_scale() {
        let pool = CommodityPool::new();
        let p1 = pool.parse_amount("$20", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let p2 = pool.parse_amount("$20.00", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let a = pool.find_or_create_annotated("AAPL", &Annotation::with_price(p1)).unwrap();
        let b = pool.find_or_create_annotated("AAPL", &Annotation::with_price(p2)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_commodity_equality_rules() {
        let pool = CommodityPool::new();
        let plain = pool.find_or_create("AAPL").unwrap();
        let price = pool.parse_amount("$20", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let annotated =
            pool.find_or_create_annotated("AAPL", &Annotation::with_price(price.clone())).unwrap();
        let annotated2 =
            pool.find_or_create_annotated("AAPL", &Annotation::with_price(price)).unwrap();
        let dated = pool
            .find_or_create_annotated(
                "AAPL",
                &Annotation::with_date(Date::from_ymd_opt(2024, 1, 5).unwrap()),
            )
            .unwrap();

        assert_eq!(*annotated, *annotated2);
        assert_ne!(*plain, *annotated);
        assert_ne!(*annotated, *dated);

        let other = pool.find_or_create("MSFT").unwrap();
        assert_ne!(*plain, *other);
    }

    #[test]
    fn test_equivalence_respects_keep() {
        let pool = CommodityPool::new();
        let plain = pool.find_or_create("AAPL").unwrap();
        let price = pool.parse_amount("$20", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let annotated =
            pool.find_or_create_annotated("AAPL", &Annotation::with_price(price)).unwrap();

        assert!(plain.equivalent_to(&annotated, &KeepDetails::none()));
        assert!(!plain.equivalent_to(&annotated, &KeepDetails::all()));
        assert!(annotated.equivalent_to(&annotated, &KeepDetails::all()));
    }

    #[test]
    fn test_price_history_ordering() {
        let pool = CommodityPool::new();
        let aapl = pool.find_or_create("AAPL").unwrap();
        let p10 = pool.parse_amount("$10", crate::amount::ParseFlags::NO_MIGRATE).unwrap();
        let p12 = pool.parse_amount("$12", crate::amount::ParseFlags::NO_MIGRATE).unwrap();

        let t1 = Date::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let t2 = Date::from_ymd_opt(2024, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        aapl.add_price(t2, p12.clone());
        aapl.add_price(t1, p10.clone());

        // latest when no moment given
        assert_eq!(aapl.value(None).unwrap(), p12);
        // greatest entry at-or-before the asked moment
        let mid = Date::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(aapl.value(Some(mid)).unwrap(), p10);
        assert_eq!(aapl.value(Some(t1)).unwrap(), p10);

        // last write wins on duplicate timestamps
        aapl.add_price(t2, p10.clone());
        assert_eq!(aapl.value(None).unwrap(), p10);

        assert!(aapl.remove_price(&t2));
        assert!(!aapl.remove_price(&t2));
    }

    #[test]
    fn test_quote_dispatch_first_some_wins() {
        use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

        let pool = CommodityPool::new();
        let aapl = pool.find_or_create("AAPL").unwrap();
        let quoted = pool.parse_amount("$42", crate::amount::ParseFlags::NO_MIGRATE).unwrap();

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        pool.add_quote_source(Box::new(|_, _, _, _| {
            CALLS.fetch_add(1, AtomicOrdering::SeqCst);
            None
        }));
        let quoted_clone = quoted.clone();
        pool.add_quote_source(Box::new(move |_, _, _, _| Some(quoted_clone.clone())));
        pool.add_quote_source(Box::new(|_, _, _, _| {
            panic!("later sources must not run once one answered")
        }));

        let before = CALLS.load(AtomicOrdering::SeqCst);
        let value = aapl.value(None).unwrap();
        assert_eq!(value, quoted);
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), before + 1);

        // the quote was recorded, so a second call hits the history
        let value2 = aapl.value(None).unwrap();
        assert_eq!(value2, quoted);
        assert_eq!(CALLS.load(AtomicOrdering::SeqCst), before + 1);
        assert!(aapl.history().unwrap().last_lookup().is_some());
    }

    #[test]
    fn test_nomarket_suppresses_quotes() {
        let pool = CommodityPool::new();
        let xau = pool.find_or_create("XAU").unwrap();
        xau.add_flags(CommodityFlags::NOMARKET);
        pool.add_quote_source(Box::new(|_, _, _, _| {
            panic!("NOMARKET commodities must not be quoted")
        }));
        assert!(xau.value(None).is_none());
    }

    #[test]
    fn test_keep_details_selectors() {
        assert!(!KeepDetails::none().keep_any());
        assert!(KeepDetails::all().keep_all());
        let partial = KeepDetails { keep_price: true, keep_date: false, keep_tag: false };
        assert!(partial.keep_any());
        assert!(!partial.keep_all());
    }
}
