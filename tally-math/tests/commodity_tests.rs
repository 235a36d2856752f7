//! Pool-level behavior: interning, annotated variants, price histories with
//! quote callbacks, and binary round-trips of pool snapshots and amounts.

use std::sync::Arc;

use tally_math::{
    Amount, AmountError, Annotation, CommodityFlags, CommodityPool, Date, KeepDetails, ParseFlags,
};

fn moment(y: i32, m: u32, d: u32) -> tally_math::Moment {
    Date::from_ymd_opt(y, m, d).unwrap().and_hms_opt(12, 0, 0).unwrap()
}

fn q(s: &str) -> tally_math::Quantity {
    s.parse().unwrap()
}

#[test]
fn pool_assigns_dense_idents() {
    let pool = CommodityPool::new();
    assert_eq!(pool.null_commodity().ident(), 0);
    let a = pool.create("USD").unwrap();
    let b = pool.create("EUR").unwrap();
    assert_eq!(a.ident(), 1);
    assert_eq!(b.ident(), 2);
    assert_eq!(pool.len(), 3);
}

#[test]
fn annotated_variants_share_identifier_space() {
    let pool = CommodityPool::new();
    let lot = pool
        .parse_amount("10 AAPL {$20}", ParseFlags::empty())
        .unwrap();
    let annotated = lot.commodity().unwrap();
    // $ and AAPL were created during the same parse
    assert!(pool.find("$").is_some());
    assert!(pool.find("AAPL").is_some());
    let found = pool
        .find_annotated("AAPL", &annotated.annotation_details())
        .unwrap();
    assert_eq!(found.ident(), annotated.ident());
}

#[test]
fn value_applies_unit_price() {
    let pool = CommodityPool::new();
    let shares = pool.parse_amount("10 AAPL", ParseFlags::empty()).unwrap();
    let unit = pool.parse_amount("$10", ParseFlags::empty()).unwrap();

    let when = moment(2024, 4, 10);
    shares.commodity().unwrap().add_price(when, unit);

    let value = shares.value(Some(when)).unwrap();
    assert_eq!(value.commodity().unwrap().symbol(), "$");
    assert_eq!(value.quantity().unwrap(), &q("100"));
    assert_eq!(value.to_string(), "$100");

    // before any recorded price, and with no quote source, there is none
    assert!(shares.value(Some(moment(2020, 1, 1))).is_none());
}

#[test]
fn quote_sources_feed_amount_value() {
    let pool = CommodityPool::new();
    let shares = pool.parse_amount("4 GLD", ParseFlags::empty()).unwrap();
    let unit = pool.parse_amount("$250.00", ParseFlags::empty()).unwrap();
    pool.add_quote_source(Box::new(move |commodity, _, _, _| {
        (commodity.symbol() == "GLD").then(|| unit.clone())
    }));

    let value = shares.value(None).unwrap();
    assert_eq!(value.to_string(), "$1000.00");
}

#[test]
fn annotations_survive_strip_round_trips() {
    let pool = CommodityPool::new();
    let lot = pool
        .parse_amount("5 HUT {$1.20} [2023-06-01] (run 7)", ParseFlags::empty())
        .unwrap();

    for keep in [
        KeepDetails::none(),
        KeepDetails::all(),
        KeepDetails { keep_price: true, keep_date: false, keep_tag: true },
        KeepDetails { keep_price: false, keep_date: true, keep_tag: false },
    ] {
        let once = lot.strip_annotations(&keep);
        let twice = once.strip_annotations(&keep);
        assert_eq!(
            once.commodity().unwrap().mapping_key(),
            twice.commodity().unwrap().mapping_key(),
            "strip not idempotent for {keep:?}"
        );
        assert_eq!(once.quantity(), lot.quantity());
    }
}

#[test]
fn annotate_commodity_interns_through_pool() {
    let pool = CommodityPool::new();
    let mut amount = pool.parse_amount("10 AAPL", ParseFlags::empty()).unwrap();
    assert!(!amount.commodity_annotated());

    // an empty annotation is a no-op
    amount.annotate_commodity(&Annotation::new()).unwrap();
    assert!(!amount.commodity_annotated());

    let date = Date::from_ymd_opt(2024, 1, 5).unwrap();
    amount.annotate_commodity(&Annotation::with_date(date)).unwrap();
    assert!(amount.commodity_annotated());
    assert_eq!(amount.annotation_details().date(), Some(date));

    // the same details resolve to the same handle
    let mut second = pool.parse_amount("3 AAPL", ParseFlags::empty()).unwrap();
    second.annotate_commodity(&Annotation::with_date(date)).unwrap();
    assert!(Arc::ptr_eq(
        amount.commodity().unwrap(),
        second.commodity().unwrap()
    ));
}

#[test]
fn pool_snapshot_round_trips() {
    let pool = CommodityPool::new();
    let dollars = pool.parse_amount("$1,234.56", ParseFlags::empty()).unwrap();
    let _ = pool.parse_amount("1.000,00 EUR", ParseFlags::empty()).unwrap();
    let lot = pool
        .parse_amount("10 AAPL {$20} [2024-01-05] (lot A)", ParseFlags::empty())
        .unwrap();
    Amount::parse_conversion_in(&pool, "1.0m", "60s").unwrap();

    let aapl = pool.find("AAPL").unwrap();
    aapl.set_name(Some("Apple Inc.".to_string()));
    aapl.set_note(Some("tech".to_string()));
    let unit = pool.parse_amount("$10", ParseFlags::NO_MIGRATE).unwrap();
    aapl.add_price(moment(2024, 4, 10), unit);

    // the documented flow: amounts first, then the pool; read in reverse
    let mut amount_bytes = Vec::new();
    dollars.write(&mut amount_bytes).unwrap();
    lot.write(&mut amount_bytes).unwrap();
    let mut pool_bytes = Vec::new();
    pool.write(&mut pool_bytes).unwrap();

    let restored = CommodityPool::read(&mut pool_bytes.as_slice()).unwrap();
    assert_eq!(restored.len(), pool.len());

    // plain metadata survives
    let dollar = restored.find("$").unwrap();
    assert_eq!(dollar.precision(), pool.find("$").unwrap().precision());
    let eur = restored.find("EUR").unwrap();
    assert!(eur.has_flags(CommodityFlags::STYLE_EUROPEAN | CommodityFlags::STYLE_THOUSANDS));
    let apple = restored.find("AAPL").unwrap();
    assert_eq!(apple.name().as_deref(), Some("Apple Inc."));
    assert_eq!(apple.note().as_deref(), Some("tech"));
    assert_eq!(
        apple.history().unwrap().prices().len(),
        pool.find("AAPL").unwrap().history().unwrap().prices().len()
    );

    // the scaling ladder survives
    let minute = restored.find("m").unwrap();
    assert_eq!(minute.smaller().unwrap().to_string(), "60s");
    let second = restored.find("s").unwrap();
    assert!(second.larger().is_some());

    // annotated commodities re-intern under the same key and identifier
    let lot_comm = restored
        .find_annotated("AAPL", &lot.commodity().unwrap().annotation_details())
        .unwrap();
    assert_eq!(lot_comm.ident(), lot.commodity().unwrap().ident());
    assert!(lot_comm.is_annotated());

    // amounts deserialize against the snapshot
    let mut cursor = amount_bytes.as_slice();
    let dollars_back = Amount::read(&restored, &mut cursor).unwrap();
    let lot_back = Amount::read(&restored, &mut cursor).unwrap();
    assert_eq!(dollars_back.to_string(), dollars.to_string());
    assert_eq!(dollars_back.quantity(), dollars.quantity());
    assert_eq!(lot_back.to_string(), lot.to_string());
    assert!(lot_back.commodity_annotated());
}

#[test]
fn foreign_pool_rejects_unknown_idents() {
    let pool = CommodityPool::new();
    let amount = pool.parse_amount("$5", ParseFlags::empty()).unwrap();
    let mut bytes = Vec::new();
    amount.write(&mut bytes).unwrap();

    let foreign = CommodityPool::new();
    assert!(matches!(
        Amount::read(&foreign, &mut bytes.as_slice()),
        Err(AmountError::UnknownCommodity(1))
    ));
}

#[test]
fn reduce_is_fixed_point_without_links() {
    let pool = CommodityPool::new();
    let plain = pool.parse_amount("$12.34", ParseFlags::empty()).unwrap();
    assert_eq!(plain.reduce(), plain);
    assert_eq!(plain.unreduce(), plain);
}
