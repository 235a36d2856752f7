//! Property-based tests for the amount kernel.
//!
//! These verify the algebraic invariants hold for arbitrary inputs using
//! proptest: identity and symmetry laws of amount arithmetic, idempotence of
//! display rounding, and losslessness of the parse/print and binary paths.

use proptest::prelude::*;
use tally_math::{Amount, BigInt, CommodityPool, ParseFlags, Precision, Quantity};

fn arb_quantity() -> impl Strategy<Value = Quantity> {
    (-1_000_000_000i64..1_000_000_000i64, 0u16..5)
        .prop_map(|(n, scale)| Quantity::new(BigInt::from(n), scale as Precision))
}

fn arb_amount() -> impl Strategy<Value = Amount> {
    arb_quantity().prop_map(Amount::from_quantity)
}

fn usd_amount(pool: &std::sync::Arc<CommodityPool>, quantity: Quantity) -> Amount {
    let mut amount = Amount::from_quantity(quantity);
    amount.set_commodity(pool.find_or_create("USD").unwrap());
    amount
}

proptest! {
    #[test]
    fn addition_commutes(a in arb_quantity(), b in arb_quantity()) {
        let pool = CommodityPool::new();
        let x = usd_amount(&pool, a);
        let y = usd_amount(&pool, b);
        prop_assert_eq!((&x + &y).unwrap(), (&y + &x).unwrap());
    }

    #[test]
    fn addition_associates(a in arb_quantity(), b in arb_quantity(), c in arb_quantity()) {
        let pool = CommodityPool::new();
        let x = usd_amount(&pool, a);
        let y = usd_amount(&pool, b);
        let z = usd_amount(&pool, c);
        let left = ((&x + &y).unwrap() + &z).unwrap();
        let right = (&x + &(&y + &z).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn multiplication_distributes_over_addition(
        a in arb_quantity(),
        b in arb_quantity(),
        c in arb_quantity(),
    ) {
        let x = Amount::from_quantity(a);
        let y = Amount::from_quantity(b);
        let z = Amount::from_quantity(c);
        let left = (&x * &(&y + &z).unwrap()).unwrap();
        let right = ((&x * &y).unwrap() + &(&x * &z).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn self_subtraction_is_zero(a in arb_quantity()) {
        let pool = CommodityPool::new();
        let x = usd_amount(&pool, a);
        let diff = (&x - &x).unwrap();
        prop_assert!(diff.is_realzero());
    }

    #[test]
    fn zero_and_null_are_additive_identities(a in arb_quantity()) {
        let pool = CommodityPool::new();
        let x = usd_amount(&pool, a);
        let zero = usd_amount(&pool, Quantity::zero());
        prop_assert_eq!(&(&x + &zero).unwrap(), &x);
        prop_assert_eq!(&(&x + &Amount::null()).unwrap(), &x);
        prop_assert_eq!(&(&Amount::null() + &x).unwrap(), &x);
    }

    #[test]
    fn display_rounding_is_idempotent(a in arb_amount(), precision in 0u16..4) {
        let once = a.roundto(precision);
        prop_assert_eq!(once.roundto(precision), once);
    }

    #[test]
    fn negation_is_involutive(a in arb_amount()) {
        prop_assert_eq!(a.negated().negated(), a);
    }

    #[test]
    fn anonymous_print_parse_is_lossless(a in arb_amount()) {
        // uncommoditized amounts always display at full internal precision
        let pool = CommodityPool::new();
        let printed = a.to_string();
        let back = pool.parse_amount(&printed, ParseFlags::empty()).unwrap();
        prop_assert_eq!(back.quantity(), a.quantity());
    }

    #[test]
    fn binary_round_trip_is_identity(a in arb_amount()) {
        let pool = CommodityPool::new();
        let mut bytes = Vec::new();
        a.write(&mut bytes).unwrap();
        let back = Amount::read(&pool, &mut bytes.as_slice()).unwrap();
        prop_assert_eq!(back, a);
    }

    #[test]
    fn division_reconstructs_dividend_within_extension(
        a in -1_000_000i64..1_000_000i64,
        b in prop::sample::select(vec![1i64, 2, 4, 5, 8, 10, 16, 20, 25, 50, 100]),
    ) {
        // divisors whose quotients terminate within the extension digits
        let x = Amount::from_i64(a);
        let y = Amount::from_i64(b);
        let quotient = (&x / &y).unwrap();
        let product = (&quotient * &y).unwrap();
        prop_assert_eq!(product, x);
    }

    #[test]
    fn reduce_is_fixed_point_without_links(a in arb_quantity()) {
        let pool = CommodityPool::new();
        let x = usd_amount(&pool, a);
        prop_assert_eq!(&x.reduce(), &x);
        prop_assert_eq!(&x.unreduce(), &x);
    }

    #[test]
    fn compare_is_antisymmetric(a in arb_amount(), b in arb_amount()) {
        let ab = a.compare(&b).unwrap();
        let ba = b.compare(&a).unwrap();
        prop_assert_eq!(ab, ba.reverse());
    }
}
