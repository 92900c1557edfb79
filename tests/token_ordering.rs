use proptest::prelude::*;
use tidemark::{
    compare, encode, DocumentKey, LogicalTime, ResumeToken, TieBreakers, TokenFormatVersion,
    TokenOrdering,
};

fn event(version: TokenFormatVersion, secs: u32, inc: u32, op: u32, key: &str) -> ResumeToken {
    let origin = version.carries_origin().then(|| "test.coll".to_string());
    ResumeToken::event(
        version,
        LogicalTime::new(secs, inc),
        op,
        TieBreakers::new(origin, DocumentKey::from(key)),
    )
    .unwrap()
}

fn mark(version: TokenFormatVersion, secs: u32, inc: u32) -> ResumeToken {
    ResumeToken::high_water_mark(version, LogicalTime::new(secs, inc))
}

#[test]
fn high_water_mark_sorts_after_events_at_same_time() {
    for version in [TokenFormatVersion::V0, TokenFormatVersion::V1] {
        let hwm = mark(version, 10, 2);
        let same_time = event(version, 10, 2, 99, "zzz");
        let later = event(version, 10, 3, 0, "a");
        assert_eq!(compare(&hwm, &same_time), TokenOrdering::Greater);
        assert_eq!(compare(&same_time, &hwm), TokenOrdering::Less);
        assert_eq!(compare(&hwm, &later), TokenOrdering::Less);
    }
}

#[test]
fn same_version_orders_by_position_then_tie_breakers() {
    let v = TokenFormatVersion::V1;
    assert_eq!(
        compare(&event(v, 1, 1, 0, "b"), &event(v, 1, 1, 1, "a")),
        TokenOrdering::Less
    );
    assert_eq!(
        compare(&event(v, 1, 1, 0, "b"), &event(v, 1, 1, 0, "a")),
        TokenOrdering::Greater
    );
    assert_eq!(
        compare(&event(v, 1, 1, 0, "a"), &event(v, 1, 1, 0, "a")),
        TokenOrdering::Equal
    );
}

#[test]
fn cross_format_same_event_compares_equal() {
    let old = event(TokenFormatVersion::V0, 5, 5, 0, "k");
    let new = event(TokenFormatVersion::V1, 5, 5, 0, "k");
    assert_eq!(compare(&old, &new), TokenOrdering::Equal);
    assert_eq!(compare(&new, &old), TokenOrdering::Equal);
}

#[test]
fn cross_format_ties_with_different_keys_are_incomparable() {
    let old = event(TokenFormatVersion::V0, 5, 5, 0, "k");
    let new = event(TokenFormatVersion::V1, 5, 5, 0, "j");
    assert_eq!(compare(&old, &new), TokenOrdering::Incomparable);
    assert_eq!(compare(&new, &old), TokenOrdering::Incomparable);
}

#[test]
fn cross_format_positions_still_order() {
    let old = event(TokenFormatVersion::V0, 5, 5, 0, "k");
    let later_new = event(TokenFormatVersion::V1, 5, 6, 0, "a");
    let next_op = event(TokenFormatVersion::V1, 5, 5, 1, "a");
    assert_eq!(compare(&old, &later_new), TokenOrdering::Less);
    assert_eq!(compare(&old, &next_op), TokenOrdering::Less);
    assert_eq!(
        compare(&mark(TokenFormatVersion::V1, 5, 5), &old),
        TokenOrdering::Greater
    );
}

#[test]
fn high_water_marks_compare_equal_across_formats() {
    assert_eq!(
        compare(
            &mark(TokenFormatVersion::V0, 7, 1),
            &mark(TokenFormatVersion::V1, 7, 1)
        ),
        TokenOrdering::Equal
    );
}

#[test]
fn reverse_flips_direction_only() {
    assert_eq!(TokenOrdering::Less.reverse(), TokenOrdering::Greater);
    assert_eq!(TokenOrdering::Equal.reverse(), TokenOrdering::Equal);
    assert_eq!(
        TokenOrdering::Incomparable.reverse(),
        TokenOrdering::Incomparable
    );
}

fn arb_same_version(version: TokenFormatVersion) -> impl Strategy<Value = ResumeToken> {
    let time = (0u32..4, 0u32..4).prop_map(|(secs, inc)| LogicalTime::new(secs, inc));
    let key = proptest::collection::vec(prop_oneof![Just(0u8), Just(1u8), Just(b'a')], 0..3)
        .prop_map(DocumentKey::new);
    let origin = proptest::option::of(prop_oneof![Just("a".to_string()), Just("a\0".to_string())]);
    prop_oneof![
        (time.clone(), 0u32..3, origin, key).prop_map(move |(ts, op, origin, key)| {
            let origin = if version.carries_origin() { origin } else { None };
            ResumeToken::event(version, ts, op, TieBreakers::new(origin, key)).unwrap()
        }),
        time.prop_map(move |ts| ResumeToken::high_water_mark(version, ts)),
    ]
}

fn arb_version() -> impl Strategy<Value = TokenFormatVersion> {
    prop_oneof![Just(TokenFormatVersion::V0), Just(TokenFormatVersion::V1)]
}

proptest! {
    #[test]
    fn same_version_order_matches_byte_order(
        (a, b) in arb_version().prop_flat_map(|v| (arb_same_version(v), arb_same_version(v)))
    ) {
        let expected: TokenOrdering = encode(&a).cmp(&encode(&b)).into();
        prop_assert_eq!(compare(&a, &b), expected);
    }

    #[test]
    fn same_version_order_is_antisymmetric(
        (a, b) in arb_version().prop_flat_map(|v| (arb_same_version(v), arb_same_version(v)))
    ) {
        prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
        prop_assert_ne!(compare(&a, &b), TokenOrdering::Incomparable);
        prop_assert_eq!(compare(&a, &b) == TokenOrdering::Equal, a == b);
    }

    #[test]
    fn same_version_order_is_transitive(
        (a, b, c) in arb_version().prop_flat_map(|v| {
            (arb_same_version(v), arb_same_version(v), arb_same_version(v))
        })
    ) {
        let ab = compare(&a, &b);
        let bc = compare(&b, &c);
        if ab == TokenOrdering::Less && bc == TokenOrdering::Less {
            prop_assert_eq!(compare(&a, &c), TokenOrdering::Less);
        }
        if ab == TokenOrdering::Equal && bc == TokenOrdering::Equal {
            prop_assert_eq!(compare(&a, &c), TokenOrdering::Equal);
        }
    }
}
