mod common;

use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // val(str(x)) == x for all finite numbers.
    #[test]
    fn number_string_round_trip(x in any::<f64>()) {
        prop_assume!(x.is_finite());
        let s = miniscript::number_to_string(x);
        let back: f64 = s.parse().unwrap();
        prop_assert_eq!(back, x, "via {}", s);
    }

    #[test]
    fn upper_and_lower_are_idempotent(s in "[a-zA-Z ]{0,20}") {
        let out = common::run(&format!(
            "print \"{s}\".upper == \"{s}\".upper.upper\nprint \"{s}\".lower == \"{s}\".lower.lower"
        ));
        prop_assert_eq!(out, vec!["1".to_string(), "1".to_string()]);
    }

    #[test]
    fn range_has_expected_length(a in 0i64..40, b in 0i64..40) {
        prop_assume!(a <= b);
        let out = common::run(&format!("print range({a}, {b}).len"));
        prop_assert_eq!(out, vec![(b - a + 1).to_string()]);
    }

    #[test]
    fn has_index_matches_bounds(len in 1usize..8, idx in -10i64..10) {
        let list = (0..len).map(|i| i.to_string()).collect::<Vec<_>>().join(", ");
        let expected = i64::from(idx >= -(len as i64) && idx < len as i64);
        let out = common::run(&format!("print [{list}].hasIndex({idx})"));
        prop_assert_eq!(out, vec![expected.to_string()]);
    }

    #[test]
    fn equality_is_commutative(a in -100i64..100, b in -100i64..100) {
        let out = common::run(&format!("print ({a} == {b}) == ({b} == {a})"));
        prop_assert_eq!(out, vec!["1".to_string()]);
    }

    #[test]
    fn isa_holds_through_new(n in 1usize..5) {
        // chains of `new` keep isa-ness all the way up
        let mut src = String::from("P0 = {}\n");
        for i in 1..=n {
            src.push_str(&format!("P{i} = new P{}\n", i - 1));
        }
        src.push_str(&format!("print P{n} isa P0"));
        let out = common::run(&src);
        prop_assert_eq!(out, vec!["1".to_string()]);
    }
}
