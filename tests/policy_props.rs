use proptest::prelude::*;
use tigris_imageguard::policy::{Verdict, decide};

proptest! {
    #[test]
    fn bands_partition_unit_interval(
        c in 0.0f64..=1.0,
        rt in 0.05f64..0.9,
        gap in 0.01f64..0.5,
    ) {
        let dt = (rt + gap).min(1.0);
        prop_assume!(rt < dt);

        let d = decide(c, dt, rt);
        prop_assert!(!(d.flagged && d.requires_review));

        let expected = if c >= dt {
            Verdict::Flagged
        } else if c >= rt {
            Verdict::NeedsReview
        } else {
            Verdict::Pass
        };
        prop_assert_eq!(d.verdict(), expected);
    }

    #[test]
    fn lower_bounds_are_inclusive(rt in 0.05f64..0.5, gap in 0.01f64..0.4) {
        let dt = rt + gap;
        prop_assert_eq!(decide(dt, dt, rt).verdict(), Verdict::Flagged);
        prop_assert_eq!(decide(rt, dt, rt).verdict(), Verdict::NeedsReview);
    }
}

#[test]
fn default_thresholds_examples() {
    assert_eq!(decide(0.84, 0.85, 0.70).verdict(), Verdict::NeedsReview);
    assert_eq!(decide(0.69, 0.85, 0.70).verdict(), Verdict::Pass);
    assert_eq!(decide(0.9, 0.85, 0.70).verdict(), Verdict::Flagged);
}
