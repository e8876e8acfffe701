//! WRED curve evaluation and queue congestion coloring.

use crate::config::Percent;
use crate::packet::Color;
use crate::profile::{WredCurve, WredParams};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WredVerdict {
    Pass,
    /// The packet lost the draw; mark it if the profile allows, else drop.
    Congested,
}

fn lerp(from: u32, to: u32, pos: u32, span: u32) -> u32 {
    if span == 0 {
        return to;
    }
    from + (to - from) * pos / span
}

/// Drop probability for `fullness` on one curve.
pub(crate) fn drop_probability(curve: &WredCurve, fullness: Percent) -> Percent {
    if !curve.enabled || fullness < curve.min_threshold {
        return Percent::ZERO;
    }
    let f = fullness.raw() as u32;
    let min = curve.min_threshold.raw() as u32;
    let med = curve.med_threshold.raw() as u32;
    let med_prob = curve.med_drop_prob.raw() as u32;
    let max_prob = curve.max_drop_prob.raw() as u32;
    let full = Percent::HUNDRED.raw() as u32;

    let prob = if f < med {
        lerp(0, med_prob, f - min, med - min)
    } else if f < full {
        lerp(med_prob, max_prob, f - med, full - med)
    } else {
        max_prob
    };
    Percent::from_ratio(prob as u64, full as u64)
}

/// Draw against the curve selected by the packet color.
pub(crate) fn evaluate<R: Rng>(
    params: &WredParams,
    color: Color,
    fullness: Percent,
    rng: &mut R,
) -> WredVerdict {
    let prob = drop_probability(params.curve(color), fullness).raw();
    if prob == 0 {
        return WredVerdict::Pass;
    }
    if rng.gen_range(0..Percent::HUNDRED.raw()) < prob {
        WredVerdict::Congested
    } else {
        WredVerdict::Pass
    }
}

/// Green below the min threshold, yellow up to the medium one, red above.
pub(crate) fn congestion_color(curve: &WredCurve, fullness: Percent) -> Color {
    if !curve.enabled || fullness < curve.min_threshold {
        Color::Green
    } else if fullness <= curve.med_threshold {
        Color::Yellow
    } else {
        Color::Red
    }
}
