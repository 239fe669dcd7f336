//! Candidate scoring.
//!
//! Five factors in [0, 1] per candidate — quality, cost, speed,
//! availability, reliability — plus contextual modifiers. Strategies
//! decide how the factors are weighed; the numbers themselves are
//! computed here.

use serde::Serialize;

/// Normalization ceilings. A request at or above the ceiling scores 0
/// on that factor.
pub const COST_CEILING_USD: f64 = 0.05;
pub const LATENCY_CEILING_MS: f64 = 10_000.0;

/// Default factor weights for the `balanced` strategy:
/// quality / cost / speed / availability / reliability.
pub const DEFAULT_WEIGHTS: [f64; 5] = [0.3, 0.2, 0.2, 0.15, 0.15];

/// Applied to the matching factor when the caller signals urgency or a
/// strict budget.
pub const CONTEXT_BOOST: f64 = 1.5;

/// Score multiplier for providers whose rate budget is exhausted this
/// window: they stay eligible but sink in the ordering.
pub const RATE_EXHAUSTED_WEIGHT: f64 = 0.5;

/// Raw inputs for one candidate.
#[derive(Debug, Clone)]
pub struct ScoreInputs {
    /// Declared model quality in [0, 1].
    pub quality: f64,
    /// Estimated cost of this request in USD.
    pub estimated_cost: f64,
    /// Observed p75 latency, ms. `None` falls back to the ceiling
    /// midpoint so unobserved candidates are neither punished nor
    /// favored.
    pub p75_latency_ms: Option<f64>,
    /// Circuit state: an open circuit zeroes availability (and the
    /// candidate is excluded before scoring; this is belt-and-braces).
    pub circuit_open: bool,
    /// Remaining fraction of the provider's rate budget, [0, 1].
    pub rate_remaining_ratio: f64,
    /// Success-rate EMA with smoothing; 0.8 prior without history.
    pub reliability: f64,
    /// Budget exhausted this window.
    pub rate_exhausted: bool,
}

/// Context signals that modify the factors before sorting.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreModifiers {
    pub urgency: bool,
    pub budget_conscious: bool,
}

/// The factor breakdown recorded in every routing decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub quality: f64,
    pub cost_score: f64,
    pub speed_score: f64,
    pub availability: f64,
    pub reliability: f64,
    pub total: f64,
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Compute the factor breakdown with the given weights.
pub fn score(inputs: &ScoreInputs, modifiers: ScoreModifiers, weights: &[f64; 5]) -> ScoreBreakdown {
    let mut cost_score = 1.0 - clamp01(inputs.estimated_cost / COST_CEILING_USD);
    let p75 = inputs.p75_latency_ms.unwrap_or(LATENCY_CEILING_MS / 2.0);
    let mut speed_score = 1.0 - clamp01(p75 / LATENCY_CEILING_MS);

    let availability = if inputs.circuit_open {
        0.0
    } else {
        clamp01(inputs.rate_remaining_ratio)
    };

    if modifiers.urgency {
        speed_score *= CONTEXT_BOOST;
    }
    if modifiers.budget_conscious {
        cost_score *= CONTEXT_BOOST;
    }

    let factors = [
        inputs.quality,
        cost_score,
        speed_score,
        availability,
        inputs.reliability,
    ];
    let mut total: f64 = factors.iter().zip(weights).map(|(f, w)| f * w).sum();
    if inputs.rate_exhausted {
        total *= RATE_EXHAUSTED_WEIGHT;
    }

    ScoreBreakdown {
        quality: inputs.quality,
        cost_score,
        speed_score,
        availability,
        reliability: inputs.reliability,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> ScoreInputs {
        ScoreInputs {
            quality: 0.9,
            estimated_cost: 0.01,
            p75_latency_ms: Some(1_000.0),
            circuit_open: false,
            rate_remaining_ratio: 0.8,
            reliability: 0.95,
            rate_exhausted: false,
        }
    }

    #[test]
    fn factors_land_in_expected_ranges() {
        let b = score(&inputs(), ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        assert!((b.cost_score - 0.8).abs() < 1e-9);
        assert!((b.speed_score - 0.9).abs() < 1e-9);
        assert!((b.availability - 0.8).abs() < 1e-9);
        assert!(b.total > 0.0 && b.total <= 1.0);
    }

    #[test]
    fn open_circuit_zeroes_availability() {
        let mut i = inputs();
        i.circuit_open = true;
        let b = score(&i, ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        assert_eq!(b.availability, 0.0);
    }

    #[test]
    fn urgency_boosts_speed_factor() {
        let plain = score(&inputs(), ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        let urgent = score(
            &inputs(),
            ScoreModifiers {
                urgency: true,
                budget_conscious: false,
            },
            &DEFAULT_WEIGHTS,
        );
        assert!(urgent.speed_score > plain.speed_score);
        assert!(urgent.total > plain.total);
    }

    #[test]
    fn exhausted_budget_halves_total_but_keeps_candidate() {
        let plain = score(&inputs(), ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        let mut i = inputs();
        i.rate_exhausted = true;
        let exhausted = score(&i, ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        assert!((exhausted.total - plain.total * RATE_EXHAUSTED_WEIGHT).abs() < 1e-9);
        assert!(exhausted.total > 0.0);
    }

    #[test]
    fn unobserved_latency_scores_midway() {
        let mut i = inputs();
        i.p75_latency_ms = None;
        let b = score(&i, ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        assert!((b.speed_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn expensive_request_bottoms_out_cost_score() {
        let mut i = inputs();
        i.estimated_cost = 1.0;
        let b = score(&i, ScoreModifiers::default(), &DEFAULT_WEIGHTS);
        assert_eq!(b.cost_score, 0.0);
    }
}
