//! Point reconciliation across task variants.
//!
//! Both variants usually observe the same account balance before they
//! start. Summing their baselines would double count, so the reconciled
//! baseline is the minimum reported value and the final balance is that
//! baseline plus everything collected.

use std::collections::BTreeMap;

use crate::job::{TaskOutcome, Variant};

/// Reconciled totals for one job attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Baseline used for the job (minimum of reported baselines, or 0).
    pub initial_total: u64,
    /// `initial_total + Σ collected`.
    pub final_total: u64,
    /// `final_total - initial_total`.
    pub total_collected: u64,
    /// Spread between the highest and lowest reported baseline.
    pub baseline_discrepancy: u64,
    /// Collected points per category.
    pub points: BTreeMap<String, u64>,
}

/// Reconcile the outcomes of the variants that succeeded.
///
/// # Example
///
/// ```
/// use drover::job::{TaskOutcome, Variant};
/// use drover::pipeline::points::reconcile;
///
/// let totals = reconcile(&[
///     (Variant::Primary, TaskOutcome::new(100, 5)),
///     (Variant::Secondary, TaskOutcome::new(100, 7)),
/// ]);
/// assert_eq!(totals.initial_total, 100);
/// assert_eq!(totals.total_collected, 12);
/// ```
#[must_use]
pub fn reconcile(outcomes: &[(Variant, TaskOutcome)]) -> Reconciliation {
    let baselines: Vec<u64> = outcomes
        .iter()
        .filter_map(|(_, outcome)| outcome.initial_points)
        .collect();

    let initial_total = baselines.iter().copied().min().unwrap_or(0);
    let highest = baselines.iter().copied().max().unwrap_or(0);

    let mut points = BTreeMap::new();
    let mut collected: u64 = 0;
    for (variant, outcome) in outcomes {
        collected = collected.saturating_add(outcome.collected_points);
        if outcome.categories.is_empty() {
            *points.entry(variant.as_str().to_string()).or_insert(0) += outcome.collected_points;
        } else {
            for (category, value) in &outcome.categories {
                *points.entry(category.clone()).or_insert(0) += *value;
            }
        }
    }

    let final_total = initial_total.saturating_add(collected);
    Reconciliation {
        initial_total,
        final_total,
        total_collected: final_total - initial_total,
        baseline_discrepancy: highest - initial_total,
        points,
    }
}
