//! Matching allocation: split the pool in proportion to score.
//!
//! Each share is rounded to cents on its own. The rounded shares can
//! therefore miss the pool by up to half a cent per campaign in either
//! direction; no remainder is redistributed. Operators who need the pool
//! to balance exactly adjust the result before approving it.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::aggregator::round_money;
use crate::errors::{Result, SettlementError};
use crate::types::CampaignAggregate;

/// Per-campaign match for each score, in the same order.
///
/// Each share is `pool × score / total`, with the ratio taken first so
/// that large scores cannot overflow the pool arithmetic. Negative or
/// non-finite scores count as zero. A zero pool or a zero score total
/// yields all zeros.
pub fn allocate(scores: &[f64], matching_pool: Decimal) -> Result<Vec<Decimal>> {
    let usable = |s: f64| if s.is_finite() && s > 0.0 { s } else { 0.0 };

    let mut unit = 1.0;
    let mut total: f64 = scores.iter().copied().map(usable).sum();
    if total.is_infinite() {
        // Sum overflowed; measure every score against the largest instead.
        unit = scores.iter().copied().map(usable).fold(0.0, f64::max);
        total = scores.iter().map(|s| usable(*s) / unit).sum();
    }
    if total <= 0.0 || matching_pool <= Decimal::ZERO {
        return Ok(vec![Decimal::ZERO; scores.len()]);
    }

    scores
        .iter()
        .map(|score| {
            let ratio = (usable(*score) / unit) / total;
            Decimal::from_f64(ratio)
                .and_then(|ratio| matching_pool.checked_mul(ratio))
                .map(round_money)
                .ok_or_else(|| {
                    SettlementError::InvalidInput(format!(
                        "cannot allocate {ratio} of matching pool {matching_pool}"
                    ))
                })
        })
        .collect()
}

/// Fill `suggested_match` on every aggregate.
pub fn apply(campaigns: &mut [CampaignAggregate], matching_pool: Decimal) -> Result<()> {
    let scores: Vec<f64> = campaigns.iter().map(|c| c.score).collect();
    let shares = allocate(&scores, matching_pool)?;
    for (campaign, amount) in campaigns.iter_mut().zip(shares) {
        campaign.suggested_match = amount;
    }
    Ok(())
}
