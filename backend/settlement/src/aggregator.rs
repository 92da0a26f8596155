//! Contribution aggregation and quadratic-funding scoring.
//!
//! For each campaign, eligible donations are first summed per contributor,
//! then scored as `(Σ sqrt(contributor_total))²`. Merging before the square
//! root matters: two donations from one person must count as one voice.
//!
//! Money is summed with [`Decimal`]; only the square root and the score
//! leave exact arithmetic.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::types::{
    CampaignAggregate, Contribution, ContributorTotal, RecipientRegistration, RegistrationStatus,
    RoundTotals,
};

pub const DEFAULT_MIN_HUMANITY_SCORE: f64 = 50.0;

const SCORE_DECIMALS: i32 = 6;
const MONEY_DECIMALS: u32 = 2;

#[derive(Default)]
struct CampaignBucket<'a> {
    contributions: u64,
    per_contributor: BTreeMap<&'a str, Decimal>,
}

fn is_eligible(contribution: &Contribution, min_humanity_score: f64) -> bool {
    contribution.is_confirmed()
        && contribution
            .humanity_score
            .map(|s| s >= min_humanity_score)
            .unwrap_or(false)
}

fn parse_amount(contribution: &Contribution) -> Option<Decimal> {
    match Decimal::from_str(contribution.amount.trim()) {
        Ok(amount) if !amount.is_sign_negative() => Some(amount),
        _ => {
            warn!(
                contribution_id = contribution.id,
                amount = %contribution.amount,
                "Skipping contribution with unusable amount"
            );
            None
        }
    }
}

/// Quadratic-funding score of a set of per-contributor totals.
pub fn qf_score<'a>(totals: impl IntoIterator<Item = &'a Decimal>) -> f64 {
    let root_sum: f64 = totals
        .into_iter()
        .map(|t| t.to_f64().unwrap_or(0.0).max(0.0).sqrt())
        .sum();
    root_sum * root_sum
}

pub fn round_score(score: f64) -> f64 {
    let factor = 10f64.powi(SCORE_DECIMALS);
    (score * factor).round() / factor
}

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
}

/// Build one aggregate row per non-rejected registration, in registration
/// order, plus the round-wide totals. `suggested_match` is left at zero for
/// the allocator to fill in.
pub fn aggregate(
    registrations: &[RecipientRegistration],
    contributions: &[Contribution],
    min_humanity_score: f64,
) -> (Vec<CampaignAggregate>, RoundTotals) {
    let candidates: Vec<&RecipientRegistration> = registrations
        .iter()
        .filter(|r| r.status != RegistrationStatus::Rejected)
        .collect();

    let mut buckets: HashMap<&str, CampaignBucket> = candidates
        .iter()
        .map(|r| (r.campaign_id.as_str(), CampaignBucket::default()))
        .collect();

    for contribution in contributions {
        if !is_eligible(contribution, min_humanity_score) {
            continue;
        }
        let Some(bucket) = buckets.get_mut(contribution.campaign_id.as_str()) else {
            continue;
        };
        let Some(amount) = parse_amount(contribution) else {
            continue;
        };
        bucket.contributions += 1;
        *bucket
            .per_contributor
            .entry(contribution.contributor.as_str())
            .or_default() += amount;
    }

    let mut totals = RoundTotals::default();
    let mut raw_donations = Decimal::ZERO;
    let mut campaigns = Vec::with_capacity(candidates.len());

    for registration in candidates {
        let bucket = buckets
            .remove(registration.campaign_id.as_str())
            .unwrap_or_default();

        let donated: Decimal = bucket.per_contributor.values().copied().sum();
        let score = round_score(qf_score(bucket.per_contributor.values()));
        let unique_contributors = bucket.per_contributor.len() as u64;

        raw_donations += donated;
        totals.total_contributions += bucket.contributions;
        totals.unique_contributors += unique_contributors;
        totals.total_score += score;

        campaigns.push(CampaignAggregate {
            campaign_id: registration.campaign_id.clone(),
            recipient_address: registration.recipient_address.clone(),
            contributors: bucket
                .per_contributor
                .into_iter()
                .map(|(contributor, total)| ContributorTotal {
                    contributor: contributor.to_string(),
                    total,
                })
                .collect(),
            contributions: bucket.contributions,
            unique_contributors,
            total_donations: round_money(donated),
            score,
            suggested_match: Decimal::ZERO,
        });
    }

    totals.total_donations = round_money(raw_donations);
    totals.total_score = round_score(totals.total_score);
    (campaigns, totals)
}
