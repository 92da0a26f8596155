//! Round settlement: scoring, allocation, approval and payout preparation.
//!
//! Computed results are advisory until an operator approves them (or uploads
//! an override). Payouts are built only from the stored approved result;
//! live aggregates are never re-derived at payout time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::info;

use crate::aggregator;
use crate::allocator;
use crate::db;
use crate::errors::{Result, SettlementError};
use crate::payout::{self, PayoutCallData};
use crate::registry::Actor;
use crate::types::{ApprovedResult, Round, RoundResults};

async fn load_round(pool: &SqlitePool, round_id: i64) -> Result<Round> {
    db::get_round(pool, round_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("round {round_id}")))
}

/// Operator creates a round before it opens.
pub async fn create_round(
    pool: &SqlitePool,
    title: &str,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    matching_pool: Decimal,
    actor: &Actor,
) -> Result<Round> {
    actor.require_operator()?;
    if title.trim().is_empty() {
        return Err(SettlementError::InvalidInput("round title is required".into()));
    }
    if end_at <= start_at {
        return Err(SettlementError::InvalidInput(
            "round must end after it starts".into(),
        ));
    }
    if matching_pool.is_sign_negative() {
        return Err(SettlementError::InvalidInput(
            "matching pool cannot be negative".into(),
        ));
    }

    let id = db::insert_round(pool, title.trim(), start_at, end_at, matching_pool).await?;
    info!(round_id = id, %matching_pool, "Round created");
    load_round(pool, id).await
}

pub async fn get_round(pool: &SqlitePool, round_id: i64) -> Result<Round> {
    load_round(pool, round_id).await
}

/// A confirmed or pending donation reported by the payment subsystem.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub campaign_id: String,
    pub contributor: String,
    pub amount: String,
    pub payment_status: String,
    pub humanity_score: Option<f64>,
}

pub async fn record_contribution(
    pool: &SqlitePool,
    round_id: i64,
    contribution: NewContribution,
    now: DateTime<Utc>,
) -> Result<i64> {
    let amount = Decimal::from_str(contribution.amount.trim())
        .ok()
        .filter(|a| !a.is_sign_negative())
        .ok_or_else(|| {
            SettlementError::InvalidInput(format!(
                "amount {:?} is not a non-negative decimal",
                contribution.amount
            ))
        })?;
    if contribution.contributor.trim().is_empty() {
        return Err(SettlementError::InvalidInput("contributor is required".into()));
    }
    if contribution.humanity_score.is_some_and(|s| !s.is_finite()) {
        return Err(SettlementError::InvalidInput(
            "humanity score must be finite".into(),
        ));
    }

    load_round(pool, round_id).await?;
    if db::get_registration(pool, round_id, &contribution.campaign_id)
        .await?
        .is_none()
    {
        return Err(SettlementError::NotFound(format!(
            "campaign {} is not registered to round {round_id}",
            contribution.campaign_id
        )));
    }

    db::insert_contribution(
        pool,
        round_id,
        &contribution.campaign_id,
        contribution.contributor.trim(),
        amount,
        contribution.payment_status.trim(),
        contribution.humanity_score,
        now.timestamp(),
    )
    .await
}

/// Score every candidate campaign and suggest its share of the pool.
/// Nothing is persisted.
pub async fn compute_results(
    pool: &SqlitePool,
    round_id: i64,
    min_humanity_score: f64,
    now: DateTime<Utc>,
) -> Result<RoundResults> {
    let round = load_round(pool, round_id).await?;
    let registrations = db::list_registrations(pool, round_id).await?;
    let contributions = db::list_contributions(pool, round_id).await?;

    let (mut campaigns, totals) =
        aggregator::aggregate(&registrations, &contributions, min_humanity_score);
    if campaigns.is_empty() {
        return Err(SettlementError::NoCampaigns);
    }
    allocator::apply(&mut campaigns, round.matching_pool)?;

    info!(
        round_id,
        campaigns = campaigns.len(),
        contributions = totals.total_contributions,
        total_score = totals.total_score,
        "Round results computed"
    );

    Ok(RoundResults {
        round_id,
        computed_at: now,
        matching_pool: round.matching_pool,
        min_humanity_score,
        totals,
        campaigns,
    })
}

/// Compute and commit the result as the round's binding distribution.
pub async fn approve_computed(
    pool: &SqlitePool,
    round_id: i64,
    min_humanity_score: f64,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<ApprovedResult> {
    actor.require_operator()?;
    let round = load_round(pool, round_id).await?;
    if round.matching_pool <= Decimal::ZERO {
        return Err(SettlementError::NoMatchingPool);
    }

    let results = compute_results(pool, round_id, min_humanity_score, now).await?;
    let approved = ApprovedResult::Computed(results);
    db::save_approved_result(pool, round_id, &approved).await?;

    info!(round_id, actor = %actor.id, "Computed result approved");
    Ok(approved)
}

pub async fn approved_result(pool: &SqlitePool, round_id: i64) -> Result<ApprovedResult> {
    load_round(pool, round_id)
        .await?
        .approved_result
        .ok_or_else(|| {
            SettlementError::NotFound(format!("round {round_id} has no approved result"))
        })
}

/// Payout call data for the round's approved result.
pub async fn build_round_payout(
    pool: &SqlitePool,
    round_id: i64,
    strategy_address: &str,
    decimals: u32,
) -> Result<PayoutCallData> {
    let approved = approved_result(pool, round_id).await?;
    payout::build_payout(strategy_address, &approved.campaign_rows(), decimals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;
    use crate::types::{RegistrationStatus, PAYMENT_CONFIRMED};

    const A: &str = "0x000000000000000000000000000000000000000a";
    const B: &str = "0x000000000000000000000000000000000000000b";
    const STRATEGY: &str = "0x5555555555555555555555555555555555555555";

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn operator() -> Actor {
        Actor {
            id: "op".into(),
            is_operator: true,
        }
    }

    fn donation(campaign: &str, contributor: &str, amount: &str) -> NewContribution {
        NewContribution {
            campaign_id: campaign.into(),
            contributor: contributor.into(),
            amount: amount.into(),
            payment_status: PAYMENT_CONFIRMED.into(),
            humanity_score: Some(75.0),
        }
    }

    async fn round_with_pool(pool: &SqlitePool, matching_pool: i64) -> i64 {
        create_round(
            pool,
            "QF round",
            at(0),
            at(1_000),
            Decimal::new(matching_pool, 0),
            &operator(),
        )
        .await
        .unwrap()
        .id
    }

    async fn seed_example(pool: &SqlitePool, round: i64) {
        registry::register(pool, round, "A", "owner-a", A, at(1)).await.unwrap();
        registry::register(pool, round, "B", "owner-b", B, at(1)).await.unwrap();
        for (campaign, who, amount) in [("A", "u1", "100"), ("A", "u2", "400"), ("B", "u3", "100")]
        {
            record_contribution(pool, round, donation(campaign, who, amount), at(2))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn end_to_end_example_allocates_900_and_100() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        seed_example(&pool, round).await;

        let results = compute_results(&pool, round, 50.0, at(2_000)).await.unwrap();
        assert_eq!(results.totals.total_score, 1000.0);
        assert_eq!(results.campaigns[0].score, 900.0);
        assert_eq!(results.campaigns[1].score, 100.0);
        assert_eq!(results.campaigns[0].suggested_match, Decimal::new(90000, 2));
        assert_eq!(results.campaigns[1].suggested_match, Decimal::new(10000, 2));

        // Not persisted until approved.
        assert!(approved_result(&pool, round).await.is_err());

        approve_computed(&pool, round, 50.0, &operator(), at(2_000))
            .await
            .unwrap();
        let payout = build_round_payout(&pool, round, STRATEGY, 6).await.unwrap();
        assert_eq!(payout.recipients, vec![A.to_string(), B.to_string()]);
        assert_eq!(
            payout.amounts,
            vec!["900000000".to_string(), "100000000".to_string()]
        );
    }

    #[tokio::test]
    async fn every_registered_campaign_appears_once() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        registry::register(&pool, round, "A", "owner-a", A, at(1)).await.unwrap();
        registry::register(&pool, round, "B", "owner-b", B, at(1)).await.unwrap();

        let results = compute_results(&pool, round, 50.0, at(2_000)).await.unwrap();
        let ids: Vec<&str> = results.campaigns.iter().map(|c| c.campaign_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert!(results
            .campaigns
            .iter()
            .all(|c| c.score == 0.0 && c.suggested_match == Decimal::ZERO));
    }

    #[tokio::test]
    async fn round_without_campaigns_cannot_be_settled() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        let err = compute_results(&pool, round, 50.0, at(2_000)).await.unwrap_err();
        assert!(matches!(err, SettlementError::NoCampaigns));
    }

    #[tokio::test]
    async fn approving_without_pool_fails() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 0).await;
        seed_example(&pool, round).await;

        let preview = compute_results(&pool, round, 50.0, at(2_000)).await.unwrap();
        assert!(preview
            .campaigns
            .iter()
            .all(|c| c.suggested_match == Decimal::ZERO));

        let err = approve_computed(&pool, round, 50.0, &operator(), at(2_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NoMatchingPool));
    }

    #[tokio::test]
    async fn threshold_filters_low_humanity_scores() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        seed_example(&pool, round).await;

        let strict = compute_results(&pool, round, 80.0, at(2_000)).await.unwrap();
        assert_eq!(strict.totals.total_contributions, 0);
        assert_eq!(strict.min_humanity_score, 80.0);
    }

    #[tokio::test]
    async fn rejected_campaigns_are_not_scored() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        seed_example(&pool, round).await;
        registry::reject(&pool, round, "B", &operator(), at(3)).await.unwrap();

        let results = compute_results(&pool, round, 50.0, at(2_000)).await.unwrap();
        assert_eq!(results.campaigns.len(), 1);
        assert_eq!(results.campaigns[0].suggested_match, Decimal::new(1000, 0));

        let regs = db::list_registrations(&pool, round).await.unwrap();
        assert_eq!(regs[1].status, RegistrationStatus::Rejected);
    }

    #[tokio::test]
    async fn contributions_need_registered_campaign_and_valid_amount() {
        let pool = db::test_pool().await;
        let round = round_with_pool(&pool, 1000).await;
        registry::register(&pool, round, "A", "owner-a", A, at(1)).await.unwrap();

        let err = record_contribution(&pool, round, donation("Z", "u1", "5"), at(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));

        let err = record_contribution(&pool, round, donation("A", "u1", "-5"), at(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn round_validation() {
        let pool = db::test_pool().await;
        let err = create_round(&pool, "x", at(10), at(5), Decimal::ONE, &operator())
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));

        let someone = Actor {
            id: "u".into(),
            is_operator: false,
        };
        let err = create_round(&pool, "x", at(0), at(5), Decimal::ONE, &someone)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Forbidden(_)));

        let err = get_round(&pool, 99).await.unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }
}
