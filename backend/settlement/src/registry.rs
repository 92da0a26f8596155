//! Recipient registry: the campaign ↔ round candidacy lifecycle.
//!
//! Every precondition is checked before the single write that performs the
//! transition, so a failed call never leaves a partial record behind.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::db;
use crate::errors::{Result, SettlementError};
use crate::types::{RecipientRegistration, RegistrationStatus, Round};

/// The caller on whose behalf a mutation is made. Authentication happens
/// upstream; the identity is trusted as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub is_operator: bool,
}

impl Actor {
    pub fn require_operator(&self) -> Result<()> {
        if self.is_operator {
            Ok(())
        } else {
            Err(SettlementError::Forbidden(format!(
                "{} is not a round operator",
                self.id
            )))
        }
    }
}

async fn load_round(pool: &SqlitePool, round_id: i64) -> Result<Round> {
    db::get_round(pool, round_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("round {round_id}")))
}

fn not_found(round_id: i64, campaign_id: &str) -> SettlementError {
    SettlementError::NotFound(format!(
        "registration for campaign {campaign_id} in round {round_id}"
    ))
}

/// Create a `PENDING` registration for `(round, campaign)`.
pub async fn register(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    submitter: &str,
    recipient_address: &str,
    now: DateTime<Utc>,
) -> Result<RecipientRegistration> {
    if campaign_id.trim().is_empty() {
        return Err(SettlementError::InvalidInput("campaign id is required".into()));
    }
    if recipient_address.trim().is_empty() {
        return Err(SettlementError::InvalidInput(
            "recipient address is required".into(),
        ));
    }

    let round = load_round(pool, round_id).await?;
    if !round.is_open_at(now) {
        return Err(SettlementError::InvalidState(format!(
            "round {round_id} ended at {}",
            round.end_at
        )));
    }

    match db::insert_registration(
        pool,
        round_id,
        campaign_id,
        submitter,
        recipient_address.trim(),
        now.timestamp(),
    )
    .await
    {
        Ok(_) => {}
        Err(e)
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false) =>
        {
            return Err(SettlementError::Conflict(format!(
                "campaign {campaign_id} is already registered to round {round_id}"
            )));
        }
        Err(e) => return Err(e.into()),
    }

    info!(round_id, campaign_id, submitter, "Registration created");
    db::get_registration(pool, round_id, campaign_id)
        .await?
        .ok_or_else(|| not_found(round_id, campaign_id))
}

/// Move a `PENDING` registration to `APPROVED` once its on-chain
/// registration transaction is known.
pub async fn confirm_on_chain(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    tx_ref: &str,
    onchain_recipient_id: &str,
    recipient_address: &str,
    now: DateTime<Utc>,
) -> Result<RecipientRegistration> {
    if tx_ref.trim().is_empty() || onchain_recipient_id.trim().is_empty() {
        return Err(SettlementError::InvalidInput(
            "both a transaction reference and an on-chain recipient id are required".into(),
        ));
    }
    if recipient_address.trim().is_empty() {
        return Err(SettlementError::InvalidInput(
            "recipient address is required".into(),
        ));
    }

    let changed = db::approve_pending_registration(
        pool,
        round_id,
        campaign_id,
        tx_ref.trim(),
        onchain_recipient_id.trim(),
        recipient_address.trim(),
        now.timestamp(),
    )
    .await?;

    let current = db::get_registration(pool, round_id, campaign_id)
        .await?
        .ok_or_else(|| not_found(round_id, campaign_id))?;

    if changed == 0 {
        return Err(SettlementError::Conflict(format!(
            "registration for campaign {campaign_id} is {:?}, not PENDING",
            current.status
        )));
    }

    info!(round_id, campaign_id, tx_ref, "Registration confirmed on-chain");
    Ok(current)
}

/// Administrative rejection. Any non-rejected registration may be rejected.
pub async fn reject(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<RecipientRegistration> {
    actor.require_operator()?;

    let changed = db::reject_registration(pool, round_id, campaign_id, now.timestamp()).await?;
    let current = db::get_registration(pool, round_id, campaign_id)
        .await?
        .ok_or_else(|| not_found(round_id, campaign_id))?;

    if changed == 0 {
        return Err(SettlementError::Conflict(format!(
            "registration for campaign {campaign_id} is already rejected"
        )));
    }

    info!(round_id, campaign_id, actor = %actor.id, "Registration rejected");
    Ok(current)
}

/// Delete a registration. Nobody may delete after the round ends;
/// non-operators may only delete their own, non-approved entries.
pub async fn remove(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<()> {
    let round = load_round(pool, round_id).await?;
    let registration = db::get_registration(pool, round_id, campaign_id)
        .await?
        .ok_or_else(|| not_found(round_id, campaign_id))?;

    if !round.is_open_at(now) {
        return Err(SettlementError::InvalidState(format!(
            "round {round_id} has ended; registrations are frozen"
        )));
    }

    if !actor.is_operator {
        if registration.submitter != actor.id {
            return Err(SettlementError::Forbidden(format!(
                "{} did not submit this registration",
                actor.id
            )));
        }
        if registration.status == RegistrationStatus::Approved {
            return Err(SettlementError::InvalidState(
                "approved registrations can only be removed by an operator".into(),
            ));
        }
    }

    let deleted = db::delete_registration(pool, registration.id, registration.status).await?;
    if deleted == 0 {
        return Err(SettlementError::Conflict(format!(
            "registration for campaign {campaign_id} changed while being removed"
        )));
    }

    info!(round_id, campaign_id, actor = %actor.id, "Registration removed");
    Ok(())
}

pub async fn list(pool: &SqlitePool, round_id: i64) -> Result<Vec<RecipientRegistration>> {
    load_round(pool, round_id).await?;
    db::list_registrations(pool, round_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn owner() -> Actor {
        Actor {
            id: "alice".into(),
            is_operator: false,
        }
    }

    fn operator() -> Actor {
        Actor {
            id: "op".into(),
            is_operator: true,
        }
    }

    async fn setup() -> (SqlitePool, i64) {
        let pool = db::test_pool().await;
        let round = db::insert_round(&pool, "Round", at(0), at(1_000), Decimal::new(1000, 0))
            .await
            .unwrap();
        (pool, round)
    }

    #[tokio::test]
    async fn register_creates_pending_entry() {
        let (pool, round) = setup().await;
        let reg = register(&pool, round, "camp-a", "alice", "0xaa", at(10))
            .await
            .unwrap();
        assert_eq!(reg.status, RegistrationStatus::Pending);
        assert_eq!(reg.submitter, "alice");
        assert!(reg.tx_ref.is_none());
        assert!(reg.onchain_recipient_id.is_none());
    }

    #[tokio::test]
    async fn registering_twice_conflicts() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        let err = register(&pool, round, "camp-a", "bob", "0xbb", at(11))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_after_round_end_is_invalid_state() {
        let (pool, round) = setup().await;
        let err = register(&pool, round, "camp-a", "alice", "0xaa", at(1_001))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidState(_)));
        assert!(db::list_registrations(&pool, round).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_unknown_round_is_not_found() {
        let (pool, round) = setup().await;
        let err = register(&pool, round + 1, "camp-a", "alice", "0xaa", at(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[tokio::test]
    async fn confirm_moves_pending_to_approved_once() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();

        let reg = confirm_on_chain(&pool, round, "camp-a", "0xtx", "42", "0xcc", at(20))
            .await
            .unwrap();
        assert_eq!(reg.status, RegistrationStatus::Approved);
        assert_eq!(reg.tx_ref.as_deref(), Some("0xtx"));
        assert_eq!(reg.onchain_recipient_id.as_deref(), Some("42"));
        assert_eq!(reg.recipient_address, "0xcc");

        let err = confirm_on_chain(&pool, round, "camp-a", "0xtx2", "43", "0xcc", at(21))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));

        let stored = db::get_registration(&pool, round, "camp-a").await.unwrap().unwrap();
        assert_eq!(stored.tx_ref.as_deref(), Some("0xtx"));
    }

    #[tokio::test]
    async fn confirm_missing_registration_is_not_found() {
        let (pool, round) = setup().await;
        let err = confirm_on_chain(&pool, round, "ghost", "0xtx", "1", "0xaa", at(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[tokio::test]
    async fn confirm_rejected_registration_conflicts() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        reject(&pool, round, "camp-a", &operator(), at(11)).await.unwrap();

        let err = confirm_on_chain(&pool, round, "camp-a", "0xtx", "1", "0xaa", at(12))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));
    }

    #[tokio::test]
    async fn only_operators_reject() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();

        let err = reject(&pool, round, "camp-a", &owner(), at(11)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Forbidden(_)));

        reject(&pool, round, "camp-a", &operator(), at(11)).await.unwrap();
        let err = reject(&pool, round, "camp-a", &operator(), at(12)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Conflict(_)));
    }

    #[tokio::test]
    async fn owner_removes_own_pending_registration() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        remove(&pool, round, "camp-a", &owner(), at(11)).await.unwrap();
        assert!(db::get_registration(&pool, round, "camp-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn owner_cannot_remove_approved_but_operator_can() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        confirm_on_chain(&pool, round, "camp-a", "0xtx", "1", "0xaa", at(11))
            .await
            .unwrap();

        let err = remove(&pool, round, "camp-a", &owner(), at(12)).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidState(_)));

        remove(&pool, round, "camp-a", &operator(), at(12)).await.unwrap();
    }

    #[tokio::test]
    async fn strangers_cannot_remove() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        let mallory = Actor {
            id: "mallory".into(),
            is_operator: false,
        };
        let err = remove(&pool, round, "camp-a", &mallory, at(11)).await.unwrap_err();
        assert!(matches!(err, SettlementError::Forbidden(_)));
    }

    #[tokio::test]
    async fn nobody_removes_after_round_end() {
        let (pool, round) = setup().await;
        register(&pool, round, "camp-a", "alice", "0xaa", at(10)).await.unwrap();
        let err = remove(&pool, round, "camp-a", &operator(), at(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidState(_)));
    }
}
