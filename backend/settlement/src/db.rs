//! Database layer: migrations and queries for rounds, registrations and
//! contributions.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{Result, SettlementError};
use crate::types::{
    ApprovedResult, Contribution, RecipientRegistration, RegistrationRecord, RegistrationStatus,
    Round, RoundRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Single-connection in-memory pool; every connection would otherwise see
/// its own empty database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        SettlementError::InvalidState(format!("stored timestamp {secs} out of range"))
    })
}

// ─────────────────────────────────────────────────────────
// Rounds
// ─────────────────────────────────────────────────────────

pub async fn insert_round(
    pool: &SqlitePool,
    title: &str,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    matching_pool: Decimal,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO rounds (title, start_at, end_at, matching_pool)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(title)
    .bind(start_at.timestamp())
    .bind(end_at.timestamp())
    .bind(matching_pool.to_string())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Load a round, decoding its stored pool amount and approved result.
pub async fn get_round(pool: &SqlitePool, round_id: i64) -> Result<Option<Round>> {
    let record = sqlx::query_as::<_, RoundRecord>(
        r#"
        SELECT id, title, start_at, end_at, matching_pool, approved_result
        FROM   rounds
        WHERE  id = ?1
        "#,
    )
    .bind(round_id)
    .fetch_optional(pool)
    .await?;

    record.map(round_from_record).transpose()
}

fn round_from_record(record: RoundRecord) -> Result<Round> {
    let matching_pool = Decimal::from_str(&record.matching_pool).map_err(|_| {
        SettlementError::InvalidState(format!(
            "round {} has a corrupt matching pool {:?}",
            record.id, record.matching_pool
        ))
    })?;
    let approved_result = record
        .approved_result
        .as_deref()
        .map(serde_json::from_str::<ApprovedResult>)
        .transpose()?;

    Ok(Round {
        id: record.id,
        title: record.title,
        start_at: timestamp(record.start_at)?,
        end_at: timestamp(record.end_at)?,
        matching_pool,
        approved_result,
    })
}

/// Replace (never merge) the round's approved result.
pub async fn save_approved_result(
    pool: &SqlitePool,
    round_id: i64,
    result: &ApprovedResult,
) -> Result<()> {
    let blob = serde_json::to_string(result)?;
    let rows = sqlx::query("UPDATE rounds SET approved_result = ?1 WHERE id = ?2")
        .bind(blob)
        .bind(round_id)
        .execute(pool)
        .await?
        .rows_affected();
    if rows == 0 {
        return Err(SettlementError::NotFound(format!("round {round_id}")));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Registrations
// ─────────────────────────────────────────────────────────

const REGISTRATION_COLUMNS: &str = "id, round_id, campaign_id, submitter, status, \
     onchain_recipient_id, tx_ref, recipient_address, created_at, updated_at";

fn registration_from_record(record: RegistrationRecord) -> Result<RecipientRegistration> {
    let status = RegistrationStatus::parse(&record.status).ok_or_else(|| {
        SettlementError::InvalidState(format!(
            "registration {} has unknown status {:?}",
            record.id, record.status
        ))
    })?;
    Ok(RecipientRegistration {
        id: record.id,
        round_id: record.round_id,
        campaign_id: record.campaign_id,
        submitter: record.submitter,
        status,
        onchain_recipient_id: record.onchain_recipient_id,
        tx_ref: record.tx_ref,
        recipient_address: record.recipient_address,
        created_at: record.created_at,
        updated_at: record.updated_at,
    })
}

/// Insert a `pending` registration. The `(round_id, campaign_id)` unique
/// constraint surfaces as a database error for the caller to classify.
pub async fn insert_registration(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    submitter: &str,
    recipient_address: &str,
    now: i64,
) -> std::result::Result<i64, sqlx::Error> {
    let id = sqlx::query(
        r#"
        INSERT INTO registrations
            (round_id, campaign_id, submitter, status, recipient_address, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?5)
        "#,
    )
    .bind(round_id)
    .bind(campaign_id)
    .bind(submitter)
    .bind(recipient_address)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn get_registration(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
) -> Result<Option<RecipientRegistration>> {
    let record = sqlx::query_as::<_, RegistrationRecord>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE round_id = ?1 AND campaign_id = ?2"
    ))
    .bind(round_id)
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;

    record.map(registration_from_record).transpose()
}

/// All registrations of a round, oldest first.
pub async fn list_registrations(
    pool: &SqlitePool,
    round_id: i64,
) -> Result<Vec<RecipientRegistration>> {
    let records = sqlx::query_as::<_, RegistrationRecord>(&format!(
        "SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE round_id = ?1 ORDER BY id ASC"
    ))
    .bind(round_id)
    .fetch_all(pool)
    .await?;

    records.into_iter().map(registration_from_record).collect()
}

/// Conditionally move a registration from `pending` to `approved`.
///
/// The status guard lives in the `WHERE` clause so two concurrent confirms
/// cannot both succeed; returns the number of rows changed (0 or 1).
pub async fn approve_pending_registration(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    tx_ref: &str,
    onchain_recipient_id: &str,
    recipient_address: &str,
    now: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE registrations
        SET    status = 'approved',
               tx_ref = ?3,
               onchain_recipient_id = ?4,
               recipient_address = ?5,
               updated_at = ?6
        WHERE  round_id = ?1 AND campaign_id = ?2 AND status = 'pending'
        "#,
    )
    .bind(round_id)
    .bind(campaign_id)
    .bind(tx_ref)
    .bind(onchain_recipient_id)
    .bind(recipient_address)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

pub async fn reject_registration(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    now: i64,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE registrations
        SET    status = 'rejected', updated_at = ?3
        WHERE  round_id = ?1 AND campaign_id = ?2 AND status != 'rejected'
        "#,
    )
    .bind(round_id)
    .bind(campaign_id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

/// Delete a registration only if it still has the status the caller checked.
pub async fn delete_registration(
    pool: &SqlitePool,
    registration_id: i64,
    expected_status: RegistrationStatus,
) -> Result<u64> {
    let rows = sqlx::query("DELETE FROM registrations WHERE id = ?1 AND status = ?2")
        .bind(registration_id)
        .bind(expected_status.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn insert_contribution(
    pool: &SqlitePool,
    round_id: i64,
    campaign_id: &str,
    contributor: &str,
    amount: Decimal,
    payment_status: &str,
    humanity_score: Option<f64>,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO contributions
            (round_id, campaign_id, contributor, amount, payment_status, humanity_score, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(round_id)
    .bind(campaign_id)
    .bind(contributor)
    .bind(amount.to_string())
    .bind(payment_status)
    .bind(humanity_score)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Every contribution recorded against the round, in insertion order.
/// Eligibility filtering happens in the aggregator.
pub async fn list_contributions(pool: &SqlitePool, round_id: i64) -> Result<Vec<Contribution>> {
    let rows = sqlx::query_as::<_, Contribution>(
        r#"
        SELECT id, round_id, campaign_id, contributor, amount, payment_status,
               humanity_score, created_at
        FROM   contributions
        WHERE  round_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(round_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
