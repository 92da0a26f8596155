//! Operator override ingestion.
//!
//! An operator may replace a round's result with a hand-reviewed one. The
//! upload arrives as a JSON body, as an uploaded file, or as raw delimited
//! text; all three normalize to the same list of [`CampaignRow`]s.
//! Only the shape is validated. Once accepted the upload replaces the
//! stored result wholesale and is what payouts are built from.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::csv;
use crate::db;
use crate::errors::{Result, SettlementError};
use crate::registry::Actor;
use crate::types::{
    number_from_value, ApprovedResult, CampaignRow, CellWarning, OverrideSnapshot, OverrideSource,
};

/// An override as received from the transport layer.
#[derive(Debug, Clone)]
pub enum OverridePayload {
    /// Already-parsed object-notation body.
    Json(Value),
    /// Uploaded file; name and media type decide how it is read.
    File {
        file_name: Option<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
    /// Raw body that is not object notation.
    Text(String),
}

/// Whether an upload should be read as JSON rather than delimited text.
pub fn is_object_notation(file_name: Option<&str>, content_type: Option<&str>) -> bool {
    let by_name = file_name
        .map(|n| n.trim().to_ascii_lowercase().ends_with(".json"))
        .unwrap_or(false);
    let by_type = content_type
        .map(|t| t.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    by_name || by_type
}

fn rows_from_json(value: Value) -> Result<(Vec<CampaignRow>, Vec<CellWarning>)> {
    let Value::Array(items) = value else {
        return Err(SettlementError::InvalidInput(
            "approved result must be an array of campaign rows".into(),
        ));
    };

    let mut rows = Vec::with_capacity(items.len());
    let mut warnings = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        let Value::Object(fields) = item else {
            return Err(SettlementError::InvalidInput(format!(
                "campaign row {i} is not an object"
            )));
        };
        let row = CampaignRow::from_fields(fields);
        warnings.extend(numeric_warnings(&row, i + 1));
        rows.push(row);
    }
    Ok((rows, warnings))
}

/// Numeric fields whose value cannot be read as a number. The value stays
/// in the row untouched; amount lookups treat it as absent.
fn numeric_warnings(row: &CampaignRow, position: usize) -> Vec<CellWarning> {
    csv::NUMERIC_COLUMNS
        .iter()
        .filter_map(|column| {
            let value = row.fields().get(*column)?;
            let blank = match value {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                _ => false,
            };
            if blank || number_from_value(value).is_some() {
                return None;
            }
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            debug!(position, column, value = %raw, "Non-numeric value kept in override row");
            Some(CellWarning {
                line: position,
                column: column.to_string(),
                value: raw,
            })
        })
        .collect()
}

/// Normalize any accepted payload shape into an override snapshot.
pub fn normalize(
    round_id: i64,
    payload: OverridePayload,
    now: DateTime<Utc>,
) -> Result<OverrideSnapshot> {
    let snapshot = |source, campaigns, warnings| OverrideSnapshot {
        round_id,
        uploaded_at: now,
        source,
        campaigns,
        warnings,
    };

    match payload {
        OverridePayload::Json(value) => {
            let (rows, warnings) = rows_from_json(value)?;
            Ok(snapshot(OverrideSource::Json, rows, warnings))
        }
        OverridePayload::File {
            file_name,
            content_type,
            bytes,
        } if is_object_notation(file_name.as_deref(), content_type.as_deref()) => {
            let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
                SettlementError::InvalidInput(format!("uploaded file is not valid JSON: {e}"))
            })?;
            let (rows, warnings) = rows_from_json(value)?;
            Ok(snapshot(OverrideSource::JsonFile, rows, warnings))
        }
        OverridePayload::File { bytes, .. } => {
            let text = String::from_utf8(bytes).map_err(|_| {
                SettlementError::InvalidInput("uploaded file is not UTF-8 text".into())
            })?;
            let table = csv::parse_table(&text)?;
            Ok(snapshot(OverrideSource::DelimitedText, table.rows, table.warnings))
        }
        OverridePayload::Text(text) => {
            let table = csv::parse_table(&text)?;
            Ok(snapshot(OverrideSource::DelimitedText, table.rows, table.warnings))
        }
    }
}

/// Validate and commit an override as the round's approved result.
pub async fn ingest(
    pool: &SqlitePool,
    round_id: i64,
    payload: OverridePayload,
    actor: &Actor,
    now: DateTime<Utc>,
) -> Result<ApprovedResult> {
    actor.require_operator()?;
    if db::get_round(pool, round_id).await?.is_none() {
        return Err(SettlementError::NotFound(format!("round {round_id}")));
    }

    let snapshot = normalize(round_id, payload, now)?;
    info!(
        round_id,
        source = ?snapshot.source,
        campaigns = snapshot.campaigns.len(),
        warnings = snapshot.warnings.len(),
        actor = %actor.id,
        "Override accepted as approved result"
    );

    let result = ApprovedResult::Override(snapshot);
    db::save_approved_result(pool, round_id, &result).await?;
    Ok(result)
}
