//! # Types
//!
//! Domain records shared by every stage of round settlement.
//!
//! ## Registration status as a finite-state machine
//!
//! ```text
//! Pending ──► Approved
//!    │           │
//!    └──► Rejected ◄┘
//! ```
//!
//! `Pending → Approved` happens only through an on-chain confirmation that
//! carries both a transaction reference and an on-chain recipient id.
//! `Rejected` is terminal.
//!
//! ## Approved result
//!
//! [`ApprovedResult`] is the binding distribution for a round. It is either
//! the computed output of the scorer and allocator, or an operator upload.
//! Both variants expose [`ApprovedResult::campaign_rows`] so the payout
//! encoder never has to inspect which one it was handed.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────
// Rounds
// ─────────────────────────────────────────────────────────

/// A matching event with a fixed pool to distribute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: i64,
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub matching_pool: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_result: Option<ApprovedResult>,
}

impl Round {
    /// Registrations may only be created or removed while this holds.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.end_at
    }
}

/// Raw `rounds` row as stored in SQLite.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoundRecord {
    pub id: i64,
    pub title: String,
    pub start_at: i64,
    pub end_at: i64,
    pub matching_pool: String,
    pub approved_result: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Registrations
// ─────────────────────────────────────────────────────────

/// Lifecycle status of a recipient registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationStatus {
    Pending,
    Approved,
    Rejected,
}

impl RegistrationStatus {
    /// Short identifier stored in the `registrations.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One campaign's candidacy in one round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientRegistration {
    pub id: i64,
    pub round_id: i64,
    pub campaign_id: String,
    pub submitter: String,
    pub status: RegistrationStatus,
    pub onchain_recipient_id: Option<String>,
    pub tx_ref: Option<String>,
    pub recipient_address: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Raw `registrations` row; `status` is validated on conversion.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RegistrationRecord {
    pub id: i64,
    pub round_id: i64,
    pub campaign_id: String,
    pub submitter: String,
    pub status: String,
    pub onchain_recipient_id: Option<String>,
    pub tx_ref: Option<String>,
    pub recipient_address: String,
    pub created_at: i64,
    pub updated_at: i64,
}

// ─────────────────────────────────────────────────────────
// Contributions
// ─────────────────────────────────────────────────────────

pub const PAYMENT_CONFIRMED: &str = "confirmed";

/// A donation written by the payment subsystem. `amount` stays text so that
/// no floating-point value ever touches the stored figure.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub id: i64,
    pub round_id: i64,
    pub campaign_id: String,
    pub contributor: String,
    pub amount: String,
    pub payment_status: String,
    pub humanity_score: Option<f64>,
    pub created_at: i64,
}

impl Contribution {
    pub fn is_confirmed(&self) -> bool {
        self.payment_status == PAYMENT_CONFIRMED
    }
}

// ─────────────────────────────────────────────────────────
// Settlement output
// ─────────────────────────────────────────────────────────

/// Sum of one contributor's eligible donations to one campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributorTotal {
    pub contributor: String,
    pub total: Decimal,
}

/// Per-campaign settlement row. Derived on every run, never persisted
/// except as part of an [`ApprovedResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignAggregate {
    pub campaign_id: String,
    pub recipient_address: String,
    pub contributors: Vec<ContributorTotal>,
    pub contributions: u64,
    pub unique_contributors: u64,
    /// Rounded to 2 places.
    pub total_donations: Decimal,
    /// Rounded to 6 places.
    pub score: f64,
    pub suggested_match: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundTotals {
    pub total_donations: Decimal,
    pub total_contributions: u64,
    /// Distinct (campaign, contributor) pairs.
    pub unique_contributors: u64,
    pub total_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResults {
    pub round_id: i64,
    pub computed_at: DateTime<Utc>,
    pub matching_pool: Decimal,
    pub min_humanity_score: f64,
    pub totals: RoundTotals,
    pub campaigns: Vec<CampaignAggregate>,
}

// ─────────────────────────────────────────────────────────
// Operator overrides
// ─────────────────────────────────────────────────────────

/// Keys that may carry a row's payout address, in priority order.
pub const RECIPIENT_KEYS: &[&str] = &["recipientAddress", "recipient", "payoutAddress"];

/// A campaign row as stored in an approved result. The row is kept
/// verbatim; typed values are read through accessors so that an uploaded
/// object is stored exactly as it was sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignRow {
    fields: Map<String, Value>,
}

impl CampaignRow {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// First non-empty string among [`RECIPIENT_KEYS`].
    pub fn recipient_address(&self) -> Option<&str> {
        RECIPIENT_KEYS.iter().find_map(|key| {
            self.fields
                .get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
    }

    /// Finite numeric value under `key`; numeric strings count.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(number_from_value)
    }

    pub fn suggested_match(&self) -> Option<f64> {
        self.number("suggestedMatch")
    }

    pub fn amount(&self) -> Option<f64> {
        self.number("amount")
    }

    pub fn payout_scaled(&self) -> Option<f64> {
        self.number("payoutScaled")
    }
}

impl From<&CampaignAggregate> for CampaignRow {
    fn from(agg: &CampaignAggregate) -> Self {
        let mut fields = Map::new();
        fields.insert("campaignId".into(), Value::String(agg.campaign_id.clone()));
        fields.insert(
            "recipientAddress".into(),
            Value::String(agg.recipient_address.clone()),
        );
        fields.insert("contributions".into(), Value::from(agg.contributions));
        fields.insert(
            "uniqueContributors".into(),
            Value::from(agg.unique_contributors),
        );
        fields.insert(
            "totalDonations".into(),
            Value::String(agg.total_donations.to_string()),
        );
        fields.insert("score".into(), Value::from(agg.score));
        if let Some(suggested) = agg.suggested_match.to_f64() {
            fields.insert("suggestedMatch".into(), Value::from(suggested));
        }
        Self { fields }
    }
}

/// Interpret a JSON value as a finite number; numeric strings count.
pub fn number_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

/// A numeric value that could not be read as a number. Delimited uploads
/// store such cells as zero; object-notation uploads keep them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellWarning {
    /// 1-based line of delimited text, or 1-based position in an array.
    pub line: usize,
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSource {
    Json,
    JsonFile,
    DelimitedText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideSnapshot {
    pub round_id: i64,
    pub uploaded_at: DateTime<Utc>,
    pub source: OverrideSource,
    pub campaigns: Vec<CampaignRow>,
    #[serde(default)]
    pub warnings: Vec<CellWarning>,
}

/// The binding distribution stored on a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovedResult {
    Computed(RoundResults),
    Override(OverrideSnapshot),
}

impl ApprovedResult {
    /// Rows in payout order.
    pub fn campaign_rows(&self) -> Vec<CampaignRow> {
        match self {
            Self::Computed(results) => results.campaigns.iter().map(CampaignRow::from).collect(),
            Self::Override(snapshot) => snapshot.campaigns.clone(),
        }
    }
}
