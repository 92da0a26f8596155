//! Payout call-data construction.
//!
//! Turns an approved distribution into the `(address[] recipients,
//! uint256[] amounts)` parameters of the payout contract call. Nothing is
//! submitted from here.
//!
//! ## Amount sources
//!
//! Result formats disagree on which field holds the payable amount. The
//! encoder tries [`AMOUNT_SOURCES`] in order and takes the first finite
//! value; a row with none of them pays `0`.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::{Result, SettlementError};
use crate::types::CampaignRow;

pub const DEFAULT_TOKEN_DECIMALS: u32 = 6;

const WORD: usize = 32;
const ADDRESS_BYTES: usize = 20;

type AmountAccessor = fn(&CampaignRow) -> Option<f64>;

/// Amount fields in priority order.
pub const AMOUNT_SOURCES: &[(&str, AmountAccessor)] = &[
    ("suggestedMatch", CampaignRow::suggested_match),
    ("amount", CampaignRow::amount),
    ("payoutScaled", CampaignRow::payout_scaled),
];

/// First finite amount found among [`AMOUNT_SOURCES`].
pub fn resolve_amount(row: &CampaignRow) -> f64 {
    let found = AMOUNT_SOURCES.iter().enumerate().find_map(|(tier, (field, accessor))| {
        accessor(row)
            .filter(|v| v.is_finite())
            .map(|v| (tier, *field, v))
    });

    match found {
        Some((0, _, value)) => value,
        Some((_, field, value)) => {
            debug!(field, value, "Payout amount taken from fallback field");
            value
        }
        None => {
            debug!("No amount field present; paying 0");
            0.0
        }
    }
}

/// Decode a `0x`-prefixed, 20-byte hex address. Case is not checked.
pub fn parse_address(raw: &str) -> Option<[u8; ADDRESS_BYTES]> {
    let hex_part = raw.trim().strip_prefix("0x").or_else(|| raw.trim().strip_prefix("0X"))?;
    if hex_part.len() != ADDRESS_BYTES * 2 {
        return None;
    }
    let mut out = [0u8; ADDRESS_BYTES];
    hex::decode_to_slice(hex_part, &mut out).ok()?;
    Some(out)
}

pub fn is_valid_address(raw: &str) -> bool {
    parse_address(raw).is_some()
}

/// Scale a decimal amount to the token's fixed-point integer, rounding
/// half away from zero at `decimals` places. Negative input pays zero.
pub fn scale_amount(amount: f64, decimals: u32) -> Result<u128> {
    let amount = Decimal::from_f64(amount.max(0.0)).ok_or_else(|| {
        SettlementError::InvalidInput(format!("amount {amount} is not representable"))
    })?;
    let rounded = amount.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero);

    let mantissa = u128::try_from(rounded.mantissa()).map_err(|_| {
        SettlementError::InvalidInput(format!("amount {rounded} is negative"))
    })?;
    let shift = decimals - rounded.scale().min(decimals);

    10u128
        .checked_pow(shift)
        .and_then(|factor| mantissa.checked_mul(factor))
        .ok_or_else(|| {
            SettlementError::InvalidInput(format!(
                "amount {rounded} overflows uint256 scaling at {decimals} decimals"
            ))
        })
}

/// A row left out of the payout, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRow {
    pub index: usize,
    pub reason: String,
}

/// Encoded call parameters plus the arrays they were built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutCallData {
    pub strategy_address: String,
    pub recipients: Vec<String>,
    /// Scaled integers as decimal strings; they can exceed JSON's safe range.
    pub amounts: Vec<String>,
    pub decimals: u32,
    pub encoded_params: String,
    pub skipped: Vec<SkippedRow>,
}

/// Build payout call data for `rows`, preserving their order.
pub fn build_payout(
    strategy_address: &str,
    rows: &[CampaignRow],
    decimals: u32,
) -> Result<PayoutCallData> {
    if !is_valid_address(strategy_address) {
        return Err(SettlementError::InvalidInput(format!(
            "strategy address {strategy_address:?} is not a valid address"
        )));
    }

    let mut addresses = Vec::new();
    let mut recipients = Vec::new();
    let mut amounts = Vec::new();
    let mut skipped = Vec::new();

    for (index, row) in rows.iter().enumerate() {
        let parsed = row.recipient_address().map(|a| (a, parse_address(a)));
        let (raw, address) = match parsed {
            Some((raw, Some(address))) => (raw, address),
            Some((raw, None)) => {
                warn!(index, address = raw, "Skipping payout row with invalid recipient address");
                skipped.push(SkippedRow {
                    index,
                    reason: format!("invalid recipient address {raw:?}"),
                });
                continue;
            }
            None => {
                warn!(index, "Skipping payout row without recipient address");
                skipped.push(SkippedRow {
                    index,
                    reason: "missing recipient address".to_string(),
                });
                continue;
            }
        };

        let scaled = scale_amount(resolve_amount(row), decimals)?;
        addresses.push(address);
        recipients.push(raw.trim().to_string());
        amounts.push(scaled);
    }

    if addresses.is_empty() {
        return Err(SettlementError::NoValidRecipients);
    }

    let encoded = encode_address_and_amount_arrays(&addresses, &amounts);
    info!(
        recipients = addresses.len(),
        skipped = skipped.len(),
        "Payout call data built"
    );

    Ok(PayoutCallData {
        strategy_address: strategy_address.trim().to_string(),
        recipients,
        amounts: amounts.iter().map(u128::to_string).collect(),
        decimals,
        encoded_params: format!("0x{}", hex::encode(encoded)),
        skipped,
    })
}

// ─────────────────────────────────────────────────────────
// ABI encoding
// ─────────────────────────────────────────────────────────

fn address_word(address: &[u8; ADDRESS_BYTES]) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - ADDRESS_BYTES..].copy_from_slice(address);
    word
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// ABI-encode `(address[], uint256[])`: two head offsets followed by each
/// dynamic array as a length word and its elements.
pub fn encode_address_and_amount_arrays(
    addresses: &[[u8; ADDRESS_BYTES]],
    amounts: &[u128],
) -> Vec<u8> {
    let head_len = 2 * WORD;
    let first_len = WORD * (1 + addresses.len());
    let mut out = Vec::with_capacity(head_len + first_len + WORD * (1 + amounts.len()));

    out.extend_from_slice(&uint_word(head_len as u128));
    out.extend_from_slice(&uint_word((head_len + first_len) as u128));

    out.extend_from_slice(&uint_word(addresses.len() as u128));
    for address in addresses {
        out.extend_from_slice(&address_word(address));
    }

    out.extend_from_slice(&uint_word(amounts.len() as u128));
    for amount in amounts {
        out.extend_from_slice(&uint_word(*amount));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALICE: &str = "0x1111111111111111111111111111111111111111";
    const BOB: &str = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01";
    const STRATEGY: &str = "0x00000000000000000000000000000000000000ff";

    fn row(address: Option<&str>, suggested: Option<f64>) -> CampaignRow {
        let mut fields = serde_json::Map::new();
        if let Some(address) = address {
            fields.insert("recipientAddress".into(), json!(address));
        }
        if let Some(suggested) = suggested {
            fields.insert("suggestedMatch".into(), json!(suggested));
        }
        CampaignRow::from_fields(fields)
    }

    fn row_from(value: serde_json::Value) -> CampaignRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn address_format() {
        assert!(is_valid_address(ALICE));
        assert!(is_valid_address(BOB));
        assert!(!is_valid_address("1111111111111111111111111111111111111111"));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("0xZZ11111111111111111111111111111111111111"));
        assert!(!is_valid_address("GABC"));
    }

    #[test]
    fn amount_priority_is_suggested_then_amount_then_scaled() {
        let r = row_from(json!({ "suggestedMatch": 1, "amount": 2, "payoutScaled": 3 }));
        assert_eq!(resolve_amount(&r), 1.0);
        let r = row_from(json!({ "amount": "2", "payoutScaled": 3 }));
        assert_eq!(resolve_amount(&r), 2.0);
        let r = row_from(json!({ "suggestedMatch": "12,5", "amount": "NaN", "payoutScaled": 3 }));
        assert_eq!(resolve_amount(&r), 3.0);
        let r = row_from(json!({ "suggestedMatch": null }));
        assert_eq!(resolve_amount(&r), 0.0);
    }

    #[test]
    fn scaling_uses_configured_decimals() {
        assert_eq!(scale_amount(12.5, 6).unwrap(), 12_500_000);
        assert_eq!(scale_amount(12.5, 0).unwrap(), 13);
        assert_eq!(scale_amount(0.1, 18).unwrap(), 100_000_000_000_000_000);
        assert_eq!(scale_amount(0.125, 2).unwrap(), 13);
        assert_eq!(scale_amount(-4.0, 6).unwrap(), 0);
    }

    #[test]
    fn scaling_overflow_is_reported() {
        assert!(matches!(
            scale_amount(1e20, 40),
            Err(SettlementError::InvalidInput(_))
        ));
    }

    #[test]
    fn rows_without_usable_address_are_skipped() {
        let rows = [row(None, Some(99.0)), row(Some(ALICE), Some(12.5))];
        let payout = build_payout(STRATEGY, &rows, 6).unwrap();

        assert_eq!(payout.recipients, vec![ALICE.to_string()]);
        assert_eq!(payout.amounts, vec!["12500000".to_string()]);
        assert_eq!(payout.skipped.len(), 1);
        assert_eq!(payout.skipped[0].index, 0);
    }

    #[test]
    fn nothing_payable_is_an_error() {
        let rows = [row(None, Some(1.0)), row(Some("0xnope"), Some(1.0))];
        assert!(matches!(
            build_payout(STRATEGY, &rows, 6),
            Err(SettlementError::NoValidRecipients)
        ));
        assert!(matches!(
            build_payout(STRATEGY, &[], 6),
            Err(SettlementError::NoValidRecipients)
        ));
    }

    #[test]
    fn invalid_strategy_address_is_rejected() {
        let rows = [row(Some(ALICE), Some(1.0))];
        assert!(matches!(
            build_payout("strategy", &rows, 6),
            Err(SettlementError::InvalidInput(_))
        ));
    }

    #[test]
    fn order_is_preserved() {
        let rows = [
            row(Some(BOB), Some(2.0)),
            row(Some("bad"), Some(5.0)),
            row(Some(ALICE), Some(1.0)),
        ];
        let payout = build_payout(STRATEGY, &rows, 2).unwrap();
        assert_eq!(payout.recipients, vec![BOB.to_string(), ALICE.to_string()]);
        assert_eq!(payout.amounts, vec!["200".to_string(), "100".to_string()]);
    }

    #[test]
    fn abi_layout_matches_solidity_encoding() {
        let alice = parse_address(ALICE).unwrap();
        let encoded = encode_address_and_amount_arrays(&[alice], &[12_500_000]);

        let expected = concat!(
            // offset of recipients
            "0000000000000000000000000000000000000000000000000000000000000040",
            // offset of amounts
            "0000000000000000000000000000000000000000000000000000000000000080",
            // recipients
            "0000000000000000000000000000000000000000000000000000000000000001",
            "0000000000000000000000001111111111111111111111111111111111111111",
            // amounts
            "0000000000000000000000000000000000000000000000000000000000000001",
            "0000000000000000000000000000000000000000000000000000000000bebc20",
        );
        assert_eq!(hex::encode(encoded), expected);
    }

    #[test]
    fn encoded_params_are_hex_prefixed() {
        let rows = [row(Some(ALICE), Some(12.5))];
        let payout = build_payout(STRATEGY, &rows, 6).unwrap();
        assert!(payout.encoded_params.starts_with("0x"));
        assert_eq!(payout.encoded_params.len(), 2 + 6 * 64);
    }
}
