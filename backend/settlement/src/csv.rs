//! Delimited-text decoder for operator override uploads.
//!
//! Deliberately tiny: one row per line, comma separated, `"` quoting with
//! `""` as the escaped quote. Unterminated quotes close at end of line.
//!
//! Numeric cells are coerced tolerantly. A non-empty cell that does not
//! parse becomes `0` and is reported as a [`CellWarning`] so operators can
//! audit what was zeroed. Missing required columns reject the whole upload.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{Result, SettlementError};
use crate::types::{CampaignRow, CellWarning, RECIPIENT_KEYS};

/// Columns every upload must carry in its header.
pub const REQUIRED_COLUMNS: &[&str] = &["campaignId", "recipientAddress", "suggestedMatch"];

/// Columns coerced to numbers; everything else stays text.
pub const NUMERIC_COLUMNS: &[&str] = &[
    "contributions",
    "uniqueContributors",
    "totalDonations",
    "score",
    "suggestedMatch",
    "amount",
    "payoutScaled",
];

/// Rows decoded from an upload, with the cells that had to be zeroed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    pub rows: Vec<CampaignRow>,
    pub warnings: Vec<CellWarning>,
}

/// Split a single line into fields.
pub fn parse_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Decode a whole upload: first non-blank line is the header.
pub fn parse_table(text: &str) -> Result<ParsedTable> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let (_, header_line) = lines
        .next()
        .ok_or_else(|| SettlementError::InvalidInput("upload is empty".into()))?;

    let header: Vec<String> = parse_line(header_line)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let index: HashMap<&str, usize> = header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !index.contains_key(col))
        .collect();
    if !missing.is_empty() {
        return Err(SettlementError::InvalidInput(format!(
            "missing required columns: {}",
            missing.join(", ")
        )));
    }

    let mut rows = Vec::new();
    let mut warnings = Vec::new();
    for (line_no, line) in lines {
        let cells = parse_line(line);
        rows.push(build_row(&header, &cells, line_no, &mut warnings));
    }

    Ok(ParsedTable { rows, warnings })
}

fn build_row(
    header: &[String],
    cells: &[String],
    line_no: usize,
    warnings: &mut Vec<CellWarning>,
) -> CampaignRow {
    let mut fields = Map::new();

    for (i, column) in header.iter().enumerate() {
        let cell = cells.get(i).map(|c| c.trim()).unwrap_or("");

        if NUMERIC_COLUMNS.contains(&column.as_str()) {
            if let Some(number) = coerce_number(cell, column, line_no, warnings) {
                fields.insert(column.clone(), Value::from(number));
            }
        } else if RECIPIENT_KEYS.contains(&column.as_str()) && cell.is_empty() {
            continue;
        } else {
            fields.insert(column.clone(), Value::String(cell.to_string()));
        }
    }

    CampaignRow::from_fields(fields)
}

/// Empty cells are absent; anything else that fails to parse is zero.
fn coerce_number(
    cell: &str,
    column: &str,
    line: usize,
    warnings: &mut Vec<CellWarning>,
) -> Option<f64> {
    if cell.is_empty() {
        return None;
    }
    match cell.parse::<f64>() {
        Ok(n) if n.is_finite() => Some(n),
        _ => {
            debug!(line, column, value = cell, "Unparsable numeric cell coerced to 0");
            warnings.push(CellWarning {
                line,
                column: column.to_string(),
                value: cell.to_string(),
            });
            Some(0.0)
        }
    }
}
