//! Report table extraction
//!
//! The first `<table>` on the post-login page is the data table. Its first
//! row is a header; every following row needs at least ten cells:
//!
//! | idx | content                          |
//! |-----|----------------------------------|
//! | 0   | sequence number                  |
//! | 1   | ip                               |
//! | 2   | category                         |
//! | 3   | display name                     |
//! | 4   | level (non-numeric becomes 0)    |
//! | 5   | guild                            |
//! | 6   | skill tag                        |
//! | 7   | `current/total` (else `0/0`)     |
//! | 8   | elapsed time                     |
//! | 9   | status text                      |
//! | 10  | runtime (optional)               |

use anyhow::{Result, anyhow};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::domain::record::RawRecord;

const MIN_CELLS: usize = 10;

pub struct TableExtractor {
    table: Selector,
    row: Selector,
    cell: Selector,
    count_pattern: Regex,
}

impl TableExtractor {
    pub fn new() -> Result<Self> {
        let parse = |css: &str| Selector::parse(css).map_err(|e| anyhow!("Invalid selector {css}: {e:?}"));
        Ok(Self {
            table: parse("table")?,
            row: parse("tr")?,
            cell: parse("td, th")?,
            count_pattern: Regex::new(r"^(\d+)/(\d+)")?,
        })
    }

    /// Parse every usable data row; malformed rows are skipped with a warning
    pub fn extract(&self, account_username: &str, html: &str) -> Vec<RawRecord> {
        let document = Html::parse_document(html);

        let Some(table) = document.select(&self.table).next() else {
            warn!(account = account_username, "no table found on the page");
            return Vec::new();
        };

        let records: Vec<RawRecord> = table
            .select(&self.row)
            .enumerate()
            .skip(1)
            .filter_map(|(index, row)| self.parse_row(account_username, index, row))
            .collect();

        debug!(account = account_username, rows = records.len(), "table extracted");
        records
    }

    fn parse_row(&self, account_username: &str, index: usize, row: ElementRef<'_>) -> Option<RawRecord> {
        let cells: Vec<String> = row.select(&self.cell).map(stripped_text).collect();

        if cells.len() < MIN_CELLS {
            warn!(account = account_username, row = index, cells = cells.len(), "skipping short row");
            return None;
        }

        let Ok(sequence_number) = cells[0].parse::<i64>() else {
            warn!(account = account_username, row = index, value = %cells[0], "skipping row with non-numeric sequence number");
            return None;
        };

        let (count_current, count_total) = self.parse_count(&cells[7]);

        Some(RawRecord {
            account_username: account_username.to_string(),
            sequence_number,
            ip: cells[1].clone(),
            category: cells[2].clone(),
            display_name: cells[3].clone(),
            level: parse_level(&cells[4]),
            guild_name: cells[5].clone(),
            skill_tag: cells[6].clone(),
            count_current,
            count_total,
            elapsed_time: cells[8].clone(),
            status_text: cells[9].clone(),
            runtime: cells.get(10).cloned().unwrap_or_default(),
        })
    }

    fn parse_count(&self, text: &str) -> (i64, i64) {
        self.count_pattern
            .captures(text)
            .and_then(|caps| {
                let current = caps.get(1)?.as_str().parse().ok()?;
                let total = caps.get(2)?.as_str().parse().ok()?;
                Some((current, total))
            })
            .unwrap_or((0, 0))
    }
}

fn parse_level(text: &str) -> i64 {
    if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) {
        text.parse().unwrap_or(0)
    } else {
        0
    }
}

/// Text of every descendant node, each trimmed, joined without separators
fn stripped_text(cell: ElementRef<'_>) -> String {
    cell.text().map(str::trim).filter(|t| !t.is_empty()).collect()
}
