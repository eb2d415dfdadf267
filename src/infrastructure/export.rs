//! CSV export of stored records
//!
//! Output opens with a UTF-8 byte order mark so spreadsheet tools pick the
//! right encoding for the Chinese headers.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use tracing::info;

use crate::domain::record::AccumulatedRecord;

const BOM: &str = "\u{feff}";

pub const HEADERS: [&str; 15] = [
    "账号", "序号", "IP", "类型", "命名", "等级", "门派", "绝技", "次数", "总时间", "状态", "运行时间", "累计次数",
    "异常关键词", "爬取时间",
];

/// Render records as CSV, timestamps shown at `utc_offset_hours`
pub fn records_to_csv(records: &[AccumulatedRecord], utc_offset_hours: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());

    let mut out = String::from(BOM);
    push_row(&mut out, HEADERS.iter().map(|h| (*h).to_string()));

    for record in records {
        let raw = &record.raw;
        let keywords = record
            .anomaly_keywords
            .iter()
            .map(|(keyword, count)| format!("{keyword}:{count}"))
            .collect::<Vec<_>>()
            .join("; ");

        push_row(
            &mut out,
            [
                raw.account_username.clone(),
                raw.sequence_number.to_string(),
                raw.ip.clone(),
                raw.category.clone(),
                raw.display_name.clone(),
                raw.level.to_string(),
                raw.guild_name.clone(),
                raw.skill_tag.clone(),
                format!("{}/{}", raw.count_current, raw.count_total),
                raw.elapsed_time.clone(),
                raw.status_text.clone(),
                raw.runtime.clone(),
                record.accumulated_count.to_string(),
                keywords,
                record
                    .observed_at
                    .with_timezone(&offset)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            ],
        );
    }
    out
}

pub async fn export_to_file(path: &Path, records: &[AccumulatedRecord], utc_offset_hours: i32) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, records_to_csv(records, utc_offset_hours))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(path = %path.display(), records = records.len(), "records exported");
    Ok(())
}

fn push_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    let line = fields.into_iter().map(|f| escape(&f)).collect::<Vec<_>>().join(",");
    out.push_str(&line);
    out.push_str("\r\n");
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
