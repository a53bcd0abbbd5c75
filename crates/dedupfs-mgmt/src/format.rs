//! Human-readable rendering of listings and reports.

use std::fmt::{self, Write};

use chrono::{DateTime, Local, Utc};
use dedupfs_meta::{GcStats, RemoveReport, StepOutcome, SubvolumeListing, Timestamp, UsageReport};

/// Size with a binary unit, two decimals from KB up.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// [`format_bytes`] keeping the sign.
pub fn format_signed_bytes(bytes: i64) -> String {
    if bytes < 0 {
        format!("-{}", format_bytes(bytes.unsigned_abs()))
    } else {
        format_bytes(bytes as u64)
    }
}

/// UTC date of a stored timestamp, if in range.
pub fn to_datetime(ts: Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs, ts.nanos)
}

/// Local wall-clock rendering of `ts`, or `missing` when unset.
pub fn format_timestamp(ts: Option<Timestamp>, missing: &str) -> String {
    match ts.and_then(to_datetime) {
        Some(dt) => dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => missing.to_string(),
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    part as f64 * 100.0 / whole as f64
}

/// Table of subvolumes with their sizes and timestamps.
pub fn format_listing(listings: &[SubvolumeListing]) -> Result<String, fmt::Error> {
    let mut out = String::new();
    let rule = "-".repeat(46 + 12 + 16 + 22 + 22 + 22 + 1);
    writeln!(out, "Subvolumes:")?;
    writeln!(out, "{}", rule)?;
    writeln!(
        out,
        "{:<46}| {:<10}| {:<14}| {:<20}| {:<20}| {:<20}|",
        "Name", "ReadOnly", "Apparent Size", "Created", "Last mounted", "Last updated"
    )?;
    writeln!(out, "{}", rule)?;
    for listing in listings {
        let record = &listing.record;
        writeln!(
            out,
            "{:<46}| {:<10}| {:<14}| {:<20}| {:<20}| {:<20}|",
            record.display_name(),
            record.readonly,
            format_bytes(listing.apparent_size),
            format_timestamp(Some(record.created_at), "---"),
            format_timestamp(record.mounted_at, "not mounted"),
            format_timestamp(record.updated_at, "not updated"),
        )?;
    }
    writeln!(out, "{}", rule)?;
    Ok(out)
}

/// Usage report of one subvolume.
pub fn format_usage(usage: &UsageReport) -> Result<String, fmt::Error> {
    let mut out = String::new();
    writeln!(out, "Apparent size is {}.", format_bytes(usage.apparent_size))?;
    writeln!(out, "Unique data size is {}.", format_bytes(usage.unique_size))?;
    writeln!(out, "Sparse data size is {}.", format_signed_bytes(usage.sparse_size))?;
    writeln!(out, "Deduped data size is {}.", format_bytes(usage.dedup_size))?;
    if usage.apparent_size > 0 {
        writeln!(
            out,
            "Compressed data size is {} ({:.2} %).",
            format_bytes(usage.compressed_size),
            percent(usage.compressed_size, usage.apparent_size)
        )?;
    }
    if usage.unique_size > 0 {
        writeln!(
            out,
            "Compressed unique data size is {} ({:.2} %).",
            format_bytes(usage.compressed_unique_size),
            percent(usage.compressed_unique_size, usage.unique_size)
        )?;
    }
    if usage.is_inconsistent() {
        writeln!(out, "WARNING: block data exceeds apparent size, metadata is inconsistent.")?;
    }
    let shares = usage.compression_shares();
    if !shares.is_empty() {
        writeln!(out, "Compression by types:")?;
        for (method, share) in shares {
            writeln!(out, " {:>8} used by {:.2}% blocks", method, share)?;
        }
    }
    Ok(out)
}

/// Per-step outcome of a subvolume removal.
pub fn format_remove_report(report: &RemoveReport) -> Result<String, fmt::Error> {
    let mut out = String::new();
    for (step, outcome) in &report.steps {
        let status = match outcome {
            StepOutcome::Done(rows) => format!("done ({} rows)", rows),
            StepOutcome::Failed(reason) => format!("FAILED: {}", reason),
            StepOutcome::Skipped => "skipped".to_string(),
        };
        writeln!(out, "  {:<24} {}", step.to_string(), status)?;
    }
    if report.is_complete() {
        writeln!(
            out,
            "Removed subvolume {} ({} blocks released).",
            report.name, report.hashes_released
        )?;
    } else {
        writeln!(
            out,
            "Subvolume {} only partially removed; re-run remove to finish.",
            report.name
        )?;
    }
    Ok(out)
}

/// Summary of a collection run.
pub fn format_gc_stats(stats: &GcStats) -> String {
    format!(
        "Names: {} scanned, {} removed.\nHashes: {} scanned, {} removed, {} reclaimed.\n",
        stats.names_scanned,
        stats.names_reclaimed,
        stats.hashes_scanned,
        stats.hashes_reclaimed,
        format_bytes(stats.bytes_reclaimed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedupfs_meta::{SubvolumeId, SubvolumeRecord, TeardownStep};

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_signed_bytes(-2048), "-2.00 KB");
    }

    #[test]
    fn test_format_timestamp_missing() {
        assert_eq!(format_timestamp(None, "not mounted"), "not mounted");
        assert!(to_datetime(Timestamp::from_secs(0)).is_some());
    }

    #[test]
    fn test_listing_has_row_per_subvolume() {
        let listing = SubvolumeListing {
            record: SubvolumeRecord {
                id: SubvolumeId::new(1),
                name: b"@daily-2024-01-07".to_vec(),
                hash: "0123456789abcdef".to_string(),
                created_at: Timestamp::from_secs(1_704_585_600),
                mounted_at: None,
                updated_at: None,
                readonly: true,
            },
            apparent_size: 2048,
        };
        let text = format_listing(&[listing]).unwrap();
        let row = text
            .lines()
            .find(|l| l.starts_with("@daily-2024-01-07"))
            .unwrap();
        assert!(row.contains("true"));
        assert!(row.contains("2.00 KB"));
        assert!(row.contains("not mounted"));
        assert!(row.contains("not updated"));
    }

    #[test]
    fn test_usage_report_lines() {
        let mut usage = UsageReport {
            apparent_size: 4096,
            data_size: 4096,
            unique_size: 2048,
            dedup_size: 2048,
            sparse_size: 0,
            compressed_size: 1024,
            compressed_unique_size: 512,
            ..Default::default()
        };
        usage.compression_types.insert("zstd".into(), 3);
        usage.compression_types.insert("lz4".into(), 1);
        let text = format_usage(&usage).unwrap();
        assert!(text.contains("Compressed data size is 1.00 KB (25.00 %)."));
        assert!(text.contains("Compressed unique data size is 512 B (25.00 %)."));
        let zstd = text.find("zstd used by 75.00%").unwrap();
        let lz4 = text.find("lz4 used by 25.00%").unwrap();
        assert!(zstd < lz4);
        assert!(!text.contains("WARNING"));
    }

    #[test]
    fn test_partial_remove_report() {
        let report = RemoveReport {
            name: "snap".to_string(),
            steps: vec![
                (TeardownStep::DropTree, StepOutcome::Done(3)),
                (TeardownStep::DropInode, StepOutcome::Failed("disk full".into())),
                (TeardownStep::DeleteSubvolumeRow, StepOutcome::Skipped),
            ],
            hashes_released: 0,
        };
        let text = format_remove_report(&report).unwrap();
        assert!(text.contains("FAILED: disk full"));
        assert!(text.contains("skipped"));
        assert!(text.contains("partially removed"));
    }
}
