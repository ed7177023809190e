//! Progress formatting and per-task aggregation.

use crate::task::SubTask;

/// Human-readable transfer speed.
///
/// Bands switch at 10^3 / 10^6 / 10^9 bytes per second; everything above
/// the B/s band carries two decimals.
pub fn format_speed(bytes_per_second: f64) -> String {
    let bps = bytes_per_second.max(0.0);
    if bps < 1_000.0 {
        format!("{bps:.0} B/s")
    } else if bps < 1_000_000.0 {
        format!("{:.2} KB/s", bps / 1_000.0)
    } else if bps < 1_000_000_000.0 {
        format!("{:.2} MB/s", bps / 1_000_000.0)
    } else {
        format!("{:.2} GB/s", bps / 1_000_000_000.0)
    }
}

/// Percentage with one decimal.
pub fn format_percent(percent: f64) -> String {
    format!("{:.1}%", percent.clamp(0.0, 100.0))
}

/// `Xs` under a minute, `Xm Ys` under an hour, `Xh Ym` above.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3_600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3_600, (seconds % 3_600) / 60)
    }
}

/// Aggregate progress over a task's sub-task lanes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateProgress {
    /// Weighted mean in `[0, 100]`.
    pub progress: f64,
    pub downloaded_bytes: u64,
    /// Sum over lanes with a known total; `None` when no lane knows one.
    pub total_bytes: Option<u64>,
    /// Sum of per-lane speeds.
    pub speed_bps: f64,
    /// Largest positive per-lane ETA.
    pub eta_seconds: Option<u64>,
}

/// Fold sub-task lanes into one task-level progress value.
///
/// Progress is a mean weighted by each lane's total bytes; lanes with an
/// unknown total fall back to equal weights for the whole set.
pub fn aggregate(sub_tasks: &[SubTask]) -> AggregateProgress {
    if sub_tasks.is_empty() {
        return AggregateProgress::default();
    }

    let all_totals_known = sub_tasks.iter().all(|s| s.total_bytes.is_some());
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut downloaded = 0u64;
    let mut total: Option<u64> = None;
    let mut speed = 0.0;
    let mut eta: Option<u64> = None;

    for sub_task in sub_tasks {
        let weight = if all_totals_known {
            sub_task.total_bytes.unwrap_or(0) as f64
        } else {
            1.0
        };
        weighted += sub_task.progress * weight;
        weight_sum += weight;

        downloaded += sub_task.downloaded_bytes;
        if let Some(t) = sub_task.total_bytes {
            total = Some(total.unwrap_or(0) + t);
        }
        if let Some(s) = sub_task.speed_bps {
            speed += s;
        }
        if let Some(e) = sub_task.eta_seconds
            && e > 0
        {
            eta = Some(eta.map_or(e, |current| current.max(e)));
        }
    }

    let progress = if weight_sum > 0.0 {
        (weighted / weight_sum).clamp(0.0, 100.0)
    } else {
        0.0
    };

    AggregateProgress {
        progress,
        downloaded_bytes: downloaded,
        total_bytes: total,
        speed_bps: speed,
        eta_seconds: eta,
    }
}
