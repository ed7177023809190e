//! Parsing of the transcoder's stderr progress stream.
//!
//! The tool prints a one-time `Duration: HH:MM:SS.mm` header and then
//! rewrites a progress line of the form
//! `frame=X fps=X size=XkB time=HH:MM:SS.mm bitrate=Xkbits/s speed=Xx`.

use std::time::Instant;

/// One parsed progress sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolProgress {
    /// Percent complete, when a total duration or size estimate is known.
    pub percent: Option<f64>,
    pub current_bytes: u64,
    /// Bytes written per wall-clock second.
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    /// Raw bitrate field, e.g. `2097.2kbits/s`.
    pub bitrate: Option<String>,
}

/// The token following `key` on a line, ending at whitespace or a comma.
///
/// Covers every field the tool emits: `time=00:01:30.50`, `size=  1024kB`,
/// `bitrate=2097.2kbits/s` and the `Duration: 00:42:10.55,` header.
fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let rest = line[line.find(key)? + key.len()..].trim_start();
    let token = rest
        .split([' ', ','])
        .next()
        .filter(|token| !token.is_empty())?;
    Some(token)
}

/// Fold an `HH:MM:SS.ms` clock into seconds.
fn clock_to_secs(text: &str) -> Option<f64> {
    let mut total = 0.0;
    let mut fields = 0usize;
    for part in text.split(':') {
        total = total * 60.0 + part.trim().parse::<f64>().ok()?;
        fields += 1;
    }
    (fields == 3).then_some(total)
}

/// Total media duration from the `Duration: HH:MM:SS.mm, start: ...` header.
pub fn parse_duration_line(line: &str) -> Option<f64> {
    clock_to_secs(field_after(line, "Duration:")?)
}

/// `size=    1024kB` (or `Lsize=`) in bytes.
pub fn parse_size(line: &str) -> Option<u64> {
    let token = field_after(line, "size=")?;
    let kb: u64 = token
        .strip_suffix("kB")
        .or_else(|| token.strip_suffix("KB"))?
        .parse()
        .ok()?;
    Some(kb * 1024)
}

/// Raw `bitrate=` field, e.g. `2097.2kbits/s`.
pub fn parse_bitrate(line: &str) -> Option<String> {
    field_after(line, "bitrate=")
        .filter(|token| *token != "N/A")
        .map(str::to_string)
}

/// Stateful line parser for one transcoder invocation.
pub struct ProgressParser {
    started: Instant,
    duration_secs: Option<f64>,
    /// Size-based total estimate, computed once and cached.
    estimated_total_bytes: Option<f64>,
}

impl Default for ProgressParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressParser {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            duration_secs: None,
            estimated_total_bytes: None,
        }
    }

    /// Feed one output record; returns a sample for progress lines.
    pub fn observe(&mut self, line: &str) -> Option<ToolProgress> {
        self.observe_with_elapsed(line, self.started.elapsed().as_secs_f64())
    }

    fn observe_with_elapsed(&mut self, line: &str, elapsed_secs: f64) -> Option<ToolProgress> {
        if self.duration_secs.is_none()
            && let Some(duration) = parse_duration_line(line)
        {
            self.duration_secs = Some(duration);
            return None;
        }

        let current_time = clock_to_secs(field_after(line, "time=")?)?;
        // `time=` alone is not proof of a progress line; demand a second
        // marker so log noise quoting a timestamp is ignored.
        let corroborated = ["frame=", "size=", "bitrate="]
            .iter()
            .any(|marker| line.contains(marker));
        if !corroborated {
            return None;
        }

        let current_bytes = parse_size(line).unwrap_or(0);
        let bitrate = parse_bitrate(line);

        let percent = match self.duration_secs {
            Some(duration) if duration > 0.0 => {
                Some((current_time / duration * 100.0).min(100.0))
            }
            _ => self
                .estimate_total(current_bytes, current_time)
                .map(|total| (current_bytes as f64 / total * 100.0).min(100.0)),
        };

        let speed_bps = if elapsed_secs > 0.0 {
            current_bytes as f64 / elapsed_secs
        } else {
            0.0
        };

        let eta_seconds = match (self.estimate_total(current_bytes, current_time), speed_bps) {
            (Some(total), speed) if speed > 0.0 && total > current_bytes as f64 => {
                Some(((total - current_bytes as f64) / speed) as u64)
            }
            _ => None,
        };

        Some(ToolProgress {
            percent,
            current_bytes,
            speed_bps,
            eta_seconds,
            bitrate,
        })
    }

    /// Cached size estimate: bytes scale linearly with media time.
    fn estimate_total(&mut self, current_bytes: u64, current_time: f64) -> Option<f64> {
        if self.estimated_total_bytes.is_none()
            && current_time > 1.0
            && current_bytes > 0
            && let Some(duration) = self.duration_secs
        {
            self.estimated_total_bytes = Some(current_bytes as f64 * duration / current_time);
        }
        self.estimated_total_bytes
    }
}
