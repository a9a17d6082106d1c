//! Utility functions used by chat-stress, and available when scripting load tests.

use lazy_static::lazy_static;
use regex::Regex;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time;
use url::Url;

use crate::{StressError, CANCELED};

lazy_static! {
    static ref TIMESPAN: Regex =
        Regex::new(r"^((?P<hours>\d+)h)?((?P<minutes>\d+)m)?((?P<seconds>\d+)s)?$").unwrap();
}

/// Seconds in a run duration or startup time, as given to `--duration`, `TEST_DURATION`
/// or `--startup-time`.
///
/// A bare number is seconds. Otherwise hours, minutes and seconds are combined as in
/// `1h30m`, `6s` or `2m15s`. Anything unparseable is 0, which `validate()` rejects where
/// a positive span is required.
///
/// # Example
/// ```rust
/// use chat_stress::util;
///
/// // The spike preset runs for a minute, the baseline for six seconds.
/// assert_eq!(util::parse_timespan("1m"), 60);
/// assert_eq!(util::parse_timespan("6s"), 6);
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
/// assert_eq!(util::parse_timespan("soon"), 0);
/// ```
pub fn parse_timespan(span: &str) -> usize {
    let span = span.trim();
    if let Ok(seconds) = usize::from_str(span) {
        return seconds;
    }

    let captures = match TIMESPAN.captures(span) {
        Some(captures) => captures,
        None => return 0,
    };
    let part = |name: &str| -> usize {
        captures
            .name(name)
            .and_then(|m| usize::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let seconds = part("hours") * 3_600 + part("minutes") * 60 + part("seconds");
    trace!("{} is {} seconds", span, seconds);
    seconds
}

/// Sleep between scheduler ticks, shortened by however long the tick itself took.
///
/// Returns the drift timer for the next tick.
pub async fn sleep_minus_drift(
    duration: std::time::Duration,
    drift: tokio::time::Instant,
) -> tokio::time::Instant {
    match duration.checked_sub(drift.elapsed()) {
        Some(delay) if delay.as_nanos() > 0 => tokio::time::sleep(delay).await,
        _ => trace!("scheduler tick overran {:?}, not sleeping", duration),
    };
    tokio::time::Instant::now()
}

/// Fit a metric name or response body into `max_length` characters for tables and logs,
/// marking a cut with "..".
///
/// # Example
/// ```rust
/// use chat_stress::util;
///
/// assert_eq!(util::truncate_string("session_creation_success_rate", 14), "session_crea..");
/// ```
pub fn truncate_string(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_length.saturating_sub(2)).collect();
    format!("{}..", kept)
}

/// Whether `run_time` seconds have passed since `started`. A `run_time` of 0 never expires.
pub fn timer_expired(started: time::Instant, run_time: usize) -> bool {
    run_time > 0 && started.elapsed().as_secs() >= run_time as u64
}

/// Whether `elapsed` milliseconds have passed since `started`, used to pace VU launches.
pub fn ms_timer_expired(started: time::Instant, elapsed: usize) -> bool {
    elapsed > 0 && started.elapsed().as_millis() >= elapsed as u128
}

/// Helper to confirm the base URL is a valid URL.
///
/// # Example
/// ```rust
/// use chat_stress::util;
///
/// assert!(util::is_valid_host("https://api.example.com").is_ok());
/// assert!(util::is_valid_host("api.example.com").is_err());
/// ```
pub fn is_valid_host(host: &str) -> Result<bool, StressError> {
    Url::parse(host).map_err(|parse_error| StressError::InvalidHost {
        host: host.to_string(),
        detail: "Invalid base URL.".to_string(),
        parse_error,
    })?;
    Ok(true)
}

/// Join a base URL and a fixed path without doubling or dropping the separating slash.
pub fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// On the first ctrl-c, VUs finish their in-flight iteration and the summary and
/// thresholds are still reported. The second ctrl-c abandons the run.
pub(crate) fn setup_ctrlc_handler() {
    match ctrlc::set_handler(move || {
        if CANCELED.load(Ordering::SeqCst) {
            warn!("second ctrl-c, abandoning the load test");
            std::process::exit(1);
        } else {
            warn!("ctrl-c, draining vus before reporting (ctrl-c again to abandon)");
            CANCELED.store(true, Ordering::SeqCst);
        }
    }) {
        Ok(_) => (),
        Err(e) => {
            // The handler can only be registered once per process, later attacks reuse it.
            debug!("ctrl-c handler already registered: {}", e);
        }
    }
}
