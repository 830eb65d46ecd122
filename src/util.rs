//! Utility functions used by the load test, and available when writing task functions.

use regex::Regex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::LoadTestHandle;

/// Parse a string representing a time span and return the number of seconds.
///
/// Can be specified as an integer, indicating seconds. Or can use integers
/// together with one or more of "h", "m", and "s", in that order, indicating
/// "hours", "minutes", and "seconds".
///
/// Valid formats include: 20, 20s, 3m, 2h, 1h20m, 3h30m10s, etc.
///
/// # Example
/// ```rust
/// use loadtree::util;
///
/// // 1 hour 2 minutes and 3 seconds is 3,723 seconds.
/// assert_eq!(util::parse_timespan("1h2m3s"), 3_723);
///
/// // 45 seconds is 45 seconds.
/// assert_eq!(util::parse_timespan("45"), 45);
///
/// // Invalid value is 0 seconds.
/// assert_eq!(util::parse_timespan("foo"), 0);
/// ```
pub fn parse_timespan(time_str: &str) -> usize {
    if let Ok(seconds) = usize::from_str(time_str) {
        trace!("{} is integer: {} seconds", time_str, seconds);
        return seconds;
    }

    let re = match Regex::new(r"((?P<hours>\d+?)h)?((?P<minutes>\d+?)m)?((?P<seconds>\d+?)s)?")
    {
        Ok(re) => re,
        Err(e) => {
            warn!("failed to compile time span regex: {}", e);
            return 0;
        }
    };
    let Some(time_matches) = re.captures(time_str) else {
        return 0;
    };
    let value = |name: &str| {
        time_matches
            .name(name)
            .and_then(|m| usize::from_str(m.as_str()).ok())
            .unwrap_or(0)
    };
    let (hours, minutes, seconds) = (value("hours"), value("minutes"), value("seconds"));
    let total = hours * 60 * 60 + minutes * 60 + seconds;
    trace!(
        "{} hours {} minutes {} seconds: {} seconds",
        hours,
        minutes,
        seconds,
        total
    );
    total
}

/// Sleeps until `interval` has passed since `since`, then returns the time it woke.
///
/// Work done since `since` counts toward the interval, so a loop that calls this once
/// per iteration keeps a steady cadence. If the work took longer than the interval,
/// it returns without sleeping.
///
/// # Example
/// ```rust
/// use loadtree::util;
/// use std::time::Duration;
///
/// # async fn reconcile() {}
/// async fn every_second() {
///     let mut tick = tokio::time::Instant::now();
///     for _ in 0..3 {
///         reconcile().await;
///         tick = util::sleep_minus_drift(Duration::from_secs(1), tick).await;
///     }
/// }
/// ```
pub async fn sleep_minus_drift(
    interval: Duration,
    since: tokio::time::Instant,
) -> tokio::time::Instant {
    let deadline = since + interval;
    let now = tokio::time::Instant::now();
    if deadline > now {
        tokio::time::sleep_until(deadline).await;
    } else {
        debug!("{:?} behind schedule, not sleeping", now - deadline);
    }
    tokio::time::Instant::now()
}

/// Shortens `name` to at most `width` characters for display in a table column,
/// marking the cut with `..`.
///
/// # Example
/// ```rust
/// use loadtree::util;
///
/// assert_eq!(util::ellipsize("root / profile / view", 10), "root / p..");
/// assert_eq!(util::ellipsize("root / help", 24), "root / help");
/// ```
pub fn ellipsize(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        return name.to_string();
    }
    let kept: String = name.chars().take(width.saturating_sub(2)).collect();
    format!("{}..", kept)
}

/// Parses a spawn rate in users per second. Only finite rates above zero are valid.
///
/// # Example
/// ```rust
/// use loadtree::util;
///
/// assert_eq!(util::parse_spawn_rate("2"), Some(2.0));
/// assert_eq!(util::parse_spawn_rate(".5"), Some(0.5));
/// assert_eq!(util::parse_spawn_rate("0"), None);
/// assert_eq!(util::parse_spawn_rate("fast"), None);
/// ```
pub fn parse_spawn_rate(value: &str) -> Option<f32> {
    match value.trim().parse::<f32>() {
        Ok(rate) if rate.is_finite() && rate > 0.0 => Some(rate),
        Ok(rate) => {
            warn!("spawn rate must be greater than 0, not {}", rate);
            None
        }
        Err(e) => {
            warn!("failed to parse spawn rate {}: {}", value, e);
            None
        }
    }
}

/// Shuts the load test down on ctrl-c. A second ctrl-c exits immediately.
pub(crate) fn setup_ctrlc_handler(handle: LoadTestHandle) {
    let canceled = AtomicBool::new(false);
    match ctrlc::set_handler(move || {
        // We've caught a ctrl-c, determine if it's the first time or an additional time.
        if canceled.swap(true, Ordering::SeqCst) {
            warn!("caught another ctrl-c, exiting immediately...");
            std::process::exit(1);
        } else {
            warn!("caught ctrl-c, stopping...");
            handle.shutdown();
        }
    }) {
        Ok(_) => (),
        Err(e) => info!("failed to set ctrl-c handler: {}", e),
    }
}
