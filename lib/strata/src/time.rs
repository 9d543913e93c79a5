use chrono::{Local, TimeZone};
use std::convert::TryFrom;

/// Renders a unix timestamp (seconds) in the local timezone, in the classic
/// `ctime` shape. Timestamps outside the representable range are shown raw.
pub fn format_timestamp(secs: u64) -> String {
    let signed = match i64::try_from(secs) {
        Ok(signed) => signed,
        Err(_) => return format!("@{}", secs),
    };

    match Local.timestamp_opt(signed, 0).single() {
        Some(t) => t.format("%a %b %e %H:%M:%S %Y").to_string(),
        None => format!("@{}", secs),
    }
}
