//! Console output helpers

use chrono::{DateTime, Local, TimeZone};
use colored::Colorize;

/// Format used for snapshot names, descriptions and listings
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

pub fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

pub fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

pub fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

/// Render a local time as `DD-MM-YYYY HH:MM:SS`
pub fn format_local(time: &DateTime<Local>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Render epoch milliseconds in local time as `DD-MM-YYYY HH:MM:SS`.
///
/// Values outside chrono's range fall back to the raw number.
pub fn format_timestamp(epoch_ms: i64) -> String {
    match Local.timestamp_millis_opt(epoch_ms).single() {
        Some(time) => format_local(&time),
        None => epoch_ms.to_string(),
    }
}
