//! MarkdownV2 rendering of the usage replies.

use std::fmt::Write;

use chrono::{Local, TimeZone};

use crate::types::{CoreUsage, PeerRecord};

pub const HELP: &str = "\n🏷 *Commands*\n\
🔧 /hw\\_usage \\- returns hardware usage\n\
🥷🏻 /wg\\_usage \\- returns WireGuard usage";

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";
/// A peer counts as online this long after its last handshake.
pub const ONLINE_THRESHOLD_SECS: i64 = 2 * 60;

const HANDSHAKE_FORMAT: &str = "%Y-%m-%d %H:%M";
const SIZE_UNITS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];
const SIZE_THRESHOLD: f64 = 1000.0;

pub fn host_header(host: &str) -> String {
    format!("🖥 {}\n", code(host))
}

pub fn help_message() -> String {
    format!("🤖 Hello\\!\n{HELP}")
}

/// `None` means the sampler has not published yet.
pub fn cpu_message(usage: Option<&[CoreUsage]>) -> String {
    let mut out = String::new();
    match usage {
        None => out.push_str("🔧 Hardware usage is not found 🗿\n"),
        Some(cores) => {
            out.push_str("🔧 *Hardware usage*\n");
            for core in cores {
                let _ = writeln!(out, "{} \\- {}%", code(&core.slug), core.percentage);
            }
        }
    }
    out.push_str(HELP);
    out
}

pub fn peer_message(peers: Option<&[PeerRecord]>, now_unix: i64) -> String {
    let mut out = String::new();
    match peers {
        None => out.push_str("🥷🏻 *WireGuard usage* is not found 🗿\n"),
        Some([]) => out.push_str("🥷🏻 *WireGuard usage* is empty 🗿\n"),
        Some(peers) => {
            out.push_str("🥷🏻 *WireGuard usage*\n");
            for peer in peers {
                out.push_str("⏤⏤⏤\n");
                let status = activity_status(now_unix, peer.latest_handshake);
                let _ = writeln!(out, "{} is {}", code(&peer.name), code(status));
                if peer.has_handshaked() {
                    let at = format_handshake(peer.latest_handshake);
                    let _ = writeln!(out, "handshaked at {}", code(&at));
                }
                if peer.transfer_rx != 0 {
                    let _ = writeln!(out, "received {}", code(&format_size(peer.transfer_rx)));
                }
                if peer.transfer_tx != 0 {
                    let _ = writeln!(out, "sent     {}", code(&format_size(peer.transfer_tx)));
                }
            }
        }
    }
    out.push_str(HELP);
    out
}

pub fn activity_status(now_unix: i64, latest_handshake: i64) -> &'static str {
    if now_unix.saturating_sub(latest_handshake) < ONLINE_THRESHOLD_SECS {
        STATUS_ONLINE
    } else {
        STATUS_OFFLINE
    }
}

/// Local time, minute precision.
pub fn format_handshake(unix: i64) -> String {
    match Local.timestamp_opt(unix, 0).single() {
        Some(at) => at.format(HANDSHAKE_FORMAT).to_string(),
        None => unix.to_string(),
    }
}

pub fn format_size(bytes: u64) -> String {
    let mut n = bytes as f64;
    let mut order = 0;
    while n > SIZE_THRESHOLD && order + 1 < SIZE_UNITS.len() {
        n /= 1024.0;
        order += 1;
    }
    format!("{n:.2} {}", SIZE_UNITS[order])
}

/// Inline code span; only backtick and backslash need escaping inside it.
fn code(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('`');
    for c in text.chars() {
        if c == '`' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('`');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_scale_past_a_thousand() {
        assert_eq!(format_size(0), "0.00 B");
        assert_eq!(format_size(1000), "1000.00 B");
        assert_eq!(format_size(1001), "0.98 KiB");
        assert_eq!(format_size(1536 * 1024), "1.50 MiB");
        assert_eq!(format_size(u64::MAX), "16.00 EiB");
    }

    #[test]
    fn online_only_within_two_minutes() {
        assert_eq!(activity_status(1_000, 1_000 - 119), STATUS_ONLINE);
        assert_eq!(activity_status(1_000, 1_000 - 120), STATUS_OFFLINE);
        assert_eq!(activity_status(1_000, 0), STATUS_OFFLINE);
    }

    #[test]
    fn code_spans_escape_backticks() {
        assert_eq!(code("a`b\\c"), "`a\\`b\\\\c`");
    }
}
