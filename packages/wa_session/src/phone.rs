//! Peer id / phone number helpers.

const USER_SUFFIX: &str = "@s.whatsapp.net";
const GROUP_SUFFIX: &str = "@g.us";

/// The number part of a peer id (`"346...@s.whatsapp.net"` -> `"346..."`).
pub fn peer_to_number(peer_id: &str) -> &str {
    peer_id.split('@').next().unwrap_or("")
}

/// Turn a loosely formatted number into a user peer id.
///
/// Full peer ids pass through untouched. Returns `None` when no digits remain.
pub fn number_to_peer(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if raw.ends_with(USER_SUFFIX) || raw.ends_with(GROUP_SUFFIX) {
        return Some(raw.to_string());
    }
    Some(format!("{digits}{USER_SUFFIX}"))
}

pub fn is_group(peer_id: &str) -> bool {
    peer_id.ends_with(GROUP_SUFFIX)
}

/// Normalize a mobile number to international digits.
///
/// Drops a leading `00`, prefixes `default_cc` on national numbers (9 digits
/// or fewer, leading zeros removed) and rejects results outside 10..=15 digits.
pub fn normalize_mobile(raw: &str, default_cc: &str) -> Option<String> {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    if let Some(rest) = digits.strip_prefix("00") {
        digits = rest.to_string();
    }
    if !digits.starts_with(default_cc) && digits.len() <= 9 {
        digits = format!("{default_cc}{}", digits.trim_start_matches('0'));
    }
    if (10..=15).contains(&digits.len()) {
        Some(digits)
    } else {
        None
    }
}
