//! Lexicographically sortable unique IDs and RFC3339 timestamps.
//!
//! No ULID crate is pulled in here: none of the example repos in this
//! family depend on one. A sortable ID is instead built from a
//! millisecond timestamp (big-endian, base32-encoded so lexicographic
//! order matches numeric order) followed by random bits from `uuid`.

use chrono::Utc;
use uuid::Uuid;

const CROCKFORD: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Returns the current time as an RFC3339 string with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// A 26-character lexicographically sortable suffix: 10 chars of
/// base32-encoded millisecond timestamp followed by 16 chars of
/// base32-encoded randomness, Crockford alphabet (ULID-style layout).
fn sortable_suffix() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut out = String::with_capacity(26);
    encode_base32(millis, 10, &mut out);

    let rand = Uuid::new_v4();
    let (hi, lo) = rand.as_u64_pair();
    encode_base32(hi, 8, &mut out);
    encode_base32(lo, 8, &mut out);
    out
}

fn encode_base32(mut value: u64, width: usize, out: &mut String) {
    let mut chars = vec![b'0'; width];
    for slot in chars.iter_mut().rev() {
        *slot = CROCKFORD[(value & 0x1f) as usize];
        value >>= 5;
    }
    out.push_str(std::str::from_utf8(&chars).unwrap());
}

pub fn new_event_id() -> String {
    format!("evt_{}", sortable_suffix())
}

pub fn new_daemon_id() -> String {
    format!("d_{}", sortable_suffix())
}

pub fn new_agent_id(role: &str) -> String {
    format!("agent:{}:{}", role, sortable_suffix())
}

pub fn new_session_id() -> String {
    format!("ses_{}", sortable_suffix())
}

pub fn new_message_id() -> String {
    format!("msg_{}", sortable_suffix())
}

pub fn new_thread_id() -> String {
    format!("thread_{}", sortable_suffix())
}

pub fn new_group_id() -> String {
    format!("grp_{}", sortable_suffix())
}

pub fn new_read_marker_id() -> String {
    format!("r_{}", sortable_suffix())
}

pub fn new_subscription_id() -> String {
    format!("sub_{}", sortable_suffix())
}

/// Whole seconds elapsed between an RFC3339 timestamp and now, used for
/// `health`'s `uptime_secs`. Returns `None` if `since` fails to parse.
pub fn seconds_since(since: &str) -> Option<i64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(since).ok()?;
    Some((Utc::now() - parsed.with_timezone(&Utc)).num_seconds())
}

/// `agentIDToName("agent:<role>:<suffix>") = "<role>_<suffix>"`. A bare
/// identifier (no `agent:` prefix) is returned unchanged. Consumed by the
/// log-shard router and by the JSONL-sharding migration; both must agree.
pub fn agent_id_to_name(agent_id: &str) -> String {
    match agent_id.strip_prefix("agent:") {
        Some(rest) => rest.replacen(':', "_", 1),
        None => agent_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_to_name_splits_role_and_suffix() {
        assert_eq!(agent_id_to_name("agent:reviewer:ABC123"), "reviewer_ABC123");
    }

    #[test]
    fn agent_id_to_name_passes_through_bare_identifiers() {
        assert_eq!(agent_id_to_name("bare-name"), "bare-name");
    }

    #[test]
    fn sortable_ids_increase_lexicographically_over_time() {
        let a = new_event_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_event_id();
        assert!(a < b, "{a} should sort before {b}");
    }

    #[test]
    fn ids_carry_expected_prefixes() {
        assert!(new_daemon_id().starts_with("d_"));
        assert!(new_session_id().starts_with("ses_"));
        assert!(new_message_id().starts_with("msg_"));
        assert!(new_thread_id().starts_with("thread_"));
        assert!(new_read_marker_id().starts_with("r_"));
    }
}
