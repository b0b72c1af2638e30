// Small helpers shared by the SQLite-backed stores

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Fixed-width UTC timestamp; lexicographic order == chronological order,
/// so TTL and recency filters can compare straight in SQL.
pub fn now_str() -> String {
    to_timestamp(Utc::now())
}

pub fn to_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Lowercase hex SHA-256 digest, used for semantic memory content dedupe.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_and_sort() {
        let now = Utc::now();
        let s = to_timestamp(now);
        let back = parse_timestamp(&s).unwrap();
        assert_eq!(to_timestamp(back), s);

        let earlier = to_timestamp(now - chrono::Duration::seconds(10));
        assert!(earlier < s);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
