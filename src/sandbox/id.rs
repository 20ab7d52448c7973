use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/**
 * Generates a host-unique identifier used to name per-sandbox resources
 * (overlay scratch directories, cgroup directories, log files).
 *
 * Format: `<nanosecond-epoch>-<8 hex chars of 4 random bytes>`. Uniqueness
 * is probabilistic; the timestamp alone already separates sequential calls.
 */
pub fn generate_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let random = Uuid::new_v4();
    let b = random.as_bytes();
    format!("{}-{:02x}{:02x}{:02x}{:02x}", nanos, b[0], b[1], b[2], b[3])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = generate_id();
            assert!(seen.insert(id.clone()), "duplicate ID generated: {}", id);
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        let (nanos, random) =
            id.split_once('-').expect("ID should contain a dash");
        assert!(nanos.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(random.len(), 8);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
