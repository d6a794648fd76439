//! Time helpers.

use chrono::Local;

/// Local timestamp in the snapshot-identifier format
/// (`YYYY-mm-dd-HH-MM-SS`).
#[must_use]
pub fn snapshot_timestamp() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_shape() {
        let ts = snapshot_timestamp();
        // YYYY-mm-dd-HH-MM-SS is 19 characters with 5 dashes.
        assert_eq!(ts.len(), 19);
        assert_eq!(ts.matches('-').count(), 5);
    }
}
