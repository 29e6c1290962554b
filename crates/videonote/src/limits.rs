use humansize::{format_size, DECIMAL};
use serde::{Deserialize, Serialize};

/// Upper bounds for a clip's declared duration and size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Longest accepted clip, in seconds
    pub max_duration_secs: u64,
    /// Largest accepted upload, in bytes
    pub max_size_bytes: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_duration_secs: 60,
            max_size_bytes: 10_000_000,
        }
    }
}

impl Limits {
    /// Returns true when the clip is acceptable. Values exactly at a threshold pass.
    pub fn validate(&self, duration_secs: u64, size_bytes: u64) -> bool {
        duration_secs <= self.max_duration_secs && size_bytes <= self.max_size_bytes
    }

    /// Human readable form used in log lines, e.g. `60s / 10 MB`
    pub fn describe(&self) -> String {
        format!(
            "{}s / {}",
            self.max_duration_secs,
            format_size(self.max_size_bytes, DECIMAL)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_boundaries() {
        let limits = Limits::default();
        assert!(limits.validate(60, 10_000_000));
        assert!(limits.validate(0, 0));
        assert!(!limits.validate(61, 10_000_000));
        assert!(!limits.validate(60, 10_000_001));
        assert!(!limits.validate(90, 5_000_000));
    }

    #[test]
    fn test_describe() {
        assert_eq!(Limits::default().describe(), "60s / 10 MB");
    }

    proptest! {
        #[test]
        fn test_rejects_iff_a_threshold_is_exceeded(
            max_duration in 0u64..10_000,
            max_size in 0u64..1_000_000_000,
            duration in 0u64..20_000,
            size in 0u64..2_000_000_000,
        ) {
            let limits = Limits { max_duration_secs: max_duration, max_size_bytes: max_size };
            let rejected = !limits.validate(duration, size);
            prop_assert_eq!(rejected, duration > max_duration || size > max_size);
        }
    }
}
