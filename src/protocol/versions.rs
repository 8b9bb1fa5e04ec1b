//! Fetch API version negotiation.
//!
//! The fetch request version is picked from the broker release the
//! client is configured to assume, never probed at runtime.
//!
//! # Version Matrix
//!
//! | Broker release ≥ | Fetch version | Added capability |
//! |------------------|---------------|------------------|
//! | 0.9.0  | 1  | baseline |
//! | 0.10.0 | 2  | message format v1 |
//! | 0.10.1 | 3  | request `max_bytes`; partition order respected |
//! | 0.11.0 | 5  | isolation level; record batches; log start offset |
//! | 1.0.0  | 6  | same wire format as 5 |
//! | 1.1.0  | 7  | fetch sessions (sent disabled: id 0, epoch -1) |
//! | 2.0.0  | 8  | same wire format as 7 |
//! | 2.1.0  | 10 | current leader epoch; zstd |
//! | 2.3.0  | 11 | rack id |

use crate::config::KafkaVersion;

/// Pick the fetch request version for a broker release.
pub fn fetch_version(version: KafkaVersion) -> i16 {
    match version {
        KafkaVersion::V0_9_0 => 1,
        KafkaVersion::V0_10_0 => 2,
        KafkaVersion::V0_10_1 => 3,
        KafkaVersion::V0_11_0 => 5,
        KafkaVersion::V1_0_0 => 6,
        KafkaVersion::V1_1_0 => 7,
        KafkaVersion::V2_0_0 => 8,
        KafkaVersion::V2_1_0 => 10,
        KafkaVersion::V2_3_0 => 11,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_version_table() {
        assert_eq!(fetch_version(KafkaVersion::V0_9_0), 1);
        assert_eq!(fetch_version(KafkaVersion::V0_10_0), 2);
        assert_eq!(fetch_version(KafkaVersion::V0_10_1), 3);
        assert_eq!(fetch_version(KafkaVersion::V0_11_0), 5);
        assert_eq!(fetch_version(KafkaVersion::V1_0_0), 6);
        assert_eq!(fetch_version(KafkaVersion::V1_1_0), 7);
        assert_eq!(fetch_version(KafkaVersion::V2_0_0), 8);
        assert_eq!(fetch_version(KafkaVersion::V2_1_0), 10);
        assert_eq!(fetch_version(KafkaVersion::V2_3_0), 11);
    }

    #[test]
    fn test_fetch_version_is_monotonic() {
        let releases = [
            KafkaVersion::V0_9_0,
            KafkaVersion::V0_10_0,
            KafkaVersion::V0_10_1,
            KafkaVersion::V0_11_0,
            KafkaVersion::V1_0_0,
            KafkaVersion::V1_1_0,
            KafkaVersion::V2_0_0,
            KafkaVersion::V2_1_0,
            KafkaVersion::V2_3_0,
        ];
        for pair in releases.windows(2) {
            assert!(fetch_version(pair[0]) < fetch_version(pair[1]));
        }
    }
}
