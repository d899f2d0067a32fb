/*!
Tests for error handling and error types.
*/

#[cfg(test)]
mod tests {
    use crate::error::{ErrorCategory, ZchainError};
    use std::io;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let error = ZchainError::validation("Dataset name cannot be empty");
        assert_eq!(
            error.to_string(),
            "Validation error: Dataset name cannot be empty"
        );

        let error = ZchainError::fatal("No backups found in restore chain.");
        assert_eq!(error.to_string(), "No backups found in restore chain.");

        let error = ZchainError::LockHeld {
            path: PathBuf::from("/var/lock/zchain.lock"),
        };
        assert_eq!(error.to_string(), "Lock held: /var/lock/zchain.lock");
    }

    #[test]
    fn test_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = ZchainError::from(io_error);

        match error {
            ZchainError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_stage_failure_carries_stderr() {
        let error = ZchainError::StageFailed {
            index: 1,
            program: "gzip".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "gzip: stdout: No space left on device".to_string(),
        };

        let message = error.to_string();
        assert!(message.contains("Stage 1 (gzip)"));
        assert!(message.contains("No space left on device"));
    }

    #[test]
    fn test_timeout_message() {
        let error = ZchainError::Timeout {
            program: "zstreamdump".to_string(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(error.to_string(), "zstreamdump timed out after 10s");
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ZchainError::validation("bad").category(),
            ErrorCategory::Validation
        );
        assert!(ZchainError::binary_not_found("zfs").is_validation());
        assert!(ZchainError::invalid_argument("no stages").is_validation());

        assert!(ZchainError::fatal("boom").is_fatal());
        assert!(ZchainError::NoChains {
            root: PathBuf::from("/mnt")
        }
        .is_fatal());
        assert!(ZchainError::from(io::Error::new(io::ErrorKind::Other, "x")).is_fatal());
    }

    #[test]
    fn test_lock_contention_is_distinguishable() {
        let lock = ZchainError::LockHeld {
            path: PathBuf::from("/tmp/x.lock"),
        };
        assert!(lock.is_fatal());
        assert!(lock.is_lock_contention());
        assert!(!ZchainError::fatal("Lock held: /tmp/x.lock").is_lock_contention());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ZchainError>();
        assert_sync::<ZchainError>();
    }
}
