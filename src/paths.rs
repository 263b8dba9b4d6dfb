use std::path::PathBuf;

/// Returns the dropmark state directory.
///
/// Resolution order:
/// 1. `DROPMARK_ROOT` environment variable (if set)
/// 2. Current working directory + `.dropmark`
pub fn state_root() -> PathBuf {
    if let Ok(root) = std::env::var("DROPMARK_ROOT") {
        PathBuf::from(root)
    } else {
        PathBuf::from(".dropmark")
    }
}

/// Returns the path to the configuration file.
pub fn config_path() -> PathBuf {
    state_root().join("config.yaml")
}

/// Returns the path to the processed-items ledger.
pub fn ledger_path() -> PathBuf {
    state_root().join("ledger.ndjson")
}

/// Returns the path to the single-instance heartbeat record.
pub fn instance_path() -> PathBuf {
    state_root().join("instance.json")
}

/// Returns the directory transforms write into before placement.
pub fn staging_dir() -> PathBuf {
    state_root().join("staging")
}

/// Returns the directory holding the rotating activity log.
pub fn logs_dir() -> PathBuf {
    state_root().join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_state_root_default() {
        // SAFETY: We use #[serial] to ensure single-threaded access
        unsafe { std::env::remove_var("DROPMARK_ROOT") };
        assert_eq!(state_root(), PathBuf::from(".dropmark"));
        assert_eq!(ledger_path(), PathBuf::from(".dropmark/ledger.ndjson"));
    }

    #[test]
    #[serial]
    fn test_state_root_with_env_var() {
        // SAFETY: We use #[serial] to ensure single-threaded access
        unsafe { std::env::set_var("DROPMARK_ROOT", "/srv/dropmark") };
        assert_eq!(state_root(), PathBuf::from("/srv/dropmark"));
        assert_eq!(staging_dir(), PathBuf::from("/srv/dropmark/staging"));
        assert_eq!(instance_path(), PathBuf::from("/srv/dropmark/instance.json"));
        unsafe { std::env::remove_var("DROPMARK_ROOT") };
    }
}
