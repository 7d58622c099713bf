//! Loading and validating job configuration

use crate::error::DownloadError;
use crate::hash::HashKind;
use splitfetch_types::TransferConfig;
use std::fs;
use std::path::Path;

/// Reject configurations a run cannot start with. Performs no I/O.
pub fn validate_config(config: &TransferConfig) -> Result<(), DownloadError> {
    if config.url.trim().is_empty() {
        return Err(DownloadError::Config("url is empty".to_string()));
    }

    let url = url::Url::parse(&config.url)
        .map_err(|e| DownloadError::Config(format!("invalid url {}: {}", config.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(DownloadError::Config(format!(
            "unsupported scheme: {}",
            url.scheme()
        )));
    }

    if config.directory.as_os_str().is_empty() {
        return Err(DownloadError::Config("directory is empty".to_string()));
    }
    if config.base_name.is_empty() {
        return Err(DownloadError::Config("file name is empty".to_string()));
    }
    if config.worker_count == 0 {
        return Err(DownloadError::Config("worker count must be at least 1".to_string()));
    }

    if let Some(hash) = &config.expected_hash {
        if HashKind::from_hex(hash).is_none() {
            return Err(DownloadError::Config(format!(
                "expected hash must be 32 (MD5) or 64 (SHA-256) hex digits: {}",
                hash
            )));
        }
    }

    Ok(())
}

/// Load a job configuration from a JSON file
pub fn load_config(path: &Path) -> Result<TransferConfig, DownloadError> {
    let content = fs::read_to_string(path)?;
    let config: TransferConfig = serde_json::from_str(&content)
        .map_err(|e| DownloadError::Config(format!("{}: {}", path.display(), e)))?;
    validate_config(&config)?;
    Ok(config)
}

/// Save a job configuration as pretty-printed JSON
pub fn save_config(path: &Path, config: &TransferConfig) -> Result<(), DownloadError> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| DownloadError::Config(e.to_string()))?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TransferConfig {
        TransferConfig::new("https://example.com/file.iso", "/tmp/downloads")
    }

    #[test]
    fn test_valid_config() {
        validate_config(&valid()).unwrap();
        validate_config(&valid().with_expected_hash("900150983CD24FB0D6963F7D28E17F72")).unwrap();
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let cases = vec![
            TransferConfig {
                url: String::new(),
                ..valid()
            },
            TransferConfig {
                url: "ftp://example.com/file.iso".to_string(),
                ..valid()
            },
            TransferConfig {
                url: "not a url".to_string(),
                ..valid()
            },
            TransferConfig {
                directory: "".into(),
                ..valid()
            },
            TransferConfig {
                base_name: String::new(),
                ..valid()
            },
            valid().with_workers(0),
            valid().with_expected_hash("abc123"),
        ];

        for config in cases {
            assert!(
                matches!(validate_config(&config), Err(DownloadError::Config(_))),
                "accepted {:?}",
                config
            );
        }
    }

    #[test]
    fn test_load_and_save_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");

        let config = valid().with_workers(8).with_resume(false);
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.url, config.url);
        assert_eq!(loaded.worker_count, 8);
        assert!(!loaded.resume);
    }

    #[test]
    fn test_load_config_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(&path), Err(DownloadError::Config(_))));
    }
}
