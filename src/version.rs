//! Build identification for the `/version` endpoint

use serde::Serialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_date: &'static str,
}

/// Version information for this build. Commit and build date are stamped by
/// the container build via environment variables.
pub fn current() -> VersionInfo {
    VersionInfo {
        version: VERSION,
        commit: option_env!("COLDFRONT_COMMIT").unwrap_or("unknown"),
        build_date: option_env!("COLDFRONT_BUILD_DATE").unwrap_or("unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_serializes_expected_fields() {
        let json = serde_json::to_value(current()).unwrap();
        assert!(json.get("version").is_some());
        assert!(json.get("commit").is_some());
        assert!(json.get("build_date").is_some());
        assert_eq!(json["version"], VERSION);
    }
}
