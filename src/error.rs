//! Application error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Application error carrying a stable kind and a small key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance, blueprint or backup absent
    NotFound,
    /// Missing or malformed caller input
    InvalidArgument,
    /// A persisted record is corrupt (relative path, missing key)
    InvalidConfig,
    /// Operation not permitted by the OS
    PermissionDenied,
    /// File system error
    Io,
    /// Latest version could not be determined
    VersionCheck,
    /// Download backend failed
    Download,
    /// Event delivery failed
    Transport,
    /// A required external tool is absent
    DependencyMissing,
    /// Supervision backend refused a start/stop
    Supervision,
    /// Instance is currently running
    InstanceRunning,
    /// Instance is not running
    InstanceNotRunning,
    /// Target is not empty and no override was given
    NotEmpty,
    /// Another mutating operation holds the instance lock
    Locked,
    /// Bounded retries exhausted (e.g. name generation)
    ResourceExhausted,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::NotFound => 1001,
            Self::InvalidArgument => 1002,
            Self::InstanceRunning => 1003,
            Self::InstanceNotRunning => 1004,
            Self::NotEmpty => 1005,
            Self::InvalidConfig => 2001,
            Self::Io => 2002,
            Self::PermissionDenied => 2003,
            Self::Locked => 2004,
            Self::ResourceExhausted => 2005,
            Self::VersionCheck => 3001,
            Self::Download => 3002,
            Self::Supervision => 3003,
            Self::DependencyMissing => 3004,
            Self::Transport => 4001,
            Self::Other => 9999,
        }
    }

    /// Process exit status reported by the CLI. `0` is reserved for success.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument => 2,
            Self::NotFound => 3,
            Self::InvalidConfig => 4,
            Self::PermissionDenied => 5,
            Self::Io => 6,
            Self::VersionCheck => 7,
            Self::Download => 8,
            Self::Transport => 9,
            Self::DependencyMissing => 10,
            Self::Supervision => 11,
            Self::InstanceRunning => 12,
            Self::InstanceNotRunning => 13,
            Self::NotEmpty => 14,
            Self::Locked => 15,
            Self::ResourceExhausted => 16,
            Self::Other => 1,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            BTreeMap::from([("instance".to_string(), name.to_string())]),
        )
    }

    pub fn blueprint_not_found(name: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            BTreeMap::from([("blueprint".to_string(), name.to_string())]),
        )
    }

    pub fn backup_not_found(backup: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            BTreeMap::from([("backup".to_string(), backup.to_string())]),
        )
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::InvalidConfig, message)
    }

    pub fn invalid_record(path: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::InvalidConfig,
            BTreeMap::from([
                ("record".to_string(), path.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::PermissionDenied, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn version_check(blueprint: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::VersionCheck,
            BTreeMap::from([
                ("blueprint".to_string(), blueprint.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Download, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Transport, message)
    }

    pub fn transport_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Transport,
            BTreeMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn dependency_missing(tool: &str) -> Self {
        Self::new(
            ErrorKind::DependencyMissing,
            BTreeMap::from([("tool".to_string(), tool.to_string())]),
        )
    }

    pub fn supervision(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Supervision, message)
    }

    pub fn instance_running(name: &str) -> Self {
        Self::new(
            ErrorKind::InstanceRunning,
            BTreeMap::from([("instance".to_string(), name.to_string())]),
        )
    }

    pub fn instance_not_running(name: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotRunning,
            BTreeMap::from([("instance".to_string(), name.to_string())]),
        )
    }

    pub fn not_empty(path: &str) -> Self {
        Self::new(
            ErrorKind::NotEmpty,
            BTreeMap::from([("path".to_string(), path.to_string())]),
        )
    }

    pub fn locked(name: &str) -> Self {
        Self::new(
            ErrorKind::Locked,
            BTreeMap::from([("instance".to_string(), name.to_string())]),
        )
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ResourceExhausted, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 3)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(err.to_string()),
            std::io::ErrorKind::NotFound => Self::with_detail(ErrorKind::NotFound, err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::invalid_config(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::invalid_config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let kinds = [
            ErrorKind::NotFound,
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidConfig,
            ErrorKind::PermissionDenied,
            ErrorKind::Io,
            ErrorKind::VersionCheck,
            ErrorKind::Download,
            ErrorKind::Transport,
            ErrorKind::DependencyMissing,
            ErrorKind::Supervision,
            ErrorKind::InstanceRunning,
            ErrorKind::InstanceNotRunning,
            ErrorKind::NotEmpty,
            ErrorKind::Locked,
            ErrorKind::ResourceExhausted,
            ErrorKind::Other,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(ErrorKind::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn io_permission_denied_maps_to_its_own_kind() {
        let err: AppError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "NotFound: detail=gone");
    }

    #[test]
    fn display_lists_payload() {
        let err = AppError::instance_not_found("factorio-1234");
        assert_eq!(err.to_string(), "NotFound: instance=factorio-1234");
    }
}
