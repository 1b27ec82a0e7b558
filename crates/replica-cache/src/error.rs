use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the local replica cache and its remote transfers.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to determine home directory for default cache path")]
    MissingHomeDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {message}")]
    Json { message: String },

    #[error("walkdir error: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("archive error: {0}")]
    Archive(#[from] replica_archive::ArchiveError),

    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("invalid data type {value:?}: expected one of `model`, `dataset`")]
    InvalidDataType { value: String },

    #[error("{path} does not exist")]
    NotFound { path: PathBuf },

    #[error("key {key:?} does not exist in the remote store")]
    RemoteKeyNotFound { key: String },

    #[error("file {key:?} is not available: no local copy and not connected to the remote store")]
    FileNotAvailable { key: String },

    #[error("not connected to the remote store")]
    NotConnected,

    #[error("transfer of {target} failed: {message}")]
    Transfer { target: String, message: String },

    #[error("upload of {key:?} failed: {message}")]
    Upload { key: String, message: String },
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: redact_json_error_message(&err.to_string()),
        }
    }
}

/// Blank out quoted string values and the first backticked name in a `serde_json` message.
///
/// Remote metadata may carry tokens or user data; line/column info and the expected-value
/// list are kept.
fn redact_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(open) = rest.find('"') {
        out.push_str(&rest[..=open]);
        rest = &rest[open + 1..];
        match closing_quote(rest) {
            Some(close) => {
                out.push_str("<redacted>\"");
                rest = &rest[close + 1..];
            }
            None => {
                out.push_str("<redacted>");
                rest = "";
            }
        }
    }
    out.push_str(rest);

    // `unknown field `token`, expected one of ...`
    if let Some(start) = out.find('`') {
        let name_start = start + 1;
        let tail = &out[name_start..];
        let name_len = tail.find("`, expected").or_else(|| tail.find('`'));
        if let Some(name_len) = name_len {
            out.replace_range(name_start..name_start + name_len, "<redacted>");
        }
    }
    out
}

/// Index of the first `"` in `s` not escaped by an odd run of backslashes.
fn closing_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    bytes.iter().enumerate().find_map(|(idx, &b)| {
        let backslashes = bytes[..idx].iter().rev().take_while(|&&c| c == b'\\').count();
        (b == b'"' && backslashes % 2 == 0).then_some(idx)
    })
}

impl CacheError {
    /// `true` for failures a caller may retry once connectivity is restored.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::FileNotAvailable { .. } | Self::NotConnected | Self::Transfer { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_do_not_echo_string_values() {
        let secret = "replica-token-0xdeadbeef";
        let err = serde_json::from_value::<u64>(serde_json::json!(format!("a\"{secret}")))
            .unwrap_err();
        let message = CacheError::from(err).to_string();
        assert!(!message.contains(secret), "{message}");
        assert!(message.contains("<redacted>"), "{message}");
    }

    #[test]
    fn unknown_field_names_are_redacted_but_expectations_kept() {
        #[derive(Debug, serde::Deserialize)]
        #[serde(deny_unknown_fields)]
        #[allow(dead_code)]
        struct Meta {
            version: u64,
        }

        let err = serde_json::from_str::<Meta>(r#"{"leaked_name": 1}"#).unwrap_err();
        let message = CacheError::from(err).to_string();
        assert!(!message.contains("leaked_name"), "{message}");
        assert!(message.contains("version"), "{message}");
    }
}
