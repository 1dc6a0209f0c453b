//! Run requests and boundary validation of submitted file sets

use crate::config::LimitsConfig;
use crate::language::Language;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Instant;

/// One submitted source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative POSIX path inside the container working directory
    pub path: String,

    /// File contents
    pub content: String,

    /// Marks the file the run command is derived from
    #[serde(default, rename = "toBeExec", skip_serializing_if = "is_false")]
    pub to_be_exec: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One run request, validated at the server boundary
#[derive(Debug)]
pub struct RunRequest {
    /// Session (connection) the request belongs to
    pub session_key: String,
    /// Identifier of this run within the session
    pub submission_id: String,
    /// Target language
    pub language: Language,
    /// Submitted file set
    pub files: Vec<FileEntry>,
    /// Admission timestamp
    pub enqueued_at: Instant,
}

fn path_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9._\-/]+$").expect("valid pattern"))
}

/// Validate a submitted file set against the configured bounds.
///
/// Any violation fails the whole request; nothing downstream of this check
/// ever sees an invalid path or an oversized payload.
pub fn validate_files(files: &[FileEntry], limits: &LimitsConfig) -> Result<()> {
    if files.is_empty() {
        return Err(Error::Validation("no files in submission".to_string()));
    }
    if files.len() > limits.max_files {
        return Err(Error::Validation(format!(
            "too many files: {} > {}",
            files.len(),
            limits.max_files
        )));
    }

    let mut total = 0usize;
    for file in files {
        validate_path(&file.path)?;

        let size = file.content.len();
        if size > limits.max_file_bytes {
            return Err(Error::Validation(format!(
                "file '{}' is {} bytes, limit is {}",
                file.path, size, limits.max_file_bytes
            )));
        }
        total += size;
    }

    if total > limits.max_total_bytes {
        return Err(Error::Validation(format!(
            "submission is {} bytes, limit is {}",
            total, limits.max_total_bytes
        )));
    }

    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Validation("empty file path".to_string()));
    }
    if path.contains('\0') {
        return Err(Error::Validation("file path contains NUL".to_string()));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(Error::Validation(format!(
            "file path '{}' is not relative",
            path
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(Error::Validation(format!(
            "file path '{}' contains a parent segment",
            path
        )));
    }
    if !path_pattern().is_match(path) {
        return Err(Error::Validation(format!(
            "file path '{}' contains disallowed characters",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, content: &str) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            content: content.to_string(),
            to_be_exec: false,
        }
    }

    fn limits() -> LimitsConfig {
        LimitsConfig {
            max_files: 3,
            max_file_bytes: 16,
            max_total_bytes: 32,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn test_valid_set() {
        let files = vec![entry("src/main.py", "print(1)"), entry("lib/util.py", "x=1")];
        assert!(validate_files(&files, &limits()).is_ok());
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(validate_files(&[], &limits()).is_err());
    }

    #[test]
    fn test_file_count_bound() {
        let files = vec![
            entry("a", ""),
            entry("b", ""),
            entry("c", ""),
            entry("d", ""),
        ];
        assert!(matches!(
            validate_files(&files, &limits()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_size_at_boundary_accepted_one_over_rejected() {
        let at = vec![entry("a.py", &"x".repeat(16))];
        assert!(validate_files(&at, &limits()).is_ok());

        let over = vec![entry("a.py", &"x".repeat(17))];
        assert!(validate_files(&over, &limits()).is_err());
    }

    #[test]
    fn test_total_size_bound() {
        let files = vec![
            entry("a.py", &"x".repeat(16)),
            entry("b.py", &"x".repeat(16)),
            entry("c.py", &"x".repeat(1)),
        ];
        assert!(validate_files(&files, &limits()).is_err());
    }

    #[test]
    fn test_parent_segment_rejected() {
        let files = vec![entry("../etc/passwd", "")];
        assert!(validate_files(&files, &limits()).is_err());

        let sneaky = vec![entry("a/../b.py", "")];
        assert!(validate_files(&sneaky, &limits()).is_err());

        // ".." as a substring of a real name is fine
        let fine = vec![entry("a..b.py", "")];
        assert!(validate_files(&fine, &limits()).is_ok());
    }

    #[test]
    fn test_absolute_and_nul_rejected() {
        assert!(validate_files(&[entry("/etc/passwd", "")], &limits()).is_err());
        assert!(validate_files(&[entry("\\windows", "")], &limits()).is_err());
        assert!(validate_files(&[entry("a\0b", "")], &limits()).is_err());
    }

    #[test]
    fn test_disallowed_characters_rejected() {
        assert!(validate_files(&[entry("a b.py", "")], &limits()).is_err());
        assert!(validate_files(&[entry("a;rm.py", "")], &limits()).is_err());
        assert!(validate_files(&[entry("$(x).py", "")], &limits()).is_err());
    }

    #[test]
    fn test_to_be_exec_wire_shape() {
        let json = r#"{"path":"main.py","content":"print(1)","toBeExec":true}"#;
        let file: FileEntry = serde_json::from_str(json).unwrap();
        assert!(file.to_be_exec);

        let json = r#"{"path":"util.py","content":""}"#;
        let file: FileEntry = serde_json::from_str(json).unwrap();
        assert!(!file.to_be_exec);
    }
}
