use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const MAX_FILES: usize = 32;
pub const MAX_FILE_BYTES: usize = 256 * 1024;
pub const MAX_BUNDLE_BYTES: usize = 1024 * 1024;
pub const MAX_INPUT_BYTES: usize = 64 * 1024;
pub const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub language: String,
    pub files: Vec<SourceFile>,
    pub entry_file: String,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputRequest {
    pub input: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

pub fn validate_session_id(session_id: &str) -> Result<(), EngineError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(EngineError::InvalidRequest(format!(
            "session id must be 1..={MAX_SESSION_ID_LEN} characters"
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(EngineError::InvalidRequest(
            "session id may only contain alphanumerics, '.', '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_bundle(request: &ExecuteRequest) -> Result<(), EngineError> {
    if request.files.is_empty() {
        return Err(EngineError::InvalidRequest(
            "source bundle is empty".to_string(),
        ));
    }
    if request.files.len() > MAX_FILES {
        return Err(EngineError::InvalidRequest(format!(
            "too many files; max is {MAX_FILES}"
        )));
    }

    let mut total = 0usize;
    for file in &request.files {
        validate_file_name(&file.name)?;
        if file.content.len() > MAX_FILE_BYTES {
            return Err(EngineError::InvalidRequest(format!(
                "file {} exceeds {MAX_FILE_BYTES} bytes",
                file.name
            )));
        }
        total += file.content.len();
    }
    if total > MAX_BUNDLE_BYTES {
        return Err(EngineError::InvalidRequest(format!(
            "source bundle exceeds {MAX_BUNDLE_BYTES} bytes"
        )));
    }

    if !request.files.iter().any(|f| f.name == request.entry_file) {
        return Err(EngineError::InvalidRequest(format!(
            "entry file {} is not part of the bundle",
            request.entry_file
        )));
    }

    if let Some(input) = &request.input {
        if input.len() > MAX_INPUT_BYTES {
            return Err(EngineError::InvalidRequest("input too large".to_string()));
        }
    }

    Ok(())
}

// File names become paths inside the sandbox scratch directory and appear in
// synthesized shell commands, so the accepted alphabet is deliberately narrow.
fn validate_file_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > 128 {
        return Err(EngineError::InvalidRequest(
            "file name must be 1..=128 characters".to_string(),
        ));
    }
    if name.starts_with('.') || name.contains("..") {
        return Err(EngineError::InvalidRequest(format!(
            "invalid file name: {name}"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(EngineError::InvalidRequest(format!(
            "file name contains unsupported characters: {name}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(files: Vec<(&str, &str)>, entry: &str) -> ExecuteRequest {
        ExecuteRequest {
            language: "python".to_string(),
            files: files
                .into_iter()
                .map(|(name, content)| SourceFile {
                    name: name.to_string(),
                    content: content.to_string(),
                })
                .collect(),
            entry_file: entry.to_string(),
            input: None,
        }
    }

    #[test]
    fn accepts_well_formed_bundle() {
        let req = request(vec![("main.py", "print('hi')"), ("util.py", "")], "main.py");
        assert!(validate_bundle(&req).is_ok());
    }

    #[test]
    fn rejects_entry_file_missing_from_set() {
        let req = request(vec![("main.py", "print('hi')")], "other.py");
        assert!(matches!(
            validate_bundle(&req),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_empty_bundle() {
        let req = request(vec![], "main.py");
        assert!(validate_bundle(&req).is_err());
    }

    #[test]
    fn rejects_path_traversal_in_file_names() {
        for name in ["../etc/passwd", "a/b.py", ".hidden", "a;b.py"] {
            let req = request(vec![(name, "")], name);
            assert!(validate_bundle(&req).is_err(), "accepted {name}");
        }
    }

    #[test]
    fn rejects_malformed_session_ids() {
        assert!(validate_session_id("user-42_lesson.3").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a b").is_err());
        assert!(validate_session_id(&"x".repeat(65)).is_err());
    }
}
