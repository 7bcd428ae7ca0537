use crate::api::error::AppError;

/// Maximum filename length in bytes
pub const MAX_FILENAME_LEN: usize = 255;

/// Validates that a requested filename is a single, plain path segment.
///
/// Unlike a sanitizer this never rewrites the name: the remote file must carry
/// exactly the name the caller asked for, so anything that would need
/// rewriting is rejected.
pub fn validate_filename(filename: &str) -> Result<&str, AppError> {
    if filename.is_empty() {
        return Err(AppError::InvalidFilename(
            "Filename cannot be empty".to_string(),
        ));
    }

    if filename.len() > MAX_FILENAME_LEN {
        return Err(AppError::InvalidFilename(format!(
            "Filename exceeds {} bytes",
            MAX_FILENAME_LEN
        )));
    }

    if filename == "." || filename == ".." {
        return Err(AppError::InvalidFilename(format!(
            "'{}' is not a file name",
            filename
        )));
    }

    // Path traversal attempts
    if filename.contains('/') || filename.contains('\\') {
        tracing::warn!("Path traversal attempt detected: {}", filename);
        return Err(AppError::InvalidFilename(
            "Filename must not contain path separators".to_string(),
        ));
    }

    if filename.chars().any(|c| c.is_control()) {
        return Err(AppError::InvalidFilename(
            "Filename must not contain control characters".to_string(),
        ));
    }

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert_eq!(validate_filename("report.csv").unwrap(), "report.csv");
        assert_eq!(validate_filename("my file.doc").unwrap(), "my file.doc");
        assert_eq!(validate_filename("测试.txt").unwrap(), "测试.txt");
        assert_eq!(validate_filename("archive..tar").unwrap(), "archive..tar");
        assert_eq!(validate_filename(".profile").unwrap(), ".profile");
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(validate_filename("../../../etc/passwd").is_err());
        assert!(validate_filename("..\\..\\windows\\system32").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("dir/file.txt").is_err());
        assert!(validate_filename("/absolute").is_err());
    }

    #[test]
    fn test_rejects_empty_control_and_long() {
        assert!(validate_filename("").is_err());
        assert!(validate_filename("bad\0name").is_err());
        assert!(validate_filename("line\nbreak").is_err());
        assert!(validate_filename(&"a".repeat(256)).is_err());
        assert!(validate_filename(&"a".repeat(255)).is_ok());
    }
}
