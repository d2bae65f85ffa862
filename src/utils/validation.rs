use anyhow::{Result, anyhow};

/// Maximum number of path segments accepted for an object key
pub const MAX_PATH_DEPTH: usize = 16;

/// Maximum length of one path segment in bytes
pub const MAX_SEGMENT_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validates a declared upload size against the maximum limit
pub fn validate_file_size(size: u64, max_size: usize) -> Result<()> {
    if size > max_size as u64 {
        return Err(anyhow!(ValidationError {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        }));
    }
    Ok(())
}

fn sanitize_segment(segment: &str) -> Result<String> {
    if segment == "." || segment == ".." {
        tracing::warn!("Path traversal attempt detected: {}", segment);
        return Err(anyhow!(ValidationError {
            code: "PATH_TRAVERSAL",
            message: "Relative path segments are not allowed".to_string(),
        }));
    }

    // Prevent hidden files
    if segment.starts_with('.') {
        return Err(anyhow!(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        }));
    }

    let sanitized: String = segment
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ';') {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    if sanitized.len() > MAX_SEGMENT_LEN {
        let mut end = MAX_SEGMENT_LEN;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        return Ok(sanitized[..end].to_string());
    }
    Ok(sanitized)
}

/// Normalises the object key taken from the request path. Empty segments are
/// collapsed; traversal and hidden segments are rejected.
pub fn sanitize_object_path(path: &str) -> Result<String> {
    let segments = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(sanitize_segment)
        .collect::<Result<Vec<_>>>()?;

    if segments.is_empty() {
        return Err(anyhow!(ValidationError {
            code: "INVALID_PATH",
            message: "Object path cannot be empty".to_string(),
        }));
    }
    if segments.len() > MAX_PATH_DEPTH {
        return Err(anyhow!(ValidationError {
            code: "INVALID_PATH",
            message: format!("Object path is deeper than {} segments", MAX_PATH_DEPTH),
        }));
    }
    Ok(segments.join("/"))
}
