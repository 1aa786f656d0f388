/// Maximum length for response bodies quoted in errors and logs
const MAX_BODY_LENGTH: usize = 500;

/// Number of leading characters of a token shown in logs and status output
const TOKEN_PREVIEW_CHARS: usize = 8;

/// Truncate a response body to avoid logging excessive data
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_BODY_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_BODY_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

/// Short, log-safe rendering of a secret: the first few characters plus an ellipsis
pub fn token_preview(token: &str) -> String {
    if token.chars().count() > TOKEN_PREVIEW_CHARS + 4 {
        let head: String = token.chars().take(TOKEN_PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        // Too short to reveal any prefix safely
        "***".to_string()
    }
}
