//! Secret scrubbing for anything that reaches disk.

use std::sync::OnceLock;

use regex::Regex;

use crate::config::REDACTED;

/// Patterns with a flag telling whether capture group 1 is kept as a prefix.
fn patterns() -> &'static [(Regex, bool)] {
    static PATTERNS: OnceLock<Vec<(Regex, bool)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Authorization headers
            (r"(?i)(bearer\s+)[A-Za-z0-9\-._~+/]+=*", true),
            // OAuth access tokens with a well-known prefix
            (r"ya29\.[A-Za-z0-9\-_]+", false),
            // "key": "value" inside JSON
            (
                r#"(?i)("(?:access_token|refresh_token|client_secret|id_token|api_key)"\s*:\s*")[^"]*"#,
                true,
            ),
            // key=value in query strings and form bodies
            (
                r"(?i)(\b(?:access_token|refresh_token|client_secret|id_token|api_key)=)[^\s&\x22]+",
                true,
            ),
        ]
        .iter()
        .filter_map(|(p, keep)| Regex::new(p).ok().map(|re| (re, *keep)))
        .collect()
    })
}

/// Replace token-shaped substrings and any of `literals` with the redaction marker.
pub fn redact_secrets(text: &str, literals: &[String]) -> String {
    let mut out = text.to_string();
    for literal in literals.iter().filter(|l| l.len() >= 4) {
        out = out.replace(literal.as_str(), REDACTED);
    }
    for (re, keep_prefix) in patterns() {
        out = if *keep_prefix {
            re.replace_all(&out, format!("${{1}}{REDACTED}")).into_owned()
        } else {
            re.replace_all(&out, REDACTED).into_owned()
        };
    }
    out
}
