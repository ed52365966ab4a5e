//! Text normalization and quality warnings for extracted text.

use crate::artifacts::codes;

/// Whitespace runs at least this long are reported.
pub const LONG_WHITESPACE_LIMIT: usize = 120;

/// Share of non-printable characters above which the text is reported.
pub const NON_PRINTABLE_RATIO_LIMIT: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityIssue {
    pub code: &'static str,
    pub detail: String,
}

fn is_layout_control(c: char) -> bool {
    matches!(c, '\n' | '\r' | '\t' | '\x0c')
}

fn is_non_printable(c: char) -> bool {
    (c.is_control() && !is_layout_control(c))
        || c == '\u{FFFD}'
        || matches!(c as u32, 0xE000..=0xF8FF)
}

/// Inspect raw text before normalization.
pub fn quality_warnings(raw: &str) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    let controls = raw
        .chars()
        .filter(|&c| c.is_control() && !is_layout_control(c))
        .count();
    if controls > 0 {
        issues.push(QualityIssue {
            code: codes::CONTROL_CHARACTERS,
            detail: format!("{controls} control characters removed"),
        });
    }

    let mut longest = 0usize;
    let mut current = 0usize;
    for c in raw.chars() {
        if c.is_whitespace() {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    if longest >= LONG_WHITESPACE_LIMIT {
        issues.push(QualityIssue {
            code: codes::LONG_WHITESPACE_RUN,
            detail: format!("whitespace run of {longest} characters"),
        });
    }

    let visible = raw.chars().filter(|c| !c.is_whitespace()).count();
    if visible > 0 {
        let non_printable = raw.chars().filter(|&c| is_non_printable(c)).count();
        let ratio = non_printable as f64 / visible as f64;
        if ratio > NON_PRINTABLE_RATIO_LIMIT {
            issues.push(QualityIssue {
                code: codes::HIGH_NON_PRINTABLE_RATIO,
                detail: format!("{:.1}% non-printable characters", ratio * 100.0),
            });
        }
    }

    issues
}

/// Strip control characters, unify line endings, trim line ends and collapse
/// runs of blank lines to one.
pub fn normalize_text(raw: &str) -> String {
    let cleaned: String = raw
        .replace("\r\n", "\n")
        .replace(['\r', '\x0c'], "\n")
        .chars()
        .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
        .collect();

    let mut out: Vec<&str> = Vec::new();
    let mut blank_run = 0usize;
    for line in cleaned.lines().map(str::trim_end) {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 || out.is_empty() {
                continue;
            }
            out.push("");
        } else {
            blank_run = 0;
            out.push(line);
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// One Markdown section of `ingestion/text.md`. `position` is 1-based.
pub fn render_section(position: usize, file_name: &str, text: &str) -> String {
    if text.is_empty() {
        format!("## {position}. {file_name}\n\n_(no text extracted)_\n")
    } else {
        format!("## {position}. {file_name}\n\n{text}\n")
    }
}
