//! Needs-OCR decision engine.
//!
//! Classifies the quality of embedded-text extraction for one document and
//! decides whether OCR should run. Pure: same inputs, same decision.
//!
//! Rule precedence (first match wins):
//! 1. total chars below `min_total_chars`
//! 2. chars/page below `min_chars_per_page` and empty-page ratio above threshold
//! 3. a parser or encoding exception was observed
//! 4. more than 90% of non-whitespace characters fall outside the known classes

use serde::{Deserialize, Serialize};

use crate::config::ExtractConfig;

/// Share of "other" characters above which the text is treated as garbage.
pub const OTHER_RATIO_LIMIT: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeedsOcrThresholds {
    pub min_total_chars: usize,
    pub min_chars_per_page: f64,
    pub empty_page_ratio_threshold: f64,
}

impl Default for NeedsOcrThresholds {
    fn default() -> Self {
        Self {
            min_total_chars: 200,
            min_chars_per_page: 50.0,
            empty_page_ratio_threshold: 0.5,
        }
    }
}

impl NeedsOcrThresholds {
    pub fn from_config(config: &ExtractConfig) -> Self {
        Self {
            min_total_chars: config.min_total_chars,
            min_chars_per_page: config.min_chars_per_page,
            empty_page_ratio_threshold: config.empty_page_ratio_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedsOcrReason {
    TotalCharsBelowThreshold,
    LowCharsAndHighEmptyPages,
    ExtractionExceptionDetected,
    UnicodeDistributionAnomaly,
    NotNeeded,
}

impl NeedsOcrReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalCharsBelowThreshold => "total_chars_below_threshold",
            Self::LowCharsAndHighEmptyPages => "low_chars_and_high_empty_pages",
            Self::ExtractionExceptionDetected => "extraction_exception_detected",
            Self::UnicodeDistributionAnomaly => "unicode_distribution_anomaly",
            Self::NotNeeded => "not_needed",
        }
    }
}

/// Character class counts over extracted text, whitespace excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnicodeDistribution {
    pub alphabetic: usize,
    pub cjk: usize,
    pub numeric: usize,
    pub punctuation: usize,
    pub other: usize,
}

impl UnicodeDistribution {
    pub fn from_text(text: &str) -> Self {
        let mut dist = Self::default();
        for c in text.chars().filter(|c| !c.is_whitespace()) {
            if is_cjk(c) {
                dist.cjk += 1;
            } else if c.is_alphabetic() {
                dist.alphabetic += 1;
            } else if c.is_numeric() {
                dist.numeric += 1;
            } else if is_punctuation(c) {
                dist.punctuation += 1;
            } else {
                dist.other += 1;
            }
        }
        dist
    }

    pub fn total(&self) -> usize {
        self.alphabetic + self.cjk + self.numeric + self.punctuation + self.other
    }

    pub fn other_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.other as f64 / total as f64,
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0xFF66..=0xFF9F    // Halfwidth Katakana
        | 0x20000..=0x2FA1F) // Supplementary ideographs
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(c as u32,
            0x00A1..=0x00BF      // Latin-1 punctuation and symbols
            | 0x2010..=0x205E    // General punctuation
            | 0x3000..=0x303F    // CJK symbols and punctuation
            | 0xFF01..=0xFF0F
            | 0xFF1A..=0xFF20
            | 0xFF3B..=0xFF40
            | 0xFF5B..=0xFF65)
}

/// Per-page numeric inputs to the decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageMetrics {
    pub total_chars: usize,
    pub chars_per_page_mean: f64,
    pub empty_page_ratio: f64,
}

/// Count non-whitespace characters per page. No pages counts as fully empty.
pub fn page_metrics<S: AsRef<str>>(pages: &[S]) -> PageMetrics {
    if pages.is_empty() {
        return PageMetrics {
            total_chars: 0,
            chars_per_page_mean: 0.0,
            empty_page_ratio: 1.0,
        };
    }
    let counts: Vec<usize> = pages
        .iter()
        .map(|p| p.as_ref().chars().filter(|c| !c.is_whitespace()).count())
        .collect();
    let total: usize = counts.iter().sum();
    let empty = counts.iter().filter(|&&n| n == 0).count();
    PageMetrics {
        total_chars: total,
        chars_per_page_mean: total as f64 / pages.len() as f64,
        empty_page_ratio: empty as f64 / pages.len() as f64,
    }
}

/// Everything the decision looks at for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionQuality {
    pub total_chars: usize,
    pub chars_per_page_mean: f64,
    pub empty_page_ratio: f64,
    pub exception_classes: Vec<String>,
    pub unicode: Option<UnicodeDistribution>,
}

impl ExtractionQuality {
    /// Build from per-page text plus any exception classes seen while parsing.
    pub fn from_pages<S: AsRef<str>>(pages: &[S], exception_classes: Vec<String>) -> Self {
        let metrics = page_metrics(pages);
        let joined: String = pages.iter().map(|p| p.as_ref()).collect::<Vec<_>>().join("\n");
        Self {
            total_chars: metrics.total_chars,
            chars_per_page_mean: metrics.chars_per_page_mean,
            empty_page_ratio: metrics.empty_page_ratio,
            exception_classes,
            unicode: Some(UnicodeDistribution::from_text(&joined)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedsOcrMetrics {
    pub total_chars: usize,
    pub chars_per_page_mean: f64,
    pub empty_page_ratio: f64,
    pub exception_classes: Vec<String>,
    pub unicode_other_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedsOcrDecision {
    pub needs_ocr: bool,
    pub reason: NeedsOcrReason,
    pub metrics: NeedsOcrMetrics,
}

/// Exception class names that point at a broken text layer.
pub fn is_extraction_exception(class: &str) -> bool {
    let lower = class.to_lowercase();
    ["pars", "pdf", "encod", "decod", "unicode", "syntax", "xref"]
        .iter()
        .any(|k| lower.contains(k))
}

pub fn decide(quality: &ExtractionQuality, thresholds: &NeedsOcrThresholds) -> NeedsOcrDecision {
    let other_ratio = quality.unicode.map(|u| u.other_ratio());

    let reason = if quality.total_chars < thresholds.min_total_chars {
        NeedsOcrReason::TotalCharsBelowThreshold
    } else if quality.chars_per_page_mean < thresholds.min_chars_per_page
        && quality.empty_page_ratio > thresholds.empty_page_ratio_threshold
    {
        NeedsOcrReason::LowCharsAndHighEmptyPages
    } else if quality
        .exception_classes
        .iter()
        .any(|c| is_extraction_exception(c))
    {
        NeedsOcrReason::ExtractionExceptionDetected
    } else if quality.total_chars > 0 && other_ratio.is_some_and(|r| r > OTHER_RATIO_LIMIT) {
        NeedsOcrReason::UnicodeDistributionAnomaly
    } else {
        NeedsOcrReason::NotNeeded
    };

    NeedsOcrDecision {
        needs_ocr: reason != NeedsOcrReason::NotNeeded,
        reason,
        metrics: NeedsOcrMetrics {
            total_chars: quality.total_chars,
            chars_per_page_mean: quality.chars_per_page_mean,
            empty_page_ratio: quality.empty_page_ratio,
            exception_classes: quality.exception_classes.clone(),
            unicode_other_ratio: other_ratio,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality(total: usize, per_page: f64, empty: f64) -> ExtractionQuality {
        ExtractionQuality {
            total_chars: total,
            chars_per_page_mean: per_page,
            empty_page_ratio: empty,
            exception_classes: vec![],
            unicode: None,
        }
    }

    #[test]
    fn short_text_needs_ocr() {
        let d = decide(&quality(10, 10.0, 0.0), &NeedsOcrThresholds::default());
        assert!(d.needs_ocr);
        assert_eq!(d.reason, NeedsOcrReason::TotalCharsBelowThreshold);
    }

    #[test]
    fn sparse_pages_need_ocr() {
        let d = decide(&quality(400, 40.0, 0.8), &NeedsOcrThresholds::default());
        assert_eq!(d.reason, NeedsOcrReason::LowCharsAndHighEmptyPages);
    }

    #[test]
    fn low_chars_alone_is_not_enough() {
        let d = decide(&quality(400, 40.0, 0.2), &NeedsOcrThresholds::default());
        assert!(!d.needs_ocr);
        assert_eq!(d.reason, NeedsOcrReason::NotNeeded);
    }

    #[test]
    fn parser_exception_needs_ocr() {
        let mut q = quality(5000, 500.0, 0.0);
        q.exception_classes = vec!["PdfSyntaxError".into()];
        assert_eq!(
            decide(&q, &NeedsOcrThresholds::default()).reason,
            NeedsOcrReason::ExtractionExceptionDetected
        );
    }

    #[test]
    fn unrelated_exception_is_ignored() {
        let mut q = quality(5000, 500.0, 0.0);
        q.exception_classes = vec!["TimeoutError".into()];
        assert!(!decide(&q, &NeedsOcrThresholds::default()).needs_ocr);
    }

    #[test]
    fn garbage_glyphs_need_ocr() {
        let garbage: String = std::iter::repeat('\u{E000}').take(300).collect();
        let q = ExtractionQuality::from_pages(&[garbage], vec![]);
        let d = decide(&q, &NeedsOcrThresholds::default());
        assert_eq!(d.reason, NeedsOcrReason::UnicodeDistributionAnomaly);
        assert!(d.metrics.unicode_other_ratio.unwrap() > 0.9);
    }

    #[test]
    fn japanese_text_is_not_anomalous() {
        let text = "日本語の文書です。".repeat(40);
        let q = ExtractionQuality::from_pages(&[text], vec![]);
        assert!(!decide(&q, &NeedsOcrThresholds::default()).needs_ocr);
    }

    #[test]
    fn precedence_first_rule_wins() {
        let mut q = quality(10, 1.0, 1.0);
        q.exception_classes = vec!["ParseError".into()];
        assert_eq!(
            decide(&q, &NeedsOcrThresholds::default()).reason,
            NeedsOcrReason::TotalCharsBelowThreshold
        );
    }

    #[test]
    fn needs_ocr_iff_some_rule_fires() {
        let t = NeedsOcrThresholds::default();
        for total in [0usize, 199, 200, 1000] {
            for per_page in [0.0, 49.9, 50.0, 300.0] {
                for empty in [0.0, 0.5, 0.51, 1.0] {
                    for exc in [false, true] {
                        for anomalous in [false, true] {
                            let mut q = quality(total, per_page, empty);
                            if exc {
                                q.exception_classes = vec!["EncodingError".into()];
                            }
                            q.unicode = Some(if anomalous {
                                UnicodeDistribution {
                                    alphabetic: 5,
                                    other: 95,
                                    ..Default::default()
                                }
                            } else {
                                UnicodeDistribution {
                                    alphabetic: 90,
                                    other: 10,
                                    ..Default::default()
                                }
                            });
                            let expected = total < t.min_total_chars
                                || (per_page < t.min_chars_per_page
                                    && empty > t.empty_page_ratio_threshold)
                                || exc
                                || (anomalous && total > 0);
                            assert_eq!(decide(&q, &t).needs_ocr, expected, "{q:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn exactly_ninety_percent_other_is_not_anomalous() {
        let mut q = quality(1000, 500.0, 0.0);
        q.unicode = Some(UnicodeDistribution {
            alphabetic: 10,
            other: 90,
            ..Default::default()
        });
        assert!(!decide(&q, &NeedsOcrThresholds::default()).needs_ocr);
    }

    #[test]
    fn page_metrics_counts_empty_pages() {
        let m = page_metrics(&["abc", "  ", "", "de f"]);
        assert_eq!(m.total_chars, 6);
        assert!((m.empty_page_ratio - 0.5).abs() < f64::EPSILON);
        assert!((m.chars_per_page_mean - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn no_pages_is_fully_empty() {
        let m = page_metrics::<&str>(&[]);
        assert_eq!(m.total_chars, 0);
        assert_eq!(m.empty_page_ratio, 1.0);
    }

    #[test]
    fn reason_strings_match_serde() {
        for r in [
            NeedsOcrReason::TotalCharsBelowThreshold,
            NeedsOcrReason::LowCharsAndHighEmptyPages,
            NeedsOcrReason::ExtractionExceptionDetected,
            NeedsOcrReason::UnicodeDistributionAnomaly,
            NeedsOcrReason::NotNeeded,
        ] {
            assert_eq!(serde_json::to_string(&r).unwrap(), format!("\"{}\"", r.as_str()));
        }
    }
}
