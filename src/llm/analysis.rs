//! Prompt construction and parsing of the model's strengths/concerns lists.

use crate::models::{AnalysisResult, Review};

pub const MAX_FINDINGS: usize = 10;

const STRENGTHS_HEADER: &str = "product strengths";
const CONCERNS_HEADER: &str = "product concerns";

const PLACEHOLDER_PHRASES: &[&str] = &[
    "no common concerns",
    "no concerns identified",
    "no specific concerns",
    "no major concerns",
    "no significant concerns",
    "no common strengths",
    "no strengths identified",
    "no specific strengths",
];

/// Decides which findings are filler and which ones repeat each other.
pub trait FindingFilter {
    fn is_placeholder(&self, finding: &str) -> bool;

    /// Two findings with the same key are duplicates; the first one wins.
    fn dedup_key(&self, finding: &str) -> String;
}

/// Case-, emphasis- and whitespace-insensitive equality plus a fixed list of
/// "nothing to report" phrases.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFindingFilter;

impl FindingFilter for DefaultFindingFilter {
    fn is_placeholder(&self, finding: &str) -> bool {
        let key = self.dedup_key(finding);
        PLACEHOLDER_PHRASES.iter().any(|phrase| key.contains(phrase))
    }

    fn dedup_key(&self, finding: &str) -> String {
        finding
            .replace(['*', '_'], "")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .trim_end_matches(['.', '!', ';'])
            .to_lowercase()
    }
}

pub fn build_prompt(title: &str, description: &str, reviews: &[Review]) -> String {
    let reviews_text = reviews
        .iter()
        .filter(|review| !review.text.trim().is_empty())
        .map(|review| format!("{}: {}", format_rating(review.rating), review.text.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"You are evaluating the product "{title}" with the following product description:
{description}

Customers have reviewed this product with these reviews:
{reviews_text}

Your goal is to provide a list of top product strengths and top product concerns, listed from most common to least common.

Requirements:
- Each list (strengths and concerns) should have a maximum of 10 points and a minimum of 3 points
- List items should be concise and specific
- Focus on the most commonly mentioned themes across reviews
- Base your analysis only on the reviews provided

Please provide your response in the following format:

**Product Strengths:**
1. [strength]
2. [strength]
...

**Product Concerns:**
1. [concern]
2. [concern]
..."#
    )
}

fn format_rating(rating: Option<f64>) -> String {
    match rating {
        Some(value) if value.fract() == 0.0 => format!("{value:.0}"),
        Some(value) => format!("{value}"),
        None => "N/A".to_string(),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Strengths,
    Concerns,
}

/// Splits model output into strengths and concerns. Only list lines
/// (numbered or bulleted) under the matching header count; everything else
/// is commentary and ignored.
pub fn parse_analysis(text: &str, filter: &dyn FindingFilter) -> AnalysisResult {
    let mut strengths = Vec::new();
    let mut concerns = Vec::new();
    let mut section = Section::Preamble;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(header) = header_section(line) {
            section = header;
            continue;
        }
        let Some(item) = list_item(line) else {
            continue;
        };
        match section {
            Section::Strengths => strengths.push(item),
            Section::Concerns => concerns.push(item),
            Section::Preamble => {}
        }
    }

    AnalysisResult {
        strengths: collect_findings(strengths, filter),
        concerns: collect_findings(concerns, filter),
    }
}

pub fn collect_findings(raw: Vec<&str>, filter: &dyn FindingFilter) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut findings = Vec::new();
    for item in raw {
        if findings.len() == MAX_FINDINGS {
            break;
        }
        if filter.is_placeholder(item) {
            continue;
        }
        if seen.insert(filter.dedup_key(item)) {
            findings.push(item.to_string());
        }
    }
    findings
}

fn header_section(line: &str) -> Option<Section> {
    let normalized = line
        .trim_matches(|c: char| c == '*' || c == '#' || c == ':' || c.is_whitespace())
        .to_lowercase();
    if normalized.starts_with(STRENGTHS_HEADER) {
        Some(Section::Strengths)
    } else if normalized.starts_with(CONCERNS_HEADER) {
        Some(Section::Concerns)
    } else {
        None
    }
}

fn list_item(line: &str) -> Option<&str> {
    let rest = if line.starts_with(|c: char| c.is_ascii_digit()) {
        line.trim_start_matches(|c: char| c.is_ascii_digit())
            .trim_start_matches(['.', ')'])
    } else if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
    {
        rest
    } else {
        return None;
    };
    let item = rest.trim();
    (!item.is_empty()).then_some(item)
}
