//! Lexical guard for observer-supplied read queries.
//!
//! The guard never parses SQL. It strips comments, masks quoted spans, and then
//! checks the remaining structure with a handful of conservative rules. The text
//! it returns is exactly the text that was validated.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;
use thiserror::Error;

pub const DEFAULT_MAX_ROWS: u64 = 100;

pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "attach", "detach", "pragma",
    "replace", "vacuum", "reindex", "truncate",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Query is required.")]
    Empty,
    #[error("Only SELECT queries are allowed.")]
    NotReadOnly,
    #[error("Multiple statements are not allowed.")]
    MultipleStatements,
    #[error("Write operations are not allowed.")]
    ForbiddenKeyword(String),
    #[error("Invalid LIMIT value.")]
    InvalidLimit,
    #[error("Unterminated quoted literal or identifier.")]
    UnterminatedQuote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryGuard {
    max_rows: u64,
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
        }
    }
}

impl QueryGuard {
    pub fn new(max_rows: u64) -> Self {
        Self { max_rows }
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Returns the query rewritten into its bounded read-only form.
    pub fn guard(&self, query: &str) -> Result<String, GuardError> {
        let stripped = strip_comments(query);
        let cleaned = stripped.trim();
        if cleaned.is_empty() {
            return Err(GuardError::Empty);
        }
        if !starts_with_keyword(cleaned, "select") {
            return Err(GuardError::NotReadOnly);
        }

        let masked = mask_quoted(cleaned)?;
        let base = match masked.separators.as_slice() {
            [] => cleaned,
            [index] if cleaned[index + 1..].trim().is_empty() => cleaned[..*index].trim_end(),
            _ => return Err(GuardError::MultipleStatements),
        };
        let masked_base = &masked.text[..base.len()];

        if let Some(keyword) = find_forbidden_keyword(masked_base) {
            return Err(GuardError::ForbiddenKeyword(keyword));
        }

        match last_top_level_limit(masked_base)? {
            None => Ok(format!("{base} LIMIT {}", self.max_rows)),
            Some(clause) if clause.limit <= self.max_rows => Ok(base.to_string()),
            Some(clause) => Ok(format!(
                "{}{}{}",
                &base[..clause.limit_span.start],
                self.max_rows,
                &base[clause.limit_span.end..]
            )),
        }
    }
}

pub fn guard_readonly_query(query: &str) -> Result<String, GuardError> {
    QueryGuard::default().guard(query)
}

fn closing_delimiter(open: char) -> Option<char> {
    match open {
        '\'' | '"' | '`' => Some(open),
        '[' => Some(']'),
        _ => None,
    }
}

/// Removes `--` and `/* */` comments that sit outside quoted spans.
pub fn strip_comments(query: &str) -> String {
    let mut output = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut close: Option<char> = None;

    while let Some(ch) = chars.next() {
        if let Some(delim) = close {
            output.push(ch);
            if ch == delim {
                if chars.peek() == Some(&delim) {
                    chars.next();
                    output.push(delim);
                } else {
                    close = None;
                }
            }
            continue;
        }

        match (ch, chars.peek().copied()) {
            ('-', Some('-')) => {
                while chars.peek().is_some_and(|next| *next != '\n') {
                    chars.next();
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                output.push(' ');
            }
            _ => {
                close = closing_delimiter(ch);
                output.push(ch);
            }
        }
    }

    output
}

#[derive(Debug)]
struct MaskedQuery {
    /// Same byte length as the input, quoted content replaced by spaces.
    text: String,
    /// Byte offsets of `;` outside quoted spans.
    separators: Vec<usize>,
}

fn mask_quoted(text: &str) -> Result<MaskedQuery, GuardError> {
    let mut masked = String::with_capacity(text.len());
    let mut separators = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut close: Option<char> = None;

    while let Some((index, ch)) = chars.next() {
        match close {
            Some(delim) if ch == delim => {
                if chars.peek().map(|(_, next)| *next) == Some(delim) {
                    chars.next();
                    masked.push_str("  ");
                    continue;
                }
                close = None;
                masked.push(ch);
            }
            Some(_) => {
                for _ in 0..ch.len_utf8() {
                    masked.push(' ');
                }
            }
            None => {
                if ch == ';' {
                    separators.push(index);
                }
                close = closing_delimiter(ch);
                masked.push(ch);
            }
        }
    }

    if close.is_some() {
        return Err(GuardError::UnterminatedQuote);
    }
    Ok(MaskedQuery {
        text: masked,
        separators,
    })
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    let Some(head) = text.get(..keyword.len()) else {
        return false;
    };
    head.eq_ignore_ascii_case(keyword)
        && !text[keyword.len()..]
            .chars()
            .next()
            .is_some_and(|next| next.is_alphanumeric() || next == '_')
}

fn forbidden_keyword_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|"))).expect("valid regex")
    })
}

fn limit_keyword_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)\blimit\b").expect("valid regex"))
}

fn limit_clause_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)\blimit\s+(?:(\d+)\s*,\s*(\d+)|(\d+)(?:\s+offset\s+(\d+))?)\b")
            .expect("valid regex")
    })
}

fn find_forbidden_keyword(masked: &str) -> Option<String> {
    forbidden_keyword_regex()
        .find(masked)
        .map(|found| found.as_str().to_ascii_lowercase())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LimitClause {
    limit: u64,
    limit_span: Range<usize>,
}

fn paren_depths(masked: &str) -> Vec<i64> {
    let mut depths = Vec::with_capacity(masked.len() + 1);
    let mut depth = 0_i64;
    for byte in masked.bytes() {
        depths.push(depth);
        match byte {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
    }
    depths.push(depth);
    depths
}

/// Finds the last `LIMIT` clause outside any parentheses.
fn last_top_level_limit(masked: &str) -> Result<Option<LimitClause>, GuardError> {
    let depths = paren_depths(masked);
    let Some(keyword_start) = limit_keyword_regex()
        .find_iter(masked)
        .map(|found| found.start())
        .filter(|start| depths[*start] == 0)
        .last()
    else {
        return Ok(None);
    };

    let captures = limit_clause_regex()
        .captures_iter(masked)
        .find(|captures| captures.get(0).is_some_and(|whole| whole.start() == keyword_start))
        .ok_or(GuardError::InvalidLimit)?;
    let clause_end = captures.get(0).map_or(masked.len(), |whole| whole.end());
    // SQLite evaluates the whole expression, so the literal must end the clause.
    if !masked[clause_end..]
        .chars()
        .all(|ch| ch.is_whitespace() || ch == ')')
    {
        return Err(GuardError::InvalidLimit);
    }
    let limit_match = captures
        .get(2)
        .or_else(|| captures.get(3))
        .ok_or(GuardError::InvalidLimit)?;
    // Only digits reach here, so a parse failure means the value overflowed.
    let limit = limit_match.as_str().parse::<u64>().unwrap_or(u64::MAX);

    Ok(Some(LimitClause {
        limit,
        limit_span: limit_match.range(),
    }))
}
