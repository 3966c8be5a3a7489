// src/version/mod.rs

//! Version selectors and admission checks
//!
//! A selector is a version string with an optional comparison prefix:
//!
//! - `>=1.0`, `>1.0`, `<=1.0`, `<1.0`, `!1.0`
//! - `=1.0` (exact, suffix-sensitive) and `=1.0*` (prefix match)
//! - `~1.0` (any revision of 1.0)
//! - `1.0` (no prefix, exact)
//!
//! The version part is 1-6 dot-separated numeric segments, optionally
//! followed by lowercase letters, then any number of suffixes among
//! `-r<N>`, `_p<N>`, `_pre[N]`, `_rc[N]`, `_alpha` and `_beta`.
//! Anything that does not fit degrades to an empty version, which is a
//! wildcard admitting every candidate.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Maximum number of dot-separated numeric segments in a version
const MAX_SEGMENTS: usize = 6;

/// Comparison carried by a selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorCondition {
    /// No prefix and no version: wildcard
    #[default]
    Invalid,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
    Not,
    /// `~`: same base version, any suffix
    AnyRevision,
    /// `=<version>*`
    MatchVersion,
}

impl SelectorCondition {
    /// The prefix this condition is written with
    pub fn prefix(&self) -> &'static str {
        match self {
            SelectorCondition::Invalid => "",
            SelectorCondition::Greater => ">",
            SelectorCondition::GreaterEqual => ">=",
            SelectorCondition::Less => "<",
            SelectorCondition::LessEqual => "<=",
            SelectorCondition::Equal | SelectorCondition::MatchVersion => "=",
            SelectorCondition::Not => "!",
            SelectorCondition::AnyRevision => "~",
        }
    }
}

/// Prefixes in the order they are tested; longer operators first
const PREFIXES: [(&str, SelectorCondition); 7] = [
    (">=", SelectorCondition::GreaterEqual),
    (">", SelectorCondition::Greater),
    ("<=", SelectorCondition::LessEqual),
    ("<", SelectorCondition::Less),
    ("=", SelectorCondition::Equal),
    ("~", SelectorCondition::AnyRevision),
    ("!", SelectorCondition::Not),
];

/// A parsed version constraint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionSelector {
    pub version: String,
    pub version_suffix: String,
    pub condition: SelectorCondition,
}

impl VersionSelector {
    /// True when the selector admits every candidate
    pub fn is_wildcard(&self) -> bool {
        self.version.is_empty()
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.condition.prefix(),
            self.version,
            self.version_suffix
        )?;
        if self.condition == SelectorCondition::MatchVersion {
            write!(f, "*")?;
        }
        Ok(())
    }
}

/// Parse a selector string
///
/// Never fails: malformed input yields a selector with an empty version.
///
/// # Examples
///
/// ```
/// use kiln::version::{parse_version, SelectorCondition};
///
/// let selector = parse_version("=12.1.0.2_p1");
/// assert_eq!(selector.version, "12.1.0.2");
/// assert_eq!(selector.version_suffix, "_p1");
/// assert_eq!(selector.condition, SelectorCondition::Equal);
/// ```
pub fn parse_version(input: &str) -> VersionSelector {
    let (mut condition, rest) = split_condition(input);

    let (version, version_suffix) = match extract_version(rest) {
        Some((base, suffix)) => (base.to_string(), suffix.to_string()),
        None => (String::new(), String::new()),
    };

    if condition == SelectorCondition::Invalid && !version.is_empty() {
        condition = SelectorCondition::Equal;
    }

    VersionSelector {
        version,
        version_suffix,
        condition,
    }
}

/// True when the string starts with one of the condition prefixes
pub fn has_condition_prefix(input: &str) -> bool {
    PREFIXES.iter().any(|(prefix, _)| input.starts_with(prefix))
}

fn split_condition(input: &str) -> (SelectorCondition, &str) {
    for (prefix, condition) in PREFIXES {
        if let Some(rest) = input.strip_prefix(prefix) {
            if condition == SelectorCondition::Equal {
                if let Some(stripped) = rest.strip_suffix('*') {
                    return (SelectorCondition::MatchVersion, stripped);
                }
            }
            return (condition, rest);
        }
    }
    (SelectorCondition::Invalid, input)
}

/// Find the leftmost position from which the remainder is a complete
/// version, returning (base, suffix)
fn extract_version(input: &str) -> Option<(&str, &str)> {
    let bytes = input.as_bytes();
    for start in 0..bytes.len() {
        if !bytes[start].is_ascii_digit() {
            continue;
        }
        let candidate = &input[start..];
        if let Some(base_end) = lex_version(candidate.as_bytes()) {
            return Some(candidate.split_at(base_end));
        }
    }
    None
}

/// Lex `SEG(.SEG){0,5}[a-z]* SUFFIX*` over the whole input.
///
/// Returns the offset where the suffix starts, or None if the input is
/// not entirely consumed.
fn lex_version(bytes: &[u8]) -> Option<usize> {
    let mut pos = 0;
    let mut segments = 0;

    loop {
        let digits = count_digits(&bytes[pos..]);
        if digits == 0 {
            return None;
        }
        pos += digits;
        segments += 1;

        let dot_then_digit = bytes.get(pos) == Some(&b'.')
            && bytes.get(pos + 1).is_some_and(|b| b.is_ascii_digit());
        if segments < MAX_SEGMENTS && dot_then_digit {
            pos += 1;
            continue;
        }
        break;
    }

    while bytes.get(pos).is_some_and(|b| b.is_ascii_lowercase()) {
        pos += 1;
    }
    let base_end = pos;

    while pos < bytes.len() {
        pos += suffix_len(&bytes[pos..])?;
    }

    Some(base_end)
}

fn count_digits(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// Length of the suffix token at the start of `bytes`, if any
fn suffix_len(bytes: &[u8]) -> Option<usize> {
    let numbered = |tag: &[u8], required: bool| -> Option<usize> {
        let rest = bytes.strip_prefix(tag)?;
        let digits = count_digits(rest);
        if required && digits == 0 {
            return None;
        }
        Some(tag.len() + digits)
    };

    numbered(b"-r", true)
        .or_else(|| numbered(b"_pre", false))
        .or_else(|| numbered(b"_p", true))
        .or_else(|| numbered(b"_rc", false))
        .or_else(|| bytes.starts_with(b"_alpha").then_some(6))
        .or_else(|| bytes.starts_with(b"_beta").then_some(5))
}

/// Numeric view of a base version used for ordering
///
/// Missing segments compare as zero. A trailing letter tag (`1.0a`)
/// sorts below the bare version; two tags compare lexicographically.
#[derive(Debug, Clone)]
pub struct NumericVersion {
    segments: Vec<u64>,
    tag: String,
}

impl NumericVersion {
    /// Parse a base version such as `1.2.3` or `2.0b`
    pub fn parse(version: &str) -> Result<Self> {
        if version.is_empty() {
            return Err(Error::ParseError("empty version".to_string()));
        }

        let parts: Vec<&str> = version.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut tag = String::new();

        for (i, part) in parts.iter().enumerate() {
            let digits = count_digits(part.as_bytes());
            let (number, letters) = part.split_at(digits);
            let is_last = i == parts.len() - 1;

            let letters_ok = letters.is_empty()
                || (is_last && letters.bytes().all(|b| b.is_ascii_lowercase()));
            if number.is_empty() || !letters_ok {
                return Err(Error::ParseError(format!(
                    "Malformed version '{}'",
                    version
                )));
            }

            let value = number.parse::<u64>().map_err(|e| {
                Error::ParseError(format!("Invalid segment in version '{}': {}", version, e))
            })?;
            segments.push(value);
            tag = letters.to_string();
        }

        Ok(Self { segments, tag })
    }

    /// Segments as written
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Exclusive upper bound for a prefix match: bump the segment at
    /// `position` (clamped to the last one) and drop everything after it
    fn bump(&self, position: usize) -> Self {
        let position = position.min(self.segments.len() - 1);
        let mut segments = self.segments[..=position].to_vec();
        segments[position] += 1;
        Self {
            segments,
            tag: String::new(),
        }
    }
}

impl Ord for NumericVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let a = self.segments.get(i).copied().unwrap_or(0);
            let b = other.segments.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }

        match (self.tag.is_empty(), other.tag.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.tag.cmp(&other.tag),
        }
    }
}

impl PartialOrd for NumericVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for NumericVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for NumericVersion {}

/// Compare two concrete version strings
///
/// Used to rank candidates; unparsable versions sort lowest. Equal base
/// versions are ordered by suffix:
/// `_alpha < _beta < _pre < _rc < (none) < _p`, then by `-rN`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left_selector = parse_version(a);
    let right_selector = parse_version(b);
    let left = NumericVersion::parse(&left_selector.version).ok();
    let right = NumericVersion::parse(&right_selector.version).ok();
    match (left, right) {
        (Some(l), Some(r)) => l
            .cmp(&r)
            .then_with(|| {
                compare_suffixes(&left_selector.version_suffix, &right_selector.version_suffix)
            })
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Rank of a release suffix; a missing suffix ranks between `_rc` and `_p`
const NO_SUFFIX: (u8, u64) = (4, 0);

fn compare_suffixes(a: &str, b: &str) -> Ordering {
    let (left, left_revision) = suffix_key(a);
    let (right, right_revision) = suffix_key(b);
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).copied().unwrap_or(NO_SUFFIX);
        let r = right.get(i).copied().unwrap_or(NO_SUFFIX);
        match l.cmp(&r) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    left_revision.cmp(&right_revision)
}

/// Split a suffix into ranked release tokens and the revision number
fn suffix_key(suffix: &str) -> (Vec<(u8, u64)>, u64) {
    const TAGS: [(&str, Option<u8>); 6] = [
        ("-r", None),
        ("_alpha", Some(0)),
        ("_beta", Some(1)),
        ("_pre", Some(2)),
        ("_rc", Some(3)),
        ("_p", Some(5)),
    ];

    let mut tokens = Vec::new();
    let mut revision = 0;
    let mut rest = suffix;
    while let Some((rank, tail)) = TAGS
        .iter()
        .find_map(|(tag, rank)| rest.strip_prefix(tag).map(|tail| (*rank, tail)))
    {
        let digits = count_digits(tail.as_bytes());
        let number = tail[..digits].parse().unwrap_or(0);
        match rank {
            Some(rank) => tokens.push((rank, number)),
            None => revision = number,
        }
        rest = &tail[digits..];
    }
    (tokens, revision)
}

/// Decide whether `candidate` satisfies `selector`
pub fn admit(selector: &VersionSelector, candidate: &VersionSelector) -> Result<bool> {
    if selector.is_wildcard() {
        return Ok(true);
    }

    let wanted = NumericVersion::parse(&selector.version)?;
    let found = if candidate.version.is_empty() {
        None
    } else {
        Some(NumericVersion::parse(&candidate.version)?)
    };

    let admitted = match (selector.condition, found) {
        (SelectorCondition::Invalid | SelectorCondition::Equal, _) => {
            !candidate.version.is_empty()
                && candidate.version == selector.version
                && candidate.version_suffix == selector.version_suffix
        }
        // A candidate without a version is itself a wildcard
        (_, None) => true,
        (SelectorCondition::AnyRevision, Some(found)) => found == wanted,
        (SelectorCondition::MatchVersion, Some(found)) => {
            let position = selector.version.matches('.').count();
            let upper = wanted.bump(position);
            (found >= wanted && found < upper)
                || candidate.version.starts_with(&selector.version)
        }
        (SelectorCondition::Greater, Some(found)) => found > wanted,
        (SelectorCondition::GreaterEqual, Some(found)) => found >= wanted,
        (SelectorCondition::Less, Some(found)) => found < wanted,
        (SelectorCondition::LessEqual, Some(found)) => found <= wanted,
        (SelectorCondition::Not, Some(found)) => found != wanted,
    };

    Ok(admitted)
}

/// Parse both strings and admit
pub fn admit_str(selector: &str, candidate: &str) -> Result<bool> {
    admit(&parse_version(selector), &parse_version(candidate))
}
