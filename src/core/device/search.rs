//! Fuzzy name lookup
//!
//! The query matches a name when its characters appear in order, with any
//! gap between them. Matches rank by the length of the matched span, then
//! by where the span starts, then by name.

use regex::Regex;

/// One ranked match
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ranked<'a> {
    /// Length of the shortest leftmost matched span
    pub span: usize,
    /// Offset of the span
    pub start: usize,
    /// Matched name
    pub name: &'a str,
}

/// Build the subsequence pattern for `query`
pub fn pattern(query: &str) -> Option<Regex> {
    let parts: Vec<String> = query.chars().map(|c| regex::escape(&c.to_string())).collect();
    Regex::new(&parts.join(".*?")).ok()
}

/// Rank `names` against `query`, best first
pub fn fuzzy_find<'a, I>(query: &str, names: I) -> Vec<Ranked<'a>>
where
    I: IntoIterator<Item = &'a str>,
{
    let Some(regex) = pattern(query) else {
        return Vec::new();
    };
    let mut ranked: Vec<Ranked<'a>> = names
        .into_iter()
        .filter_map(|name| {
            regex.find(name).map(|m| Ranked {
                span: m.len(),
                start: m.start(),
                name,
            })
        })
        .collect();
    ranked.sort();
    ranked
}
