//! Fuzzy name matching for library search.

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Matching flags for [`fuzzy_matches`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub diacritic_sensitive: bool,
    pub case_sensitive: bool,
}

fn fold(value: &str, options: SearchOptions) -> Vec<char> {
    let stripped: String = if options.diacritic_sensitive {
        value.to_string()
    } else {
        value.nfd().filter(|c| !is_combining_mark(*c)).collect()
    };
    if options.case_sensitive {
        stripped.chars().collect()
    } else {
        stripped.chars().flat_map(char::to_lowercase).collect()
    }
}

/// True when every character of `query` appears in `candidate` in order.
///
/// Empty inputs never match, and a query with more characters than the
/// candidate never matches.
pub fn fuzzy_matches(candidate: &str, query: &str, options: SearchOptions) -> bool {
    let query_len = query.chars().count();
    if query_len == 0 || candidate.is_empty() || query_len > candidate.chars().count() {
        return false;
    }

    let haystack = fold(candidate, options);
    let needle = fold(query, options);
    let mut remaining = haystack.iter();
    needle
        .iter()
        .all(|wanted| remaining.any(|candidate_char| candidate_char == wanted))
}
