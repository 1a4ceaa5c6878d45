//! Word tokenizer shared by the hash embedding, keyword search and the
//! tutor's keyword extraction.
//!
//! A token is a maximal run of ASCII letters/digits and CJK unified
//! ideographs (U+4E00..=U+9FFF); everything else separates tokens. Tokens are
//! ASCII-lower-cased. A run of ideographs is one token, there is no word
//! segmentation.

use std::collections::HashSet;

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Split `text` into lower-cased tokens, in order, duplicates kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !is_token_char(c))
        .filter(|tok| !tok.is_empty())
        .map(|tok| tok.to_ascii_lowercase())
        .collect()
}

/// Distinct tokens of `text`.
pub fn token_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_punctuation_and_lowercases() {
        assert_eq!(
            tokenize("Depth-First Search (DFS): uses a Stack."),
            vec!["depth", "first", "search", "dfs", "uses", "a", "stack"]
        );
    }

    #[test]
    fn keeps_digits_and_cjk_runs() {
        assert_eq!(tokenize("KMP 算法 next[0]"), vec!["kmp", "算法", "next", "0"]);
    }

    #[test]
    fn non_ascii_letters_are_separators() {
        assert_eq!(tokenize("café naïve"), vec!["caf", "na", "ve"]);
    }

    #[test]
    fn empty_and_symbol_only_input() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("--- !!! ---").is_empty());
    }

    #[test]
    fn token_set_dedups() {
        let set = token_set("stack Stack STACK queue");
        assert_eq!(set.len(), 2);
        assert!(set.contains("stack"));
        assert!(set.contains("queue"));
    }
}
