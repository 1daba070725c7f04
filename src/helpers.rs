//! String normalization helpers shared by the taxonomy and instance layers.

use regex::Regex;
use std::sync::OnceLock;

/// Convert a concept or table name to the snake_case convention used for
/// all output column and table names.
///
/// Spaces, hyphens and underscores collapse into single underscores, other
/// punctuation is dropped, and an underscore is inserted before uppercase
/// characters.
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    // Start true so the output never begins with an underscore.
    let mut prev_separator = true;
    for ch in input.chars() {
        if ch.is_ascii_uppercase() {
            if !prev_separator {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_separator = false;
        } else if ch == ' ' || ch == '-' || ch == '_' {
            if !prev_separator {
                out.push('_');
            }
            prev_separator = true;
        } else if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_separator = false;
        }
        // Remaining special characters are dropped outright.
    }
    out.trim_end_matches('_').to_string()
}

/// Lowercase all but the first letter of fully uppercase words.
///
/// Several FERC link role definitions contain completely uppercase words
/// (acronyms). Without this pass the snake_case conversion would insert an
/// underscore between every one of those characters.
pub fn lowercase_words(name: &str) -> String {
    static UPPERCASE_WORD: OnceLock<Regex> = OnceLock::new();
    let re = UPPERCASE_WORD.get_or_init(|| {
        Regex::new("[^A-Z][A-Z]([A-Z]+)").unwrap_or_else(|e| panic!("invalid regex: {e}"))
    });

    let mut out = name.to_string();
    for cap in re.captures_iter(name) {
        let upper = &cap[1];
        out = out.replace(upper, &upper.to_lowercase());
    }
    out
}

/// Strip an XML namespace prefix (`ferc:Foo` -> `Foo`).
pub fn strip_prefix(name: &str) -> &str {
    name.split_once(':').map_or(name, |(_, rest)| rest)
}
