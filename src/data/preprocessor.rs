// ============================================================
// Layer 4 — Text Preprocessor
// ============================================================
// Normalises one corpus line and splits it into words.
//
// WMT QE corpora are pre-tokenised: one sentence per line,
// tokens separated by single spaces, and word-level tags
// aligned one-to-one with those tokens. Cleaning therefore
// must never merge or split tokens, only normalise them:
//
//   1. Map Unicode whitespace variants to plain spaces
//   2. Drop invisible control characters
//   3. Split on whitespace (collapses runs of spaces)
//   4. Optionally lowercase
//
// Reference: Rust Book §8 (Strings in Rust)

pub struct Preprocessor {
    lowercase: bool,
}

impl Preprocessor {
    pub fn new(lowercase: bool) -> Self {
        Self { lowercase }
    }

    /// Clean a raw line without changing its token boundaries.
    pub fn clean(&self, line: &str) -> String {
        line.chars()
            .filter_map(|c| match c {
                '\t' | '\u{00A0}' | '\u{2009}' | '\u{202F}' => Some(' '),
                '\u{200B}' | '\u{FEFF}' => None,
                c if c.is_control() => None,
                c => Some(c),
            })
            .collect()
    }

    /// Clean, split into words, and lowercase when configured.
    pub fn tokenize(&self, line: &str) -> Vec<String> {
        self.clean(line)
            .split_whitespace()
            .map(|w| if self.lowercase { w.to_lowercase() } else { w.to_string() })
            .collect()
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(false)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapses_multiple_spaces() {
        let p = Preprocessor::default();
        assert_eq!(p.tokenize("hello   world"), vec!["hello", "world"]);
    }

    #[test]
    fn test_zero_width_chars_do_not_split_tokens() {
        let p = Preprocessor::default();
        assert_eq!(p.tokenize("Haus\u{200B}tür ist"), vec!["Haustür", "ist"]);
    }

    #[test]
    fn test_non_breaking_space_separates() {
        let p = Preprocessor::default();
        assert_eq!(p.tokenize("10\u{00A0}km"), vec!["10", "km"]);
    }

    #[test]
    fn test_lowercase() {
        let p = Preprocessor::new(true);
        assert_eq!(p.tokenize("Das HAUS"), vec!["das", "haus"]);
    }

    #[test]
    fn test_empty_string() {
        let p = Preprocessor::default();
        assert!(p.tokenize("  \r").is_empty());
    }
}
