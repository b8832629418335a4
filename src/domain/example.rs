// ============================================================
// Layer 3 — QeExample Domain Type
// ============================================================
// Represents one line of a QE corpus in domain terms: the
// source and target words, their alignments, and whatever
// labels the split provides.
//
//   Tag       OK / BAD per word or gap (PAD fills batches)
//   TagField  which label stream a tag belongs to

use serde::{Deserialize, Serialize};

// ─── Tag ──────────────────────────────────────────────────────────────────────
/// Word-level quality label. The discriminant doubles as the class index
/// used by the tag heads; `PAD_INDEX` marks positions without a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    Ok  = 0,
    Bad = 1,
}

pub const PAD_INDEX: u8 = 2;

impl Tag {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OK" | "ok" | "GOOD" => Some(Self::Ok),
            "BAD" | "bad" => Some(Self::Bad),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

// ─── TagField ─────────────────────────────────────────────────────────────────
/// The three word-level label streams. The name is the metric prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagField {
    TargetTags,
    GapTags,
    SourceTags,
}

impl TagField {
    pub const ALL: [TagField; 3] = [Self::TargetTags, Self::GapTags, Self::SourceTags];

    pub fn name(self) -> &'static str {
        match self {
            Self::TargetTags => "target_tags",
            Self::GapTags    => "gap_tags",
            Self::SourceTags => "source_tags",
        }
    }
}

// ─── QeExample ────────────────────────────────────────────────────────────────
/// One line of a parallel QE corpus after tokenisation into words.
///
/// `alignments` holds `(source word, target word)` pairs as written in
/// the WMT alignment files. Target tags in WMT files interleave gap tags
/// (`gap w1 gap w2 ... wT gap`); the loader separates them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QeExample {
    /// 1-based line number in the corpus files.
    pub line: usize,

    pub source: Vec<String>,
    pub target: Vec<String>,

    pub alignments:  Option<Vec<(usize, usize)>>,
    pub target_tags: Option<Vec<Tag>>,
    pub gap_tags:    Option<Vec<Tag>>,
    pub source_tags: Option<Vec<Tag>>,

    /// Sentence-level HTER score in [0, 1].
    pub sentence_score: Option<f32>,
}

impl QeExample {
    pub fn tags(&self, field: TagField) -> Option<&[Tag]> {
        match field {
            TagField::TargetTags => self.target_tags.as_deref(),
            TagField::GapTags    => self.gap_tags.as_deref(),
            TagField::SourceTags => self.source_tags.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_parse() {
        assert_eq!(Tag::parse("OK"), Some(Tag::Ok));
        assert_eq!(Tag::parse("BAD"), Some(Tag::Bad));
        assert_eq!(Tag::parse("MAYBE"), None);
        assert_eq!(Tag::Bad.index(), 1);
    }

    #[test]
    fn test_tag_field_names_are_metric_prefixes() {
        let names: Vec<_> = TagField::ALL.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["target_tags", "gap_tags", "source_tags"]);
    }
}
