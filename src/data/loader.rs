// ============================================================
// Layer 4 — Parallel Corpus Loader
// ============================================================
// Reads a WMT-style QE split: several line-aligned files where
// line N of every file describes the same sentence pair.
//
//   input.source       "Das Haus ist klein ."
//   input.target       "The house is small ."
//   input.alignments   "0-0 1-1 2-2 3-3 4-4"   (source-target)
//   output.target_tags "OK OK OK BAD OK OK OK OK OK OK OK"
//                      (2T+1 tags: gaps interleaved with words,
//                       or just T word tags)
//   output.source_tags "OK OK OK BAD OK"
//   output.sentence_scores "0.2"
//
// File-level problems (unreadable file, different line counts)
// are fatal configuration errors. A single bad line becomes a
// BatchDataError outcome so the batch holding it can be skipped.
//
// Reference: Rust Book §9 (Error Handling)
//            Rust Book §12 (I/O and File Handling)

use std::{fs, path::Path};

use crate::data::preprocessor::Preprocessor;
use crate::domain::config::DatasetFiles;
use crate::domain::error::{BatchDataError, QeError, QeResult};
use crate::domain::example::{QeExample, Tag};
use crate::domain::traits::{ExampleOutcome, ExampleSource};

/// Maximum sentence lengths in words; longer pairs are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LengthLimits {
    pub source: Option<usize>,
    pub target: Option<usize>,
}

impl LengthLimits {
    fn admits(&self, example: &QeExample) -> bool {
        self.source.map_or(true, |max| example.source.len() <= max)
            && self.target.map_or(true, |max| example.target.len() <= max)
    }
}

/// Loads one split (train / valid / test) of a parallel corpus.
/// Implements the ExampleSource trait from Layer 3.
pub struct ParallelCorpusLoader {
    split:        String,
    files:        DatasetFiles,
    preprocessor: Preprocessor,
    limits:       LengthLimits,
}

impl ParallelCorpusLoader {
    pub fn new(split: impl Into<String>, files: DatasetFiles, preprocessor: Preprocessor) -> Self {
        Self { split: split.into(), files, preprocessor, limits: LengthLimits::default() }
    }

    pub fn with_limits(mut self, limits: LengthLimits) -> Self {
        self.limits = limits;
        self
    }

    fn field(&self, name: &str) -> String {
        format!("data.{}.{name}", self.split)
    }

    fn read_lines(&self, field: &str, path: &Path) -> QeResult<Vec<String>> {
        let text = fs::read_to_string(path).map_err(|e| {
            QeError::config(self.field(field), format!("cannot read '{}': {e}", path.display()))
        })?;
        Ok(text.lines().map(str::to_string).collect())
    }

    fn read_optional(&self, field: &str, path: Option<&Path>) -> QeResult<Option<Vec<String>>> {
        path.map(|p| self.read_lines(field, p)).transpose()
    }
}

impl ExampleSource for ParallelCorpusLoader {
    fn load_all(&self) -> QeResult<Vec<ExampleOutcome>> {
        let input  = &self.files.input;
        let output = &self.files.output;

        let source_path = input
            .source
            .as_deref()
            .ok_or_else(|| QeError::config(self.field("input.source"), "required"))?;
        let target_path = input
            .target
            .as_deref()
            .ok_or_else(|| QeError::config(self.field("input.target"), "required"))?;

        let source      = self.read_lines("input.source", source_path)?;
        let target      = self.read_lines("input.target", target_path)?;
        let alignments  = self.read_optional("input.alignments", input.alignments.as_deref())?;
        let target_tags = self.read_optional("output.target_tags", output.target_tags.as_deref())?;
        let source_tags = self.read_optional("output.source_tags", output.source_tags.as_deref())?;
        let scores      = self.read_optional("output.sentence_scores", output.sentence_scores.as_deref())?;

        let expected = source.len();
        let columns = [
            ("input.target", Some(&target)),
            ("input.alignments", alignments.as_ref()),
            ("output.target_tags", target_tags.as_ref()),
            ("output.source_tags", source_tags.as_ref()),
            ("output.sentence_scores", scores.as_ref()),
        ];
        for (name, lines) in columns {
            if let Some(lines) = lines {
                if lines.len() != expected {
                    return Err(QeError::config(
                        self.field(name),
                        format!("has {} lines but input.source has {expected}", lines.len()),
                    ));
                }
            }
        }

        let mut outcomes = Vec::with_capacity(expected);
        let mut dropped  = 0usize;
        for i in 0..expected {
            let raw = RawLine {
                line:        i + 1,
                source:      &source[i],
                target:      &target[i],
                alignments:  alignments.as_ref().map(|v| v[i].as_str()),
                target_tags: target_tags.as_ref().map(|v| v[i].as_str()),
                source_tags: source_tags.as_ref().map(|v| v[i].as_str()),
                score:       scores.as_ref().map(|v| v[i].as_str()),
            };
            match parse_example(&raw, &self.preprocessor) {
                Ok(example) if !self.limits.admits(&example) => dropped += 1,
                outcome => outcomes.push(outcome),
            }
        }

        let malformed = outcomes.iter().filter(|o| o.is_err()).count();
        tracing::info!(
            "Loaded {} examples for '{}' ({} malformed, {} over length limits)",
            outcomes.len(),
            self.split,
            malformed,
            dropped,
        );
        Ok(outcomes)
    }
}

// ─── Line parsing ─────────────────────────────────────────────────────────────

struct RawLine<'a> {
    line:        usize,
    source:      &'a str,
    target:      &'a str,
    alignments:  Option<&'a str>,
    target_tags: Option<&'a str>,
    source_tags: Option<&'a str>,
    score:       Option<&'a str>,
}

fn parse_example(raw: &RawLine<'_>, pre: &Preprocessor) -> ExampleOutcome {
    let line   = raw.line;
    let source = pre.tokenize(raw.source);
    let target = pre.tokenize(raw.target);
    if source.is_empty() {
        return Err(BatchDataError::new(line, "source", "empty sentence"));
    }
    if target.is_empty() {
        return Err(BatchDataError::new(line, "target", "empty sentence"));
    }

    let mut example = QeExample { line, source, target, ..QeExample::default() };

    if let Some(text) = raw.target_tags {
        let tags = parse_tags(line, "target_tags", text)?;
        let t = example.target.len();
        if tags.len() == 2 * t + 1 {
            example.gap_tags    = Some(tags.iter().step_by(2).copied().collect());
            example.target_tags = Some(tags.iter().skip(1).step_by(2).copied().collect());
        } else if tags.len() == t {
            example.target_tags = Some(tags);
        } else {
            return Err(BatchDataError::new(
                line,
                "target_tags",
                format!("expected {t} or {} tags, found {}", 2 * t + 1, tags.len()),
            ));
        }
    }

    if let Some(text) = raw.source_tags {
        let tags = parse_tags(line, "source_tags", text)?;
        if tags.len() != example.source.len() {
            return Err(BatchDataError::new(
                line,
                "source_tags",
                format!("expected {} tags, found {}", example.source.len(), tags.len()),
            ));
        }
        example.source_tags = Some(tags);
    }

    if let Some(text) = raw.score {
        let score: f32 = text
            .trim()
            .parse()
            .map_err(|_| BatchDataError::new(line, "sentence_scores", format!("`{}` is not a number", text.trim())))?;
        if !score.is_finite() {
            return Err(BatchDataError::new(line, "sentence_scores", "score is not finite"));
        }
        example.sentence_score = Some(score);
    }

    if let Some(text) = raw.alignments {
        example.alignments = Some(parse_alignments(
            line,
            text,
            example.source.len(),
            example.target.len(),
        )?);
    }

    Ok(example)
}

fn parse_tags(line: usize, field: &str, text: &str) -> Result<Vec<Tag>, BatchDataError> {
    text.split_whitespace()
        .map(|raw| {
            Tag::parse(raw).ok_or_else(|| BatchDataError::new(line, field, format!("unknown tag `{raw}`")))
        })
        .collect()
}

fn parse_alignments(
    line:       usize,
    text:       &str,
    source_len: usize,
    target_len: usize,
) -> Result<Vec<(usize, usize)>, BatchDataError> {
    text.split_whitespace()
        .map(|pair| {
            let bad = || BatchDataError::new(line, "alignments", format!("bad pair `{pair}`"));
            let (s, t) = pair.split_once('-').ok_or_else(bad)?;
            let s: usize = s.parse().map_err(|_| bad())?;
            let t: usize = t.parse().map_err(|_| bad())?;
            if s >= source_len || t >= target_len {
                return Err(BatchDataError::new(
                    line,
                    "alignments",
                    format!("pair `{pair}` is out of range"),
                ));
            }
            Ok((s, t))
        })
        .collect()
}
