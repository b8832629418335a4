// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from line-aligned corpus files
// all the way to padded tensor batches.
//
// The pipeline flows in this order:
//
//   source / target / tags / scores files
//       │
//       ▼
//   ParallelCorpusLoader → reads the files line by line
//       │
//       ▼
//   Preprocessor         → cleans and splits lines into words
//       │
//       ▼
//   Vocabularies         → word ↔ id tables (or a pretrained
//   TokenIndexer           tokenizer for transformer backbones)
//       │
//       ▼
//   QeDataset            → implements Burn's Dataset trait
//       │
//       ▼
//   QeBatcher            → pads samples into tensor batches
//       │
//       ▼
//   DataLoader           → feeds batches to the training loop
//
// Reference: Burn Book §4 (Datasets and Dataloaders)
//            Rust Book §13 (Iterators and Closures)

/// Reads WMT-style line-aligned QE corpora
pub mod loader;

/// Cleans and tokenises raw corpus lines
pub mod preprocessor;

/// Vocabularies, persistence and token indexers
pub mod vocabulary;

/// Implements Burn's Dataset trait for QE samples
pub mod dataset;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Seeded train/validation split
pub mod splitter;
