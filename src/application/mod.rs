// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// One use case per command. Each takes a resolved
// ExperimentConfig, wires data, model and tracking together
// and returns an outcome the CLI prints.
//
//   train    → TrainUseCase    → TrainOutcome
//   evaluate → EvaluateUseCase → EvaluateOutcome
//   search   → SearchUseCase   → SearchOutcome (one TrainUseCase per trial)
//
// No tensor math lives here, and nothing here prints.
//
// Reference: Clean Architecture pattern

// What every command agrees on before a model exists
pub mod system_plan;

// The training workflow
pub mod train_use_case;

// Scoring a trained checkpoint
pub mod evaluate_use_case;

// Random hyperparameter search over training runs
pub mod search_use_case;

#[cfg(test)]
pub(crate) mod fixtures;
