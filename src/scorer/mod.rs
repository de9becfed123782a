pub mod engine;
pub mod tables;

pub use engine::{Explainer, RuleExplainer, ScoringEngine, ScoringInput};
