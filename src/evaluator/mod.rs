//! Evaluate Stage (§4.6): the two evaluator kinds a recipe can select,
//! `hotwire` (static regex rules) and `llm` (model classification).

pub mod hotwire;
pub mod llm;
