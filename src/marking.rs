//! Token marking
//!
//! The control-flow state of a case: a multiset of anonymous tokens over
//! condition identifiers. `BTreeMap` keeps iteration, serialization and
//! replay deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{WorkflowError, WorkflowResult};

/// Multiset of tokens over condition ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marking {
    tokens: BTreeMap<String, u32>,
}

impl Marking {
    /// Empty marking
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial marking: one token in the input condition
    pub fn initial(input_condition: &str) -> Self {
        let mut marking = Self::new();
        marking.produce(input_condition, 1);
        marking
    }

    /// Token count in a condition
    pub fn count(&self, condition: &str) -> u32 {
        self.tokens.get(condition).copied().unwrap_or(0)
    }

    /// Whether a condition holds at least one token
    pub fn is_marked(&self, condition: &str) -> bool {
        self.count(condition) > 0
    }

    /// Add `n` tokens to a condition
    pub fn produce(&mut self, condition: &str, n: u32) {
        if n == 0 {
            return;
        }
        *self.tokens.entry(condition.to_string()).or_insert(0) += n;
    }

    /// Remove `n` tokens from a condition; underflow is an invariant break
    pub fn consume(&mut self, condition: &str, n: u32) -> WorkflowResult<()> {
        if n == 0 {
            return Ok(());
        }
        match self.tokens.get_mut(condition) {
            Some(count) if *count >= n => {
                *count -= n;
                if *count == 0 {
                    self.tokens.remove(condition);
                }
                Ok(())
            }
            _ => Err(WorkflowError::InvariantBroken(format!(
                "consume of {n} token(s) from {condition} would go negative"
            ))),
        }
    }

    /// Remove every token from a condition, returning how many were held
    pub fn drain(&mut self, condition: &str) -> u32 {
        self.tokens.remove(condition).unwrap_or(0)
    }

    /// Total token count across all conditions
    pub fn total(&self) -> u32 {
        self.tokens.values().sum()
    }

    /// Marked conditions in deterministic order
    pub fn marked_conditions(&self) -> impl Iterator<Item = (&str, u32)> {
        self.tokens.iter().map(|(c, n)| (c.as_str(), *n))
    }

    /// Whether the marking is exactly one token in `condition` and nothing
    /// else
    pub fn is_exactly(&self, condition: &str) -> bool {
        self.total() == 1 && self.count(condition) == 1
    }
}
