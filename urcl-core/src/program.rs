//! Finished instruction/label stream
//!
//! A [`Program`] is the read-only result of an emitter run: the
//! instruction vector plus the label table. Backend targets consume it,
//! and it round-trips through JSON for tooling.

use crate::inst::{Instruction, Label};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Immutable instruction stream with position-bound labels
///
/// Label positions range over `0..=instructions.len()`; the position equal
/// to the stream length is the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub labels: BTreeMap<usize, Vec<Label>>,
}

impl Program {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Labels bound at a stream position, in binding order
    pub fn labels_at(&self, position: usize) -> &[Label] {
        self.labels
            .get(&position)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve every label name to a numeric position
    ///
    /// Duplicate names are legal in the table; where a single value is
    /// needed the binding at the highest position wins.
    pub fn label_positions(&self) -> HashMap<String, usize> {
        let mut positions = HashMap::new();
        for (&position, labels) in &self.labels {
            for label in labels {
                positions.insert(label.name().to_string(), position);
            }
        }
        positions
    }
}
