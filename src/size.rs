//! Approximate in-memory footprint of values
//!
//! The estimate only steers file layout (which container entries get spilled,
//! which variables get their own file), never correctness. Costs are loose
//! upper bounds modelled on a boxed, reference-counted object runtime so that
//! small scalars are not treated as free.

use crate::value::Value;
use std::collections::HashSet;

const NULL_SIZE: u64 = 16;
const SCALAR_SIZE: u64 = 28;
const FLOAT_SIZE: u64 = 24;
const TEXT_HEADER: u64 = 49;
const SEQUENCE_HEADER: u64 = 56;
const MAPPING_HEADER: u64 = 64;
const SLOT_SIZE: u64 = 8;
const ARRAY_HEADER: u64 = 112;
const PLACEHOLDER_SIZE: u64 = 48;

/// Estimate the footprint of `value` in bytes
pub fn estimate_size(value: &Value) -> u64 {
    SizeEstimator::new().estimate(value)
}

/// Size estimator with a visited set keyed by node address
///
/// A node reached a second time contributes zero. Reusing one estimator across
/// several values therefore deliberately undercounts anything they share.
#[derive(Debug, Default)]
pub struct SizeEstimator {
    visited: HashSet<usize>,
}

impl SizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimate(&mut self, value: &Value) -> u64 {
        let id = value as *const Value as usize;
        if !self.visited.insert(id) {
            return 0;
        }

        match value {
            Value::Null => NULL_SIZE,
            Value::Bool(_) | Value::Int(_) => SCALAR_SIZE,
            Value::Float(_) => FLOAT_SIZE,
            Value::Text(s) => TEXT_HEADER + s.len() as u64,
            Value::Sequence(items) => {
                SEQUENCE_HEADER
                    + SLOT_SIZE * items.len() as u64
                    + items.iter().map(|item| self.estimate(item)).sum::<u64>()
            }
            Value::Mapping(map) => {
                MAPPING_HEADER
                    + map
                        .iter()
                        .map(|(k, v)| SLOT_SIZE + TEXT_HEADER + k.len() as u64 + self.estimate(v))
                        .sum::<u64>()
            }
            Value::Array(data) => ARRAY_HEADER + data.nbytes(),
            // On disk, not in memory
            Value::Mapped(mapped) => mapped.file_len(),
            Value::Placeholder(p) => PLACEHOLDER_SIZE + p.filename.len() as u64,
        }
    }
}
