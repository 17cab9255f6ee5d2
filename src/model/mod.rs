//! patchgate data model: task descriptors, patch artifacts, grading outcomes.

pub mod outcome;
pub mod patch;
pub mod types;
