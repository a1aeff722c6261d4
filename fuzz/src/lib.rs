//! Fuzzing harnesses for strand's shared memory structures.
//!
//! The models drive the real ring, log buffer and registry types over heap
//! memory, without touching mmap, and check them against simple reference
//! state after every step.

pub mod log_model;
pub mod position_model;
pub mod registry_model;
pub mod ring_model;
