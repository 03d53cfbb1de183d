//! Security-driven reference erasure
//!
//! References to entities the caller may not read are collected after load,
//! erased from the in-memory graph before it reaches the caller and put back
//! before a re-submitted entity is saved.

pub mod eraser;

pub use eraser::{ErasedReference, ErasedReferenceSet, ReferenceEraser};
