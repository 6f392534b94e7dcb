//! Nyx Runtime - object model core with deterministic force-free
//!
//! This crate provides the object-model internals of the Nyx scripting
//! runtime together with its one embedding-facing capability: forcing the
//! immediate, synchronous reclamation of a single heap object, bypassing
//! the collector. Embedders use it to cap peak memory in long-running
//! processes instead of waiting for a collection cycle.

#![allow(dead_code)]

pub mod error;
pub mod free;
pub mod heap;
pub mod logging;
pub mod object;
pub mod repr;
pub mod runtime;

// Re-export core types
pub use error::{FreeError, FreeResult};
pub use free::{force_free, force_free_all, DESTRUCTOR_HOOK};
pub use object::{ObjRef, SymbolId};
pub use repr::{DataType, ReleaseHook, Repr};
pub use runtime::Runtime;

/// Runtime initialization
pub fn init() {
    logging::init();
}
