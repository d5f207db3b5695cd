#![forbid(unsafe_code)]

//! Execution of checked slate programs against versioned global storage.

mod error;
mod storage;
mod value;
mod vm;

pub use error::RuntimeError;
pub use storage::{GlobalStorage, SlotKey, StorageTransaction, StoredResource};
pub use value::{RefRoot, Reference, StructValue, Value};
pub use vm::{ExecOutcome, Vm, VmConfig, execute};
