#![forbid(unsafe_code)]

mod error;
mod program;
mod sema;
mod types;
pub mod abilities;
pub mod acquires;
pub mod borrow_checker;
pub mod move_tracking;
pub mod resolve;

pub use error::{CheckErrors, Location, TypeError};
pub use program::CheckedProgram;
pub use resolve::{FunctionSig, StructDef, TypeUniverse};
pub use sema::{Checker, check};
pub use types::{FunctionId, StructId, StructTag, Type};
