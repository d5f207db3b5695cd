#![forbid(unsafe_code)]

use miette::Diagnostic;
use slate_ast::AccountAddress;
use thiserror::Error;

/// Failure of one execution. Every variant rolls back the storage writes of
/// the invocation that raised it.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("`{resource}` already exists at {address}")]
    #[diagnostic(
        code(slate::runtime::resource_already_exists),
        help("an address holds at most one resource of each type; `move_from` it first")
    )]
    ResourceAlreadyExists {
        address: AccountAddress,
        resource: String,
    },

    #[error("no `{resource}` at {address}")]
    #[diagnostic(
        code(slate::runtime::missing_resource),
        help("guard the access with `exists`")
    )]
    MissingResource {
        address: AccountAddress,
        resource: String,
    },

    #[error("{location}: aborted with code {code}")]
    #[diagnostic(code(slate::runtime::aborted))]
    Aborted { code: u64, location: String },

    #[error("{location}: arithmetic error in `{op}`: {reason}")]
    #[diagnostic(code(slate::runtime::arithmetic))]
    ArithmeticError {
        op: String,
        reason: String,
        location: String,
    },

    #[error("call depth limit of {limit} exceeded")]
    #[diagnostic(
        code(slate::runtime::call_depth_exceeded),
        help("raise `runtime.max_call_depth` in slate.toml if the recursion is intended")
    )]
    CallDepthExceeded { limit: usize },

    #[error("unknown function `{name}`")]
    #[diagnostic(code(slate::runtime::unknown_function))]
    UnknownFunction { name: String },

    #[error("invalid argument: {message}")]
    #[diagnostic(code(slate::runtime::invalid_argument))]
    InvalidArgument { message: String },

    #[error("`{resource}` at {address} was changed by a concurrent transaction")]
    #[diagnostic(
        code(slate::runtime::conflict),
        help("nothing was written; the invocation can be retried")
    )]
    Conflict {
        address: AccountAddress,
        resource: String,
    },

    /// A checked program reached a state the checker rules out.
    #[error("internal invariant violated: {message}")]
    #[diagnostic(code(slate::runtime::invariant_violation))]
    InvariantViolation { message: String },
}

impl RuntimeError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        RuntimeError::InvariantViolation {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Abort code, if the failure was raised by program logic.
    pub fn abort_code(&self) -> Option<u64> {
        match self {
            RuntimeError::Aborted { code, .. } => Some(*code),
            _ => None,
        }
    }
}
