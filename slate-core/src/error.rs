#![forbid(unsafe_code)]

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// Where a static error was found: module, optional function, and a short
/// description of the offending construct.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub module: String,
    pub function: Option<String>,
    pub detail: String,
}

impl Location {
    pub fn module(module: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: None,
            detail: detail.into(),
        }
    }

    pub fn function(
        module: impl Into<String>,
        function: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            function: Some(function.into()),
            detail: detail.into(),
        }
    }

    pub fn with_detail(&self, detail: impl Into<String>) -> Self {
        Self {
            module: self.module.clone(),
            function: self.function.clone(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(func) => write!(f, "{}::{}", self.module, func)?,
            None => write!(f, "{}", self.module)?,
        }
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// Static (type-checking) error. Never recovered automatically.
#[derive(Clone, Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum TypeError {
    #[error("{loc}: `{name}` expects {expected} type argument(s), found {found}")]
    #[diagnostic(code(slate::check::arity_mismatch))]
    ArityMismatch {
        loc: Location,
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("{loc}: type parameter `{name}` is not bound in this context")]
    #[diagnostic(
        code(slate::check::unbound_type_parameter),
        help("declare it as a type parameter of the enclosing struct or function")
    )]
    UnboundTypeParameter { loc: Location, name: String },

    #[error("{loc}: {message}")]
    #[diagnostic(code(slate::check::ability_violation))]
    AbilityViolation { loc: Location, message: String },

    #[error("{loc}: local `{local}` of type `{ty}` is not consumed before it goes out of scope")]
    #[diagnostic(
        code(slate::check::unconsumed_resource),
        help("move it into storage, pass it to a function, return it, or destructure it")
    )]
    UnconsumedResource {
        loc: Location,
        local: String,
        ty: String,
    },

    #[error("{loc}: value of type `{ty}` is dropped but the type lacks `drop`")]
    #[diagnostic(code(slate::check::missing_drop_ability))]
    MissingDropAbility { loc: Location, ty: String },

    #[error("{loc}: value of type `{ty}` is copied but the type lacks `copy`")]
    #[diagnostic(code(slate::check::missing_copy_ability))]
    MissingCopyAbility { loc: Location, ty: String },

    #[error("{loc}: {message}")]
    #[diagnostic(code(slate::check::borrow_conflict))]
    BorrowConflict { loc: Location, message: String },

    #[error("{loc}: accesses `{resource}` in global storage without declaring it in `acquires`")]
    #[diagnostic(
        code(slate::check::missing_acquires),
        help("list the struct in the function's `acquires` clause")
    )]
    MissingAcquires { loc: Location, resource: String },

    #[error("{loc}: unknown struct `{name}`")]
    #[diagnostic(code(slate::check::unknown_struct))]
    UnknownStruct { loc: Location, name: String },

    #[error("{loc}: unknown function `{name}`")]
    #[diagnostic(code(slate::check::unknown_function))]
    UnknownFunction { loc: Location, name: String },

    #[error("{loc}: unknown local `{name}`")]
    #[diagnostic(code(slate::check::unknown_local))]
    UnknownLocal { loc: Location, name: String },

    #[error("{loc}: expected `{expected}`, found `{found}`")]
    #[diagnostic(code(slate::check::type_mismatch))]
    TypeMismatch {
        loc: Location,
        expected: String,
        found: String,
    },

    #[error("{loc}: {message}")]
    #[diagnostic(code(slate::check::invalid_type))]
    InvalidType { loc: Location, message: String },

    #[error("{loc}: local `{local}` is used after it was moved")]
    #[diagnostic(code(slate::check::use_after_move))]
    UseAfterMove { loc: Location, local: String },

    #[error("{loc}: `{function}` expects {expected} argument(s), found {found}")]
    #[diagnostic(code(slate::check::argument_count_mismatch))]
    ArgumentCountMismatch {
        loc: Location,
        function: String,
        expected: usize,
        found: usize,
    },

    #[error("{loc}: `{name}` is declared more than once")]
    #[diagnostic(code(slate::check::duplicate_declaration))]
    DuplicateDeclaration { loc: Location, name: String },
}

impl TypeError {
    pub fn location(&self) -> &Location {
        match self {
            TypeError::ArityMismatch { loc, .. }
            | TypeError::UnboundTypeParameter { loc, .. }
            | TypeError::AbilityViolation { loc, .. }
            | TypeError::UnconsumedResource { loc, .. }
            | TypeError::MissingDropAbility { loc, .. }
            | TypeError::MissingCopyAbility { loc, .. }
            | TypeError::BorrowConflict { loc, .. }
            | TypeError::MissingAcquires { loc, .. }
            | TypeError::UnknownStruct { loc, .. }
            | TypeError::UnknownFunction { loc, .. }
            | TypeError::UnknownLocal { loc, .. }
            | TypeError::TypeMismatch { loc, .. }
            | TypeError::InvalidType { loc, .. }
            | TypeError::UseAfterMove { loc, .. }
            | TypeError::ArgumentCountMismatch { loc, .. }
            | TypeError::DuplicateDeclaration { loc, .. } => loc,
        }
    }

    pub fn mismatch(loc: Location, expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        TypeError::TypeMismatch {
            loc,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// Every static error found while checking a declaration set.
#[derive(Debug, Error, Diagnostic)]
#[error("check failed with {} error(s)", .errors.len())]
#[diagnostic(code(slate::check))]
pub struct CheckErrors {
    #[related]
    pub errors: Vec<TypeError>,
}

impl CheckErrors {
    pub fn iter(&self) -> impl Iterator<Item = &TypeError> {
        self.errors.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = Location::function("M", "f", "local `x`");
        assert_eq!(loc.to_string(), "M::f (local `x`)");
        assert_eq!(Location::module("M", "").to_string(), "M");
    }

    #[test]
    fn test_error_message_carries_location() {
        let err = TypeError::UnconsumedResource {
            loc: Location::function("M", "leak", "end of function"),
            local: "s".to_string(),
            ty: "M::S".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("M::leak (end of function)"), "{msg}");
        assert!(msg.contains("`s`"));
    }
}
