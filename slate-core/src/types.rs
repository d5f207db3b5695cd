#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unparameterized identity of a struct: `(module, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructId {
    pub module: String,
    pub name: String,
}

impl StructId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StructId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId {
    pub module: String,
    pub name: String,
}

impl FunctionId {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.module, self.name)
    }
}

/// Canonical descriptor of a (possibly generic) struct instantiation.
///
/// Two tags are equal iff they name the same struct and their arguments are
/// pairwise equal, recursively.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StructTag {
    pub id: StructId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Type>,
}

impl StructTag {
    pub fn new(id: StructId, args: Vec<Type>) -> Self {
        Self { id, args }
    }

    pub fn is_concrete(&self) -> bool {
        self.args.iter().all(Type::is_concrete)
    }

    pub fn subst(&self, args: &[Type]) -> StructTag {
        StructTag {
            id: self.id.clone(),
            args: self.args.iter().map(|t| t.subst(args)).collect(),
        }
    }
}

impl fmt::Display for StructTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if !self.args.is_empty() {
            let args = self
                .args
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            write!(f, "<{args}>")?;
        }
        Ok(())
    }
}

/// Resolved type descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Unit,
    Bool,
    U8,
    U64,
    U128,
    Address,
    Signer,
    Vector(Box<Type>),
    Struct(StructTag),
    /// Type parameter bound by the enclosing generic context, by position.
    Param { index: usize, name: String },
    Ref { mutable: bool, inner: Box<Type> },
}

impl Type {
    pub fn reference(mutable: bool, inner: Type) -> Type {
        Type::Ref {
            mutable,
            inner: Box::new(inner),
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Type::Ref { .. })
    }

    pub fn is_mut_ref(&self) -> bool {
        matches!(self, Type::Ref { mutable: true, .. })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::U8 | Type::U64 | Type::U128)
    }

    /// Referent of a reference type.
    pub fn deref(&self) -> Option<&Type> {
        match self {
            Type::Ref { inner, .. } => Some(inner),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructTag> {
        match self {
            Type::Struct(tag) => Some(tag),
            _ => None,
        }
    }

    /// True once no type parameter occurs anywhere inside.
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::Param { .. } => false,
            Type::Vector(inner) => inner.is_concrete(),
            Type::Ref { inner, .. } => inner.is_concrete(),
            Type::Struct(tag) => tag.is_concrete(),
            _ => true,
        }
    }

    /// Replace every `Param { index }` with `args[index]`.
    ///
    /// Out-of-range indices are left in place; the resolver guarantees they
    /// cannot occur in well-formed declarations.
    pub fn subst(&self, args: &[Type]) -> Type {
        match self {
            Type::Param { index, .. } => args.get(*index).cloned().unwrap_or_else(|| self.clone()),
            Type::Vector(inner) => Type::Vector(Box::new(inner.subst(args))),
            Type::Ref { mutable, inner } => Type::Ref {
                mutable: *mutable,
                inner: Box::new(inner.subst(args)),
            },
            Type::Struct(tag) => Type::Struct(tag.subst(args)),
            other => other.clone(),
        }
    }

    /// `&mut T` may flow where `&T` is expected.
    pub fn is_assignable_to(&self, expected: &Type) -> bool {
        if self == expected {
            return true;
        }
        match (self, expected) {
            (
                Type::Ref {
                    mutable: true,
                    inner: actual,
                },
                Type::Ref {
                    mutable: false,
                    inner: wanted,
                },
            ) => actual == wanted,
            _ => false,
        }
    }

    pub fn display(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Unit => f.write_str("()"),
            Type::Bool => f.write_str("bool"),
            Type::U8 => f.write_str("u8"),
            Type::U64 => f.write_str("u64"),
            Type::U128 => f.write_str("u128"),
            Type::Address => f.write_str("address"),
            Type::Signer => f.write_str("signer"),
            Type::Vector(inner) => write!(f, "vector<{inner}>"),
            Type::Struct(tag) => write!(f, "{tag}"),
            Type::Param { name, .. } => f.write_str(name),
            Type::Ref { mutable: true, inner } => write!(f, "&mut {inner}"),
            Type::Ref { mutable: false, inner } => write!(f, "&{inner}"),
        }
    }
}
