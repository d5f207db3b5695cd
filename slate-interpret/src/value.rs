#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use slate_ast::AccountAddress;
use slate_core::{StructTag, Type, TypeUniverse};

use crate::storage::SlotKey;

/// A runtime value.
///
/// References never leave an execution, so they are not serializable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Unit,
    Bool(bool),
    U8(u8),
    U64(u64),
    U128(u128),
    Address(AccountAddress),
    Signer(AccountAddress),
    Vector(Vec<Value>),
    Struct(StructValue),
    #[serde(skip)]
    Ref(Reference),
}

/// Field values in declaration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructValue {
    pub tag: StructTag,
    pub fields: Vec<Value>,
}

impl StructValue {
    pub fn new(tag: StructTag, fields: Vec<Value>) -> Self {
        Self { tag, fields }
    }
}

/// Where a reference points: a root location plus a chain of field indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub root: RefRoot,
    pub path: Vec<usize>,
    pub mutable: bool,
}

impl Reference {
    pub fn new(root: RefRoot, mutable: bool) -> Self {
        Self {
            root,
            path: Vec::new(),
            mutable,
        }
    }

    pub fn field(&self, index: usize, mutable: bool) -> Self {
        let mut path = self.path.clone();
        path.push(index);
        Self {
            root: self.root.clone(),
            path,
            mutable,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefRoot {
    /// Binding `index` of call frame `frame`.
    Local { frame: usize, index: usize },
    Global(SlotKey),
    /// Value supplied by the host for a reference parameter of the entry
    /// function (the `&signer`).
    Host(usize),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::U64(_) => "u64",
            Value::U128(_) => "u128",
            Value::Address(_) => "address",
            Value::Signer(_) => "signer",
            Value::Vector(_) => "vector",
            Value::Struct(_) => "struct",
            Value::Ref(_) => "reference",
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Whether the value is a well-formed inhabitant of `ty`. References
    /// are accepted for reference types without looking at the referent.
    pub fn conforms_to(&self, ty: &Type, universe: &TypeUniverse) -> bool {
        match (self, ty) {
            (Value::Unit, Type::Unit)
            | (Value::Bool(_), Type::Bool)
            | (Value::U8(_), Type::U8)
            | (Value::U64(_), Type::U64)
            | (Value::U128(_), Type::U128)
            | (Value::Address(_), Type::Address)
            | (Value::Signer(_), Type::Signer)
            | (Value::Ref(_), Type::Ref { .. }) => true,
            (Value::Vector(items), Type::Vector(elem)) => {
                items.iter().all(|v| v.conforms_to(elem, universe))
            }
            (Value::Struct(s), Type::Struct(tag)) => {
                if &s.tag != tag {
                    return false;
                }
                let Some(fields) = universe.instantiate_fields(tag) else {
                    return false;
                };
                fields.len() == s.fields.len()
                    && s.fields
                        .iter()
                        .zip(&fields)
                        .all(|(v, (_, t))| v.conforms_to(t, universe))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::U8(n) => write!(f, "{n}u8"),
            Value::U64(n) => write!(f, "{n}"),
            Value::U128(n) => write!(f, "{n}u128"),
            Value::Address(a) => write!(f, "@{a}"),
            Value::Signer(a) => write!(f, "signer({a})"),
            Value::Vector(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Struct(s) => {
                write!(f, "{} {{", s.tag)?;
                for (i, item) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {item}")?;
                }
                f.write_str(" }")
            }
            Value::Ref(r) => write!(f, "&{}{:?}", if r.mutable { "mut " } else { "" }, r.root),
        }
    }
}
