#![forbid(unsafe_code)]

//! Declaration set consumed by the slate checker and interpreter.
//!
//! Source text is not parsed here: hosts hand over modules as data, usually
//! JSON produced by an external front end (see [`Module::from_json`]).

mod ability;
mod address;
pub mod build;

use serde::{Deserialize, Serialize};

pub use ability::{Ability, AbilitySet};
pub use address::{AccountAddress, AddressParseError};

/// Unresolved type syntax as written in a declaration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeRef {
    Bool,
    U8,
    U64,
    U128,
    Address,
    Signer,
    Vector(Box<TypeRef>),
    Struct(StructRef),
    /// A type parameter of the enclosing struct or function.
    Param(String),
    Ref {
        mutable: bool,
        inner: Box<TypeRef>,
    },
}

/// Reference to a struct by name, with explicit type arguments.
///
/// `module` defaults to the module containing the reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<TypeRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeParamDecl {
    pub name: String,
    #[serde(default)]
    pub constraints: AbilitySet,
    #[serde(default)]
    pub phantom: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDecl {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<TypeParamDecl>,
    #[serde(default)]
    pub abilities: AbilitySet,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub type_params: Vec<TypeParamDecl>,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    /// `None` means the function returns unit.
    #[serde(default)]
    pub ret: Option<TypeRef>,
    /// Struct names (without type arguments) this function may access in
    /// global storage.
    #[serde(default)]
    pub acquires: Vec<String>,
    /// Opaque annotation markers such as `callable` or `evm_test`.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub body: Block,
}

impl FunctionDecl {
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Publishing address; carried for hosts, never interpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<AccountAddress>,
    pub name: String,
    #[serde(default)]
    pub structs: Vec<StructDecl>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

impl Module {
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn struct_decl(&self, name: &str) -> Option<&StructDecl> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub stmts: Vec<Stmt>,
}

/// Target of one field in an unpack pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binder {
    Bind(String),
    /// `_`: the field value is dropped on the spot.
    Ignore,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinder {
    pub field: String,
    pub binder: Binder,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInit {
    pub field: String,
    pub value: Expr,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Let {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ty: Option<TypeRef>,
        value: Expr,
    },
    /// `let S { a: x, b: _ } = value;`
    Unpack {
        ty: StructRef,
        fields: Vec<FieldBinder>,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    /// `*target = value;`
    Write {
        target: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Block,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
    },
    Return(Option<Expr>),
    Abort(Expr),
    Assert {
        cond: Expr,
        code: u64,
    },
    /// Evaluate and discard.
    Expr(Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,

    And,
    Or,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod)
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Unit,
    Bool(bool),
    U8(u8),
    U64(u64),
    U128(u128),
    Address(AccountAddress),

    /// Copy when the local's type has `copy`, move otherwise.
    Var(String),
    Move(String),
    Copy(String),

    /// `&name` / `&mut name`
    Borrow {
        mutable: bool,
        name: String,
    },
    /// `&base.field` / `&mut base.field` where `base` evaluates to a reference.
    BorrowField {
        mutable: bool,
        base: Box<Expr>,
        field: String,
    },
    Freeze(Box<Expr>),
    Deref(Box<Expr>),

    Pack {
        ty: StructRef,
        fields: Vec<FieldInit>,
    },
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        module: Option<String>,
        function: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        type_args: Vec<TypeRef>,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Not(Box<Expr>),
    Vector {
        elem: TypeRef,
        #[serde(default)]
        items: Vec<Expr>,
    },
    /// Address held by a `&signer`.
    SignerAddress(Box<Expr>),

    MoveTo {
        ty: StructRef,
        signer: Box<Expr>,
        value: Box<Expr>,
    },
    MoveFrom {
        ty: StructRef,
        addr: Box<Expr>,
    },
    BorrowGlobal {
        ty: StructRef,
        mutable: bool,
        addr: Box<Expr>,
    },
    Exists {
        ty: StructRef,
        addr: Box<Expr>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_from_json() {
        let src = r#"{
            "name": "M",
            "structs": [
                { "name": "S", "abilities": ["key"], "fields": [{ "name": "a", "ty": "u64" }] }
            ],
            "functions": [
                {
                    "name": "publish",
                    "params": [{ "name": "account", "ty": { "ref": { "mutable": false, "inner": "signer" } } }],
                    "attributes": ["callable"],
                    "body": { "stmts": [
                        { "expr": { "move_to": {
                            "ty": { "name": "S" },
                            "signer": { "var": "account" },
                            "value": { "pack": { "ty": { "name": "S" }, "fields": [
                                { "field": "a", "value": { "u64": 7 } }
                            ] } }
                        } } }
                    ] }
                }
            ]
        }"#;
        let module = Module::from_json(src).expect("parse");
        assert_eq!(module.name, "M");
        let s = module.struct_decl("S").expect("struct");
        assert!(s.abilities.has(Ability::Key));
        assert_eq!(s.fields[0].ty, TypeRef::U64);
        let f = module.function("publish").expect("function");
        assert!(f.has_attribute("callable"));
        assert_eq!(f.body.stmts.len(), 1);
        assert!(matches!(f.body.stmts[0], Stmt::Expr(Expr::MoveTo { .. })));
    }

    #[test]
    fn test_json_round_trip_keeps_module() {
        let module = Module::new("M")
            .with_struct(StructDecl::new("Coin").abilities([Ability::Store]).field("v", TypeRef::U64));
        let json = module.to_json().expect("serialize");
        assert_eq!(Module::from_json(&json).expect("parse"), module);
    }
}
