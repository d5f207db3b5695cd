#![forbid(unsafe_code)]

//! Shorthand constructors for assembling declarations in code.

use crate::{
    AbilitySet, AccountAddress, BinOp, Binder, Block, Expr, FieldBinder, FieldDecl, FieldInit,
    FunctionDecl, Module, ParamDecl, Stmt, StructDecl, StructRef, TypeParamDecl, TypeRef,
};

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            address: None,
            name: name.into(),
            structs: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn at(mut self, address: AccountAddress) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_struct(mut self, decl: StructDecl) -> Self {
        self.structs.push(decl);
        self
    }

    pub fn with_function(mut self, decl: FunctionDecl) -> Self {
        self.functions.push(decl);
        self
    }
}

impl StructDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_params: Vec::new(),
            abilities: AbilitySet::EMPTY,
            fields: Vec::new(),
        }
    }

    pub fn abilities(mut self, abilities: impl Into<AbilitySet>) -> Self {
        self.abilities = abilities.into();
        self
    }

    pub fn type_param(mut self, param: TypeParamDecl) -> Self {
        self.type_params.push(param);
        self
    }

    pub fn field(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.fields.push(FieldDecl {
            name: name.into(),
            ty,
        });
        self
    }
}

impl TypeParamDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraints: AbilitySet::EMPTY,
            phantom: false,
        }
    }

    pub fn constrained(name: impl Into<String>, constraints: impl Into<AbilitySet>) -> Self {
        Self {
            name: name.into(),
            constraints: constraints.into(),
            phantom: false,
        }
    }

    pub fn phantom(mut self) -> Self {
        self.phantom = true;
        self
    }
}

impl FunctionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_params: Vec::new(),
            params: Vec::new(),
            ret: None,
            acquires: Vec::new(),
            attributes: Vec::new(),
            body: Block::default(),
        }
    }

    pub fn type_param(mut self, param: TypeParamDecl) -> Self {
        self.type_params.push(param);
        self
    }

    pub fn param(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.params.push(ParamDecl {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn returns(mut self, ty: TypeRef) -> Self {
        self.ret = Some(ty);
        self
    }

    pub fn acquires(mut self, name: impl Into<String>) -> Self {
        self.acquires.push(name.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>) -> Self {
        self.attributes.push(name.into());
        self
    }

    pub fn body(mut self, stmts: Vec<Stmt>) -> Self {
        self.body = Block { stmts };
        self
    }
}

impl Block {
    pub fn of(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }
}

impl StructRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            module: None,
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn generic(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        Self {
            module: None,
            name: name.into(),
            args,
        }
    }

    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }
}

impl TypeRef {
    pub fn st(name: impl Into<String>) -> Self {
        TypeRef::Struct(StructRef::named(name))
    }

    pub fn generic(name: impl Into<String>, args: Vec<TypeRef>) -> Self {
        TypeRef::Struct(StructRef::generic(name, args))
    }

    pub fn param(name: impl Into<String>) -> Self {
        TypeRef::Param(name.into())
    }

    pub fn vector(elem: TypeRef) -> Self {
        TypeRef::Vector(Box::new(elem))
    }

    pub fn imm(inner: TypeRef) -> Self {
        TypeRef::Ref {
            mutable: false,
            inner: Box::new(inner),
        }
    }

    pub fn mutable(inner: TypeRef) -> Self {
        TypeRef::Ref {
            mutable: true,
            inner: Box::new(inner),
        }
    }
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    pub fn mv(name: impl Into<String>) -> Self {
        Expr::Move(name.into())
    }

    pub fn cp(name: impl Into<String>) -> Self {
        Expr::Copy(name.into())
    }

    pub fn addr(value: u64) -> Self {
        Expr::Address(AccountAddress::from_u64(value))
    }

    pub fn borrow(name: impl Into<String>) -> Self {
        Expr::Borrow {
            mutable: false,
            name: name.into(),
        }
    }

    pub fn borrow_mut(name: impl Into<String>) -> Self {
        Expr::Borrow {
            mutable: true,
            name: name.into(),
        }
    }

    pub fn field(base: Expr, field: impl Into<String>) -> Self {
        Expr::BorrowField {
            mutable: false,
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn field_mut(base: Expr, field: impl Into<String>) -> Self {
        Expr::BorrowField {
            mutable: true,
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn deref(inner: Expr) -> Self {
        Expr::Deref(Box::new(inner))
    }

    pub fn freeze(inner: Expr) -> Self {
        Expr::Freeze(Box::new(inner))
    }

    pub fn pack(ty: StructRef, fields: Vec<(&str, Expr)>) -> Self {
        Expr::Pack {
            ty,
            fields: fields
                .into_iter()
                .map(|(field, value)| FieldInit {
                    field: field.to_string(),
                    value,
                })
                .collect(),
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            module: None,
            function: function.into(),
            type_args: Vec::new(),
            args,
        }
    }

    pub fn call_generic(function: impl Into<String>, type_args: Vec<TypeRef>, args: Vec<Expr>) -> Self {
        Expr::Call {
            module: None,
            function: function.into(),
            type_args,
            args,
        }
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn signer_address(signer: Expr) -> Self {
        Expr::SignerAddress(Box::new(signer))
    }

    pub fn move_to(ty: StructRef, signer: Expr, value: Expr) -> Self {
        Expr::MoveTo {
            ty,
            signer: Box::new(signer),
            value: Box::new(value),
        }
    }

    pub fn move_from(ty: StructRef, addr: Expr) -> Self {
        Expr::MoveFrom {
            ty,
            addr: Box::new(addr),
        }
    }

    pub fn borrow_global(ty: StructRef, addr: Expr) -> Self {
        Expr::BorrowGlobal {
            ty,
            mutable: false,
            addr: Box::new(addr),
        }
    }

    pub fn borrow_global_mut(ty: StructRef, addr: Expr) -> Self {
        Expr::BorrowGlobal {
            ty,
            mutable: true,
            addr: Box::new(addr),
        }
    }

    pub fn exists(ty: StructRef, addr: Expr) -> Self {
        Expr::Exists {
            ty,
            addr: Box::new(addr),
        }
    }
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            ty: None,
            value,
        }
    }

    pub fn let_typed(name: impl Into<String>, ty: TypeRef, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            ty: Some(ty),
            value,
        }
    }

    /// `("a", Some("x"))` binds field `a` to `x`; `("b", None)` ignores `b`.
    pub fn unpack(ty: StructRef, fields: Vec<(&str, Option<&str>)>, value: Expr) -> Self {
        Stmt::Unpack {
            ty,
            fields: fields
                .into_iter()
                .map(|(field, binder)| FieldBinder {
                    field: field.to_string(),
                    binder: match binder {
                        Some(name) => Binder::Bind(name.to_string()),
                        None => Binder::Ignore,
                    },
                })
                .collect(),
            value,
        }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            name: name.into(),
            value,
        }
    }

    pub fn write(target: Expr, value: Expr) -> Self {
        Stmt::Write { target, value }
    }

    pub fn if_else(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then: Block::of(then),
            otherwise: Some(Block::of(otherwise)),
        }
    }

    pub fn if_then(cond: Expr, then: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then: Block::of(then),
            otherwise: None,
        }
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Self {
        Stmt::While {
            cond,
            body: Block::of(body),
        }
    }

    pub fn ret(value: Expr) -> Self {
        Stmt::Return(Some(value))
    }

    pub fn ret_unit() -> Self {
        Stmt::Return(None)
    }

    pub fn abort(code: u64) -> Self {
        Stmt::Abort(Expr::U64(code))
    }

    pub fn assert(cond: Expr, code: u64) -> Self {
        Stmt::Assert { cond, code }
    }

    pub fn expr(expr: Expr) -> Self {
        Stmt::Expr(expr)
    }
}
