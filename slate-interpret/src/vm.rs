#![forbid(unsafe_code)]

//! Tree-walking interpreter over a [`CheckedProgram`].
//!
//! Linearity and borrow discipline were established by the checker, so the
//! interpreter only tracks what it needs to produce values: bindings per
//! call frame, references as symbolic paths, and a storage transaction that
//! is committed when the entry function returns normally.

use slate_ast::{AccountAddress, BinOp, Binder, Block, Expr, FieldInit, FunctionDecl, Stmt, StructRef, TypeParamDecl, TypeRef};
use slate_core::abilities::AbilityOracle;
use slate_core::{CheckedProgram, FunctionId, FunctionSig, Location, StructDef, StructTag, Type, TypeUniverse};

use crate::error::RuntimeError;
use crate::storage::{GlobalStorage, SlotKey, StorageTransaction};
use crate::value::{RefRoot, Reference, StructValue, Value};

/// Native stack reserved per permitted call level. Each interpreted call
/// nests several interpreter frames, more in unoptimized builds.
const STACK_PER_CALL: usize = 64 * 1024;
const BASE_STACK: usize = 4 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct VmConfig {
    pub max_call_depth: usize,
    /// Stack size of the interpreter thread. `None` sizes it so that
    /// `max_call_depth` is reached before the native stack runs out.
    pub stack_size: Option<usize>,
}

impl VmConfig {
    pub fn stack_size(&self) -> usize {
        self.stack_size.unwrap_or_else(|| {
            self.max_call_depth
                .saturating_mul(STACK_PER_CALL)
                .saturating_add(BASE_STACK)
        })
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            stack_size: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecOutcome {
    pub value: Value,
    /// Storage slots written by the committed transaction.
    pub writes: usize,
}

#[derive(Clone, Debug)]
pub struct Vm<'p> {
    program: &'p CheckedProgram,
    config: VmConfig,
}

impl<'p> Vm<'p> {
    pub fn new(program: &'p CheckedProgram) -> Self {
        Self::with_config(program, VmConfig::default())
    }

    pub fn with_config(program: &'p CheckedProgram, config: VmConfig) -> Self {
        Self { program, config }
    }

    /// Run `function` as a top-level invocation.
    ///
    /// `&signer` parameters take a `Value::Signer`; no other reference
    /// parameters are accepted from the host. Storage changes are committed
    /// only if the call returns normally; otherwise they are discarded.
    ///
    /// The interpreter runs on its own scoped thread with a stack of
    /// [`VmConfig::stack_size`] bytes, whatever thread the host calls from.
    pub fn execute(
        &self,
        storage: &GlobalStorage,
        function: &FunctionId,
        type_args: &[Type],
        args: Vec<Value>,
    ) -> Result<ExecOutcome, RuntimeError> {
        let span = tracing::info_span!("execute", function = %function);
        std::thread::scope(|scope| -> Result<ExecOutcome, RuntimeError> {
            let worker = std::thread::Builder::new()
                .name("slate-vm".to_string())
                .stack_size(self.config.stack_size())
                .spawn_scoped(scope, || span.in_scope(|| self.run(storage, function, type_args, args)))
                .map_err(|e| RuntimeError::invariant(format!("cannot start interpreter thread: {e}")))?;
            worker
                .join()
                .map_err(|_| RuntimeError::invariant("interpreter thread panicked"))?
        })
    }

    fn run(
        &self,
        storage: &GlobalStorage,
        function: &FunctionId,
        type_args: &[Type],
        args: Vec<Value>,
    ) -> Result<ExecOutcome, RuntimeError> {
        let program = self.program;
        let universe = program.universe();
        let unknown = || RuntimeError::UnknownFunction {
            name: function.to_string(),
        };
        let decl = program.function(function).ok_or_else(unknown)?;
        let sig = universe.function(function).ok_or_else(unknown)?;
        check_type_args(universe, sig, type_args)?;
        if sig.ret.is_ref() {
            return Err(RuntimeError::invalid_argument(format!(
                "`{function}` returns a reference and cannot be called from the host"
            )));
        }
        if args.len() != sig.params.len() {
            return Err(RuntimeError::invalid_argument(format!(
                "`{function}` expects {} argument(s), got {}",
                sig.params.len(),
                args.len()
            )));
        }

        let mut machine = Machine {
            program,
            tx: storage.begin(),
            frames: Vec::new(),
            host: Vec::new(),
            max_call_depth: self.config.max_call_depth,
        };
        let mut params = Vec::with_capacity(args.len());
        for ((name, ty), arg) in sig.params.iter().zip(args) {
            params.push(machine.entry_argument(name, &ty.subst(type_args), arg)?);
        }

        match machine.call(function.clone(), decl, type_args.to_vec(), params) {
            Ok(value) => {
                let writes = machine.tx.commit()?;
                tracing::debug!(writes, "storage committed");
                Ok(ExecOutcome { value, writes })
            }
            Err(err) => {
                tracing::info!(error = %err, "execution failed, storage writes discarded");
                Err(err)
            }
        }
    }
}

/// Execute with the default configuration and return the result value.
pub fn execute(
    program: &CheckedProgram,
    function: &FunctionId,
    type_args: &[Type],
    args: Vec<Value>,
    storage: &GlobalStorage,
) -> Result<Value, RuntimeError> {
    Vm::new(program)
        .execute(storage, function, type_args, args)
        .map(|outcome| outcome.value)
}

fn check_type_args(universe: &TypeUniverse, sig: &FunctionSig, type_args: &[Type]) -> Result<(), RuntimeError> {
    if type_args.len() != sig.type_params.len() {
        return Err(RuntimeError::invalid_argument(format!(
            "`{}` expects {} type argument(s), got {}",
            sig.id,
            sig.type_params.len(),
            type_args.len()
        )));
    }
    let mut oracle = AbilityOracle::new(universe);
    let loc = Location::function(&sig.id.module, &sig.id.name, "type argument");
    for (param, arg) in sig.type_params.iter().zip(type_args) {
        if !is_value_type(universe, arg) {
            return Err(RuntimeError::invalid_argument(format!(
                "`{arg}` is not a concrete value type"
            )));
        }
        let have = oracle.abilities(arg, &[]);
        if !param.constraints.is_subset_of(have) {
            return Err(RuntimeError::invalid_argument(format!(
                "type argument `{arg}` for `{}` lacks {}",
                param.name,
                param.constraints.difference(have)
            )));
        }
        let mut errors = Vec::new();
        oracle.check_constraints(arg, &[], &loc, &mut errors);
        if let Some(e) = errors.first() {
            return Err(RuntimeError::invalid_argument(e.to_string()));
        }
    }
    Ok(())
}

/// Concrete, reference-free, and naming only declared structs.
fn is_value_type(universe: &TypeUniverse, ty: &Type) -> bool {
    match ty {
        Type::Param { .. } | Type::Ref { .. } => false,
        Type::Vector(inner) => is_value_type(universe, inner),
        Type::Struct(tag) => universe
            .struct_def(&tag.id)
            .is_some_and(|def| def.type_params.len() == tag.args.len())
            && tag.args.iter().all(|a| is_value_type(universe, a)),
        _ => true,
    }
}

struct Binding {
    name: String,
    /// `None` once moved out.
    value: Option<Value>,
}

struct Frame<'p> {
    function: FunctionId,
    type_params: &'p [TypeParamDecl],
    type_args: Vec<Type>,
    bindings: Vec<Binding>,
}

enum Flow {
    Next,
    Return(Value),
}

struct Machine<'p, 's> {
    program: &'p CheckedProgram,
    tx: StorageTransaction<'s>,
    frames: Vec<Frame<'p>>,
    host: Vec<Value>,
    max_call_depth: usize,
}

impl<'p, 's> Machine<'p, 's> {
    fn entry_argument(&mut self, name: &str, ty: &Type, arg: Value) -> Result<Value, RuntimeError> {
        match ty {
            Type::Ref { mutable, inner } if **inner == Type::Signer => {
                let Value::Signer(_) = arg else {
                    return Err(RuntimeError::invalid_argument(format!(
                        "parameter `{name}` expects a signer, got a {}",
                        arg.kind()
                    )));
                };
                self.host.push(arg);
                let root = RefRoot::Host(self.host.len() - 1);
                Ok(Value::Ref(Reference::new(root, *mutable)))
            }
            Type::Ref { .. } => Err(RuntimeError::invalid_argument(format!(
                "parameter `{name}` of type `{ty}` cannot be supplied by the host"
            ))),
            _ if arg.conforms_to(ty, self.program.universe()) => Ok(arg),
            _ => Err(RuntimeError::invalid_argument(format!(
                "parameter `{name}` expects `{ty}`, got {arg}"
            ))),
        }
    }

    fn call(
        &mut self,
        function: FunctionId,
        decl: &'p FunctionDecl,
        type_args: Vec<Type>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        if self.frames.len() >= self.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded {
                limit: self.max_call_depth,
            });
        }
        tracing::trace!(function = %function, depth = self.frames.len(), "call");
        let bindings = decl
            .params
            .iter()
            .zip(args)
            .map(|(p, value)| Binding {
                name: p.name.clone(),
                value: Some(value),
            })
            .collect();
        self.frames.push(Frame {
            function,
            type_params: &decl.type_params,
            type_args,
            bindings,
        });
        let flow = self.exec_block(&decl.body);
        self.frames.pop();
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Next => Ok(Value::Unit),
        }
    }

    fn frame(&self) -> Result<&Frame<'p>, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::invariant("no active call frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame<'p>, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::invariant("no active call frame"))
    }

    fn location(&self) -> String {
        self.frames
            .last()
            .map(|f| f.function.to_string())
            .unwrap_or_default()
    }

    // ---- types ---------------------------------------------------------

    fn runtime_loc(frame: &Frame<'_>) -> Location {
        Location::function(&frame.function.module, &frame.function.name, "runtime")
    }

    fn resolve_struct(&self, sref: &StructRef) -> Result<StructTag, RuntimeError> {
        let frame = self.frame()?;
        let tag = self
            .program
            .universe()
            .resolve_struct(&frame.function.module, sref, frame.type_params, &Self::runtime_loc(frame))
            .map_err(|e| RuntimeError::invariant(e.to_string()))?;
        Ok(tag.subst(&frame.type_args))
    }

    fn resolve_type(&self, ty: &TypeRef) -> Result<Type, RuntimeError> {
        let frame = self.frame()?;
        let resolved = self
            .program
            .universe()
            .resolve(&frame.function.module, ty, frame.type_params, &Self::runtime_loc(frame))
            .map_err(|e| RuntimeError::invariant(e.to_string()))?;
        Ok(resolved.subst(&frame.type_args))
    }

    fn struct_def(&self, tag: &StructTag) -> Result<&'p StructDef, RuntimeError> {
        let program = self.program;
        program
            .universe()
            .struct_def(&tag.id)
            .ok_or_else(|| RuntimeError::invariant(format!("unknown struct `{tag}`")))
    }

    fn field_index(&self, tag: &StructTag, field: &str) -> Result<usize, RuntimeError> {
        self.struct_def(tag)?
            .field_index(field)
            .ok_or_else(|| RuntimeError::invariant(format!("`{tag}` has no field `{field}`")))
    }

    // ---- bindings and places -------------------------------------------

    fn binding_index(&self, name: &str) -> Result<usize, RuntimeError> {
        self.frame()?
            .bindings
            .iter()
            .rposition(|b| b.name == name)
            .ok_or_else(|| RuntimeError::invariant(format!("unknown local `{name}`")))
    }

    fn binding_mut(&mut self, name: &str) -> Result<&mut Binding, RuntimeError> {
        let index = self.binding_index(name)?;
        self.frame_mut()?
            .bindings
            .get_mut(index)
            .ok_or_else(|| RuntimeError::invariant(format!("unknown local `{name}`")))
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.frame_mut()?.bindings.push(Binding {
            name: name.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    fn read_local(&mut self, name: &str) -> Result<Value, RuntimeError> {
        self.binding_mut(name)?
            .value
            .clone()
            .ok_or_else(|| RuntimeError::invariant(format!("read of moved local `{name}`")))
    }

    fn take_local(&mut self, name: &str) -> Result<Value, RuntimeError> {
        self.binding_mut(name)?
            .value
            .take()
            .ok_or_else(|| RuntimeError::invariant(format!("move of moved local `{name}`")))
    }

    /// The value a reference points at. `write` marks a storage slot as
    /// modified.
    fn place(&mut self, r: &Reference, write: bool) -> Result<&mut Value, RuntimeError> {
        let root = match &r.root {
            RefRoot::Local { frame, index } => self
                .frames
                .get_mut(*frame)
                .and_then(|f| f.bindings.get_mut(*index))
                .and_then(|b| b.value.as_mut())
                .ok_or_else(|| RuntimeError::invariant("dangling reference to a local"))?,
            RefRoot::Global(key) => self.tx.value_mut(key, write)?,
            RefRoot::Host(index) => self
                .host
                .get_mut(*index)
                .ok_or_else(|| RuntimeError::invariant("dangling host reference"))?,
        };
        descend(root, &r.path)
    }

    /// Dereference `value` if it is a reference.
    fn read_through(&mut self, value: Value) -> Result<Value, RuntimeError> {
        match value {
            Value::Ref(r) => Ok(self.place(&r, false)?.clone()),
            other => Ok(other),
        }
    }

    // ---- statements ----------------------------------------------------

    fn exec_block(&mut self, block: &'p Block) -> Result<Flow, RuntimeError> {
        let mark = self.frame()?.bindings.len();
        let mut flow = Flow::Next;
        for stmt in &block.stmts {
            flow = self.exec_stmt(stmt)?;
            if matches!(flow, Flow::Return(_)) {
                break;
            }
        }
        self.frame_mut()?.bindings.truncate(mark);
        Ok(flow)
    }

    fn exec_stmt(&mut self, stmt: &'p Stmt) -> Result<Flow, RuntimeError> {
        match stmt {
            Stmt::Let { name, value, .. } => {
                let value = self.eval(value)?;
                self.bind(name, value)?;
            }
            Stmt::Unpack { fields, value, .. } => {
                let Value::Struct(s) = self.eval(value)? else {
                    return Err(RuntimeError::invariant("unpack of a non-struct value"));
                };
                let def = self.struct_def(&s.tag)?;
                let mut values: Vec<Option<Value>> = s.fields.into_iter().map(Some).collect();
                for b in fields {
                    let value = def
                        .field_index(&b.field)
                        .and_then(|i| values.get_mut(i))
                        .and_then(Option::take)
                        .ok_or_else(|| RuntimeError::invariant(format!("bad unpack of field `{}`", b.field)))?;
                    if let Binder::Bind(name) = &b.binder {
                        self.bind(name, value)?;
                    }
                }
            }
            Stmt::Assign { name, value } => {
                let value = self.eval(value)?;
                self.binding_mut(name)?.value = Some(value);
            }
            Stmt::Write { target, value } => {
                let value = self.eval(value)?;
                let Value::Ref(r) = self.eval(target)? else {
                    return Err(RuntimeError::invariant("write through a non-reference"));
                };
                if !r.mutable {
                    return Err(RuntimeError::invariant("write through a shared reference"));
                }
                *self.place(&r, true)? = value;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval_bool(cond)? {
                    return self.exec_block(then);
                }
                if let Some(block) = otherwise {
                    return self.exec_block(block);
                }
            }
            Stmt::While { cond, body } => {
                while self.eval_bool(cond)? {
                    if let Flow::Return(value) = self.exec_block(body)? {
                        return Ok(Flow::Return(value));
                    }
                }
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval(e)?,
                    None => Value::Unit,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Abort(code) => {
                let Value::U64(code) = self.eval(code)? else {
                    return Err(RuntimeError::invariant("abort code is not a u64"));
                };
                return Err(self.aborted(code));
            }
            Stmt::Assert { cond, code } => {
                if !self.eval_bool(cond)? {
                    return Err(self.aborted(*code));
                }
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Next)
    }

    fn aborted(&self, code: u64) -> RuntimeError {
        let location = self.location();
        tracing::debug!(code, %location, "abort");
        RuntimeError::Aborted { code, location }
    }

    // ---- expressions ---------------------------------------------------

    fn eval_bool(&mut self, expr: &'p Expr) -> Result<bool, RuntimeError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(RuntimeError::invariant(format!("expected bool, got {}", other.kind()))),
        }
    }

    fn eval_address(&mut self, expr: &'p Expr) -> Result<AccountAddress, RuntimeError> {
        match self.eval(expr)? {
            Value::Address(a) => Ok(a),
            other => Err(RuntimeError::invariant(format!("expected address, got {}", other.kind()))),
        }
    }

    fn storage_key(&mut self, ty: &StructRef, addr: &'p Expr) -> Result<SlotKey, RuntimeError> {
        let address = self.eval_address(addr)?;
        Ok(SlotKey::new(address, self.resolve_struct(ty)?))
    }

    fn eval(&mut self, expr: &'p Expr) -> Result<Value, RuntimeError> {
        Ok(match expr {
            Expr::Unit => Value::Unit,
            Expr::Bool(b) => Value::Bool(*b),
            Expr::U8(n) => Value::U8(*n),
            Expr::U64(n) => Value::U64(*n),
            Expr::U128(n) => Value::U128(*n),
            Expr::Address(a) => Value::Address(*a),

            // An implicit use leaves the binding in place; a checked program
            // never reads a moved-from binding again.
            Expr::Var(name) | Expr::Copy(name) => self.read_local(name)?,
            Expr::Move(name) => self.take_local(name)?,

            Expr::Borrow { mutable, name } => {
                let index = self.binding_index(name)?;
                let frame = self.frames.len() - 1;
                Value::Ref(Reference::new(RefRoot::Local { frame, index }, *mutable))
            }
            Expr::BorrowField {
                mutable,
                base,
                field,
            } => {
                let Value::Ref(base) = self.eval(base)? else {
                    return Err(RuntimeError::invariant("field borrow through a non-reference"));
                };
                let tag = match self.place(&base, false)? {
                    Value::Struct(s) => s.tag.clone(),
                    other => {
                        return Err(RuntimeError::invariant(format!(
                            "field borrow on a {}",
                            other.kind()
                        )));
                    }
                };
                let index = self.field_index(&tag, field)?;
                Value::Ref(base.field(index, *mutable))
            }
            Expr::Freeze(inner) => match self.eval(inner)? {
                Value::Ref(mut r) => {
                    r.mutable = false;
                    Value::Ref(r)
                }
                other => {
                    return Err(RuntimeError::invariant(format!("freeze of a {}", other.kind())));
                }
            },
            Expr::Deref(inner) => match self.eval(inner)? {
                Value::Ref(r) => self.place(&r, false)?.clone(),
                other => {
                    return Err(RuntimeError::invariant(format!("dereference of a {}", other.kind())));
                }
            },

            Expr::Pack { ty, fields } => self.pack(ty, fields)?,
            Expr::Call {
                module,
                function,
                type_args,
                args,
            } => self.call_expr(module.as_deref(), function, type_args, args)?,
            Expr::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
            } => {
                let l = self.eval_bool(lhs)?;
                // `false && _` and `true || _` skip the right operand.
                if l == (*op == BinOp::Or) {
                    Value::Bool(l)
                } else {
                    Value::Bool(self.eval_bool(rhs)?)
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                self.binary(*op, l, r)?
            }
            Expr::Not(inner) => Value::Bool(!self.eval_bool(inner)?),
            Expr::Vector { items, .. } => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Value::Vector(values)
            }
            Expr::SignerAddress(inner) => {
                let value = self.eval(inner)?;
                Value::Address(self.signer_of(value)?)
            }

            Expr::MoveTo { ty, signer, value } => {
                let signer = self.eval(signer)?;
                let address = self.signer_of(signer)?;
                let value = self.eval(value)?;
                let key = SlotKey::new(address, self.resolve_struct(ty)?);
                tracing::trace!(slot = %key, "move_to");
                self.tx.move_to(key, value)?;
                Value::Unit
            }
            Expr::MoveFrom { ty, addr } => {
                let key = self.storage_key(ty, addr)?;
                tracing::trace!(slot = %key, "move_from");
                self.tx.move_from(&key)?
            }
            Expr::BorrowGlobal { ty, mutable, addr } => {
                let key = self.storage_key(ty, addr)?;
                self.tx.borrow(&key)?;
                Value::Ref(Reference::new(RefRoot::Global(key), *mutable))
            }
            Expr::Exists { ty, addr } => {
                let key = self.storage_key(ty, addr)?;
                Value::Bool(self.tx.exists(&key))
            }
        })
    }

    fn signer_of(&mut self, value: Value) -> Result<AccountAddress, RuntimeError> {
        match self.read_through(value)? {
            Value::Signer(a) => Ok(a),
            other => Err(RuntimeError::invariant(format!("expected signer, got {}", other.kind()))),
        }
    }

    fn pack(&mut self, ty: &StructRef, inits: &'p [FieldInit]) -> Result<Value, RuntimeError> {
        let mut given = Vec::with_capacity(inits.len());
        for init in inits {
            given.push((init.field.as_str(), self.eval(&init.value)?));
        }
        let tag = self.resolve_struct(ty)?;
        let def = self.struct_def(&tag)?;
        let mut fields: Vec<Option<Value>> = vec![None; def.fields.len()];
        for (name, value) in given {
            let index = self.field_index(&tag, name)?;
            fields[index] = Some(value);
        }
        let fields = fields
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RuntimeError::invariant(format!("pack of `{tag}` left a field unset")))?;
        Ok(Value::Struct(StructValue::new(tag, fields)))
    }

    fn call_expr(
        &mut self,
        module: Option<&str>,
        function: &str,
        type_args: &[TypeRef],
        args: &'p [Expr],
    ) -> Result<Value, RuntimeError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        let targs = type_args
            .iter()
            .map(|t| self.resolve_type(t))
            .collect::<Result<Vec<_>, _>>()?;
        let caller = &self.frame()?.function.module;
        let id = FunctionId::new(module.unwrap_or(caller), function);
        let program = self.program;
        let decl = program
            .function(&id)
            .ok_or_else(|| RuntimeError::UnknownFunction { name: id.to_string() })?;
        self.call(id, decl, targs, values)
    }

    fn binary(&mut self, op: BinOp, l: Value, r: Value) -> Result<Value, RuntimeError> {
        match op {
            BinOp::Eq | BinOp::Neq => {
                let l = self.read_through(l)?;
                let r = self.read_through(r)?;
                Ok(Value::Bool((l == r) == (op == BinOp::Eq)))
            }
            BinOp::And | BinOp::Or => Err(RuntimeError::invariant(format!(
                "operator `{}` evaluated without short-circuiting",
                op.symbol()
            ))),
            _ if op.is_ordering() => {
                let ordering = match (&l, &r) {
                    (Value::U8(a), Value::U8(b)) => a.cmp(b),
                    (Value::U64(a), Value::U64(b)) => a.cmp(b),
                    (Value::U128(a), Value::U128(b)) => a.cmp(b),
                    _ => return Err(self.operand_mismatch(op, &l, &r)),
                };
                Ok(Value::Bool(match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Le => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                }))
            }
            _ => {
                let result = match (&l, &r) {
                    (Value::U8(a), Value::U8(b)) => arithmetic(op, *a, *b).map(Value::U8),
                    (Value::U64(a), Value::U64(b)) => arithmetic(op, *a, *b).map(Value::U64),
                    (Value::U128(a), Value::U128(b)) => arithmetic(op, *a, *b).map(Value::U128),
                    _ => return Err(self.operand_mismatch(op, &l, &r)),
                };
                result.map_err(|reason| RuntimeError::ArithmeticError {
                    op: op.symbol().to_string(),
                    reason: reason.to_string(),
                    location: self.location(),
                })
            }
        }
    }

    fn operand_mismatch(&self, op: BinOp, l: &Value, r: &Value) -> RuntimeError {
        RuntimeError::invariant(format!(
            "operator `{}` on {} and {}",
            op.symbol(),
            l.kind(),
            r.kind()
        ))
    }
}

fn descend<'v>(value: &'v mut Value, path: &[usize]) -> Result<&'v mut Value, RuntimeError> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(value);
    };
    match value {
        Value::Struct(s) => {
            let field = s
                .fields
                .get_mut(*first)
                .ok_or_else(|| RuntimeError::invariant("field index out of range"))?;
            descend(field, rest)
        }
        other => Err(RuntimeError::invariant(format!("field access on a {}", other.kind()))),
    }
}

/// Checked unsigned arithmetic shared by every integer width.
trait Unsigned: Copy + PartialEq + Default {
    fn checked(self, op: BinOp, rhs: Self) -> Option<Self>;
}

macro_rules! impl_unsigned {
    ($($t:ty),*) => {$(
        impl Unsigned for $t {
            fn checked(self, op: BinOp, rhs: Self) -> Option<Self> {
                match op {
                    BinOp::Add => self.checked_add(rhs),
                    BinOp::Sub => self.checked_sub(rhs),
                    BinOp::Mul => self.checked_mul(rhs),
                    BinOp::Div => self.checked_div(rhs),
                    BinOp::Mod => self.checked_rem(rhs),
                    _ => None,
                }
            }
        }
    )*};
}

impl_unsigned!(u8, u64, u128);

fn arithmetic<T: Unsigned>(op: BinOp, a: T, b: T) -> Result<T, &'static str> {
    a.checked(op, b).ok_or(match op {
        BinOp::Div | BinOp::Mod if b == T::default() => "division by zero",
        BinOp::Sub => "underflow",
        BinOp::Add | BinOp::Mul => "overflow",
        _ => "unsupported operator",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_reasons() {
        assert_eq!(arithmetic(BinOp::Add, 1u64, 2), Ok(3));
        assert_eq!(arithmetic(BinOp::Add, u8::MAX, 1), Err("overflow"));
        assert_eq!(arithmetic(BinOp::Sub, 0u128, 1), Err("underflow"));
        assert_eq!(arithmetic(BinOp::Div, 7u64, 0), Err("division by zero"));
        assert_eq!(arithmetic(BinOp::Mod, 7u64, 3), Ok(1));
    }

    #[test]
    fn test_descend_follows_field_path() {
        use slate_core::StructId;
        let tag = StructTag::new(StructId::new("M", "P"), vec![]);
        let mut v = Value::Struct(StructValue::new(tag, vec![Value::U64(1), Value::U64(2)]));
        *descend(&mut v, &[1]).expect("path") = Value::U64(9);
        let Value::Struct(s) = &v else { unreachable!() };
        assert_eq!(s.fields[1], Value::U64(9));
        assert!(descend(&mut Value::U64(0), &[0]).is_err());
    }
}
