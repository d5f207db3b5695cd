#![forbid(unsafe_code)]

//! Static checking of a declaration set.
//!
//! Struct declarations go through the resolver and the ability checker;
//! every function body is then walked once, forward, by a
//! [`FunctionChecker`] that tracks linear locals and live borrows together.
//! Storage accesses collected along the way feed the acquires verifier.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rayon::prelude::*;
use slate_ast::{
    Ability, AbilitySet, BinOp, Binder, Block, Expr, FieldBinder, FieldInit, FunctionDecl, Module,
    Stmt, StructRef, TypeRef,
};

use crate::abilities::{self, AbilityOracle, constraint_sets};
use crate::acquires::{self, FunctionAccess};
use crate::borrow_checker::{BorrowMode, BorrowPath, BorrowRoot, BorrowTable, Loan, LoanId};
use crate::error::{CheckErrors, Location, TypeError};
use crate::move_tracking::{BindingId, LocalState, LocalTable};
use crate::program::CheckedProgram;
use crate::resolve::{FunctionSig, TypeUniverse, reject_references};
use crate::types::{FunctionId, StructId, StructTag, Type};

/// Entry point of static checking.
#[derive(Clone, Debug)]
pub struct Checker {
    parallel: bool,
}

impl Default for Checker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker {
    pub fn new() -> Self {
        Self { parallel: true }
    }

    /// Check function bodies on the rayon pool (default) or sequentially.
    /// The reported errors are identical either way.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn check_module(&self, module: &Module) -> Result<CheckedProgram, CheckErrors> {
        self.check_program(std::slice::from_ref(module))
    }

    pub fn check_program(&self, modules: &[Module]) -> Result<CheckedProgram, CheckErrors> {
        let span = tracing::info_span!("check", modules = modules.len());
        let _enter = span.enter();

        let (universe, mut errors) = TypeUniverse::build(modules);
        errors.extend(abilities::check_structs(&universe));

        // Duplicates were already reported; only the registered declaration
        // is checked.
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for module in modules {
            for decl in &module.functions {
                let id = FunctionId::new(&module.name, &decl.name);
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(sig) = universe.function(&id) {
                    jobs.push((module.name.as_str(), decl, sig));
                }
            }
        }

        let outcomes: Vec<FunctionOutcome> = if self.parallel {
            jobs.par_iter()
                .map(|(module, decl, sig)| FunctionChecker::new(&universe, module, sig).run(decl))
                .collect()
        } else {
            jobs.iter()
                .map(|(module, decl, sig)| FunctionChecker::new(&universe, module, sig).run(decl))
                .collect()
        };

        let mut accesses = BTreeMap::new();
        for outcome in outcomes {
            errors.extend(outcome.errors);
            accesses.insert(outcome.id, outcome.access);
        }
        errors.extend(acquires::verify(&universe, &accesses));

        if errors.is_empty() {
            tracing::info!(functions = jobs.len(), "check passed");
            Ok(CheckedProgram::new(universe, modules.to_vec()))
        } else {
            tracing::info!(errors = errors.len(), "check failed");
            Err(CheckErrors { errors })
        }
    }
}

/// Check a single module with the default configuration.
pub fn check(module: &Module) -> Result<CheckedProgram, CheckErrors> {
    Checker::new().check_module(module)
}

struct FunctionOutcome {
    id: FunctionId,
    errors: Vec<TypeError>,
    access: FunctionAccess,
}

/// Result of checking an expression: its type, the loans a reference value
/// keeps alive, and what the reference points at.
#[derive(Clone, Debug)]
struct Operand {
    ty: Type,
    loans: BTreeSet<LoanId>,
    place: Option<BorrowPath>,
}

impl Operand {
    fn value(ty: Type) -> Self {
        Self {
            ty,
            loans: BTreeSet::new(),
            place: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Use {
    /// `x`: copy when the type has `copy`, move otherwise.
    Implicit,
    Move,
    Copy,
}

struct FunctionChecker<'a> {
    universe: &'a TypeUniverse,
    oracle: AbilityOracle<'a>,
    module: &'a str,
    sig: &'a FunctionSig,
    constraints: Vec<AbilitySet>,
    locals: LocalTable,
    borrows: BorrowTable,
    /// Bindings whose initializer failed to check; uses are not re-reported.
    poisoned: HashSet<BindingId>,
    /// Local names read by any statement that may run after the current one.
    live_after: HashSet<String>,
    access: FunctionAccess,
    errors: Vec<TypeError>,
}

impl<'a> FunctionChecker<'a> {
    fn new(universe: &'a TypeUniverse, module: &'a str, sig: &'a FunctionSig) -> Self {
        Self {
            universe,
            oracle: AbilityOracle::new(universe),
            module,
            sig,
            constraints: constraint_sets(&sig.type_params),
            locals: LocalTable::new(),
            borrows: BorrowTable::new(),
            poisoned: HashSet::new(),
            live_after: HashSet::new(),
            access: FunctionAccess::default(),
            errors: Vec::new(),
        }
    }

    fn run(mut self, decl: &FunctionDecl) -> FunctionOutcome {
        let span = tracing::debug_span!("function", name = %self.sig.id);
        let _enter = span.enter();

        let sig = self.sig;
        let mut names = HashSet::new();
        for (name, ty) in &sig.params {
            let loc = self.loc(format!("parameter `{name}`"));
            if !names.insert(name.as_str()) {
                self.report(TypeError::DuplicateDeclaration {
                    loc,
                    name: name.clone(),
                });
                continue;
            }
            self.oracle
                .check_constraints(ty, &self.constraints, &loc, &mut self.errors);
            let abilities = self.abilities(ty);
            let id = self.locals.declare(name, ty.clone(), abilities, BTreeSet::new());
            if let Type::Ref { mutable, .. } = ty {
                // The caller guarantees exclusivity of what a reference
                // parameter points at for the duration of the call.
                let path = BorrowPath::root(BorrowRoot::Param(id));
                let loan = self.borrows.insert(Loan {
                    path: path.clone(),
                    mode: BorrowMode::of(*mutable),
                    parents: BTreeSet::new(),
                });
                let slot = self.locals.slot_mut(id);
                slot.loans.insert(loan);
                slot.place = Some(path);
            }
        }
        let rloc = self.loc("return type");
        self.oracle
            .check_constraints(&sig.ret, &self.constraints, &rloc, &mut self.errors);

        let terminated = self.check_block(&decl.body);
        if !terminated {
            if sig.ret != Type::Unit {
                let loc = self.loc("end of function");
                self.report(TypeError::mismatch(loc, &sig.ret, Type::Unit));
            }
            let visible = self.locals.visible();
            self.check_unconsumed(&visible, "end of function");
        }

        FunctionOutcome {
            id: sig.id.clone(),
            errors: self.errors,
            access: self.access,
        }
    }

    fn loc(&self, detail: impl Into<String>) -> Location {
        Location::function(self.module, &self.sig.id.name, detail)
    }

    fn report(&mut self, error: TypeError) {
        tracing::trace!(%error, "static error");
        self.errors.push(error);
    }

    fn abilities(&mut self, ty: &Type) -> AbilitySet {
        self.oracle.abilities(ty, &self.constraints)
    }

    fn expect(&mut self, found: &Type, expected: &Type, detail: impl Into<String>) -> bool {
        if found.is_assignable_to(expected) {
            return true;
        }
        let loc = self.loc(detail);
        self.report(TypeError::mismatch(loc, expected, found));
        false
    }

    fn resolve(&mut self, ty: &TypeRef, allow_ref: bool, detail: &str) -> Option<Type> {
        let loc = self.loc(detail);
        match self
            .universe
            .resolve(self.module, ty, &self.sig.type_params, &loc)
            .and_then(|t| reject_references(t, allow_ref, &loc))
        {
            Ok(ty) => {
                self.oracle
                    .check_constraints(&ty, &self.constraints, &loc, &mut self.errors);
                Some(ty)
            }
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    /// Resolve a struct that the current module owns; only the owner may
    /// pack, unpack, borrow fields of, or store its values.
    fn resolve_own_struct(&mut self, sref: &StructRef, what: &str) -> Option<StructTag> {
        let loc = self.loc(format!("{what} `{}`", sref.name));
        let tag = match self
            .universe
            .resolve_struct(self.module, sref, &self.sig.type_params, &loc)
        {
            Ok(tag) => tag,
            Err(e) => {
                self.report(e);
                return None;
            }
        };
        self.oracle
            .check_tag_constraints(&tag, &self.constraints, &loc, &mut self.errors);
        if tag.id.module != self.module {
            self.report(TypeError::InvalidType {
                loc,
                message: format!("`{what}` of `{tag}` is only allowed inside module `{}`", tag.id.module),
            });
            return None;
        }
        Some(tag)
    }

    /// A `key` struct of the current module, as required by every storage
    /// operation.
    fn storage_tag(&mut self, sref: &StructRef, what: &str) -> Option<StructTag> {
        let tag = self.resolve_own_struct(sref, what)?;
        if !self.abilities(&Type::Struct(tag.clone())).has(Ability::Key) {
            let loc = self.loc(format!("{what} `{}`", sref.name));
            self.report(TypeError::AbilityViolation {
                loc,
                message: format!("`{what}` requires `{tag}` to have `key`"),
            });
            return None;
        }
        Some(tag)
    }

    fn describe(&self, path: &BorrowPath) -> String {
        let mut out = match &path.root {
            BorrowRoot::Local(id) | BorrowRoot::Param(id) => {
                if *id < self.locals.len() {
                    format!("`{}`", self.locals.slot(*id).name)
                } else {
                    "a local".to_string()
                }
            }
            BorrowRoot::Global(tag) => format!("global `{tag}`"),
        };
        for field in &path.fields {
            out.push('.');
            out.push_str(field);
        }
        out
    }

    // ---- scopes and liveness -------------------------------------------

    /// Returns true when every path through the block ends in `return` or
    /// `abort`.
    fn check_block(&mut self, block: &Block) -> bool {
        self.locals.push_scope();
        let outer = self.live_after.clone();
        let mut suffix = vec![HashSet::new(); block.stmts.len() + 1];
        for (index, stmt) in block.stmts.iter().enumerate().rev() {
            let mut names = suffix[index + 1].clone();
            stmt_names(stmt, &mut names);
            suffix[index] = names;
        }

        let mut terminated = false;
        for (index, stmt) in block.stmts.iter().enumerate() {
            if terminated {
                tracing::debug!(skipped = block.stmts.len() - index, "unreachable statements");
                break;
            }
            self.live_after = suffix[index + 1].union(&outer).cloned().collect();
            terminated = self.check_stmt(stmt);
            self.expire_references();
            self.release_temporaries();
        }
        self.live_after = outer;
        let popped = self.locals.pop_scope();
        if !terminated {
            self.check_unconsumed(&popped, "end of block");
            self.release_temporaries();
            self.check_outlived(&popped);
        }
        terminated
    }

    fn check_unconsumed(&mut self, ids: &[BindingId], detail: &str) {
        for id in ids {
            if self.poisoned.contains(id) {
                continue;
            }
            let slot = self.locals.slot(*id);
            if slot.state.holds_value() && !slot.can_drop() {
                let error = TypeError::UnconsumedResource {
                    loc: self.loc(detail),
                    local: slot.name.clone(),
                    ty: slot.ty.to_string(),
                };
                self.report(error);
            }
        }
    }

    /// A reference may not outlive the local it borrows.
    fn check_outlived(&mut self, popped: &[BindingId]) {
        let dangling: Vec<String> = self
            .borrows
            .iter()
            .filter_map(|(_, loan)| match loan.path.root {
                BorrowRoot::Local(id) if popped.contains(&id) => Some(self.locals.slot(id).name.clone()),
                _ => None,
            })
            .collect();
        for name in dangling {
            let loc = self.loc(format!("end of scope of `{name}`"));
            self.report(TypeError::BorrowConflict {
                loc,
                message: format!("`{name}` goes out of scope while a reference to it is still live"),
            });
        }
    }

    /// A reference binding that is never read again no longer keeps its
    /// loans alive.
    fn expire_references(&mut self) {
        for id in self.locals.visible() {
            let slot = self.locals.slot_mut(id);
            if slot.ty.is_ref() && !self.live_after.contains(&slot.name) {
                slot.loans.clear();
            }
        }
    }

    /// Release every loan no live binding holds.
    fn release_temporaries(&mut self) {
        let held = self.locals.held_loans();
        self.borrows.retain(&held);
    }

    /// Release the given loans unless a live binding still holds them.
    fn release_unheld(&mut self, loans: &BTreeSet<LoanId>) {
        let held = self.locals.held_loans();
        for id in loans {
            if !held.contains(id) {
                self.borrows.release(*id);
            }
        }
    }

    fn truncate_locals(&mut self, len: usize) {
        self.locals.truncate(len);
        self.poisoned.retain(|id| *id < len);
    }

    /// Merge the state of another path (`other_*`) into the current one.
    /// Terminated paths do not flow into the join point.
    fn merge_paths(
        &mut self,
        base_len: usize,
        mut other_locals: LocalTable,
        mut other_borrows: BorrowTable,
        other_done: bool,
        self_done: bool,
    ) -> bool {
        self.truncate_locals(base_len);
        other_locals.truncate(base_len);
        match (other_done, self_done) {
            (true, true) => true,
            (true, false) => false,
            (false, true) => {
                other_borrows.continue_ids_from(&self.borrows);
                self.locals = other_locals;
                self.borrows = other_borrows;
                false
            }
            (false, false) => {
                self.locals.join(&other_locals);
                self.borrows.join(&other_borrows);
                false
            }
        }
    }

    fn bind(&mut self, name: &str, operand: Operand) -> BindingId {
        self.check_shadowed(name);
        let abilities = self.abilities(&operand.ty);
        let id = self
            .locals
            .declare(name, operand.ty, abilities, operand.loans);
        self.locals.slot_mut(id).place = operand.place;
        id
    }

    fn bind_poisoned(&mut self, name: &str) {
        self.check_shadowed(name);
        let id = self
            .locals
            .declare(name, Type::Unit, AbilitySet::ALL, BTreeSet::new());
        self.poisoned.insert(id);
    }

    /// Shadowing a binding in the same scope discards its value.
    fn check_shadowed(&mut self, name: &str) {
        let Some(prev) = self.locals.lookup_current_scope(name) else {
            return;
        };
        let slot = self.locals.slot(prev);
        if !self.poisoned.contains(&prev) && slot.state.holds_value() && !slot.can_drop() {
            let error = TypeError::UnconsumedResource {
                loc: self.loc(format!("`{name}` shadowed")),
                local: name.to_string(),
                ty: slot.ty.to_string(),
            };
            self.report(error);
        }
        // The old binding is unreachable from here on.
        self.locals.consume(prev);
    }

    // ---- statements ----------------------------------------------------

    /// Returns true when the statement never falls through.
    fn check_stmt(&mut self, stmt: &Stmt) -> bool {
        match stmt {
            Stmt::Let { name, ty, value } => {
                let operand = self.eval(value);
                let detail = format!("let `{name}`");
                let annotated = match ty {
                    Some(t) => self.resolve(t, true, &detail),
                    None => None,
                };
                match operand {
                    Some(mut op) => {
                        if let Some(t) = annotated {
                            if self.expect(&op.ty, &t, detail) {
                                op.ty = t;
                            }
                        }
                        self.bind(name, op);
                    }
                    None => self.bind_poisoned(name),
                }
                false
            }
            Stmt::Unpack { ty, fields, value } => {
                self.check_unpack(ty, fields, value);
                false
            }
            Stmt::Assign { name, value } => {
                self.check_assign(name, value);
                false
            }
            Stmt::Write { target, value } => {
                let value = self.eval(value);
                let target = self.eval(target);
                let (Some(value), Some(target)) = (value, target) else {
                    return false;
                };
                match &target.ty {
                    Type::Ref {
                        mutable: true,
                        inner,
                    } => {
                        let inner = inner.as_ref().clone();
                        self.check_access(&target, BorrowMode::Exclusive, "write through reference");
                        self.expect(&value.ty, &inner, "write through reference");
                        if !self.abilities(&inner).has(Ability::Drop) {
                            let loc = self.loc("write through reference");
                            self.report(TypeError::MissingDropAbility {
                                loc,
                                ty: inner.to_string(),
                            });
                        }
                    }
                    other => {
                        let loc = self.loc("write through reference");
                        self.report(TypeError::mismatch(loc, "&mut _", other));
                    }
                }
                false
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.eval_bool(cond, "if condition");
                self.release_temporaries();

                let base_len = self.locals.len();
                let base_locals = self.locals.clone();
                let base_borrows = self.borrows.clone();

                let then_done = self.check_block(then);
                let then_locals = std::mem::replace(&mut self.locals, base_locals);
                let then_borrows = std::mem::replace(&mut self.borrows, base_borrows);
                self.borrows.continue_ids_from(&then_borrows);

                let else_done = match otherwise {
                    Some(block) => self.check_block(block),
                    None => false,
                };
                self.merge_paths(base_len, then_locals, then_borrows, then_done, else_done)
            }
            Stmt::While { cond, body } => {
                self.eval_bool(cond, "while condition");
                self.release_temporaries();

                let base_len = self.locals.len();
                let base_locals = self.locals.clone();
                let base_borrows = self.borrows.clone();

                // The next iteration reads whatever the loop reads.
                let saved = self.live_after.clone();
                stmt_names(stmt, &mut self.live_after);
                let body_done = self.check_block(body);
                self.live_after = saved;
                if !body_done {
                    // A value consumed by the body would be consumed again by
                    // the next iteration.
                    for id in 0..base_len {
                        if self.poisoned.contains(&id) {
                            continue;
                        }
                        let before = base_locals.slot(id);
                        let after = self.locals.slot(id);
                        if before.state == LocalState::Live && after.state != LocalState::Live {
                            let error = TypeError::UseAfterMove {
                                loc: self.loc("moved inside loop"),
                                local: after.name.clone(),
                            };
                            self.report(error);
                        }
                    }
                }
                let body_locals = std::mem::replace(&mut self.locals, base_locals);
                let body_borrows = std::mem::replace(&mut self.borrows, base_borrows);
                self.borrows.continue_ids_from(&body_borrows);
                // The loop may run zero times, so it never terminates the
                // enclosing block on its own.
                self.merge_paths(base_len, body_locals, body_borrows, body_done, false);
                false
            }
            Stmt::Return(expr) => {
                let operand = match expr {
                    Some(e) => self.eval(e),
                    None => Some(Operand::value(Type::Unit)),
                };
                if let Some(op) = operand {
                    let ret = self.sig.ret.clone();
                    if self.expect(&op.ty, &ret, "return") && ret.is_ref() {
                        self.check_returned_reference(&op);
                    }
                }
                let visible = self.locals.visible();
                self.check_unconsumed(&visible, "return");
                true
            }
            Stmt::Abort(code) => {
                if let Some(op) = self.eval(code) {
                    self.expect(&op.ty, &Type::U64, "abort code");
                }
                true
            }
            Stmt::Assert { cond, .. } => {
                self.eval_bool(cond, "assert condition");
                false
            }
            Stmt::Expr(expr) => {
                if let Some(op) = self.eval(expr) {
                    if op.ty != Type::Unit && !self.abilities(&op.ty).has(Ability::Drop) {
                        let loc = self.loc("discarded expression value");
                        self.report(TypeError::MissingDropAbility {
                            loc,
                            ty: op.ty.to_string(),
                        });
                    }
                }
                false
            }
        }
    }

    fn check_unpack(&mut self, ty: &StructRef, binders: &[FieldBinder], value: &Expr) {
        let operand = self.eval(value);
        let tag = self.resolve_own_struct(ty, "unpack");
        let poison = |this: &mut Self| {
            for b in binders {
                if let Binder::Bind(name) = &b.binder {
                    this.bind_poisoned(name);
                }
            }
        };
        let (Some(op), Some(tag)) = (operand, tag) else {
            poison(self);
            return;
        };
        let detail = format!("unpack `{}`", ty.name);
        let expected = Type::Struct(tag.clone());
        if !self.expect(&op.ty, &expected, detail.as_str()) {
            poison(self);
            return;
        }
        let fields = self.universe.instantiate_fields(&tag).unwrap_or_default();
        let given: Vec<&str> = binders.iter().map(|b| b.field.as_str()).collect();
        if !self.check_field_coverage(&tag, &fields, &given, &detail) {
            poison(self);
            return;
        }
        for b in binders {
            let Some((_, field_ty)) = fields.iter().find(|(n, _)| *n == b.field) else {
                continue;
            };
            match &b.binder {
                Binder::Bind(name) => {
                    self.bind(name, Operand::value(field_ty.clone()));
                }
                Binder::Ignore => {
                    if !self.abilities(field_ty).has(Ability::Drop) {
                        let loc = self.loc(format!("{detail} field `{}` bound to `_`", b.field));
                        self.report(TypeError::MissingDropAbility {
                            loc,
                            ty: field_ty.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn check_field_coverage(
        &mut self,
        tag: &StructTag,
        fields: &[(String, Type)],
        given: &[&str],
        detail: &str,
    ) -> bool {
        let mut ok = true;
        let mut seen = HashSet::new();
        for name in given {
            let loc = self.loc(format!("{detail} field `{name}`"));
            if !seen.insert(*name) {
                self.report(TypeError::DuplicateDeclaration {
                    loc,
                    name: name.to_string(),
                });
                ok = false;
            } else if !fields.iter().any(|(n, _)| n == name) {
                self.report(TypeError::InvalidType {
                    loc,
                    message: format!("`{tag}` has no field `{name}`"),
                });
                ok = false;
            }
        }
        for (name, _) in fields {
            if !seen.contains(name.as_str()) {
                let loc = self.loc(detail);
                self.report(TypeError::InvalidType {
                    loc,
                    message: format!("field `{name}` of `{tag}` is missing"),
                });
                ok = false;
            }
        }
        ok
    }

    fn check_assign(&mut self, name: &str, value: &Expr) {
        let operand = self.eval(value);
        let detail = format!("assignment to `{name}`");
        let Some(id) = self.locals.lookup(name) else {
            let loc = self.loc(detail);
            self.report(TypeError::UnknownLocal {
                loc,
                name: name.to_string(),
            });
            return;
        };
        if self.poisoned.contains(&id) {
            return;
        }
        let Some(op) = operand else {
            return;
        };
        let slot_ty = self.locals.slot(id).ty.clone();
        if !self.expect(&op.ty, &slot_ty, detail.as_str()) {
            return;
        }
        let slot = self.locals.slot(id);
        if slot.state.holds_value() && !slot.can_drop() {
            let loc = self.loc(detail.as_str());
            self.report(TypeError::MissingDropAbility {
                loc,
                ty: slot_ty.to_string(),
            });
        }
        let path = BorrowPath::root(BorrowRoot::Local(id));
        if let Some(loan) = self.borrows.conflicting(&path, BorrowMode::Exclusive) {
            let message = format!(
                "cannot assign to `{name}` while a {} borrow of {} is live",
                loan.mode.display(),
                self.describe(&loan.path)
            );
            let loc = self.loc(detail.as_str());
            self.report(TypeError::BorrowConflict { loc, message });
        }
        let slot = self.locals.slot_mut(id);
        slot.state = LocalState::Live;
        slot.loans = op.loans;
        slot.place = op.place;
    }

    /// Only references derived from reference parameters outlive the call.
    fn check_returned_reference(&mut self, op: &Operand) {
        let escaping = op.loans.iter().find_map(|id| {
            let loan = self.borrows.get(*id)?;
            (!matches!(loan.path.root, BorrowRoot::Param(_))).then(|| self.describe(&loan.path))
        });
        if let Some(what) = escaping {
            let loc = self.loc("return");
            self.report(TypeError::BorrowConflict {
                loc,
                message: format!("returned reference points into {what}, which does not outlive the call"),
            });
        }
    }

    // ---- expressions ---------------------------------------------------

    fn eval_bool(&mut self, expr: &Expr, detail: &str) {
        if let Some(op) = self.eval(expr) {
            self.expect(&op.ty, &Type::Bool, detail);
        }
    }

    fn eval(&mut self, expr: &Expr) -> Option<Operand> {
        match expr {
            Expr::Unit => Some(Operand::value(Type::Unit)),
            Expr::Bool(_) => Some(Operand::value(Type::Bool)),
            Expr::U8(_) => Some(Operand::value(Type::U8)),
            Expr::U64(_) => Some(Operand::value(Type::U64)),
            Expr::U128(_) => Some(Operand::value(Type::U128)),
            Expr::Address(_) => Some(Operand::value(Type::Address)),

            Expr::Var(name) => self.use_local(name, Use::Implicit),
            Expr::Move(name) => self.use_local(name, Use::Move),
            Expr::Copy(name) => self.use_local(name, Use::Copy),

            Expr::Borrow { mutable, name } => self.borrow_local(*mutable, name),
            Expr::BorrowField {
                mutable,
                base,
                field,
            } => self.borrow_field(*mutable, base, field),
            Expr::Freeze(inner) => {
                let op = self.eval(inner)?;
                match op.ty {
                    Type::Ref {
                        mutable: true,
                        inner,
                    } => Some(Operand {
                        ty: Type::Ref {
                            mutable: false,
                            inner,
                        },
                        loans: op.loans,
                        place: op.place,
                    }),
                    other => {
                        let loc = self.loc("freeze");
                        self.report(TypeError::mismatch(loc, "&mut _", other));
                        None
                    }
                }
            }
            Expr::Deref(inner) => {
                let op = self.eval(inner)?;
                let Some(target) = op.ty.deref().cloned() else {
                    let loc = self.loc("dereference");
                    self.report(TypeError::mismatch(loc, "a reference", &op.ty));
                    return None;
                };
                self.check_access(&op, BorrowMode::Shared, "dereference");
                self.release_unheld(&op.loans);
                if !self.abilities(&target).has(Ability::Copy) {
                    let loc = self.loc("dereference");
                    self.report(TypeError::MissingCopyAbility {
                        loc,
                        ty: target.to_string(),
                    });
                    return None;
                }
                Some(Operand::value(target))
            }

            Expr::Pack { ty, fields } => self.pack(ty, fields),
            Expr::Call {
                module,
                function,
                type_args,
                args,
            } => self.call(module.as_deref(), function, type_args, args),
            Expr::Binary { op, lhs, rhs } => self.binary(*op, lhs, rhs),
            Expr::Not(inner) => {
                let op = self.eval(inner)?;
                self.expect(&op.ty, &Type::Bool, "operator `!`")
                    .then(|| Operand::value(Type::Bool))
            }
            Expr::Vector { elem, items } => {
                let values: Vec<Option<Operand>> = items.iter().map(|e| self.eval(e)).collect();
                let elem = self.resolve(elem, false, "vector element type")?;
                let mut ok = true;
                for value in values {
                    match value {
                        Some(v) => ok &= self.expect(&v.ty, &elem, "vector element"),
                        None => ok = false,
                    }
                }
                ok.then(|| Operand::value(Type::Vector(Box::new(elem))))
            }
            Expr::SignerAddress(inner) => {
                let op = self.eval(inner)?;
                self.release_unheld(&op.loans);
                match op.ty.deref().unwrap_or(&op.ty) {
                    Type::Signer => Some(Operand::value(Type::Address)),
                    _ => {
                        let loc = self.loc("signer address");
                        self.report(TypeError::mismatch(loc, "&signer", &op.ty));
                        None
                    }
                }
            }

            Expr::MoveTo { ty, signer, value } => {
                let signer = self.eval(signer);
                let value = self.eval(value);
                let tag = self.storage_tag(ty, "move_to");
                let (signer, value, tag) = (signer?, value?, tag?);
                self.release_unheld(&signer.loans);
                let signer_ok = match &signer.ty {
                    Type::Ref { inner, .. } if **inner == Type::Signer => true,
                    other => {
                        let loc = self.loc("move_to signer");
                        self.report(TypeError::mismatch(loc, "&signer", other));
                        false
                    }
                };
                let value_ok = self.expect(&value.ty, &Type::Struct(tag), "move_to value");
                (signer_ok && value_ok).then(|| Operand::value(Type::Unit))
            }
            Expr::MoveFrom { ty, addr } => {
                let addr = self.eval(addr);
                let tag = self.storage_tag(ty, "move_from");
                let (addr, tag) = (addr?, tag?);
                self.expect(&addr.ty, &Type::Address, "move_from address");
                self.access.direct.insert(tag.id.clone());
                let path = BorrowPath::root(BorrowRoot::Global(tag.clone()));
                if let Some(loan) = self.borrows.conflicting(&path, BorrowMode::Exclusive) {
                    let message = format!(
                        "cannot move `{tag}` out of global storage while a {} borrow of {} is live",
                        loan.mode.display(),
                        self.describe(&loan.path)
                    );
                    let loc = self.loc("move_from");
                    self.report(TypeError::BorrowConflict { loc, message });
                }
                Some(Operand::value(Type::Struct(tag)))
            }
            Expr::BorrowGlobal { ty, mutable, addr } => {
                let what = if *mutable {
                    "borrow_global_mut"
                } else {
                    "borrow_global"
                };
                let addr = self.eval(addr);
                let tag = self.storage_tag(ty, what);
                let (addr, tag) = (addr?, tag?);
                self.expect(&addr.ty, &Type::Address, format!("{what} address"));
                self.access.direct.insert(tag.id.clone());
                let path = BorrowPath::root(BorrowRoot::Global(tag.clone()));
                self.grant(path, *mutable, BTreeSet::new(), Type::Struct(tag), what)
            }
            Expr::Exists { ty, addr } => {
                let addr = self.eval(addr);
                let tag = self.storage_tag(ty, "exists");
                let (addr, _) = (addr?, tag?);
                self.expect(&addr.ty, &Type::Address, "exists address")
                    .then(|| Operand::value(Type::Bool))
            }
        }
    }

    fn use_local(&mut self, name: &str, how: Use) -> Option<Operand> {
        let Some(id) = self.locals.lookup(name) else {
            let loc = self.loc(format!("use of `{name}`"));
            self.report(TypeError::UnknownLocal {
                loc,
                name: name.to_string(),
            });
            return None;
        };
        if self.poisoned.contains(&id) {
            return None;
        }
        let slot = self.locals.slot(id);
        let (state, ty, can_copy) = (slot.state, slot.ty.clone(), slot.can_copy());
        let (held, place) = (slot.loans.clone(), slot.place.clone());
        if state != LocalState::Live {
            let loc = self.loc(format!("use of `{name}` ({})", state.display()));
            self.report(TypeError::UseAfterMove {
                loc,
                local: name.to_string(),
            });
            return None;
        }
        let copy = match how {
            Use::Copy => true,
            Use::Move => false,
            Use::Implicit => can_copy,
        };
        let path = BorrowPath::root(BorrowRoot::Local(id));

        if copy {
            if !can_copy {
                let loc = self.loc(format!("copy of `{name}`"));
                self.report(TypeError::MissingCopyAbility {
                    loc,
                    ty: ty.to_string(),
                });
                return None;
            }
            if !ty.is_ref() {
                if let Some(loan) = self.borrows.conflicting(&path, BorrowMode::Shared) {
                    let message = format!(
                        "cannot read `{name}` while {} is mutably borrowed",
                        self.describe(&loan.path)
                    );
                    let loc = self.loc(format!("copy of `{name}`"));
                    self.report(TypeError::BorrowConflict { loc, message });
                    return None;
                }
            }
            return Some(Operand {
                ty,
                loans: held,
                place,
            });
        }

        if let Some(loan) = self.borrows.conflicting(&path, BorrowMode::Exclusive) {
            let message = format!(
                "cannot move `{name}` while a {} borrow of {} is live",
                loan.mode.display(),
                self.describe(&loan.path)
            );
            let loc = self.loc(format!("move of `{name}`"));
            self.report(TypeError::BorrowConflict { loc, message });
        }
        let loans = self.locals.consume(id);
        Some(Operand { ty, loans, place })
    }

    /// Reading or writing through a reference must not overlap a live
    /// borrow the reference is not itself derived from.
    fn check_access(&mut self, reference: &Operand, mode: BorrowMode, detail: &str) {
        let Some(place) = &reference.place else {
            return;
        };
        let Some(loan) = self.borrows.conflicting_access(place, mode, &reference.loans) else {
            return;
        };
        let message = format!(
            "cannot {} {} while a {} borrow of {} is live",
            if mode == BorrowMode::Exclusive { "write" } else { "read" },
            self.describe(place),
            loan.mode.display(),
            self.describe(&loan.path)
        );
        let loc = self.loc(detail);
        self.report(TypeError::BorrowConflict { loc, message });
    }

    fn grant(
        &mut self,
        path: BorrowPath,
        mutable: bool,
        parents: BTreeSet<LoanId>,
        referent: Type,
        detail: &str,
    ) -> Option<Operand> {
        let mode = BorrowMode::of(mutable);
        match self.borrows.grant(path.clone(), mode, parents.clone()) {
            Ok(id) => {
                let mut loans = parents;
                loans.insert(id);
                Some(Operand {
                    ty: Type::reference(mutable, referent),
                    loans,
                    place: Some(path),
                })
            }
            Err(existing) => {
                let message = format!(
                    "cannot take a {} borrow of {} while a {} borrow of {} is live",
                    mode.display(),
                    self.describe(&path),
                    existing.mode.display(),
                    self.describe(&existing.path)
                );
                let loc = self.loc(detail);
                self.report(TypeError::BorrowConflict { loc, message });
                None
            }
        }
    }

    fn borrow_local(&mut self, mutable: bool, name: &str) -> Option<Operand> {
        let detail = format!("borrow of `{name}`");
        let (id, ty) = self.borrowable_local(name, &detail)?;
        self.grant(
            BorrowPath::root(BorrowRoot::Local(id)),
            mutable,
            BTreeSet::new(),
            ty,
            &detail,
        )
    }

    /// A local that may be borrowed: in scope, holding its value, and not a
    /// reference itself.
    fn borrowable_local(&mut self, name: &str, detail: &str) -> Option<(BindingId, Type)> {
        let Some(id) = self.locals.lookup(name) else {
            let loc = self.loc(detail);
            self.report(TypeError::UnknownLocal {
                loc,
                name: name.to_string(),
            });
            return None;
        };
        if self.poisoned.contains(&id) {
            return None;
        }
        let slot = self.locals.slot(id);
        let (state, ty) = (slot.state, slot.ty.clone());
        if state != LocalState::Live {
            let loc = self.loc(detail);
            self.report(TypeError::UseAfterMove {
                loc,
                local: name.to_string(),
            });
            return None;
        }
        if ty.is_ref() {
            let loc = self.loc(detail);
            self.report(TypeError::InvalidType {
                loc,
                message: format!("`{name}` is already a reference and cannot be borrowed"),
            });
            return None;
        }
        Some((id, ty))
    }

    fn borrow_field(&mut self, mutable: bool, base: &Expr, field: &str) -> Option<Operand> {
        let detail = format!("borrow of field `{field}`");
        let base = match base {
            // `&mut x.f` borrows only the field, not all of `x`.
            Expr::Borrow {
                mutable: base_mutable,
                name,
            } => {
                let (id, ty) = self.borrowable_local(name, &detail)?;
                Operand {
                    ty: Type::reference(*base_mutable, ty),
                    loans: BTreeSet::new(),
                    place: Some(BorrowPath::root(BorrowRoot::Local(id))),
                }
            }
            other => self.eval(other)?,
        };
        let Type::Ref {
            mutable: base_mutable,
            inner,
        } = &base.ty
        else {
            let loc = self.loc(detail);
            self.report(TypeError::mismatch(loc, "a reference to a struct", &base.ty));
            return None;
        };
        if mutable && !*base_mutable {
            let loc = self.loc(detail);
            self.report(TypeError::InvalidType {
                loc,
                message: format!("cannot mutably borrow field `{field}` through `{}`", base.ty),
            });
            return None;
        }
        let Type::Struct(tag) = inner.as_ref() else {
            let loc = self.loc(detail);
            self.report(TypeError::mismatch(loc, "a reference to a struct", &base.ty));
            return None;
        };
        if tag.id.module != self.module {
            let loc = self.loc(detail);
            self.report(TypeError::InvalidType {
                loc,
                message: format!("fields of `{tag}` are only accessible inside module `{}`", tag.id.module),
            });
            return None;
        }
        let Some(field_ty) = self.universe.field_type(tag, field) else {
            let loc = self.loc(detail);
            self.report(TypeError::InvalidType {
                loc,
                message: format!("`{tag}` has no field `{field}`"),
            });
            return None;
        };
        match &base.place {
            Some(place) => self.grant(place.child(field), mutable, base.loans, field_ty, &detail),
            // Reference returned by a call: its loans already cover the field.
            None => Some(Operand {
                ty: Type::reference(mutable, field_ty),
                loans: base.loans,
                place: None,
            }),
        }
    }

    fn pack(&mut self, ty: &StructRef, inits: &[FieldInit]) -> Option<Operand> {
        let values: Vec<Option<Operand>> = inits.iter().map(|f| self.eval(&f.value)).collect();
        let tag = self.resolve_own_struct(ty, "pack")?;
        let detail = format!("pack `{}`", ty.name);
        let fields = self.universe.instantiate_fields(&tag)?;
        let given: Vec<&str> = inits.iter().map(|f| f.field.as_str()).collect();
        if !self.check_field_coverage(&tag, &fields, &given, &detail) {
            return None;
        }
        let mut ok = true;
        for (init, value) in inits.iter().zip(values) {
            let Some(value) = value else {
                ok = false;
                continue;
            };
            if let Some((_, field_ty)) = fields.iter().find(|(n, _)| *n == init.field) {
                ok &= self.expect(&value.ty, field_ty, format!("{detail} field `{}`", init.field));
            }
        }
        ok.then(|| Operand::value(Type::Struct(tag)))
    }

    fn call(
        &mut self,
        module: Option<&str>,
        function: &str,
        type_args: &[TypeRef],
        args: &[Expr],
    ) -> Option<Operand> {
        let id = FunctionId::new(module.unwrap_or(self.module), function);
        let detail = format!("call `{id}`");
        let values: Vec<Option<Operand>> = args.iter().map(|a| self.eval(a)).collect();

        let universe = self.universe;
        let Some(callee) = universe.function(&id) else {
            let loc = self.loc(detail);
            self.report(TypeError::UnknownFunction {
                loc,
                name: id.to_string(),
            });
            return None;
        };
        self.access.calls.insert(id.clone());

        if callee.type_params.len() != type_args.len() {
            let loc = self.loc(detail);
            self.report(TypeError::ArityMismatch {
                loc,
                name: id.to_string(),
                expected: callee.type_params.len(),
                found: type_args.len(),
            });
            return None;
        }
        let resolved: Vec<Option<Type>> = type_args
            .iter()
            .map(|t| self.resolve(t, false, &detail))
            .collect();
        let targs: Vec<Type> = resolved.into_iter().collect::<Option<_>>()?;
        for (param, arg) in callee.type_params.iter().zip(&targs) {
            let have = self.abilities(arg);
            if !param.constraints.is_subset_of(have) {
                let loc = self.loc(detail.as_str());
                self.report(TypeError::AbilityViolation {
                    loc,
                    message: format!(
                        "type argument `{arg}` for `{}` of `{id}` lacks {}",
                        param.name,
                        param.constraints.difference(have)
                    ),
                });
            }
        }

        if callee.params.len() != args.len() {
            let loc = self.loc(detail);
            self.report(TypeError::ArgumentCountMismatch {
                loc,
                function: id.to_string(),
                expected: callee.params.len(),
                found: args.len(),
            });
            return None;
        }
        let values: Vec<Operand> = values.into_iter().collect::<Option<_>>()?;

        let mut ok = true;
        for ((name, ty), value) in callee.params.iter().zip(&values) {
            let expected = ty.subst(&targs);
            ok &= self.expect(&value.ty, &expected, format!("argument `{name}` of `{id}`"));
        }
        self.check_aliased_arguments(&values, &detail);

        for name in &callee.acquires {
            let sid = StructId::new(&id.module, name);
            let live = self.borrows.iter().find_map(|(_, loan)| match &loan.path.root {
                BorrowRoot::Global(tag) if tag.id == sid => Some(loan.path.clone()),
                _ => None,
            });
            if let Some(path) = live {
                let loc = self.loc(detail.as_str());
                let message = format!(
                    "`{id}` acquires `{sid}` while a borrow of {} is live",
                    self.describe(&path)
                );
                self.report(TypeError::BorrowConflict { loc, message });
            }
        }

        // A returned reference is derived from the reference arguments and
        // keeps their loans alive.
        let ret = callee.ret.subst(&targs);
        let mut held = BTreeSet::new();
        let mut place = None;
        if ret.is_ref() {
            let refs: Vec<&Operand> = values.iter().filter(|v| v.ty.is_ref()).collect();
            for r in &refs {
                held.extend(r.loans.iter().copied());
            }
            if let [only] = refs.as_slice() {
                place = only.place.clone();
            }
        }
        for value in &values {
            let released: BTreeSet<LoanId> = value.loans.difference(&held).copied().collect();
            self.release_unheld(&released);
        }

        ok.then_some(Operand {
            ty: ret,
            loans: held,
            place,
        })
    }

    /// A mutable reference may not be passed to a call together with another
    /// reference to an overlapping place.
    fn check_aliased_arguments(&mut self, values: &[Operand], detail: &str) {
        let refs: Vec<(bool, &BorrowPath)> = values
            .iter()
            .filter(|v| v.ty.is_ref())
            .filter_map(|v| Some((v.ty.is_mut_ref(), v.place.as_ref()?)))
            .collect();
        for (i, (mutable, place)) in refs.iter().enumerate() {
            if !mutable {
                continue;
            }
            let clash = refs
                .iter()
                .enumerate()
                .find(|(j, (_, other))| *j != i && other.overlaps(place));
            if let Some((_, (_, other))) = clash {
                let message = format!(
                    "mutable reference to {} is passed together with a reference to {}",
                    self.describe(place),
                    self.describe(other)
                );
                let loc = self.loc(detail);
                self.report(TypeError::BorrowConflict { loc, message });
                return;
            }
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<Operand> {
        if matches!(op, BinOp::And | BinOp::Or) {
            return self.short_circuit(op, lhs, rhs);
        }
        let l = self.eval(lhs);
        let r = self.eval(rhs);
        let (l, r) = (l?, r?);
        let detail = format!("operator `{}`", op.symbol());
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
            | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if !l.ty.is_integer() {
                    let loc = self.loc(detail);
                    self.report(TypeError::mismatch(loc, "an integer type", &l.ty));
                    return None;
                }
                if !self.expect(&r.ty, &l.ty, detail.as_str()) {
                    return None;
                }
                let ty = if op.is_arithmetic() { l.ty } else { Type::Bool };
                Some(Operand::value(ty))
            }
            BinOp::Eq | BinOp::Neq => {
                let ok = self.expect(&r.ty, &l.ty, detail.as_str());
                self.release_unheld(&l.loans);
                self.release_unheld(&r.loans);
                // Comparison consumes both operands.
                if !self.abilities(&l.ty).has(Ability::Drop) {
                    let loc = self.loc(detail);
                    self.report(TypeError::MissingDropAbility {
                        loc,
                        ty: l.ty.to_string(),
                    });
                    return None;
                }
                ok.then(|| Operand::value(Type::Bool))
            }
            // Handled by `short_circuit` before either operand is checked.
            BinOp::And | BinOp::Or => None,
        }
    }

    /// `&&` and `||` evaluate their right operand only on some paths, so it
    /// is checked like the body of an `if` without `else`.
    fn short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Option<Operand> {
        let l = self.eval(lhs);

        let base_len = self.locals.len();
        let base_locals = self.locals.clone();
        let base_borrows = self.borrows.clone();
        let r = self.eval(rhs);
        let rhs_locals = std::mem::replace(&mut self.locals, base_locals);
        let rhs_borrows = std::mem::replace(&mut self.borrows, base_borrows);
        self.borrows.continue_ids_from(&rhs_borrows);
        self.merge_paths(base_len, rhs_locals, rhs_borrows, false, false);

        let (l, r) = (l?, r?);
        let detail = format!("operator `{}`", op.symbol());
        let ok = self.expect(&l.ty, &Type::Bool, detail.as_str())
            & self.expect(&r.ty, &Type::Bool, detail.as_str());
        ok.then(|| Operand::value(Type::Bool))
    }
}

/// Every local name a statement may read, including nested blocks.
fn stmt_names(stmt: &Stmt, out: &mut HashSet<String>) {
    match stmt {
        Stmt::Let { value, .. } | Stmt::Unpack { value, .. } => expr_names(value, out),
        Stmt::Assign { name, value } => {
            out.insert(name.clone());
            expr_names(value, out);
        }
        Stmt::Write { target, value } => {
            expr_names(target, out);
            expr_names(value, out);
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            expr_names(cond, out);
            block_names(then, out);
            if let Some(block) = otherwise {
                block_names(block, out);
            }
        }
        Stmt::While { cond, body } => {
            expr_names(cond, out);
            block_names(body, out);
        }
        Stmt::Return(Some(e)) | Stmt::Abort(e) | Stmt::Expr(e) => expr_names(e, out),
        Stmt::Assert { cond, .. } => expr_names(cond, out),
        Stmt::Return(None) => {}
    }
}

fn block_names(block: &Block, out: &mut HashSet<String>) {
    for stmt in &block.stmts {
        stmt_names(stmt, out);
    }
}

fn expr_names(expr: &Expr, out: &mut HashSet<String>) {
    match expr {
        Expr::Var(name) | Expr::Move(name) | Expr::Copy(name) | Expr::Borrow { name, .. } => {
            out.insert(name.clone());
        }
        Expr::BorrowField { base: inner, .. }
        | Expr::Freeze(inner)
        | Expr::Deref(inner)
        | Expr::Not(inner)
        | Expr::SignerAddress(inner) => expr_names(inner, out),
        Expr::Pack { fields, .. } => {
            for f in fields {
                expr_names(&f.value, out);
            }
        }
        Expr::Call { args: items, .. } | Expr::Vector { items, .. } => {
            for item in items {
                expr_names(item, out);
            }
        }
        Expr::Binary { lhs, rhs, .. } => {
            expr_names(lhs, out);
            expr_names(rhs, out);
        }
        Expr::MoveTo { signer, value, .. } => {
            expr_names(signer, out);
            expr_names(value, out);
        }
        Expr::MoveFrom { addr, .. } | Expr::BorrowGlobal { addr, .. } | Expr::Exists { addr, .. } => {
            expr_names(addr, out)
        }
        Expr::Unit | Expr::Bool(_) | Expr::U8(_) | Expr::U64(_) | Expr::U128(_) | Expr::Address(_) => {}
    }
}
