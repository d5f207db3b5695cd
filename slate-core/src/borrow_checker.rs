#![forbid(unsafe_code)]

//! Borrow exclusivity over symbolic paths.
//!
//! A loan names what it borrows (a local, a reference parameter, or a global
//! resource type, followed by a field chain) and whether it is shared or
//! exclusive. Loans are released when no live binding holds them anymore.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::move_tracking::BindingId;
use crate::types::{StructTag, Type};

pub type LoanId = u32;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BorrowRoot {
    Local(BindingId),
    /// Referent of a reference parameter, owned by the caller.
    Param(BindingId),
    /// Global storage slot of this type. Addresses are not known statically,
    /// so every address is treated as the same slot.
    Global(StructTag),
}

impl BorrowRoot {
    fn may_alias(&self, other: &BorrowRoot) -> bool {
        match (self, other) {
            (BorrowRoot::Local(a), BorrowRoot::Local(b)) => a == b,
            (BorrowRoot::Param(a), BorrowRoot::Param(b)) => a == b,
            (BorrowRoot::Global(a), BorrowRoot::Global(b)) => tags_may_alias(a, b),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BorrowPath {
    pub root: BorrowRoot,
    pub fields: Vec<String>,
}

impl BorrowPath {
    pub fn root(root: BorrowRoot) -> Self {
        Self {
            root,
            fields: Vec::new(),
        }
    }

    pub fn child(&self, field: &str) -> Self {
        let mut fields = self.fields.clone();
        fields.push(field.to_string());
        Self {
            root: self.root.clone(),
            fields,
        }
    }

    /// Two paths overlap when their roots may alias and one field chain is a
    /// prefix of the other.
    pub fn overlaps(&self, other: &BorrowPath) -> bool {
        if !self.root.may_alias(&other.root) {
            return false;
        }
        let n = self.fields.len().min(other.fields.len());
        self.fields[..n] == other.fields[..n]
    }
}

impl fmt::Display for BorrowPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            BorrowRoot::Local(id) => write!(f, "local#{id}")?,
            BorrowRoot::Param(id) => write!(f, "param#{id}")?,
            BorrowRoot::Global(tag) => write!(f, "global<{tag}>")?,
        }
        for field in &self.fields {
            write!(f, ".{field}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BorrowMode {
    Shared,
    Exclusive,
}

impl BorrowMode {
    pub fn of(mutable: bool) -> Self {
        if mutable {
            BorrowMode::Exclusive
        } else {
            BorrowMode::Shared
        }
    }

    pub fn conflicts_with(self, other: BorrowMode) -> bool {
        self == BorrowMode::Exclusive || other == BorrowMode::Exclusive
    }

    pub fn display(&self) -> &'static str {
        match self {
            BorrowMode::Shared => "shared",
            BorrowMode::Exclusive => "exclusive",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Loan {
    pub path: BorrowPath,
    pub mode: BorrowMode,
    /// Loans this one was derived from (field borrows through a reference).
    pub parents: BTreeSet<LoanId>,
}

#[derive(Clone, Debug, Default)]
pub struct BorrowTable {
    loans: BTreeMap<LoanId, Loan>,
    next: LoanId,
}

impl BorrowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a new loan unless an overlapping live loan forbids it. Loans the
    /// new one is derived from (and their ancestors) never conflict with it.
    pub fn grant(
        &mut self,
        path: BorrowPath,
        mode: BorrowMode,
        parents: BTreeSet<LoanId>,
    ) -> Result<LoanId, Loan> {
        let ancestors = self.ancestors(&parents);
        if let Some((_, existing)) = self.loans.iter().find(|(id, loan)| {
            !ancestors.contains(id) && loan.path.overlaps(&path) && loan.mode.conflicts_with(mode)
        }) {
            return Err(existing.clone());
        }
        Ok(self.insert(Loan {
            path,
            mode,
            parents,
        }))
    }

    /// Grant without checking; used for the referents of reference parameters,
    /// whose exclusivity the caller already established.
    pub fn insert(&mut self, loan: Loan) -> LoanId {
        let id = self.next;
        self.next += 1;
        self.loans.insert(id, loan);
        id
    }

    fn ancestors(&self, parents: &BTreeSet<LoanId>) -> BTreeSet<LoanId> {
        let mut out = BTreeSet::new();
        let mut work: Vec<LoanId> = parents.iter().copied().collect();
        while let Some(id) = work.pop() {
            if out.insert(id) {
                if let Some(loan) = self.loans.get(&id) {
                    work.extend(loan.parents.iter().copied());
                }
            }
        }
        out
    }

    /// First live loan overlapping `path` that conflicts with `mode`.
    pub fn conflicting(&self, path: &BorrowPath, mode: BorrowMode) -> Option<&Loan> {
        self.loans
            .values()
            .find(|loan| loan.path.overlaps(path) && loan.mode.conflicts_with(mode))
    }

    /// Like [`conflicting`](Self::conflicting), for an access through a
    /// reference holding `held`: those loans and their ancestors are the
    /// access's own and never conflict with it.
    pub fn conflicting_access(
        &self,
        path: &BorrowPath,
        mode: BorrowMode,
        held: &BTreeSet<LoanId>,
    ) -> Option<&Loan> {
        let own = self.ancestors(held);
        self.loans
            .iter()
            .find(|(id, loan)| !own.contains(id) && loan.path.overlaps(path) && loan.mode.conflicts_with(mode))
            .map(|(_, loan)| loan)
    }

    pub fn get(&self, id: LoanId) -> Option<&Loan> {
        self.loans.get(&id)
    }

    pub fn release(&mut self, id: LoanId) {
        self.loans.remove(&id);
    }

    /// Drop every loan not in `held`.
    pub fn retain(&mut self, held: &BTreeSet<LoanId>) {
        self.loans.retain(|id, _| held.contains(id));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LoanId, &Loan)> {
        self.loans.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.loans.is_empty()
    }

    /// Keep loan ids unique across sibling branches analysed from the same
    /// snapshot.
    pub fn continue_ids_from(&mut self, other: &BorrowTable) {
        self.next = self.next.max(other.next);
    }

    /// Union of the loans live along either path.
    pub fn join(&mut self, other: &BorrowTable) {
        for (id, loan) in &other.loans {
            self.loans.entry(*id).or_insert_with(|| loan.clone());
        }
        self.continue_ids_from(other);
    }
}

/// Whether two instantiations of a resource might denote the same slot once
/// type parameters are known.
pub fn tags_may_alias(a: &StructTag, b: &StructTag) -> bool {
    a.id == b.id
        && a.args.len() == b.args.len()
        && a.args.iter().zip(&b.args).all(|(x, y)| types_may_alias(x, y))
}

fn types_may_alias(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Param { .. }, _) | (_, Type::Param { .. }) => true,
        (Type::Vector(x), Type::Vector(y)) => types_may_alias(x, y),
        (Type::Struct(x), Type::Struct(y)) => tags_may_alias(x, y),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructId;

    fn global(name: &str, args: Vec<Type>) -> BorrowPath {
        BorrowPath::root(BorrowRoot::Global(StructTag::new(StructId::new("M", name), args)))
    }

    #[test]
    fn test_shared_borrows_coexist() {
        let mut table = BorrowTable::new();
        let p = global("S", vec![]);
        assert!(table.grant(p.clone(), BorrowMode::Shared, BTreeSet::new()).is_ok());
        assert!(table.grant(p, BorrowMode::Shared, BTreeSet::new()).is_ok());
    }

    #[test]
    fn test_exclusive_conflicts_with_shared() {
        let mut table = BorrowTable::new();
        let p = global("S", vec![]);
        table.grant(p.clone(), BorrowMode::Shared, BTreeSet::new()).expect("shared");
        let err = table.grant(p.clone(), BorrowMode::Exclusive, BTreeSet::new()).expect_err("conflict");
        assert_eq!(err.mode, BorrowMode::Shared);

        let mut table = BorrowTable::new();
        table.grant(p.clone(), BorrowMode::Exclusive, BTreeSet::new()).expect("exclusive");
        assert!(table.grant(p, BorrowMode::Shared, BTreeSet::new()).is_err());
    }

    #[test]
    fn test_field_paths() {
        let mut table = BorrowTable::new();
        let root = BorrowPath::root(BorrowRoot::Local(0));
        let parent = table.grant(root.clone(), BorrowMode::Exclusive, BTreeSet::new()).expect("root");
        let a = table
            .grant(root.child("a"), BorrowMode::Exclusive, BTreeSet::from([parent]))
            .expect("derived from parent");
        // Disjoint sibling field through the same parent.
        assert!(table.grant(root.child("b"), BorrowMode::Exclusive, BTreeSet::from([parent])).is_ok());
        // Same field again while `a` is live.
        assert!(table.grant(root.child("a"), BorrowMode::Shared, BTreeSet::from([parent])).is_err());
        table.release(a);
        assert!(table.grant(root.child("a"), BorrowMode::Shared, BTreeSet::from([parent])).is_ok());
    }

    #[test]
    fn test_access_through_parent_sees_live_child() {
        let mut table = BorrowTable::new();
        let root = BorrowPath::root(BorrowRoot::Local(0));
        let parent = table.grant(root.clone(), BorrowMode::Exclusive, BTreeSet::new()).expect("root");
        let child = table
            .grant(root.child("a"), BorrowMode::Shared, BTreeSet::from([parent]))
            .expect("child");

        let own = BTreeSet::from([parent]);
        let clash = table.conflicting_access(&root, BorrowMode::Exclusive, &own).expect("conflict");
        assert_eq!(clash.path, root.child("a"));
        // Reading through the parent is compatible with a shared child.
        assert!(table.conflicting_access(&root, BorrowMode::Shared, &own).is_none());
        // The child's own access never conflicts with its ancestors.
        let child_own = BTreeSet::from([parent, child]);
        assert!(table.conflicting_access(&root.child("a"), BorrowMode::Shared, &child_own).is_none());
    }

    #[test]
    fn test_generic_instantiations_alias_conservatively() {
        let t = Type::Param {
            index: 0,
            name: "T".to_string(),
        };
        let a = StructTag::new(StructId::new("M", "Box"), vec![t]);
        let b = StructTag::new(StructId::new("M", "Box"), vec![Type::U64]);
        let c = StructTag::new(StructId::new("M", "Box"), vec![Type::U8]);
        assert!(tags_may_alias(&a, &b));
        assert!(!tags_may_alias(&b, &c));
    }

    #[test]
    fn test_retain_releases_unheld() {
        let mut table = BorrowTable::new();
        let keep = table.grant(global("S", vec![]), BorrowMode::Shared, BTreeSet::new()).expect("keep");
        table.grant(global("T", vec![]), BorrowMode::Exclusive, BTreeSet::new()).expect("temp");
        table.retain(&BTreeSet::from([keep]));
        assert!(table.get(keep).is_some());
        assert!(table.conflicting(&global("T", vec![]), BorrowMode::Exclusive).is_none());
    }
}
