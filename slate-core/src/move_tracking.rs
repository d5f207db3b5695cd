#![forbid(unsafe_code)]

//! Linear value tracking for function bodies.
//!
//! Every binding of a function lives in one analysis-local arena indexed by
//! [`BindingId`]; its state tag records whether the value is still owned.
//! Branches are analysed on clones of the table and merged with
//! [`LocalTable::join`].

use std::collections::BTreeSet;

use slate_ast::{Ability, AbilitySet};

use crate::borrow_checker::{BorrowPath, LoanId};
use crate::types::Type;

pub type BindingId = usize;

/// Ownership state of a binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalState {
    /// Owned by the binding: may be moved, copied (with `copy`), or borrowed.
    Live,
    /// Moved out, destructured, or stored.
    Consumed,
    /// Consumed along some control-flow paths but not others.
    MaybeConsumed,
}

impl LocalState {
    pub fn join(self, other: LocalState) -> LocalState {
        if self == other {
            self
        } else {
            LocalState::MaybeConsumed
        }
    }

    /// Still (possibly) holds a value that must be accounted for.
    pub fn holds_value(&self) -> bool {
        !matches!(self, LocalState::Consumed)
    }

    pub fn display(&self) -> &'static str {
        match self {
            LocalState::Live => "live",
            LocalState::Consumed => "consumed",
            LocalState::MaybeConsumed => "possibly consumed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalSlot {
    pub name: String,
    pub ty: Type,
    pub abilities: AbilitySet,
    pub state: LocalState,
    /// Loans kept alive by the reference stored in this binding.
    pub loans: BTreeSet<LoanId>,
    /// What a reference-typed binding points at, when known.
    pub place: Option<BorrowPath>,
}

impl LocalSlot {
    pub fn can_drop(&self) -> bool {
        self.abilities.has(Ability::Drop)
    }

    pub fn can_copy(&self) -> bool {
        self.abilities.has(Ability::Copy)
    }
}

#[derive(Clone, Debug)]
pub struct LocalTable {
    slots: Vec<LocalSlot>,
    scopes: Vec<Vec<BindingId>>,
}

impl Default for LocalTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            scopes: vec![Vec::new()],
        }
    }

    pub fn declare(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        abilities: AbilitySet,
        loans: BTreeSet<LoanId>,
    ) -> BindingId {
        let id = self.slots.len();
        self.slots.push(LocalSlot {
            name: name.into(),
            ty,
            abilities,
            state: LocalState::Live,
            loans,
            place: None,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(id);
        }
        id
    }

    /// Innermost visible binding named `name`.
    pub fn lookup(&self, name: &str) -> Option<BindingId> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .copied()
            .find(|id| self.slots[*id].name == name)
    }

    /// Binding named `name` declared in the innermost scope only.
    pub fn lookup_current_scope(&self, name: &str) -> Option<BindingId> {
        self.scopes
            .last()?
            .iter()
            .rev()
            .copied()
            .find(|id| self.slots[*id].name == name)
    }

    pub fn slot(&self, id: BindingId) -> &LocalSlot {
        &self.slots[id]
    }

    pub fn slot_mut(&mut self, id: BindingId) -> &mut LocalSlot {
        &mut self.slots[id]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Leave the innermost scope, returning the bindings it declared.
    pub fn pop_scope(&mut self) -> Vec<BindingId> {
        if self.scopes.len() > 1 {
            self.scopes.pop().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Every binding currently in scope, outermost first.
    pub fn visible(&self) -> Vec<BindingId> {
        self.scopes.iter().flatten().copied().collect()
    }

    /// Move the value out of `id`, returning the loans it carried.
    pub fn consume(&mut self, id: BindingId) -> BTreeSet<LoanId> {
        let slot = &mut self.slots[id];
        slot.state = LocalState::Consumed;
        std::mem::take(&mut slot.loans)
    }

    /// Loans kept alive by any binding that still holds a value.
    pub fn held_loans(&self) -> BTreeSet<LoanId> {
        self.visible()
            .into_iter()
            .map(|id| &self.slots[id])
            .filter(|slot| slot.state.holds_value())
            .flat_map(|slot| slot.loans.iter().copied())
            .collect()
    }

    /// Forget bindings created after the table had `len` slots. Used once a
    /// branch has been merged; its block-local bindings are out of scope.
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
        for scope in &mut self.scopes {
            scope.retain(|id| *id < len);
        }
    }

    /// Merge the state reached along another path into this one.
    pub fn join(&mut self, other: &LocalTable) {
        let shared = self.slots.len().min(other.slots.len());
        for id in 0..shared {
            let theirs = &other.slots[id];
            let mine = &mut self.slots[id];
            mine.state = mine.state.join(theirs.state);
            mine.loans.extend(theirs.loans.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource() -> (Type, AbilitySet) {
        (Type::U64, AbilitySet::EMPTY)
    }

    #[test]
    fn test_shadowing_lookup_prefers_innermost() {
        let mut table = LocalTable::new();
        let (ty, ab) = resource();
        let outer = table.declare("x", ty.clone(), ab, BTreeSet::new());
        table.push_scope();
        let inner = table.declare("x", ty, ab, BTreeSet::new());
        assert_eq!(table.lookup("x"), Some(inner));
        assert_eq!(table.pop_scope(), vec![inner]);
        assert_eq!(table.lookup("x"), Some(outer));
    }

    #[test]
    fn test_consume_takes_loans() {
        let mut table = LocalTable::new();
        let id = table.declare("r", Type::reference(false, Type::U64), AbilitySet::REFERENCES, BTreeSet::from([3]));
        assert_eq!(table.held_loans(), BTreeSet::from([3]));
        assert_eq!(table.consume(id), BTreeSet::from([3]));
        assert_eq!(table.slot(id).state, LocalState::Consumed);
        assert!(table.held_loans().is_empty());
    }

    #[test]
    fn test_join_marks_divergent_states() {
        let mut left = LocalTable::new();
        let (ty, ab) = resource();
        let a = left.declare("a", ty.clone(), ab, BTreeSet::new());
        let b = left.declare("b", ty, ab, BTreeSet::new());
        let mut right = left.clone();
        left.consume(a);
        right.consume(a);
        right.consume(b);
        left.join(&right);
        assert_eq!(left.slot(a).state, LocalState::Consumed);
        assert_eq!(left.slot(b).state, LocalState::MaybeConsumed);
    }

    #[test]
    fn test_truncate_drops_branch_locals() {
        let mut table = LocalTable::new();
        let (ty, ab) = resource();
        table.declare("a", ty.clone(), ab, BTreeSet::new());
        let len = table.len();
        table.push_scope();
        table.declare("tmp", ty, ab, BTreeSet::new());
        table.pop_scope();
        table.truncate(len);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("tmp"), None);
    }
}
