#![forbid(unsafe_code)]

//! Transitive `acquires` verification over the call graph.

use std::collections::{BTreeMap, BTreeSet};

use slate_ast::Ability;

use crate::error::{Location, TypeError};
use crate::resolve::TypeUniverse;
use crate::types::{FunctionId, StructId};

/// Global storage accesses observed in one function body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FunctionAccess {
    /// Structs touched by `move_from`, `borrow_global`, or `borrow_global_mut`.
    pub direct: BTreeSet<StructId>,
    pub calls: BTreeSet<FunctionId>,
}

/// Every struct each function may touch, directly or through callees.
///
/// Starts from the direct accesses and unions callee closures until nothing
/// changes, so call cycles terminate.
pub fn closure(
    accesses: &BTreeMap<FunctionId, FunctionAccess>,
) -> BTreeMap<FunctionId, BTreeSet<StructId>> {
    let mut sets: BTreeMap<FunctionId, BTreeSet<StructId>> = accesses
        .iter()
        .map(|(id, access)| (id.clone(), access.direct.clone()))
        .collect();

    let mut round = 0usize;
    loop {
        round += 1;
        let mut changed = false;
        for (id, access) in accesses {
            let mut add = BTreeSet::new();
            for callee in &access.calls {
                if let Some(theirs) = sets.get(callee) {
                    add.extend(theirs.iter().cloned());
                }
            }
            if let Some(mine) = sets.get_mut(id) {
                let before = mine.len();
                mine.extend(add);
                changed |= mine.len() != before;
            }
        }
        tracing::debug!(round, changed, "acquires fixpoint iteration");
        if !changed {
            break;
        }
    }
    sets
}

/// Compare each function's closure against its declared `acquires` clause.
///
/// Only structs of the function's own module must be declared; resources of
/// other modules are their owners' business.
pub fn verify(
    universe: &TypeUniverse,
    accesses: &BTreeMap<FunctionId, FunctionAccess>,
) -> Vec<TypeError> {
    let mut errors = Vec::new();
    let closures = closure(accesses);

    for (id, reached) in &closures {
        let Some(sig) = universe.function(id) else {
            continue;
        };
        let mut declared = BTreeSet::new();
        for name in &sig.acquires {
            let loc = Location::function(&id.module, &id.name, "acquires");
            let sid = StructId::new(&id.module, name);
            match universe.struct_def(&sid) {
                None => errors.push(TypeError::UnknownStruct {
                    loc,
                    name: sid.to_string(),
                }),
                Some(def) if !def.abilities.has(Ability::Key) => {
                    errors.push(TypeError::InvalidType {
                        loc,
                        message: format!("`{sid}` is listed in `acquires` but does not have `key`"),
                    })
                }
                Some(_) => {
                    declared.insert(sid);
                }
            }
        }

        for resource in reached.iter().filter(|s| s.module == id.module) {
            if !declared.contains(resource) {
                errors.push(TypeError::MissingAcquires {
                    loc: Location::function(
                        &id.module,
                        &id.name,
                        format!("access to `{resource}`"),
                    ),
                    resource: resource.to_string(),
                });
            }
        }
        for unused in declared.iter().filter(|s| !reached.contains(*s)) {
            tracing::warn!(function = %id, resource = %unused, "declared acquires is never used");
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(name: &str) -> FunctionId {
        FunctionId::new("M", name)
    }

    fn sid(name: &str) -> StructId {
        StructId::new("M", name)
    }

    #[test]
    fn test_closure_follows_calls_transitively() {
        let mut accesses = BTreeMap::new();
        accesses.insert(
            fid("a"),
            FunctionAccess {
                direct: BTreeSet::new(),
                calls: BTreeSet::from([fid("b")]),
            },
        );
        accesses.insert(
            fid("b"),
            FunctionAccess {
                direct: BTreeSet::new(),
                calls: BTreeSet::from([fid("c")]),
            },
        );
        accesses.insert(
            fid("c"),
            FunctionAccess {
                direct: BTreeSet::from([sid("S")]),
                calls: BTreeSet::new(),
            },
        );
        let sets = closure(&accesses);
        assert_eq!(sets[&fid("a")], BTreeSet::from([sid("S")]));
    }

    #[test]
    fn test_closure_terminates_on_mutual_recursion() {
        let mut accesses = BTreeMap::new();
        accesses.insert(
            fid("even"),
            FunctionAccess {
                direct: BTreeSet::from([sid("A")]),
                calls: BTreeSet::from([fid("odd")]),
            },
        );
        accesses.insert(
            fid("odd"),
            FunctionAccess {
                direct: BTreeSet::from([sid("B")]),
                calls: BTreeSet::from([fid("even")]),
            },
        );
        let sets = closure(&accesses);
        assert_eq!(sets[&fid("even")], BTreeSet::from([sid("A"), sid("B")]));
        assert_eq!(sets[&fid("odd")], sets[&fid("even")]);
    }
}
