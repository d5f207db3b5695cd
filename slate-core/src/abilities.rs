#![forbid(unsafe_code)]

//! Ability computation and validation.
//!
//! Abilities of a generic instantiation are a pure function of the struct's
//! declared set and its arguments' abilities, so they are recomputed at every
//! instantiation site. [`AbilityOracle`] memoizes results by canonical
//! descriptor for the lifetime of one analysis; there is no shared cache.

use std::collections::HashMap;

use slate_ast::{Ability, AbilitySet, TypeParamDecl};

use crate::error::{Location, TypeError};
use crate::resolve::{StructDef, TypeUniverse};
use crate::types::{StructTag, Type};

/// Effective abilities of `def` instantiated with arguments whose abilities
/// are `arg_abilities`. Phantom parameters never restrict the result.
pub fn instantiated_abilities(def: &StructDef, arg_abilities: &[AbilitySet]) -> AbilitySet {
    let mut out = def.abilities;
    for (param, arg) in def.type_params.iter().zip(arg_abilities) {
        if param.phantom {
            continue;
        }
        for ability in def.abilities.iter() {
            if !arg.has(ability.requirement()) {
                out.remove(ability);
            }
        }
    }
    out
}

pub struct AbilityOracle<'u> {
    universe: &'u TypeUniverse,
    memo: HashMap<Type, AbilitySet>,
}

impl<'u> AbilityOracle<'u> {
    pub fn new(universe: &'u TypeUniverse) -> Self {
        Self {
            universe,
            memo: HashMap::new(),
        }
    }

    /// Abilities of `ty`, where `params` gives the constraint set assumed
    /// for each type parameter in scope.
    pub fn abilities(&mut self, ty: &Type, params: &[AbilitySet]) -> AbilitySet {
        // Only concrete descriptors are context-free and safe to memoize.
        let concrete = ty.is_concrete();
        if concrete {
            if let Some(set) = self.memo.get(ty) {
                return *set;
            }
        }
        let set = match ty {
            Type::Unit => AbilitySet::REFERENCES,
            Type::Bool | Type::U8 | Type::U64 | Type::U128 | Type::Address => AbilitySet::PRIMITIVES,
            Type::Signer => AbilitySet::SIGNER,
            Type::Ref { .. } => AbilitySet::REFERENCES,
            Type::Vector(inner) => self.abilities(inner, params).intersect(AbilitySet::PRIMITIVES),
            Type::Param { index, .. } => params.get(*index).copied().unwrap_or(AbilitySet::EMPTY),
            Type::Struct(tag) => self.struct_abilities(tag, params),
        };
        if concrete {
            self.memo.insert(ty.clone(), set);
        }
        set
    }

    pub fn has(&mut self, ty: &Type, ability: Ability, params: &[AbilitySet]) -> bool {
        self.abilities(ty, params).has(ability)
    }

    fn struct_abilities(&mut self, tag: &StructTag, params: &[AbilitySet]) -> AbilitySet {
        let universe = self.universe;
        let Some(def) = universe.struct_def(&tag.id) else {
            return AbilitySet::EMPTY;
        };
        let args = tag
            .args
            .iter()
            .map(|a| self.abilities(a, params))
            .collect::<Vec<_>>();
        instantiated_abilities(def, &args)
    }

    /// Check that every struct instantiation inside `ty` satisfies the
    /// constraints of the struct's type parameters.
    pub fn check_constraints(
        &mut self,
        ty: &Type,
        params: &[AbilitySet],
        loc: &Location,
        errors: &mut Vec<TypeError>,
    ) {
        match ty {
            Type::Vector(inner) | Type::Ref { inner, .. } => {
                self.check_constraints(inner, params, loc, errors)
            }
            Type::Struct(tag) => self.check_tag_constraints(tag, params, loc, errors),
            _ => {}
        }
    }

    pub fn check_tag_constraints(
        &mut self,
        tag: &StructTag,
        params: &[AbilitySet],
        loc: &Location,
        errors: &mut Vec<TypeError>,
    ) {
        let universe = self.universe;
        let Some(def) = universe.struct_def(&tag.id) else {
            return;
        };
        for (param, arg) in def.type_params.iter().zip(&tag.args) {
            let have = self.abilities(arg, params);
            if !param.constraints.is_subset_of(have) {
                errors.push(TypeError::AbilityViolation {
                    loc: loc.clone(),
                    message: format!(
                        "type argument `{arg}` for `{}` of `{}` lacks {} (has {have})",
                        param.name,
                        tag.id,
                        param.constraints.difference(have)
                    ),
                });
            }
            self.check_constraints(arg, params, loc, errors);
        }
    }

    /// Validate a struct declaration: claimed abilities must be derivable
    /// from the fields, field types must respect parameter constraints, and
    /// phantom parameters may only appear in phantom positions.
    pub fn check_struct_decl(&mut self, def: &StructDef) -> Vec<TypeError> {
        let mut errors = Vec::new();
        let loc = Location::module(&def.id.module, format!("struct {}", def.id.name));

        // Abilities are conditional on the arguments, so the declaration is
        // checked as if every parameter had every ability.
        let optimistic = vec![AbilitySet::ALL; def.type_params.len()];
        let declared = constraint_sets(&def.type_params);

        for (name, ty) in &def.fields {
            let floc = loc.with_detail(format!("struct {} field `{name}`", def.id.name));
            let field_abilities = self.abilities(ty, &optimistic);
            for ability in def.abilities.iter() {
                let needed = ability.requirement();
                if !field_abilities.has(needed) {
                    errors.push(TypeError::AbilityViolation {
                        loc: floc.clone(),
                        message: format!(
                            "struct `{}` declares `{ability}` but field `{name}` of type `{ty}` lacks `{needed}`",
                            def.id
                        ),
                    });
                }
            }
            self.check_constraints(ty, &declared, &floc, &mut errors);
            check_phantom_positions(ty, def, self.universe, &floc, &mut errors);
        }
        errors
    }
}

pub fn constraint_sets(params: &[TypeParamDecl]) -> Vec<AbilitySet> {
    params.iter().map(|p| p.constraints).collect()
}

fn check_phantom_positions(
    ty: &Type,
    owner: &StructDef,
    universe: &TypeUniverse,
    loc: &Location,
    errors: &mut Vec<TypeError>,
) {
    match ty {
        Type::Param { index, name } => {
            if owner.type_params.get(*index).is_some_and(|p| p.phantom) {
                errors.push(TypeError::InvalidType {
                    loc: loc.clone(),
                    message: format!("phantom parameter `{name}` used in a non-phantom position"),
                });
            }
        }
        Type::Vector(inner) => check_phantom_positions(inner, owner, universe, loc, errors),
        Type::Struct(tag) => {
            let Some(def) = universe.struct_def(&tag.id) else {
                return;
            };
            for (param, arg) in def.type_params.iter().zip(&tag.args) {
                if !param.phantom {
                    check_phantom_positions(arg, owner, universe, loc, errors);
                }
            }
        }
        _ => {}
    }
}

/// Run the declaration checks over every struct in the universe.
pub fn check_structs(universe: &TypeUniverse) -> Vec<TypeError> {
    let mut oracle = AbilityOracle::new(universe);
    universe
        .structs()
        .flat_map(|def| oracle.check_struct_decl(def))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StructId;
    use slate_ast::{Module, StructDecl, TypeParamDecl, TypeRef};

    fn universe(module: Module) -> TypeUniverse {
        let (u, errors) = TypeUniverse::build(&[module]);
        assert!(errors.is_empty(), "{errors:?}");
        u
    }

    fn tag(name: &str, args: Vec<Type>) -> Type {
        Type::Struct(StructTag::new(StructId::new("M", name), args))
    }

    #[test]
    fn test_primitives_and_signer() {
        let u = TypeUniverse::default();
        let mut oracle = AbilityOracle::new(&u);
        assert_eq!(oracle.abilities(&Type::U64, &[]), AbilitySet::PRIMITIVES);
        assert_eq!(oracle.abilities(&Type::Signer, &[]), AbilitySet::SIGNER);
        assert_eq!(
            oracle.abilities(&Type::Vector(Box::new(Type::Signer)), &[]),
            AbilitySet::SIGNER
        );
        assert!(!oracle.has(&Type::reference(false, Type::Signer), Ability::Store, &[]));
    }

    #[test]
    fn test_instantiation_dependent_abilities() {
        let u = universe(
            Module::new("M")
                .with_struct(StructDecl::new("NoStore").abilities([Ability::Drop]))
                .with_struct(
                    StructDecl::new("ParamStruct")
                        .type_param(TypeParamDecl::new("T"))
                        .abilities([Ability::Store, Ability::Drop, Ability::Copy])
                        .field("v", TypeRef::param("T")),
                ),
        );
        let mut oracle = AbilityOracle::new(&u);
        let with_u64 = oracle.abilities(&tag("ParamStruct", vec![Type::U64]), &[]);
        let with_no_store = oracle.abilities(&tag("ParamStruct", vec![tag("NoStore", vec![])]), &[]);
        assert!(with_u64.has(Ability::Store));
        assert!(with_u64.has(Ability::Copy));
        assert!(!with_no_store.has(Ability::Store));
        assert!(!with_no_store.has(Ability::Copy));
        assert!(with_no_store.has(Ability::Drop));
    }

    #[test]
    fn test_phantom_param_ignored() {
        let u = universe(
            Module::new("M")
                .with_struct(StructDecl::new("Res"))
                .with_struct(
                    StructDecl::new("Marker")
                        .type_param(TypeParamDecl::new("T").phantom())
                        .abilities([Ability::Copy, Ability::Drop]),
                ),
        );
        let mut oracle = AbilityOracle::new(&u);
        let set = oracle.abilities(&tag("Marker", vec![tag("Res", vec![])]), &[]);
        assert_eq!(set, AbilitySet::from([Ability::Copy, Ability::Drop]));
    }

    #[test]
    fn test_key_requires_store_fields() {
        let u = universe(
            Module::new("M")
                .with_struct(StructDecl::new("Plain").abilities([Ability::Drop]))
                .with_struct(
                    StructDecl::new("Holder")
                        .abilities([Ability::Key])
                        .field("p", TypeRef::st("Plain")),
                ),
        );
        let errors = check_structs(&u);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], TypeError::AbilityViolation { message, .. } if message.contains("`store`")));
    }

    #[test]
    fn test_constraint_not_satisfied_in_field() {
        let u = universe(
            Module::new("M")
                .with_struct(
                    StructDecl::new("NeedsCopy")
                        .type_param(TypeParamDecl::constrained("T", [Ability::Copy]))
                        .field("v", TypeRef::param("T")),
                )
                .with_struct(
                    StructDecl::new("Outer")
                        .type_param(TypeParamDecl::new("U"))
                        .field("n", TypeRef::generic("NeedsCopy", vec![TypeRef::param("U")])),
                ),
        );
        let errors = check_structs(&u);
        assert!(matches!(errors.as_slice(), [TypeError::AbilityViolation { .. }]));
    }

    #[test]
    fn test_phantom_in_field_position_rejected() {
        let u = universe(
            Module::new("M").with_struct(
                StructDecl::new("Bad")
                    .type_param(TypeParamDecl::new("T").phantom())
                    .field("v", TypeRef::param("T")),
            ),
        );
        let errors = check_structs(&u);
        assert!(matches!(errors.as_slice(), [TypeError::InvalidType { .. }]));
    }
}
