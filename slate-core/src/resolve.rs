#![forbid(unsafe_code)]

//! Type descriptor resolution.
//!
//! Turns [`TypeRef`] syntax into canonical [`Type`] descriptors and keeps the
//! universe of struct definitions and function signatures every later pass
//! consults. Resolution is a pure function over the declarations.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use slate_ast::{AbilitySet, Module, StructRef, TypeParamDecl, TypeRef};

use crate::error::{Location, TypeError};
use crate::types::{FunctionId, StructId, StructTag, Type};

/// A struct declaration with its field types resolved against its own type
/// parameters (`Type::Param { index }` refers to `type_params[index]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructDef {
    pub id: StructId,
    pub type_params: Vec<TypeParamDecl>,
    pub abilities: AbilitySet,
    pub fields: Vec<(String, Type)>,
}

impl StructDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionSig {
    pub id: FunctionId,
    pub type_params: Vec<TypeParamDecl>,
    pub params: Vec<(String, Type)>,
    pub ret: Type,
    pub acquires: Vec<String>,
}

/// All struct definitions and function signatures of a declaration set.
#[derive(Clone, Debug, Default)]
pub struct TypeUniverse {
    structs: BTreeMap<StructId, StructDef>,
    functions: BTreeMap<FunctionId, FunctionSig>,
}

impl TypeUniverse {
    /// Register every declaration of `modules`, resolving field and
    /// signature types. Errors are collected rather than aborting so that
    /// independent problems are all reported.
    pub fn build(modules: &[Module]) -> (Self, Vec<TypeError>) {
        let mut universe = TypeUniverse::default();
        let mut errors = Vec::new();

        // Headers first so fields may refer to structs declared later.
        // `registered` holds the (module, struct) positions that won.
        let mut registered = HashSet::new();
        for (m, module) in modules.iter().enumerate() {
            for (s, decl) in module.structs.iter().enumerate() {
                let id = StructId::new(&module.name, &decl.name);
                let loc = Location::module(&module.name, format!("struct {}", decl.name));
                if universe.structs.contains_key(&id) {
                    errors.push(TypeError::DuplicateDeclaration {
                        loc,
                        name: id.to_string(),
                    });
                    continue;
                }
                registered.insert((m, s));
                check_type_param_names(&decl.type_params, &loc, &mut errors);
                universe.structs.insert(
                    id.clone(),
                    StructDef {
                        id,
                        type_params: decl.type_params.clone(),
                        abilities: decl.abilities,
                        fields: Vec::new(),
                    },
                );
            }
        }

        for (m, module) in modules.iter().enumerate() {
            for (s, decl) in module.structs.iter().enumerate() {
                if !registered.contains(&(m, s)) {
                    continue;
                }
                let id = StructId::new(&module.name, &decl.name);
                let mut fields = Vec::with_capacity(decl.fields.len());
                let mut seen = HashSet::new();
                for field in &decl.fields {
                    let loc = Location::module(
                        &module.name,
                        format!("struct {} field `{}`", decl.name, field.name),
                    );
                    if !seen.insert(field.name.as_str()) {
                        errors.push(TypeError::DuplicateDeclaration {
                            loc,
                            name: field.name.clone(),
                        });
                        continue;
                    }
                    match universe
                        .resolve(&module.name, &field.ty, &decl.type_params, &loc)
                        .and_then(|ty| reject_references(ty, false, &loc))
                    {
                        Ok(ty) => fields.push((field.name.clone(), ty)),
                        Err(e) => errors.push(e),
                    }
                }
                if let Some(def) = universe.structs.get_mut(&id) {
                    def.fields = fields;
                }
            }
        }

        for module in modules {
            for decl in &module.functions {
                let id = FunctionId::new(&module.name, &decl.name);
                let loc = Location::function(&module.name, &decl.name, "signature");
                if universe.functions.contains_key(&id) {
                    errors.push(TypeError::DuplicateDeclaration {
                        loc,
                        name: id.to_string(),
                    });
                    continue;
                }
                check_type_param_names(&decl.type_params, &loc, &mut errors);

                let mut params = Vec::with_capacity(decl.params.len());
                for p in &decl.params {
                    let ploc = loc.with_detail(format!("parameter `{}`", p.name));
                    match universe
                        .resolve(&module.name, &p.ty, &decl.type_params, &ploc)
                        .and_then(|ty| reject_references(ty, true, &ploc))
                    {
                        Ok(ty) => params.push((p.name.clone(), ty)),
                        // Keep arity stable for callers; the error is reported.
                        Err(e) => {
                            errors.push(e);
                            params.push((p.name.clone(), Type::Unit));
                        }
                    }
                }
                let ret = match &decl.ret {
                    None => Type::Unit,
                    Some(ty) => {
                        let rloc = loc.with_detail("return type");
                        match universe
                            .resolve(&module.name, ty, &decl.type_params, &rloc)
                            .and_then(|ty| reject_references(ty, true, &rloc))
                        {
                            Ok(ty) => ty,
                            Err(e) => {
                                errors.push(e);
                                Type::Unit
                            }
                        }
                    }
                };

                universe.functions.insert(
                    id.clone(),
                    FunctionSig {
                        id,
                        type_params: decl.type_params.clone(),
                        params,
                        ret,
                        acquires: decl.acquires.clone(),
                    },
                );
            }
        }

        errors.extend(universe.recursive_structs());
        (universe, errors)
    }

    /// Resolve `ty` as written inside `module`, where `params` are the type
    /// parameters in scope.
    pub fn resolve(
        &self,
        module: &str,
        ty: &TypeRef,
        params: &[TypeParamDecl],
        loc: &Location,
    ) -> Result<Type, TypeError> {
        Ok(match ty {
            TypeRef::Bool => Type::Bool,
            TypeRef::U8 => Type::U8,
            TypeRef::U64 => Type::U64,
            TypeRef::U128 => Type::U128,
            TypeRef::Address => Type::Address,
            TypeRef::Signer => Type::Signer,
            TypeRef::Vector(inner) => {
                Type::Vector(Box::new(self.resolve(module, inner, params, loc)?))
            }
            TypeRef::Struct(sref) => Type::Struct(self.resolve_struct(module, sref, params, loc)?),
            TypeRef::Param(name) => {
                let index = params
                    .iter()
                    .position(|p| &p.name == name)
                    .ok_or_else(|| TypeError::UnboundTypeParameter {
                        loc: loc.clone(),
                        name: name.clone(),
                    })?;
                Type::Param {
                    index,
                    name: name.clone(),
                }
            }
            TypeRef::Ref { mutable, inner } => {
                Type::reference(*mutable, self.resolve(module, inner, params, loc)?)
            }
        })
    }

    pub fn resolve_struct(
        &self,
        module: &str,
        sref: &StructRef,
        params: &[TypeParamDecl],
        loc: &Location,
    ) -> Result<StructTag, TypeError> {
        let id = StructId::new(sref.module.as_deref().unwrap_or(module), &sref.name);
        let def = self.structs.get(&id).ok_or_else(|| TypeError::UnknownStruct {
            loc: loc.clone(),
            name: id.to_string(),
        })?;
        if def.type_params.len() != sref.args.len() {
            return Err(TypeError::ArityMismatch {
                loc: loc.clone(),
                name: id.to_string(),
                expected: def.type_params.len(),
                found: sref.args.len(),
            });
        }
        let args = sref
            .args
            .iter()
            .map(|a| {
                self.resolve(module, a, params, loc)
                    .and_then(|t| reject_references(t, false, loc))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(StructTag::new(id, args))
    }

    pub fn struct_def(&self, id: &StructId) -> Option<&StructDef> {
        self.structs.get(id)
    }

    pub fn function(&self, id: &FunctionId) -> Option<&FunctionSig> {
        self.functions.get(id)
    }

    pub fn structs(&self) -> impl Iterator<Item = &StructDef> {
        self.structs.values()
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionSig> {
        self.functions.values()
    }

    /// Field list of a struct instantiation with the outer arguments
    /// substituted into every field type.
    pub fn instantiate_fields(&self, tag: &StructTag) -> Option<Vec<(String, Type)>> {
        let def = self.structs.get(&tag.id)?;
        Some(
            def.fields
                .iter()
                .map(|(name, ty)| (name.clone(), ty.subst(&tag.args)))
                .collect(),
        )
    }

    pub fn field_type(&self, tag: &StructTag, field: &str) -> Option<Type> {
        let def = self.structs.get(&tag.id)?;
        let index = def.field_index(field)?;
        Some(def.fields[index].1.subst(&tag.args))
    }

    /// A struct may not contain itself, directly or through other structs.
    fn recursive_structs(&self) -> Vec<TypeError> {
        let mut errors = Vec::new();
        let mut done = BTreeSet::new();
        for id in self.structs.keys() {
            let mut stack = Vec::new();
            self.visit_struct(id, &mut stack, &mut done, &mut errors);
        }
        errors
    }

    fn visit_struct(
        &self,
        id: &StructId,
        stack: &mut Vec<StructId>,
        done: &mut BTreeSet<StructId>,
        errors: &mut Vec<TypeError>,
    ) {
        if done.contains(id) {
            return;
        }
        if stack.contains(id) {
            errors.push(TypeError::InvalidType {
                loc: Location::module(&id.module, format!("struct {}", id.name)),
                message: format!("struct `{id}` contains itself"),
            });
            return;
        }
        stack.push(id.clone());
        if let Some(def) = self.structs.get(id) {
            let mut children = BTreeSet::new();
            for (_, ty) in &def.fields {
                collect_struct_ids(ty, &mut children);
            }
            for child in &children {
                self.visit_struct(child, stack, done, errors);
            }
        }
        stack.pop();
        done.insert(id.clone());
    }
}

fn collect_struct_ids(ty: &Type, out: &mut BTreeSet<StructId>) {
    match ty {
        Type::Struct(tag) => {
            out.insert(tag.id.clone());
            for arg in &tag.args {
                collect_struct_ids(arg, out);
            }
        }
        Type::Vector(inner) | Type::Ref { inner, .. } => collect_struct_ids(inner, out),
        _ => {}
    }
}

fn check_type_param_names(params: &[TypeParamDecl], loc: &Location, errors: &mut Vec<TypeError>) {
    let mut seen = HashSet::new();
    for p in params {
        if !seen.insert(p.name.as_str()) {
            errors.push(TypeError::DuplicateDeclaration {
                loc: loc.clone(),
                name: p.name.clone(),
            });
        }
    }
}

/// References may only appear at the top level of a parameter, return, or
/// local type; never inside fields, vectors, type arguments, or other
/// references.
pub(crate) fn reject_references(ty: Type, allow_top: bool, loc: &Location) -> Result<Type, TypeError> {
    fn nested(ty: &Type) -> bool {
        match ty {
            Type::Ref { .. } => true,
            Type::Vector(inner) => nested(inner),
            Type::Struct(tag) => tag.args.iter().any(nested),
            _ => false,
        }
    }
    let bad = match &ty {
        Type::Ref { inner, .. } => !allow_top || nested(inner),
        other => nested(other),
    };
    if bad {
        return Err(TypeError::InvalidType {
            loc: loc.clone(),
            message: format!("reference type not allowed in this position: `{ty}`"),
        });
    }
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_ast::{Ability, StructDecl};

    fn sample() -> Module {
        Module::new("M")
            .with_struct(
                StructDecl::new("ParamStruct")
                    .type_param(TypeParamDecl::new("T"))
                    .abilities([Ability::Store, Ability::Drop])
                    .field("v", TypeRef::param("T")),
            )
            .with_struct(
                StructDecl::new("AnotherParamStruct")
                    .type_param(TypeParamDecl::new("T"))
                    .abilities([Ability::Key])
                    .field("inner", TypeRef::generic("ParamStruct", vec![TypeRef::param("T")])),
            )
    }

    #[test]
    fn test_nested_generic_substitution() {
        let (universe, errors) = TypeUniverse::build(&[sample()]);
        assert!(errors.is_empty(), "{errors:?}");
        let tag = StructTag::new(StructId::new("M", "AnotherParamStruct"), vec![Type::U64]);
        let fields = universe.instantiate_fields(&tag).expect("fields");
        assert_eq!(fields[0].1.to_string(), "M::ParamStruct<u64>");
        let inner = fields[0].1.as_struct().expect("struct");
        assert_eq!(universe.field_type(inner, "v"), Some(Type::U64));
    }

    #[test]
    fn test_duplicate_struct_keeps_first_declaration() {
        let module = Module::new("M")
            .with_struct(StructDecl::new("Marker").abilities([Ability::Drop]))
            .with_struct(StructDecl::new("Marker").field("v", TypeRef::U64));
        let (universe, errors) = TypeUniverse::build(&[module]);
        assert!(
            matches!(errors.as_slice(), [TypeError::DuplicateDeclaration { .. }]),
            "{errors:?}"
        );
        let def = universe.struct_def(&StructId::new("M", "Marker")).expect("registered");
        assert!(def.fields.is_empty());
        assert!(def.abilities.has(Ability::Drop));
    }

    #[test]
    fn test_arity_mismatch() {
        let (universe, _) = TypeUniverse::build(&[sample()]);
        let loc = Location::module("M", "test");
        let err = universe
            .resolve("M", &TypeRef::generic("ParamStruct", vec![]), &[], &loc)
            .expect_err("arity");
        assert!(matches!(err, TypeError::ArityMismatch { expected: 1, found: 0, .. }));
    }

    #[test]
    fn test_unbound_type_parameter() {
        let m = Module::new("M").with_struct(StructDecl::new("S").field("x", TypeRef::param("T")));
        let (_, errors) = TypeUniverse::build(&[m]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&errors[0], TypeError::UnboundTypeParameter { name, .. } if name == "T"));
    }

    #[test]
    fn test_reference_field_rejected() {
        let m = Module::new("M").with_struct(StructDecl::new("S").field("r", TypeRef::imm(TypeRef::U64)));
        let (_, errors) = TypeUniverse::build(&[m]);
        assert!(matches!(errors.as_slice(), [TypeError::InvalidType { .. }]));
    }

    #[test]
    fn test_recursive_struct_rejected() {
        let m = Module::new("M")
            .with_struct(StructDecl::new("A").field("b", TypeRef::st("B")))
            .with_struct(StructDecl::new("B").field("a", TypeRef::vector(TypeRef::st("A"))));
        let (_, errors) = TypeUniverse::build(&[m]);
        assert!(errors.iter().any(|e| matches!(e, TypeError::InvalidType { message, .. } if message.contains("contains itself"))));
    }

    #[test]
    fn test_duplicate_struct_reported() {
        let m = Module::new("M")
            .with_struct(StructDecl::new("S"))
            .with_struct(StructDecl::new("S"));
        let (_, errors) = TypeUniverse::build(&[m]);
        assert!(matches!(errors.as_slice(), [TypeError::DuplicateDeclaration { .. }]));
    }
}
