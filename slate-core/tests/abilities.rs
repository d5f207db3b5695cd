use proptest::prelude::*;
use slate_ast::{
    Ability, AbilitySet, Expr, FunctionDecl, Module, Stmt, StructDecl, StructRef, TypeParamDecl,
    TypeRef,
};
use slate_core::abilities::AbilityOracle;
use slate_core::{Checker, StructId, StructTag, Type, TypeError, TypeUniverse};

fn coin() -> StructDecl {
    StructDecl::new("Coin").field("v", TypeRef::U64)
}

fn all_violations(module: &Module) -> usize {
    let err = Checker::new().check_module(module).expect_err("expected check error");
    assert!(
        err.iter().all(|e| matches!(e, TypeError::AbilityViolation { .. })),
        "unexpected errors: {:?}",
        err.errors
    );
    err.len()
}

#[test]
fn key_struct_with_non_store_field_is_rejected() {
    let module = Module::new("M").with_struct(coin()).with_struct(
        StructDecl::new("Vault")
            .abilities([Ability::Key])
            .field("c", TypeRef::st("Coin")),
    );
    assert_eq!(all_violations(&module), 1);
}

#[test]
fn declared_copy_and_drop_need_field_support() {
    let module = Module::new("M").with_struct(coin()).with_struct(
        StructDecl::new("Holder")
            .abilities([Ability::Copy, Ability::Drop])
            .field("c", TypeRef::st("Coin")),
    );
    assert_eq!(all_violations(&module), 2);
}

#[test]
fn phantom_argument_does_not_restrict_abilities() {
    let module = Module::new("M")
        .with_struct(coin())
        .with_struct(
            StructDecl::new("Tagged")
                .abilities([Ability::Copy, Ability::Drop, Ability::Store])
                .type_param(TypeParamDecl::new("T").phantom())
                .field("v", TypeRef::U64),
        )
        .with_function(
            FunctionDecl::new("discard")
                .param("t", TypeRef::generic("Tagged", vec![TypeRef::st("Coin")]))
                .body(vec![Stmt::let_("u", Expr::cp("t"))]),
        );
    Checker::new().check_module(&module).expect("check");
}

#[test]
fn phantom_parameter_in_field_position_is_rejected() {
    let module = Module::new("M").with_struct(
        StructDecl::new("Bad")
            .type_param(TypeParamDecl::new("T").phantom())
            .field("x", TypeRef::param("T")),
    );
    let err = Checker::new().check_module(&module).expect_err("expected check error");
    assert!(
        matches!(err.errors.as_slice(), [TypeError::InvalidType { .. }]),
        "unexpected errors: {:?}",
        err.errors
    );
}

#[test]
fn generic_argument_must_satisfy_call_constraints() {
    let coin_ref = StructRef::named("Coin");
    let module = Module::new("M")
        .with_struct(coin())
        .with_function(
            FunctionDecl::new("id")
                .type_param(TypeParamDecl::constrained("T", [Ability::Copy, Ability::Drop]))
                .param("x", TypeRef::param("T"))
                .returns(TypeRef::param("T"))
                .body(vec![Stmt::ret(Expr::var("x"))]),
        )
        .with_function(FunctionDecl::new("f").body(vec![
            Stmt::let_("c", Expr::pack(coin_ref.clone(), vec![("v", Expr::U64(1))])),
            Stmt::let_(
                "d",
                Expr::call_generic("id", vec![TypeRef::st("Coin")], vec![Expr::var("c")]),
            ),
            Stmt::unpack(coin_ref, vec![("v", None)], Expr::var("d")),
        ]));
    assert_eq!(all_violations(&module), 1);
}

#[test]
fn constrained_struct_parameter_rejects_weak_argument() {
    let module = Module::new("M")
        .with_struct(coin())
        .with_struct(
            StructDecl::new("Boxed")
                .abilities([Ability::Store])
                .type_param(TypeParamDecl::constrained("T", [Ability::Store]))
                .field("v", TypeRef::param("T")),
        )
        .with_function(
            FunctionDecl::new("open")
                .param("b", TypeRef::imm(TypeRef::generic("Boxed", vec![TypeRef::st("Coin")]))),
        );
    let err = Checker::new().check_module(&module).expect_err("expected check error");
    assert!(err.iter().any(|e| matches!(e, TypeError::AbilityViolation { .. })));
}

#[test]
fn generic_resource_can_be_published_for_storable_argument() {
    let module = Module::new("M")
        .with_struct(
            StructDecl::new("Balance")
                .abilities([Ability::Key])
                .type_param(TypeParamDecl::new("T"))
                .field("v", TypeRef::param("T")),
        )
        .with_function(
            FunctionDecl::new("publish")
                .param("account", TypeRef::imm(TypeRef::Signer))
                .body(vec![Stmt::expr(Expr::move_to(
                    StructRef::generic("Balance", vec![TypeRef::U64]),
                    Expr::var("account"),
                    Expr::pack(
                        StructRef::generic("Balance", vec![TypeRef::U64]),
                        vec![("v", Expr::U64(10))],
                    ),
                ))]),
        );
    Checker::new().check_module(&module).expect("check");
}

#[test]
fn generic_resource_over_non_storable_argument_lacks_key() {
    let module = Module::new("M")
        .with_struct(coin())
        .with_struct(
            StructDecl::new("Balance")
                .abilities([Ability::Key])
                .type_param(TypeParamDecl::new("T"))
                .field("v", TypeRef::param("T")),
        )
        .with_function(
            FunctionDecl::new("inspect")
                .param("addr", TypeRef::Address)
                .returns(TypeRef::Bool)
                .body(vec![Stmt::ret(Expr::exists(
                    StructRef::generic("Balance", vec![TypeRef::st("Coin")]),
                    Expr::var("addr"),
                ))]),
        );
    assert_eq!(all_violations(&module), 1);
}

fn set_from_bits(bits: u8) -> AbilitySet {
    Ability::ALL
        .iter()
        .enumerate()
        .filter(|(i, _)| bits & (1 << i) != 0)
        .map(|(_, a)| *a)
        .collect()
}

fn tag(name: &str, args: Vec<Type>) -> Type {
    Type::Struct(StructTag::new(StructId::new("M", name), args))
}

proptest! {
    #[test]
    fn wrapper_abilities_follow_argument(bits in 0u8..16) {
        let declared = set_from_bits(bits);
        let module = Module::new("M")
            .with_struct(StructDecl::new("Arg").abilities(declared))
            .with_struct(
                StructDecl::new("Wrapper")
                    .abilities(AbilitySet::ALL)
                    .type_param(TypeParamDecl::new("T"))
                    .field("v", TypeRef::param("T")),
            );
        let (universe, errors) = TypeUniverse::build(&[module]);
        prop_assert!(errors.is_empty());
        let mut oracle = AbilityOracle::new(&universe);

        let arg = tag("Arg", vec![]);
        prop_assert_eq!(oracle.abilities(&arg, &[]), declared);

        let expected: AbilitySet = Ability::ALL
            .into_iter()
            .filter(|a| declared.has(a.requirement()))
            .collect();
        let wrapped = tag("Wrapper", vec![arg.clone()]);
        prop_assert_eq!(oracle.abilities(&wrapped, &[]), expected);

        let vector = Type::Vector(Box::new(arg));
        prop_assert_eq!(
            oracle.abilities(&vector, &[]),
            declared.intersect(AbilitySet::PRIMITIVES)
        );
    }
}
