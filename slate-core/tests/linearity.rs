use slate_ast::{Ability, BinOp, Expr, FunctionDecl, Module, Stmt, StructDecl, StructRef, TypeRef};
use slate_core::{CheckErrors, Checker, TypeError};

fn coin() -> StructRef {
    StructRef::named("Coin")
}

fn mint(value: u64) -> Expr {
    Expr::pack(coin(), vec![("v", Expr::U64(value))])
}

fn burn(local: &str) -> Stmt {
    Stmt::unpack(coin(), vec![("v", None)], Expr::mv(local))
}

/// `Coin` has no abilities at all: it must be moved exactly once.
fn base() -> Module {
    Module::new("M")
        .with_struct(StructDecl::new("Coin").field("v", TypeRef::U64))
        .with_struct(
            StructDecl::new("Ticket")
                .abilities([Ability::Copy, Ability::Drop])
                .field("id", TypeRef::U64),
        )
        .with_function(
            FunctionDecl::new("destroy")
                .param("c", TypeRef::st("Coin"))
                .body(vec![burn("c")]),
        )
}

fn check_fn(f: FunctionDecl) -> Result<(), CheckErrors> {
    Checker::new().check_module(&base().with_function(f)).map(|_| ())
}

fn errors_of(f: FunctionDecl) -> Vec<TypeError> {
    check_fn(f).expect_err("expected check error").errors
}

#[test]
fn passing_by_value_consumes() {
    check_fn(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::expr(Expr::call("destroy", vec![Expr::var("c")])),
    ]))
    .expect("check");
}

#[test]
fn use_after_move_is_rejected() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::expr(Expr::call("destroy", vec![Expr::var("c")])),
        Stmt::expr(Expr::call("destroy", vec![Expr::var("c")])),
    ]));
    assert!(
        matches!(errors.as_slice(), [TypeError::UseAfterMove { local, .. }] if local == "c"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn explicit_copy_requires_copy_ability() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::let_("d", Expr::cp("c")),
        burn("c"),
    ]));
    assert!(
        matches!(errors.as_slice(), [TypeError::MissingCopyAbility { .. }]),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn copyable_values_are_copied_implicitly() {
    check_fn(
        FunctionDecl::new("f")
            .returns(TypeRef::st("Ticket"))
            .body(vec![
                Stmt::let_("t", Expr::pack(StructRef::named("Ticket"), vec![("id", Expr::U64(7))])),
                Stmt::let_("u", Expr::var("t")),
                Stmt::ret(Expr::var("t")),
            ]),
    )
    .expect("check");
}

#[test]
fn consumed_on_one_branch_only_is_unconsumed() {
    let errors = errors_of(FunctionDecl::new("f").param("b", TypeRef::Bool).body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::if_then(Expr::var("b"), vec![burn("c")]),
    ]));
    assert!(
        matches!(errors.as_slice(), [TypeError::UnconsumedResource { local, .. }] if local == "c"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn consumed_on_both_branches_is_accepted() {
    check_fn(FunctionDecl::new("f").param("b", TypeRef::Bool).body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::if_else(
            Expr::var("b"),
            vec![burn("c")],
            vec![Stmt::expr(Expr::call("destroy", vec![Expr::mv("c")]))],
        ),
    ]))
    .expect("check");
}

#[test]
fn aborting_branch_does_not_need_to_consume() {
    check_fn(FunctionDecl::new("f").param("b", TypeRef::Bool).body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::if_else(Expr::var("b"), vec![burn("c")], vec![Stmt::abort(3)]),
    ]))
    .expect("check");
}

#[test]
fn moving_inside_a_loop_is_rejected() {
    let errors = errors_of(FunctionDecl::new("f").param("b", TypeRef::Bool).body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::while_(Expr::var("b"), vec![burn("c")]),
    ]));
    assert!(
        errors.iter().any(|e| matches!(e, TypeError::UseAfterMove { local, .. } if local == "c")),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn discarding_a_resource_expression_is_rejected() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![Stmt::expr(mint(1))]));
    assert!(
        matches!(errors.as_slice(), [TypeError::MissingDropAbility { .. }]),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn overwriting_a_resource_is_rejected() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::assign("c", mint(2)),
        burn("c"),
    ]));
    assert!(
        matches!(errors.as_slice(), [TypeError::MissingDropAbility { .. }]),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn reassigning_after_move_is_accepted() {
    check_fn(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        burn("c"),
        Stmt::assign("c", mint(2)),
        burn("c"),
    ]))
    .expect("check");
}

#[test]
fn shadowing_a_live_resource_is_unconsumed() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![
        Stmt::let_("c", mint(1)),
        Stmt::let_("c", mint(2)),
        burn("c"),
    ]));
    assert!(
        matches!(errors.as_slice(), [TypeError::UnconsumedResource { local, .. }] if local == "c"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn unconsumed_parameter_is_rejected() {
    let errors = errors_of(FunctionDecl::new("keep").param("c", TypeRef::st("Coin")));
    assert!(
        matches!(errors.as_slice(), [TypeError::UnconsumedResource { local, .. }] if local == "c"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn returning_consumes() {
    check_fn(
        FunctionDecl::new("f")
            .returns(TypeRef::st("Coin"))
            .body(vec![Stmt::let_("c", mint(1)), Stmt::ret(Expr::var("c"))]),
    )
    .expect("check");
}

#[test]
fn missing_return_value_is_a_type_mismatch() {
    let errors = errors_of(FunctionDecl::new("f").returns(TypeRef::U64));
    assert!(
        matches!(errors.as_slice(), [TypeError::TypeMismatch { expected, .. }] if expected == "u64"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn unknown_names_are_reported_once() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![
        Stmt::let_("x", Expr::var("nope")),
        Stmt::let_("y", Expr::var("x")),
        Stmt::expr(Expr::call("missing", vec![])),
    ]));
    assert!(
        matches!(
            errors.as_slice(),
            [TypeError::UnknownLocal { .. }, TypeError::UnknownFunction { .. }]
        ),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn argument_count_is_checked() {
    let errors = errors_of(FunctionDecl::new("f").body(vec![Stmt::expr(Expr::call("destroy", vec![]))]));
    assert!(
        matches!(errors.as_slice(), [TypeError::ArgumentCountMismatch { expected: 1, found: 0, .. }]),
        "unexpected errors: {errors:?}"
    );
}

/// `spend(c)` consumes a coin and yields a bool, so it can sit on either side
/// of `&&`.
fn with_spend(f: FunctionDecl) -> Module {
    base()
        .with_function(
            FunctionDecl::new("spend")
                .param("c", TypeRef::st("Coin"))
                .returns(TypeRef::Bool)
                .body(vec![burn("c"), Stmt::ret(Expr::Bool(true))]),
        )
        .with_function(f)
}

#[test]
fn move_in_right_operand_of_and_is_conditional() {
    let module = with_spend(
        FunctionDecl::new("f")
            .param("b", TypeRef::Bool)
            .returns(TypeRef::Bool)
            .body(vec![
                Stmt::let_("c", mint(1)),
                Stmt::ret(Expr::binary(
                    BinOp::And,
                    Expr::var("b"),
                    Expr::call("spend", vec![Expr::var("c")]),
                )),
            ]),
    );
    let errors = Checker::new().check_module(&module).expect_err("expected check error").errors;
    assert!(
        matches!(errors.as_slice(), [TypeError::UnconsumedResource { local, .. }] if local == "c"),
        "unexpected errors: {errors:?}"
    );
}

#[test]
fn move_in_left_operand_of_or_always_happens() {
    let module = with_spend(
        FunctionDecl::new("f")
            .param("b", TypeRef::Bool)
            .returns(TypeRef::Bool)
            .body(vec![
                Stmt::let_("c", mint(1)),
                Stmt::ret(Expr::binary(
                    BinOp::Or,
                    Expr::call("spend", vec![Expr::var("c")]),
                    Expr::var("b"),
                )),
            ]),
    );
    Checker::new().check_module(&module).expect("check");
}
