use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use slate_ast::{Ability, BinOp, Expr, FunctionDecl, Module, Stmt, StructDecl, StructRef, TypeRef};

fn counter() -> StructRef {
    StructRef::named("Counter")
}

fn bank() -> Module {
    Module::new("Bank")
        .with_struct(
            StructDecl::new("Counter")
                .abilities([Ability::Key])
                .field("n", TypeRef::U64),
        )
        .with_function(
            FunctionDecl::new("publish")
                .attribute("callable")
                .param("account", TypeRef::imm(TypeRef::Signer))
                .param("n", TypeRef::U64)
                .body(vec![Stmt::expr(Expr::move_to(
                    counter(),
                    Expr::var("account"),
                    Expr::pack(counter(), vec![("n", Expr::var("n"))]),
                ))]),
        )
        .with_function(
            FunctionDecl::new("read")
                .param("addr", TypeRef::Address)
                .returns(TypeRef::U64)
                .acquires("Counter")
                .body(vec![Stmt::ret(Expr::deref(Expr::field(
                    Expr::borrow_global(counter(), Expr::var("addr")),
                    "n",
                )))]),
        )
}

fn write_module(dir: &Path, module: &Module) -> PathBuf {
    let path = dir.join(format!("{}.json", module.name));
    fs::write(&path, module.to_json().expect("serialize module")).expect("write module");
    path
}

fn slate(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_slate"))
        .args(args)
        .current_dir(dir)
        .env("SLATE_LOG", "off")
        .output()
        .expect("run slate")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

#[test]
fn check_accepts_well_typed_module() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(dir.path(), &bank());

    let out = slate(dir.path(), &["check", "Bank.json"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(stdout(&out).starts_with("ok: 1 module(s)"));
}

#[test]
fn check_reports_type_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let leaky = bank().with_function(
        FunctionDecl::new("leak")
            .body(vec![Stmt::let_("c", Expr::pack(counter(), vec![("n", Expr::U64(1))]))]),
    );
    write_module(dir.path(), &leaky);

    let out = slate(dir.path(), &["check", "Bank.json", "--sequential"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("check failed with 1 error(s)"), "stderr: {}", stderr(&out));
}

#[test]
fn malformed_module_is_reported_with_its_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::write(dir.path().join("broken.json"), "{ \"name\": ").expect("write");

    let out = slate(dir.path(), &["check", "broken.json"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("is not a valid module declaration"), "stderr: {}", stderr(&out));
}

#[test]
fn run_persists_state_between_invocations() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(dir.path(), &bank());
    fs::write(dir.path().join("slate.toml"), "[runtime]\nsender = \"0x7\"\n").expect("write config");

    let publish = slate(
        dir.path(),
        &["run", "Bank.json", "--function", "Bank::publish", "--arg", "5", "--state", "state.json"],
    );
    assert!(publish.status.success(), "stderr: {}", stderr(&publish));
    let report: serde_json::Value = serde_json::from_str(&stdout(&publish)).expect("json report");
    assert_eq!(report["writes"], 1);
    assert_eq!(report["storage"][0]["address"], "0x7");

    let read = slate(
        dir.path(),
        &["run", "Bank.json", "--function", "Bank::read", "--arg", "0x7", "--state", "state.json"],
    );
    assert!(read.status.success(), "stderr: {}", stderr(&read));
    let report: serde_json::Value = serde_json::from_str(&stdout(&read)).expect("json report");
    assert_eq!(report["return"]["u64"], 5);
    assert_eq!(report["writes"], 0);
}

#[test]
fn run_failure_leaves_state_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_module(dir.path(), &bank());
    let args = ["run", "Bank.json", "--function", "Bank::publish", "--arg", "1", "--state", "state.json"];

    assert!(slate(dir.path(), &args).status.success());
    let before = fs::read_to_string(dir.path().join("state.json")).expect("state");

    let again = slate(dir.path(), &args);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("already exists"), "stderr: {}", stderr(&again));
    let after = fs::read_to_string(dir.path().join("state.json")).expect("state");
    assert_eq!(before, after);
}

#[test]
fn test_command_reports_each_function() {
    let dir = tempfile::tempdir().expect("tempdir");
    let module = bank()
        .with_function(
            FunctionDecl::new("publishes")
                .attribute("test")
                .param("account", TypeRef::imm(TypeRef::Signer))
                .body(vec![Stmt::expr(Expr::call(
                    "publish",
                    vec![Expr::var("account"), Expr::U64(3)],
                ))]),
        )
        .with_function(
            FunctionDecl::new("arithmetic")
                .attribute("evm_test")
                .body(vec![Stmt::assert(
                    Expr::binary(
                        BinOp::Eq,
                        Expr::binary(BinOp::Add, Expr::U64(2), Expr::U64(2)),
                        Expr::U64(5),
                    ),
                    42,
                )]),
        );
    write_module(dir.path(), &module);

    let out = slate(dir.path(), &["test", "Bank.json"]);
    let text = stdout(&out);
    assert!(!out.status.success());
    assert!(text.contains("test Bank::publishes ... ok"), "stdout: {text}");
    assert!(text.contains("test Bank::arithmetic ... FAILED"), "stdout: {text}");
    assert!(text.contains("1 passed; 1 failed"), "stdout: {text}");
}
