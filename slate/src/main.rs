#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{Diagnostic, IntoDiagnostic, NamedSource, SourceSpan};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use slate_ast::{AccountAddress, Module};
use slate_core::{CheckedProgram, Checker, FunctionId, Type};
use slate_interpret::{GlobalStorage, StoredResource, Value, Vm};

mod args;
mod config;

use config::SlateConfig;

/// Annotations that mark a function as a test entry point.
const TEST_ATTRIBUTES: [&str; 2] = ["test", "evm_test"];

#[derive(Parser, Debug)]
#[command(name = "slate", version, about = "Resource type checker and storage interpreter")]
struct Cli {
    /// Configuration file. Defaults to the nearest `slate.toml` above the
    /// first input.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Type-check modules given as JSON declaration files
    Check {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Check functions one at a time instead of on the thread pool
        #[arg(long, default_value_t = false)]
        sequential: bool,
    },

    /// Check, then execute one function against global storage
    Run {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Entry function as `Module::function`
        #[arg(long)]
        function: String,

        /// Type argument (repeatable), e.g. `u64` or `Bank::Coin`
        #[arg(long = "type-arg")]
        type_args: Vec<String>,

        /// Value for the next non-signer parameter (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// JSON storage snapshot to start from and write back on success
        #[arg(long)]
        state: Option<PathBuf>,

        /// Address given to `&signer` parameters. Overrides `slate.toml`.
        #[arg(long)]
        sender: Option<AccountAddress>,
    },

    /// Run every function annotated `test` or `evm_test`, each on fresh storage
    Test {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Error, Diagnostic)]
#[error("{path} is not a valid module declaration")]
#[diagnostic(code(slate::cli::module))]
struct ModuleLoadError {
    path: String,
    #[source_code]
    src: NamedSource<String>,
    #[label("{message}")]
    span: SourceSpan,
    message: String,
}

#[derive(Serialize)]
struct RunReport {
    function: String,
    #[serde(rename = "return")]
    value: Value,
    writes: usize,
    storage: Vec<StoredResource>,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let first = match &cli.cmd {
        Cmd::Check { paths, .. } | Cmd::Run { paths, .. } | Cmd::Test { paths } => paths.first().cloned(),
    }
    .unwrap_or_else(|| PathBuf::from("."));
    let config = config::load_config(cli.config.as_deref(), &first)?;
    init_logging(&config);

    match cli.cmd {
        Cmd::Check { paths, sequential } => {
            let program = check(&paths, &config, sequential)?;
            let functions = program.universe().functions().count();
            println!(
                "ok: {} module(s), {functions} function(s)",
                program.modules().len()
            );
            Ok(())
        }
        Cmd::Run {
            paths,
            function,
            type_args,
            args,
            state,
            sender,
        } => {
            let program = check(&paths, &config, false)?;
            let sender = sender.unwrap_or(config.runtime.sender);
            run(&program, &config, &function, &type_args, &args, state.as_deref(), sender)
        }
        Cmd::Test { paths } => {
            let program = check(&paths, &config, false)?;
            test(&program, &config)
        }
    }
}

fn init_logging(config: &SlateConfig) {
    let filter = EnvFilter::try_from_env("SLATE_LOG").unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    // A second subscriber (e.g. under a test harness) is not an error.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if let Some(path) = &config.config_path {
        tracing::debug!(config = %path.display(), "loaded configuration");
    }
}

fn load_module(path: &Path) -> miette::Result<Module> {
    let src = fs::read_to_string(path).into_diagnostic()?;
    Module::from_json(&src).map_err(|e| {
        let offset = offset_of(&src, e.line(), e.column());
        let display = path.display().to_string();
        ModuleLoadError {
            path: display.clone(),
            message: e.to_string(),
            span: (offset, 0).into(),
            src: NamedSource::new(display, src),
        }
        .into()
    })
}

/// Byte offset of a 1-based line/column position.
fn offset_of(src: &str, line: usize, column: usize) -> usize {
    let line_start: usize = src
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(src.len())
}

fn check(paths: &[PathBuf], config: &SlateConfig, sequential: bool) -> miette::Result<CheckedProgram> {
    let modules = paths
        .iter()
        .map(|p| load_module(p))
        .collect::<miette::Result<Vec<_>>>()?;
    Checker::new()
        .parallel(config.check.parallel && !sequential)
        .check_program(&modules)
        .map_err(miette::Report::new)
}

/// Fill `&signer` parameters with `sender` and the rest from `raw`, in order.
fn build_arguments(
    program: &CheckedProgram,
    function: &FunctionId,
    type_args: &[Type],
    raw: &[String],
    sender: AccountAddress,
) -> miette::Result<Vec<Value>> {
    let universe = program.universe();
    let sig = universe
        .function(function)
        .ok_or_else(|| miette::miette!("unknown function `{function}`"))?;
    let mut raw = raw.iter();
    let mut values = Vec::with_capacity(sig.params.len());
    for (name, ty) in &sig.params {
        let ty = ty.subst(type_args);
        if matches!(ty.deref(), Some(Type::Signer)) {
            values.push(Value::Signer(sender));
            continue;
        }
        let src = raw
            .next()
            .ok_or_else(|| miette::miette!("missing `--arg` for parameter `{name}: {ty}` of `{function}`"))?;
        values.push(args::parse_value(src, &ty, universe)?);
    }
    let extra = raw.count();
    if extra > 0 {
        return Err(miette::miette!("{extra} unused `--arg` value(s) for `{function}`"));
    }
    Ok(values)
}

fn run(
    program: &CheckedProgram,
    config: &SlateConfig,
    function: &str,
    type_args: &[String],
    raw_args: &[String],
    state: Option<&Path>,
    sender: AccountAddress,
) -> miette::Result<()> {
    let function = args::parse_function(function)?;
    let type_args = type_args
        .iter()
        .map(|t| args::parse_type(t))
        .collect::<Result<Vec<_>, _>>()?;
    let values = build_arguments(program, &function, &type_args, raw_args, sender)?;

    let storage = match state {
        Some(path) if path.exists() => {
            let raw = fs::read_to_string(path).into_diagnostic()?;
            let resources: Vec<StoredResource> = serde_json::from_str(&raw).into_diagnostic()?;
            GlobalStorage::from_snapshot(resources)?
        }
        _ => GlobalStorage::new(),
    };

    let vm = Vm::with_config(program, config.runtime.vm_config());
    let outcome = vm.execute(&storage, &function, &type_args, values)?;
    let report = RunReport {
        function: function.to_string(),
        value: outcome.value,
        writes: outcome.writes,
        storage: storage.snapshot(),
    };
    println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);

    if let Some(path) = state {
        let json = serde_json::to_string_pretty(&report.storage).into_diagnostic()?;
        fs::write(path, json).into_diagnostic()?;
        tracing::info!(state = %path.display(), resources = report.storage.len(), "state written");
    }
    Ok(())
}

fn test(program: &CheckedProgram, config: &SlateConfig) -> miette::Result<()> {
    let mut tests: Vec<FunctionId> = Vec::new();
    for attribute in TEST_ATTRIBUTES {
        for id in program.functions_with_attribute(attribute) {
            if !tests.contains(&id) {
                tests.push(id);
            }
        }
    }
    if tests.is_empty() {
        println!("slate test: no tests found");
        return Ok(());
    }

    let vm = Vm::with_config(program, config.runtime.vm_config());
    let mut failed = 0usize;
    for id in &tests {
        let result = build_arguments(program, id, &[], &[], config.runtime.sender)
            .and_then(|values| Ok(vm.execute(&GlobalStorage::new(), id, &[], values)?));
        match result {
            Ok(_) => println!("test {id} ... ok"),
            Err(err) => {
                failed += 1;
                println!("test {id} ... FAILED: {err}");
            }
        }
    }
    println!(
        "test result: {} passed; {failed} failed",
        tests.len() - failed
    );
    if failed > 0 {
        return Err(miette::miette!("{failed} test(s) failed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_of_counts_preceding_lines() {
        let src = "{\n  \"name\": 1\n}";
        assert_eq!(offset_of(src, 1, 1), 0);
        assert_eq!(offset_of(src, 2, 3), 4);
        assert_eq!(offset_of(src, 9, 9), src.len());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
