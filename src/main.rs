// ABOUTME: Thin CLI front-end wiring the parser, analyzer, compiler, VM, and interpreter together

use clap::Parser;
use pascal_vm::ast::{self, CompilationUnit};
use pascal_vm::compiler::{self, Compiled};
use pascal_vm::config::{PROGRAM_BYTECODE_EXT, UNIT_BYTECODE_EXT};
use pascal_vm::disassemble;
use pascal_vm::error::Error;
use pascal_vm::interpreter::Interpreter;
use pascal_vm::parser;
use pascal_vm::semant::Analyzer;
use pascal_vm::serialize;
use pascal_vm::unit_loader::{BytecodeUnitLoader, SourceUnitLoader};
use pascal_vm::vm::Vm;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Compiler and virtual machine for a Turbo-Pascal-flavored dialect.
#[derive(Parser, Debug)]
#[command(name = "pascal-vm", version = pascal_vm::config::VERSION)]
struct CliArgs {
    /// Source (.pas) or compiled (.pbc/.pbu) file to process
    file: PathBuf,

    /// Run via the tree-walking interpreter instead of the bytecode VM
    #[arg(short, long)]
    debug: bool,

    /// Compile the file to standalone program bytecode (.pbc) and exit
    #[arg(short, long)]
    compile: bool,

    /// Compile the file to unit bytecode (.pbu) and exit
    #[arg(short = 'u', long = "compile-unit")]
    compile_unit: bool,

    /// Execute the program (the default action when no other mode is given)
    #[arg(short, long)]
    run: bool,

    /// Print a disassembly listing of the compiled bytecode instead of running it
    #[arg(short = 's', long)]
    disassemble: bool,

    /// Destination file for --compile/--compile-unit/--disassemble output
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    match dispatch(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: &CliArgs) -> Result<(), Error> {
    if args.compile_unit {
        return compile_to_file(args, true);
    }
    if args.compile {
        return compile_to_file(args, false);
    }
    if args.disassemble {
        return disassemble_file(args);
    }
    run_file(args)
}

fn is_bytecode(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext == PROGRAM_BYTECODE_EXT || ext == UNIT_BYTECODE_EXT,
        None => false,
    }
}

fn read_source(path: &Path) -> Result<CompilationUnit, Error> {
    let src = std::fs::read_to_string(path)?;
    Ok(parser::parse(&src)?)
}

/// Analyzes a parsed program or unit, first loading the interface of every
/// unit it `uses` (from alongside `source_path`) so cross-unit calls resolve
/// instead of reporting a spurious undeclared-name error.
fn analyze_or_fail(unit: &CompilationUnit, source_path: &Path) -> Result<(), Error> {
    let uses = match unit {
        CompilationUnit::Program(p) => &p.uses,
        CompilationUnit::Unit(u) => &u.uses,
    };
    let mut loader = SourceUnitLoader::new(unit_dir(source_path));
    let mut deps: Vec<std::rc::Rc<ast::Unit>> = Vec::new();
    for name in uses {
        deps.push(loader.load(name)?);
    }
    let dep_refs: Vec<&ast::Unit> = deps.iter().map(|rc| rc.as_ref()).collect();

    let errors = match unit {
        CompilationUnit::Program(p) => Analyzer::analyze_program_with_units(p, &dep_refs),
        CompilationUnit::Unit(u) => Analyzer::analyze_unit_with_units(u, &dep_refs),
    };
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Semantic(errors))
    }
}

fn write_output(args: &CliArgs, default_name: &str, bytes: &[u8]) -> Result<(), Error> {
    let path = args.output.clone().unwrap_or_else(|| PathBuf::from(default_name));
    std::fs::write(path, bytes)?;
    Ok(())
}

fn other_error(message: impl Into<String>) -> Error {
    Error::Semantic(vec![pascal_vm::error::SemanticError::Other(message.into())])
}

fn compile_to_file(args: &CliArgs, as_unit: bool) -> Result<(), Error> {
    let parsed = read_source(&args.file)?;
    analyze_or_fail(&parsed, &args.file)?;
    let compiled = compiler::compile(&parsed);
    match (as_unit, compiled) {
        (true, Compiled::Unit(unit)) => {
            let name = format!("{}.{UNIT_BYTECODE_EXT}", unit.name.to_lowercase());
            write_output(args, &name, &serialize::write_unit(&unit))
        }
        (false, Compiled::Program(program)) => {
            let name = format!("{}.{PROGRAM_BYTECODE_EXT}", program.name.to_lowercase());
            write_output(args, &name, &serialize::write_program(&program))
        }
        (true, Compiled::Program(_)) => Err(other_error("--compile-unit given a program file; expected a unit")),
        (false, Compiled::Unit(_)) => Err(other_error("--compile given a unit file; expected a program")),
    }
}

fn disassemble_file(args: &CliArgs) -> Result<(), Error> {
    let text = if is_bytecode(&args.file) {
        let bytes = std::fs::read(&args.file)?;
        match args.file.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext == UNIT_BYTECODE_EXT => disassemble::disassemble_unit(&serialize::read_unit(&bytes)?),
            _ => disassemble::disassemble_program(&serialize::read_program(&bytes)?),
        }
    } else {
        let parsed = read_source(&args.file)?;
        analyze_or_fail(&parsed, &args.file)?;
        match compiler::compile(&parsed) {
            Compiled::Program(p) => disassemble::disassemble_program(&p),
            Compiled::Unit(u) => disassemble::disassemble_unit(&u),
        }
    };

    match &args.output {
        Some(path) => std::fs::write(path, text)?,
        None => print!("{text}"),
    }
    Ok(())
}

fn unit_dir(file: &Path) -> PathBuf {
    file.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
}

fn run_file(args: &CliArgs) -> Result<(), Error> {
    if args.debug {
        return run_with_interpreter(args);
    }

    if is_bytecode(&args.file) {
        let bytes = std::fs::read(&args.file)?;
        let program = serialize::read_program(&bytes)?;
        let mut loader = BytecodeUnitLoader::new(unit_dir(&args.file));
        return run_with_vm(program, &mut loader);
    }

    let parsed = read_source(&args.file)?;
    analyze_or_fail(&parsed, &args.file)?;
    let program = match &parsed {
        CompilationUnit::Program(_) => match compiler::compile(&parsed) {
            Compiled::Program(p) => p,
            Compiled::Unit(_) => unreachable!("program source always compiles to a Program"),
        },
        CompilationUnit::Unit(_) => {
            return Err(other_error("cannot run a unit directly; run the program that uses it"))
        }
    };
    let mut loader = BytecodeUnitLoader::new(unit_dir(&args.file));
    run_with_vm(program, &mut loader)
}

fn run_with_vm(program: pascal_vm::bytecode::Program, loader: &mut BytecodeUnitLoader) -> Result<(), Error> {
    let mut vm = Vm::new();
    vm.link_program(&program, loader)?;
    vm.run()?;
    std::io::stdout().write_all(vm.output())?;
    Ok(())
}

fn run_with_interpreter(args: &CliArgs) -> Result<(), Error> {
    if is_bytecode(&args.file) {
        return Err(other_error("--debug requires a .pas source file, not compiled bytecode"));
    }
    let parsed = read_source(&args.file)?;
    analyze_or_fail(&parsed, &args.file)?;
    let program = match &parsed {
        CompilationUnit::Program(p) => p,
        CompilationUnit::Unit(_) => {
            return Err(other_error("cannot run a unit directly; run the program that uses it"))
        }
    };
    let mut loader = SourceUnitLoader::new(unit_dir(&args.file));
    let mut interp = Interpreter::new();
    interp.run_program(program, &mut loader)?;
    std::io::stdout().write_all(interp.output())?;
    Ok(())
}
