// ABOUTME: Black-box end-to-end scenarios exercising parser, analyzer, compiler, VM, and interpreter together

use pascal_vm::ast::CompilationUnit;
use pascal_vm::compiler::{self, Compiled};
use pascal_vm::interpreter::Interpreter;
use pascal_vm::parser;
use pascal_vm::semant::Analyzer;
use pascal_vm::serialize;
use pascal_vm::unit_loader::BytecodeUnitLoader;
use pascal_vm::vm::Vm;
use std::fs;
use std::path::PathBuf;

/// Parses and analyzes `src` as a standalone program, panicking with a
/// readable message on any parse or semantic failure.
fn compile_program(src: &str) -> pascal_vm::bytecode::Program {
    let parsed = parser::parse(src).expect("should parse");
    let program = match &parsed {
        CompilationUnit::Program(p) => p,
        CompilationUnit::Unit(_) => panic!("expected a program"),
    };
    let errors = Analyzer::analyze_program(program);
    assert!(errors.is_empty(), "unexpected semantic errors: {errors:?}");
    match compiler::compile(&parsed) {
        Compiled::Program(p) => p,
        Compiled::Unit(_) => unreachable!(),
    }
}

fn run_vm(src: &str) -> String {
    let program = compile_program(src);
    let mut loader = BytecodeUnitLoader::new(".");
    let mut vm = Vm::new();
    vm.link_program(&program, &mut loader).expect("link should succeed");
    vm.run().expect("run should succeed");
    String::from_utf8_lossy(vm.output()).into_owned()
}

fn run_interpreter(src: &str) -> String {
    let parsed = parser::parse(src).expect("should parse");
    let program = match &parsed {
        CompilationUnit::Program(p) => p,
        CompilationUnit::Unit(_) => panic!("expected a program"),
    };
    let errors = Analyzer::analyze_program(program);
    assert!(errors.is_empty(), "unexpected semantic errors: {errors:?}");
    let mut loader = pascal_vm::unit_loader::SourceUnitLoader::new(".");
    let mut interp = Interpreter::new();
    interp.run_program(program, &mut loader).expect("run should succeed");
    String::from_utf8_lossy(interp.output()).into_owned()
}

fn tempdir(tag: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("pascal_vm_integration_{tag}_{}", std::process::id()));
    let _ = fs::create_dir_all(&dir);
    dir
}

#[test]
fn fibonacci_for_loop_matches_expected_sequence() {
    let src = r#"
        program Fib;
        var a, b, temp, i, n: integer;
        begin
            n := 10;
            a := 0;
            b := 1;
            write(a);
            write(' ');
            write(b);
            for i := 3 to n do begin
                temp := a + b;
                write(' ');
                write(temp);
                a := b;
                b := temp
            end
        end.
    "#;
    assert_eq!(run_vm(src), "0 1 1 2 3 5 8 13 21 34");
    assert_eq!(run_interpreter(src), "0 1 1 2 3 5 8 13 21 34");
}

#[test]
fn nested_function_return_sums_double_and_triple() {
    let src = r#"
        program Nested;
        function Double(n: integer): integer;
        begin
            Double := n * 2
        end;
        function Triple(n: integer): integer;
        begin
            Triple := n * 3
        end;
        function Calculate(x: integer): integer;
        begin
            Calculate := Double(x) + Triple(x)
        end;
        begin
            writeln(Calculate(5))
        end.
    "#;
    assert!(run_vm(src).contains("25"));
    assert!(run_interpreter(src).contains("25"));
}

#[test]
fn var_parameter_swap_mutates_caller_variables() {
    let src = r#"
        program SwapDemo;
        procedure Swap(var a, b: integer);
        var t: integer;
        begin
            t := a;
            a := b;
            b := t
        end;
        var x, y: integer;
        begin
            x := 5;
            y := 10;
            Swap(x, y);
            write(x);
            write(' ');
            write(y)
        end.
    "#;
    assert_eq!(run_vm(src), "10 5");
    assert_eq!(run_interpreter(src), "10 5");
}

#[test]
fn unit_link_exposes_compiled_square_function() {
    let dir = tempdir("unit_link");

    let unit_src = r#"
        unit MathUtils;
        interface
        function Square(x: integer): integer;
        implementation
        function Square(x: integer): integer;
        begin
            Square := x * x
        end;
        end.
    "#;
    let parsed_unit = parser::parse(unit_src).expect("unit should parse");
    let unit = match &parsed_unit {
        CompilationUnit::Unit(u) => u,
        CompilationUnit::Program(_) => panic!("expected a unit"),
    };
    assert!(Analyzer::analyze_unit(unit).is_empty());
    let compiled_unit = match compiler::compile(&parsed_unit) {
        Compiled::Unit(u) => u,
        Compiled::Program(_) => unreachable!(),
    };
    fs::write(dir.join("MathUtils.pbu"), serialize::write_unit(&compiled_unit)).unwrap();

    let program_src = r#"
        program Main;
        uses MathUtils;
        begin
            writeln(Square(7))
        end.
    "#;
    let parsed_program = parser::parse(program_src).expect("program should parse");
    let main_program = match &parsed_program {
        CompilationUnit::Program(p) => p,
        CompilationUnit::Unit(_) => panic!("expected a program"),
    };
    assert!(Analyzer::analyze_program_with_units(main_program, &[unit]).is_empty());
    let compiled_program = match compiler::compile(&parsed_program) {
        Compiled::Program(p) => p,
        Compiled::Unit(_) => unreachable!(),
    };

    let mut loader = BytecodeUnitLoader::new(dir.as_path());
    let mut vm = Vm::new();
    vm.link_program(&compiled_program, &mut loader).expect("link should succeed");
    vm.run().expect("run should succeed");
    assert!(String::from_utf8_lossy(vm.output()).contains("49"));
}

#[test]
fn case_with_ranges_selects_matching_branch() {
    let src = r#"
        program Grade;
        var choice: integer;
        var g: string;
        begin
            choice := 85;
            case choice of
                90..100: g := 'A';
                80..89: g := 'B'
            else
                g := 'X'
            end;
            write(g)
        end.
    "#;
    assert_eq!(run_vm(src), "B");
    assert_eq!(run_interpreter(src), "B");
}

#[test]
fn pointer_alloc_dispose_round_trips_and_then_errors() {
    let src = r#"
        program PointerDemo;
        var p: ^integer;
        begin
            new(p);
            p^ := 42;
            writeln(p^);
            dispose(p)
        end.
    "#;
    assert!(run_vm(src).contains("42"));
    assert!(run_interpreter(src).contains("42"));

    let use_after_dispose = r#"
        program UseAfterDispose;
        var p: ^integer;
        begin
            new(p);
            dispose(p);
            writeln(p^)
        end.
    "#;
    let program = compile_program(use_after_dispose);
    let mut loader = BytecodeUnitLoader::new(".");
    let mut vm = Vm::new();
    vm.link_program(&program, &mut loader).expect("link should succeed");
    assert!(vm.run().is_err());
}

#[test]
fn with_statement_resolves_unqualified_fields_to_the_record() {
    let src = r#"
        program WithDemo;
        type Point = record
            x: integer;
            y: integer
        end;
        var p: Point;
        procedure Bump(amount: integer);
        var x: integer;
        begin
            x := amount;
            writeln(x)
        end;
        begin
            p.x := 1;
            p.y := 2;
            with p do begin
                x := x + 10;
                y := x + y;
                Bump(99)
            end;
            writeln(p.x);
            writeln(p.y)
        end.
    "#;
    assert_eq!(run_vm(src), "99\n11\n13\n");
    assert_eq!(run_interpreter(src), "99\n11\n13\n");
}
