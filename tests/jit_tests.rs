//! JIT against interpreter on straight-line programs.

#![cfg(all(target_arch = "x86_64", unix, feature = "jit"))]

use std::io::Cursor;

use steve::config::{JitMode, RuntimeConfig};
use steve::jit::{JitCompiler, can_jit_compile};
use steve::vm::{SharedOutput, VirtualMachine, parse_ir};

fn interpret(source: &str) -> String {
    let out = SharedOutput::new();
    let mut vm = VirtualMachine::with_io(
        RuntimeConfig::default(),
        Box::new(Cursor::new(Vec::new())),
        Box::new(out.clone()),
    );
    vm.load_source(source).unwrap();
    vm.execute().unwrap();
    out.text()
}

fn native(source: &str) -> (String, i64) {
    let program = parse_ir(source);
    assert!(can_jit_compile(&program), "program should be JIT eligible");
    let compiled = JitCompiler::new().compile(&program).unwrap();
    let mut out = Vec::new();
    let result = compiled.execute(&mut out).unwrap();
    (String::from_utf8(out).unwrap(), result)
}

fn assert_same_output(source: &str) -> i64 {
    let (jit_out, result) = native(source);
    assert_eq!(jit_out, interpret(source));
    result
}

#[test]
fn test_arithmetic_matches() {
    let source = "\
PUSH 6
PUSH 7
BINARY_OP *
PRINT
PUSH 100
PUSH 58
BINARY_OP -
PRINT
PUSH 9
PUSH 2
BINARY_OP %
PRINT";
    assert_eq!(assert_same_output(source), 1);
}

#[test]
fn test_variables_match() {
    let source = "\
PUSH 5
STORE x
LOAD x
LOAD x
BINARY_OP *
STORE y
LOAD y
PUSH 1
BINARY_OP +
PRINT";
    assert_eq!(assert_same_output(source), 26);
}

#[test]
fn test_comparisons_match() {
    let source = "\
PUSH 3
PUSH 4
BINARY_OP <
PRINT
PUSH 3
PUSH 4
BINARY_OP ==
PRINT";
    assert_eq!(assert_same_output(source), 0);
}

#[test]
fn test_unary_match() {
    let source = "PUSH 12\nUNARY_OP -\nPRINT\nPUSH 0\nUNARY_OP !\nPRINT";
    assert_eq!(assert_same_output(source), 1);
}

#[test]
fn test_result_is_stack_top() {
    let (out, result) = native("PUSH 2\nPUSH 3\nBINARY_OP +");
    assert_eq!(out, "");
    assert_eq!(result, 5);
}

#[test]
fn test_vm_runs_through_jit() {
    let out = SharedOutput::new();
    let config = RuntimeConfig {
        jit_mode: JitMode::On,
        ..Default::default()
    };
    let mut vm = VirtualMachine::with_io(config, Box::new(Cursor::new(Vec::new())), Box::new(out.clone()));
    vm.load_source("PUSH 20\nPUSH 22\nBINARY_OP +\nPRINT").unwrap();
    vm.execute().unwrap();
    assert_eq!(out.text(), "42\n");
    assert_eq!(vm.state().registers.rax, 42);
}

#[test]
fn test_branches_fall_back_to_interpreter() {
    let source = "PUSH true\nIF\nPUSH 1\nPRINT\nEND";
    assert!(!can_jit_compile(&parse_ir(source)));

    let out = SharedOutput::new();
    let config = RuntimeConfig {
        jit_mode: JitMode::On,
        ..Default::default()
    };
    let mut vm = VirtualMachine::with_io(config, Box::new(Cursor::new(Vec::new())), Box::new(out.clone()));
    vm.load_source(source).unwrap();
    vm.execute().unwrap();
    assert_eq!(out.text(), "1\n");
}
