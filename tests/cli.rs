//! End-to-end tests that drive the `sccc` binary itself, the way a user
//! invokes it: a source file on disk, stdout captured, exit status checked.
//! The `#[cfg(test)]` suites under `src/` exercise each pipeline stage in
//! isolation; these exercise the whole `sccc` process.

use std::io::Write;
use std::process::Command;

fn sccc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sccc"))
}

fn write_source(src: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("create temp source file");
    f.write_all(src.as_bytes()).expect("write temp source file");
    f
}

#[test]
fn compiles_a_file_argument_to_assembly_on_stdout() {
    let src = write_source("int main() { return 1 + 2 * 3; }");
    let output = sccc().arg(src.path()).output().expect("run sccc");
    assert!(output.status.success());
    let asm = String::from_utf8(output.stdout).unwrap();
    assert!(asm.contains("main:"));
    assert!(asm.contains(".globl\tmain"));
}

#[test]
fn reads_from_standard_input_when_no_file_is_given() {
    let mut child = sccc()
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .expect("spawn sccc");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"int main() { return 0; }")
        .unwrap();
    let output = child.wait_with_output().expect("wait for sccc");
    assert!(output.status.success());
    assert!(String::from_utf8(output.stdout).unwrap().contains("main:"));
}

#[test]
fn exits_nonzero_and_reports_line_numbers_on_a_semantic_error() {
    let src = write_source("int main() {\n  return x;\n}");
    let output = sccc().arg(src.path()).output().expect("run sccc");
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("line 2"));
    assert!(stderr.contains("undeclared"));
}

#[test]
fn exits_nonzero_on_a_parse_error_without_emitting_assembly() {
    let src = write_source("int main( { }");
    let output = sccc().arg(src.path()).output().expect("run sccc");
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn emit_tir_dumps_the_typed_tree_instead_of_assembly() {
    let src = write_source("int main() { return 0; }");
    let output = sccc().arg("--emit").arg("tir").arg(src.path()).output().expect("run sccc");
    assert!(output.status.success());
    let out = String::from_utf8(output.stdout).unwrap();
    assert!(out.contains("Function"));
    assert!(!out.contains(".globl"));
}

#[test]
fn call_with_more_than_six_arguments_compiles_and_balances_the_stack() {
    let src = write_source(
        "int sum8(int a, int b, int c, int d, int e, int f, int g, int h) { return a; }\n\
         int main() { return sum8(1,2,3,4,5,6,7,8); }",
    );
    let output = sccc().arg(src.path()).output().expect("run sccc");
    assert!(output.status.success());
    let asm = String::from_utf8(output.stdout).unwrap();
    assert_eq!(asm.matches("pushq\t%rax").count(), 2);
    assert!(asm.contains("addq\t$16, %rsp"));
}
