//! FileCheck-style tests for `.oir` files
//!
//! Each file under `tests/filetest/` carries its own RUN and CHECK lines.
//! The named tests pin individual files; `test_all_filetests` picks up any
//! file added later.

use obfuscator::filecheck::{CheckDirective, TestRunner, TestSpec};
use std::fs;
use std::path::{Path, PathBuf};

fn filetest_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/filetest")
}

/// Discovers all .oir files in a directory recursively
fn discover_oir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(discover_oir_files(&path));
            } else if path.extension().and_then(|s| s.to_str()) == Some("oir") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Runs one file through FileCheck validation
fn run_filecheck_test(file: &str) {
    let _ = env_logger::builder().is_test(true).try_init();
    let path = filetest_dir().join(file);
    let contents = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));

    let spec = TestSpec::parse(&contents);
    TestRunner::new(false)
        .run_test(&spec)
        .unwrap_or_else(|e| panic!("Test {} failed: {}", file, e));
}

#[test]
fn test_split_filecheck() {
    run_filecheck_test("split.oir");
}

#[test]
fn test_opaque_filecheck() {
    run_filecheck_test("opaque.oir");
}

#[test]
fn test_flattening_filecheck() {
    run_filecheck_test("flattening.oir");
}

#[test]
fn test_apihiding_filecheck() {
    run_filecheck_test("apihiding.oir");
}

#[test]
fn test_string_filecheck() {
    run_filecheck_test("string.oir");
}

#[test]
fn test_outlining_filecheck() {
    run_filecheck_test("outlining.oir");
}

#[test]
fn test_all_filetests() {
    let files = discover_oir_files(&filetest_dir());
    assert!(files.len() >= 6, "expected the filetest directory to be populated");
    let mut failures = Vec::new();
    for path in &files {
        let contents = fs::read_to_string(path).unwrap();
        let spec = TestSpec::parse(&contents);
        if let Err(e) = TestRunner::new(false).run_test(&spec) {
            failures.push(format!("{}: {}", path.display(), e));
        }
    }
    assert!(failures.is_empty(), "failing filetests:\n{}", failures.join("\n"));
}

#[cfg(test)]
mod filecheck_internals {
    use super::*;

    #[test]
    fn test_check_directive_parsing() {
        let content = r#"; RUN: obfuscate --passes split
; CHECK: foo
; CHECK-LABEL: bar
; CHECK-NEXT: baz
; CHECK-EMPTY
; COM: comment
define @f() -> void {
entry:
  ret
}"#;

        let spec = TestSpec::parse(content);
        assert_eq!(spec.check_directives.len(), 5);
        assert_eq!(spec.check_directives[0], CheckDirective::Check("foo".to_string()));
        assert_eq!(spec.check_directives[1], CheckDirective::CheckLabel("bar".to_string()));
        assert_eq!(spec.check_directives[3], CheckDirective::CheckEmpty);
    }

    #[test]
    fn test_check_next_succeeds() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";
        let directives = vec![
            CheckDirective::CheckLabel("Line 1".to_string()),
            CheckDirective::CheckNext("Line 2".to_string()),
            CheckDirective::CheckSame("2".to_string()),
        ];

        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_failing_check_is_reported() {
        let content = r#"; RUN: obfuscate --passes split --seed 1
; CHECK: switch
define @f() -> void {
entry:
  ret
}"#;
        let spec = TestSpec::parse(content);
        let err = TestRunner::new(false).run_test(&spec).unwrap_err();
        assert!(err.to_string().contains("CHECK"));
    }
}
