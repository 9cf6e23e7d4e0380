// FileCheck-style checking of printed IR. A test file is ordinary `.oir` text whose
// comment lines carry directives: `; RUN:` lines say which passes to run (and with which
// seed and settings), `; CHECK:` family lines describe the printed module that must come
// out. The runner parses the remaining text as a module, runs the pipeline once per RUN
// line, prints the result and matches the directives against it line by line.

//! FileCheck-style test validation for `.oir` files.
//!
//! Supported directives:
//! - `; RUN: obfuscate [--passes a,b] [--seed N] [--set pass.key=value] [--exec fn [args]]`
//! - `; CHECK:`, `; CHECK-LABEL:`, `; CHECK-NEXT:`, `; CHECK-SAME:`, `; CHECK-NOT:`,
//!   `; CHECK-EMPTY`
//! - `; COM:` comments, ignored
//!
//! Patterns are plain substrings.

use crate::core::PipelineConfig;
use crate::interp::Interpreter;
use crate::ir::Module;
use crate::pipeline::Pipeline;
use thiserror::Error;

/// A CHECK directive extracted from a test file
#[derive(Debug, Clone, PartialEq)]
pub enum CheckDirective {
    /// CHECK: pattern - match on this or any later line
    Check(String),
    /// CHECK-LABEL: pattern - start of a section
    CheckLabel(String),
    /// CHECK-NEXT: pattern - match on the line right after the previous match
    CheckNext(String),
    /// CHECK-SAME: pattern - match on the same line as the previous match
    CheckSame(String),
    /// CHECK-NOT: pattern - must not occur before the next positive match
    CheckNot(String),
    /// CHECK-EMPTY - the next line is blank
    CheckEmpty,
    /// COM: comment, ignored
    Comment(String),
}

/// A RUN directive: the tool name and its arguments
#[derive(Debug, Clone, PartialEq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckError {
    #[error("no RUN directive")]
    NoRun,

    #[error("unsupported RUN command '{0}'")]
    UnknownCommand(String),

    #[error("bad RUN argument: {0}")]
    BadArgument(String),

    #[error("input does not parse: {0}")]
    Parse(String),

    #[error("pipeline rejected configuration: {0}")]
    Config(String),

    #[error("pipeline reported failures: {0}")]
    Failures(String),

    #[error("execution trapped: {0}")]
    Exec(String),

    #[error("{directive}: {message}")]
    Mismatch { directive: &'static str, message: String },
}

/// Test specification extracted from a file
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub ir_content: String,
}

impl TestSpec {
    /// Split a test file into directives and IR text.
    pub fn parse(content: &str) -> Self {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();
        let mut ir_lines = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix("; RUN:") {
                let mut parts = rest.split_whitespace().map(str::to_string);
                if let Some(command) = parts.next() {
                    run_directives.push(RunDirective {
                        command,
                        args: parts.collect(),
                    });
                }
            } else if let Some(rest) = trimmed.strip_prefix("; CHECK-LABEL:") {
                check_directives.push(CheckDirective::CheckLabel(rest.trim().to_string()));
            } else if let Some(rest) = trimmed.strip_prefix("; CHECK-NEXT:") {
                check_directives.push(CheckDirective::CheckNext(rest.trim().to_string()));
            } else if let Some(rest) = trimmed.strip_prefix("; CHECK-SAME:") {
                check_directives.push(CheckDirective::CheckSame(rest.trim().to_string()));
            } else if let Some(rest) = trimmed.strip_prefix("; CHECK-NOT:") {
                check_directives.push(CheckDirective::CheckNot(rest.trim().to_string()));
            } else if trimmed.starts_with("; CHECK-EMPTY") {
                check_directives.push(CheckDirective::CheckEmpty);
            } else if let Some(rest) = trimmed.strip_prefix("; CHECK:") {
                check_directives.push(CheckDirective::Check(rest.trim().to_string()));
            } else if let Some(rest) = trimmed.strip_prefix("; COM:") {
                check_directives.push(CheckDirective::Comment(rest.trim().to_string()));
            } else {
                ir_lines.push(line);
            }
        }

        TestSpec {
            run_directives,
            check_directives,
            ir_content: ir_lines.join("\n"),
        }
    }
}

/// What one RUN line asks for.
#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    config: PipelineConfig,
    exec: Option<(String, Vec<u64>)>,
}

impl Invocation {
    fn from_args(args: &[String]) -> Result<Self, CheckError> {
        let mut config = PipelineConfig::new(0);
        config.jobs = 1;
        let mut exec = None;
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| CheckError::BadArgument(format!("{flag} needs a value")))
            };
            match arg.as_str() {
                "%s" => {}
                "--passes" => {
                    for name in value("--passes")?.split(',').filter(|n| !n.is_empty()) {
                        config
                            .enable(name)
                            .map_err(|e| CheckError::Config(e.to_string()))?;
                    }
                }
                "--seed" => {
                    let seed = value("--seed")?;
                    config.seed = seed
                        .parse()
                        .map_err(|_| CheckError::BadArgument(format!("seed '{seed}'")))?;
                }
                "--set" => {
                    config
                        .apply_setting(&value("--set")?)
                        .map_err(|e| CheckError::Config(e.to_string()))?;
                }
                "--no-verify-each" => config.verify_each = false,
                "--exec" => {
                    let name = value("--exec")?;
                    // Remaining arguments are the call arguments.
                    let mut call_args = Vec::new();
                    for a in iter.by_ref() {
                        call_args.push(
                            a.parse::<i64>()
                                .map_err(|_| CheckError::BadArgument(format!("exec argument '{a}'")))?
                                as u64,
                        );
                    }
                    exec = Some((name, call_args));
                }
                other => return Err(CheckError::BadArgument(other.to_string())),
            }
        }
        Ok(Self { config, exec })
    }
}

/// Runs test files and validates output
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Run every RUN line of a test and check its output.
    pub fn run_test(&self, spec: &TestSpec) -> Result<(), CheckError> {
        if spec.run_directives.is_empty() {
            return Err(CheckError::NoRun);
        }
        for run in &spec.run_directives {
            let output = self.execute_command(&spec.ir_content, run)?;
            if self.verbose {
                log::debug!("output of {} {:?}:\n{}", run.command, run.args, output);
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Run the pipeline for one RUN line and render what it produced.
    pub fn execute_command(&self, ir: &str, run: &RunDirective) -> Result<String, CheckError> {
        if run.command != "obfuscate" {
            return Err(CheckError::UnknownCommand(run.command.clone()));
        }
        let invocation = Invocation::from_args(&run.args)?;
        let pipeline =
            Pipeline::new(invocation.config).map_err(|e| CheckError::Config(e.to_string()))?;
        let mut module = Module::parse(ir).map_err(|e| CheckError::Parse(e.to_string()))?;
        let report = pipeline.run(&mut module);
        if !report.is_clean() {
            let failures: Vec<String> = report.failures.iter().map(|f| f.to_string()).collect();
            return Err(CheckError::Failures(failures.join("; ")));
        }

        let mut output = module.to_string();
        if let Some((name, args)) = &invocation.exec {
            let mut interp = Interpreter::new(&module);
            let result = interp
                .call(name, args)
                .map_err(|e| CheckError::Exec(e.to_string()))?;
            if !output.ends_with('\n') {
                output.push('\n');
            }
            match result.value {
                Some(v) => output.push_str(&format!("exec {name} -> {}\n", v as i64)),
                None => output.push_str(&format!("exec {name} -> void\n")),
            }
            for line in result.stdout().lines() {
                output.push_str(&format!("stdout: {line}\n"));
            }
        }
        Ok(output)
    }

    /// Validate output against CHECK directives
    pub fn validate_output(
        &self,
        output: &str,
        directives: &[CheckDirective],
    ) -> Result<(), CheckError> {
        let lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&str> = Vec::new();

        for directive in directives {
            match directive {
                CheckDirective::Comment(_) => continue,

                CheckDirective::CheckNot(pattern) => pending_not.push(pattern),

                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => {
                    let name = if matches!(directive, CheckDirective::Check(_)) {
                        "CHECK"
                    } else {
                        "CHECK-LABEL"
                    };
                    let found = lines[line_idx.min(lines.len())..]
                        .iter()
                        .position(|line| line.contains(pattern.as_str()))
                        .ok_or_else(|| CheckError::Mismatch {
                            directive: name,
                            message: format!("pattern '{pattern}' not found"),
                        })?;
                    check_absent(&lines[line_idx..line_idx + found], &pending_not)?;
                    pending_not.clear();
                    line_idx += found + 1;
                    if self.verbose {
                        log::trace!("{name}: '{pattern}' found at line {}", line_idx - 1);
                    }
                }

                CheckDirective::CheckNext(pattern) => {
                    let line = lines.get(line_idx).ok_or_else(|| CheckError::Mismatch {
                        directive: "CHECK-NEXT",
                        message: format!("no more lines, expected '{pattern}'"),
                    })?;
                    if !line.contains(pattern.as_str()) {
                        return Err(CheckError::Mismatch {
                            directive: "CHECK-NEXT",
                            message: format!("expected '{pattern}' but got '{line}'"),
                        });
                    }
                    pending_not.clear();
                    line_idx += 1;
                }

                CheckDirective::CheckSame(pattern) => {
                    let line = line_idx
                        .checked_sub(1)
                        .and_then(|i| lines.get(i))
                        .ok_or_else(|| CheckError::Mismatch {
                            directive: "CHECK-SAME",
                            message: format!("no previous match for '{pattern}'"),
                        })?;
                    if !line.contains(pattern.as_str()) {
                        return Err(CheckError::Mismatch {
                            directive: "CHECK-SAME",
                            message: format!("expected '{pattern}' in '{line}'"),
                        });
                    }
                }

                CheckDirective::CheckEmpty => {
                    // End of output counts as empty.
                    if let Some(line) = lines.get(line_idx) {
                        if !line.trim().is_empty() {
                            return Err(CheckError::Mismatch {
                                directive: "CHECK-EMPTY",
                                message: format!("expected empty line but got '{line}'"),
                            });
                        }
                        line_idx += 1;
                    }
                }
            }
        }

        check_absent(&lines[line_idx.min(lines.len())..], &pending_not)
    }
}

fn check_absent(lines: &[&str], patterns: &[&str]) -> Result<(), CheckError> {
    for pattern in patterns {
        if let Some(line) = lines.iter().find(|l| l.contains(pattern)) {
            return Err(CheckError::Mismatch {
                directive: "CHECK-NOT",
                message: format!("'{pattern}' found in '{line}'"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = r#"; RUN: obfuscate --passes split --seed 3 %s
; CHECK-LABEL: define @f
; CHECK-NEXT: entry:
; CHECK-NOT: switch
; COM: split never adds a dispatcher
define @f() -> i32 {
entry:
  %a = const i32 1
  ret %a
}"#;

        let spec = TestSpec::parse(content);
        assert_eq!(spec.run_directives.len(), 1);
        assert_eq!(spec.run_directives[0].command, "obfuscate");
        assert_eq!(spec.run_directives[0].args.len(), 5);
        assert_eq!(spec.check_directives.len(), 4);
        assert!(spec.ir_content.contains("define @f"));
        assert!(!spec.ir_content.contains("CHECK"));
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "module \"m\"\ndefine @f() -> i32 {\nentry:\n  ret %a\n}\n";

        let directives = vec![
            CheckDirective::Check("module".to_string()),
            CheckDirective::CheckLabel("define @f".to_string()),
            CheckDirective::CheckNext("entry:".to_string()),
            CheckDirective::CheckNot("switch".to_string()),
            CheckDirective::Check("ret".to_string()),
        ];

        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_next_failure() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";

        let directives = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNext("Line 3".to_string()),
        ];

        let err = runner.validate_output(output, &directives).unwrap_err();
        assert!(matches!(err, CheckError::Mismatch { directive: "CHECK-NEXT", .. }));
    }

    #[test]
    fn test_check_not_scoped_between_matches() {
        let runner = TestRunner::new(false);
        let output = "a\nbad\nb\nc\n";

        let scoped = vec![
            CheckDirective::Check("b".to_string()),
            CheckDirective::CheckNot("bad".to_string()),
            CheckDirective::Check("c".to_string()),
        ];
        // "bad" itself matches "b" first, so the NOT window is "b".."c".
        runner.validate_output(output, &scoped).unwrap();

        let failing = vec![
            CheckDirective::Check("a".to_string()),
            CheckDirective::CheckNot("bad".to_string()),
            CheckDirective::Check("c".to_string()),
        ];
        let err = runner.validate_output(output, &failing).unwrap_err();
        assert!(matches!(err, CheckError::Mismatch { directive: "CHECK-NOT", .. }));
    }

    #[test]
    fn test_run_with_exec() {
        let content = r#"; RUN: obfuscate --seed 1 --exec f 5
; CHECK: exec f -> 6
define @f(%x: i32) -> i32 {
entry:
  %one = const i32 1
  %r = add i32 %x, %one
  ret %r
}"#;
        let spec = TestSpec::parse(content);
        TestRunner::new(false).run_test(&spec).unwrap();
    }

    #[test]
    fn test_bad_arguments() {
        let err = Invocation::from_args(&["--passes".to_string(), "nope".to_string()]).unwrap_err();
        assert!(matches!(err, CheckError::Config(_)));
        let err = Invocation::from_args(&["--frobnicate".to_string()]).unwrap_err();
        assert!(matches!(err, CheckError::BadArgument(_)));
    }
}
