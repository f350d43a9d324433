//! Static analysis of handler source before it is allowed to run
//!
//! The analyzer walks every command invocation it can see statically (top level,
//! `[...]` substitutions, control-structure bodies, `expr` conditions) and flags
//! commands and variable names from fixed deny-lists. Module imports are only
//! recorded; admission is decided at run time by the executor's module gate.

use crate::sandbox::parser::{self, Command, Part, Script, Word};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Commands that may never appear in handler code, with the capability they expose
pub const DENIED_COMMANDS: &[(&str, &str)] = &[
    ("eval", "dynamic evaluation"),
    ("subst", "dynamic evaluation"),
    ("uplevel", "dynamic execution in caller scope"),
    ("namespace", "dynamic evaluation"),
    ("exec", "process execution"),
    ("exit", "process exit"),
    ("interp", "dynamic compilation"),
    ("apply", "dynamic compilation"),
    ("open", "raw file access"),
    ("file", "raw file access"),
    ("glob", "raw file access"),
    ("cd", "raw file access"),
    ("pwd", "raw file access"),
    ("chan", "raw file access"),
    ("fconfigure", "raw file access"),
    ("fileevent", "raw file access"),
    ("close", "raw file access"),
    ("seek", "raw file access"),
    ("flush", "raw file access"),
    ("gets", "raw input"),
    ("read", "raw input"),
    ("socket", "raw network access"),
    ("vwait", "event loop access"),
    ("source", "dynamic import"),
    ("load", "dynamic import"),
    ("auto_load", "dynamic import"),
    ("info", "scope introspection"),
    ("global", "scope introspection"),
    ("upvar", "scope introspection"),
    ("variable", "scope introspection"),
    ("rename", "command redefinition"),
    ("trace", "command redefinition"),
    ("unknown", "command redefinition"),
    ("breakpoint", "debugger access"),
    ("pdump", "interpreter internals"),
    ("pclear", "interpreter internals"),
    ("_sandbox_proc", "interpreter internals"),
];

/// Variable and namespace names that reveal host or interpreter internals
pub const DENIED_NAMES: &[&str] = &[
    "env",
    "tcl_platform",
    "tcl_library",
    "tcl_pkgPath",
    "auto_path",
    "auto_index",
    "argv",
    "argv0",
    "argc",
    "errorInfo",
    "errorCode",
    "tcl_interactive",
    "tcl_rcFileName",
];

const MAX_NESTING: usize = 64;

/// Outcome of analyzing one piece of source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Hard failures; code with issues must not run
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    /// Modules named by `package require`
    pub imports: Vec<String>,
}

impl AnalysisReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Static analyzer for TCL handler code
#[derive(Debug, Clone)]
pub struct CodeAnalyzer {
    denied_commands: HashMap<String, String>,
    denied_names: Vec<String>,
}

impl CodeAnalyzer {
    /// Create an analyzer with the default deny-lists
    pub fn new() -> Self {
        Self {
            denied_commands: DENIED_COMMANDS
                .iter()
                .map(|(name, reason)| (name.to_string(), reason.to_string()))
                .collect(),
            denied_names: DENIED_NAMES.iter().map(|n| n.to_string()).collect(),
        }
    }

    /// Add a command to the deny-list
    pub fn deny_command(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.denied_commands.insert(name.into(), reason.into());
        self
    }

    /// Analyze `code`; a parse failure is reported as the only issue
    pub fn analyze(&self, code: &str) -> AnalysisReport {
        let mut report = AnalysisReport::default();

        match parser::parse(code) {
            Ok(script) => self.walk_script(&script, 1, 0, &mut report),
            Err(e) => report.issues.push(format!("Syntax error at {}", e)),
        }

        report
    }

    /// Read-only validity check: `(is_valid, issues)`
    pub fn validate(&self, code: &str) -> (bool, Vec<String>) {
        let report = self.analyze(code);
        (report.issues.is_empty(), report.issues)
    }

    fn walk_script(&self, script: &Script, base_line: usize, depth: usize, report: &mut AnalysisReport) {
        if depth > MAX_NESTING {
            report
                .issues
                .push(format!("Line {}: nesting deeper than {} levels", base_line, MAX_NESTING));
            return;
        }

        for command in &script.commands {
            self.walk_command(command, base_line, depth, report);
        }
    }

    fn walk_command(&self, command: &Command, base_line: usize, depth: usize, report: &mut AnalysisReport) {
        let line = base_line + command.line - 1;

        let name = command.name();
        match &name {
            Some(name) => self.check_command(name, line, report),
            None => report.warnings.push(format!(
                "Line {}: dynamic command name cannot be verified statically",
                line
            )),
        }

        for word in &command.words {
            self.walk_parts(&word.parts, base_line + word.line - 1, depth, report);
        }

        let Some(name) = name else {
            return;
        };

        for target in variable_targets(&name, command) {
            self.check_name(&target, line, report);
        }

        let words = &command.words;
        match name.as_str() {
            "proc" => {
                if let Some(body) = words.get(3) {
                    self.walk_body(body, base_line, depth, report);
                }
            }
            "if" => self.walk_if(command, base_line, depth, report),
            "while" => {
                if let Some(condition) = words.get(1) {
                    self.walk_expression(condition, base_line, report, depth);
                }
                if let Some(body) = words.get(2) {
                    self.walk_body(body, base_line, depth, report);
                }
            }
            "for" => {
                for (index, word) in words.iter().enumerate().skip(1) {
                    if index == 2 {
                        self.walk_expression(word, base_line, report, depth);
                    } else {
                        self.walk_body(word, base_line, depth, report);
                    }
                }
            }
            "foreach" => {
                if words.len() > 3 {
                    if let Some(body) = words.last() {
                        self.walk_body(body, base_line, depth, report);
                    }
                }
            }
            "catch" | "time" => {
                if let Some(body) = words.get(1) {
                    self.walk_body(body, base_line, depth, report);
                }
            }
            "expr" => {
                for word in words.iter().skip(1) {
                    self.walk_expression(word, base_line, report, depth);
                }
            }
            "dict" => {
                let sub = command.literal_arg(1).unwrap_or_default();
                if matches!(sub.as_str(), "for" | "map" | "update" | "with") {
                    if let Some(body) = words.last() {
                        self.walk_body(body, base_line, depth, report);
                    }
                }
            }
            "package" => {
                if command.literal_arg(1).as_deref() == Some("require") {
                    let module = words
                        .iter()
                        .skip(2)
                        .filter_map(Word::literal)
                        .find(|w| !w.starts_with('-'));
                    match module {
                        Some(module) => {
                            report.warnings.push(format!(
                                "Line {}: imports module '{}' (admission checked at run time)",
                                line, module
                            ));
                            report.imports.push(module);
                        }
                        None => report.warnings.push(format!(
                            "Line {}: dynamic module import cannot be verified statically",
                            line
                        )),
                    }
                }
            }
            _ => {}
        }
    }

    fn walk_if(&self, command: &Command, base_line: usize, depth: usize, report: &mut AnalysisReport) {
        let words = &command.words;
        let mut i = 1;

        if let Some(condition) = words.get(i) {
            self.walk_expression(condition, base_line, report, depth);
        }
        i += 1;

        while i < words.len() {
            if command.literal_arg(i).as_deref() == Some("then") {
                i += 1;
            }
            if let Some(body) = words.get(i) {
                self.walk_body(body, base_line, depth, report);
            }
            i += 1;

            match command.literal_arg(i).as_deref() {
                Some("elseif") => {
                    if let Some(condition) = words.get(i + 1) {
                        self.walk_expression(condition, base_line, report, depth);
                    }
                    i += 2;
                }
                Some("else") => {
                    if let Some(body) = words.get(i + 1) {
                        self.walk_body(body, base_line, depth, report);
                    }
                    break;
                }
                _ => {
                    if let Some(body) = words.get(i) {
                        self.walk_body(body, base_line, depth, report);
                    }
                    break;
                }
            }
        }
    }

    /// Braced word in script position: parse and walk it as a script
    fn walk_body(&self, word: &Word, base_line: usize, depth: usize, report: &mut AnalysisReport) {
        if !word.is_braced() {
            return;
        }
        let line = base_line + word.line - 1;

        match parser::parse(&word.text) {
            Ok(script) => self.walk_script(&script, line, depth + 1, report),
            Err(e) => report.issues.push(format!(
                "Syntax error in body at line {}: {}",
                line + e.line - 1,
                e.message
            )),
        }
    }

    /// Braced word in expression position: walk its substitutions
    fn walk_expression(&self, word: &Word, base_line: usize, report: &mut AnalysisReport, depth: usize) {
        if !word.is_braced() {
            return;
        }
        let line = base_line + word.line - 1;

        match parser::parse_substitutions(&word.text) {
            Ok(parts) => self.walk_parts(&parts, line, depth + 1, report),
            Err(e) => report.issues.push(format!(
                "Syntax error in expression at line {}: {}",
                line + e.line - 1,
                e.message
            )),
        }
    }

    fn walk_parts(&self, parts: &[Part], line: usize, depth: usize, report: &mut AnalysisReport) {
        for part in parts {
            match part {
                Part::Literal(_) => {}
                Part::Variable { name, index } => {
                    self.check_name(name, line, report);
                    if let Some(index) = index {
                        self.walk_parts(index, line, depth, report);
                    }
                }
                Part::Command(script) => self.walk_script(script, line, depth + 1, report),
            }
        }
    }

    fn check_command(&self, name: &str, line: usize, report: &mut AnalysisReport) {
        if let Some(reason) = self.denied_commands.get(name) {
            report.issues.push(format!(
                "Line {}: call to '{}' is not allowed ({})",
                line, name, reason
            ));
        }
        if name.contains("::") {
            self.check_name(name, line, report);
        }
    }

    fn check_name(&self, name: &str, line: usize, report: &mut AnalysisReport) {
        for segment in name.split("::").filter(|s| !s.is_empty()) {
            if self.denied_names.iter().any(|denied| denied == segment) {
                report.issues.push(format!(
                    "Line {}: access to '{}' is not allowed (reveals interpreter internals)",
                    line, segment
                ));
            }
        }
    }
}

/// Variable names a command reads or writes by name rather than by `$` substitution
fn variable_targets(name: &str, command: &Command) -> Vec<String> {
    let words = &command.words;
    let indexes: Vec<usize> = match name {
        "set" | "append" | "lappend" | "incr" => vec![1],
        "unset" => (1..words.len())
            .filter(|&i| !matches!(command.literal_arg(i).as_deref(), Some("-nocomplain") | Some("--")))
            .collect(),
        "array" => vec![2],
        "dict" => match command.literal_arg(1).as_deref() {
            Some("set" | "unset" | "append" | "lappend" | "incr" | "update" | "with") => vec![2],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    indexes
        .into_iter()
        .filter_map(|i| words.get(i))
        .filter_map(variable_prefix)
        .collect()
}

/// Leading literal text of a variable-name word, without any array index
fn variable_prefix(word: &Word) -> Option<String> {
    let text = if word.is_braced() {
        word.text.clone()
    } else {
        word.parts
            .iter()
            .map_while(|part| match part {
                Part::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    };

    let base = text.split('(').next().unwrap_or_default();
    (!base.is_empty()).then(|| base.to_string())
}

impl Default for CodeAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}
