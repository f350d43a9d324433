//! Sandboxed execution of TCL handler code
//!
//! Every execution gets a fresh `molt` interpreter on its own thread. With the
//! sandbox enabled the interpreter is stripped down to the configured command
//! allow-list, `puts` is redirected into bounded buffers, `package require` goes
//! through the module gate, and `after`, the loop commands and proc entry all
//! check the deadline so a runaway script winds its thread down on its own. The
//! caller waits for the thread no longer than the configured timeout.

use crate::sandbox::analyzer::CodeAnalyzer;
use crate::sandbox::config::{SandboxConfig, SandboxResult};
use crate::sandbox::parser::{self, ProcSignature};
use molt::types::{ContextID, Exception, MoltResult, ResultCode, Value};
use molt::{check_args, molt_err, molt_ok, Interp};
use serde_json::{Map, Value as JsonValue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Executes untrusted TCL under a [`SandboxConfig`]
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    analyzer: CodeAnalyzer,
    /// Execution threads still running, shared between clones
    running: Arc<AtomicUsize>,
}

/// Original `proc`, renamed so the sandboxed `proc` can wrap it
const PROC_DEFINE: &str = "_sandbox_proc";

/// Deadline check prepended to every sandboxed proc body
const DEADLINE_CHECK: &str = "_sandbox_deadline";

/// Counts a running execution thread until dropped
struct RunningGuard(Arc<AtomicUsize>);

impl RunningGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Work shipped to the execution thread
struct Job {
    code: String,
    bindings: Vec<(String, JsonValue)>,
    entry: Option<(String, Vec<JsonValue>)>,
    config: SandboxConfig,
    deadline: Instant,
}

/// What the execution thread reports back
struct Outcome {
    result: Result<Option<JsonValue>, String>,
    stdout: String,
    stderr: String,
    warnings: Vec<String>,
}

impl SandboxExecutor {
    /// Create an executor for the given configuration
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            analyzer: CodeAnalyzer::new(),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the analyzer (e.g. one with extra denied commands)
    pub fn with_analyzer(mut self, analyzer: CodeAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &CodeAnalyzer {
        &self.analyzer
    }

    /// Execution threads that have not finished yet, including timed-out ones
    pub fn running_threads(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Run `code` with `bindings` as global variables and optionally call `entry_point`
    pub fn execute(
        &self,
        code: &str,
        bindings: &Map<String, JsonValue>,
        entry_point: Option<&str>,
        entry_args: &Map<String, JsonValue>,
    ) -> SandboxResult {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.limits.timeout_ms);
        let deadline = start + timeout;
        let mut warnings = Vec::new();

        if self.config.enabled {
            let report = self.analyzer.analyze(code);
            if !report.is_clean() {
                warn!(issues = ?report.issues, "Sandbox rejected code during analysis");
                return SandboxResult::failure(
                    format!("Security violation: {}", report.issues.join("; ")),
                    elapsed_ms(start),
                    report.warnings,
                );
            }
            warnings.extend(report.warnings);
        }

        let entry = match entry_point {
            Some(name) => match resolve_entry(code, name, entry_args) {
                Ok(args) => Some((name.to_string(), args)),
                Err(e) => return SandboxResult::failure(e, elapsed_ms(start), warnings),
            },
            None => None,
        };

        let job = Job {
            code: code.to_string(),
            bindings: bindings.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            entry,
            config: self.config.clone(),
            deadline,
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let guard = RunningGuard::new(&self.running);
        let spawned = std::thread::Builder::new()
            .name("sandbox-exec".to_string())
            .spawn(move || {
                let _guard = guard;
                let outcome = run_job(job);
                let _ = tx.send(outcome);
            });

        if let Err(e) = spawned {
            return SandboxResult::failure(
                format!("Failed to start sandbox thread: {}", e),
                elapsed_ms(start),
                warnings,
            );
        }

        let outcome = match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = self.config.limits.timeout_ms, "Sandbox execution timed out");
                return SandboxResult::failure(
                    timeout_message(self.config.limits.timeout_ms),
                    elapsed_ms(start),
                    warnings,
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                return SandboxResult::failure(
                    "Sandbox thread terminated unexpectedly",
                    elapsed_ms(start),
                    warnings,
                );
            }
        };

        warnings.extend(outcome.warnings);
        let execution_time_ms = elapsed_ms(start);

        match outcome.result {
            Ok(result) => {
                debug!(execution_time_ms, "Sandbox execution succeeded");
                SandboxResult {
                    success: true,
                    result,
                    error: None,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    execution_time_ms,
                    memory_estimate_bytes: None,
                    warnings,
                }
            }
            Err(error) => {
                debug!(execution_time_ms, error = %error, "Sandbox execution failed");
                SandboxResult {
                    success: false,
                    result: None,
                    error: Some(error),
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    execution_time_ms,
                    memory_estimate_bytes: None,
                    warnings,
                }
            }
        }
    }
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

fn timeout_message(timeout_ms: u64) -> String {
    format!("Execution timeout: exceeded {}ms limit", timeout_ms)
}

/// Map named entry arguments onto the positional parameters of the entry proc
fn resolve_entry(code: &str, name: &str, args: &Map<String, JsonValue>) -> Result<Vec<JsonValue>, String> {
    let script = parser::parse(code).map_err(|e| format!("Syntax error at {}", e))?;
    let signature = parser::find_proc(&script, name)
        .ok_or_else(|| format!("Entry point '{}' is not defined", name))?;
    bind_entry_args(&signature, args)
}

pub(crate) fn bind_entry_args(
    signature: &ProcSignature,
    args: &Map<String, JsonValue>,
) -> Result<Vec<JsonValue>, String> {
    let fixed = if signature.variadic {
        &signature.params[..signature.params.len() - 1]
    } else {
        &signature.params[..]
    };

    for key in args.keys() {
        let known = fixed.iter().any(|p| &p.name == key) || (signature.variadic && key == "args");
        if !known {
            return Err(format!(
                "Entry point '{}' got an unexpected argument '{}'",
                signature.name, key
            ));
        }
    }

    let mut positional = Vec::with_capacity(fixed.len());
    for param in fixed {
        match (args.get(&param.name), &param.default) {
            (Some(value), _) => positional.push(value.clone()),
            (None, Some(default)) => positional.push(JsonValue::String(default.clone())),
            (None, None) => {
                return Err(format!(
                    "Entry point '{}' is missing required argument '{}'",
                    signature.name, param.name
                ))
            }
        }
    }

    if signature.variadic {
        match args.get("args") {
            Some(JsonValue::Array(rest)) => positional.extend(rest.iter().cloned()),
            Some(other) => positional.push(other.clone()),
            None => {}
        }
    }

    Ok(positional)
}

/// Convert JSON into a TCL value (objects become dicts)
pub fn json_to_molt(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::empty(),
        JsonValue::Bool(b) => Value::from(if *b { 1i64 } else { 0i64 }),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => Value::from(s.as_str()),
        JsonValue::Array(items) => Value::from(items.iter().map(json_to_molt).collect::<Vec<_>>()),
        JsonValue::Object(map) => {
            let mut pairs = Vec::with_capacity(map.len() * 2);
            for (key, value) in map {
                pairs.push(Value::from(key.as_str()));
                pairs.push(json_to_molt(value));
            }
            Value::from(pairs)
        }
    }
}

/// Convert a TCL value back into JSON: integers and floats become numbers
pub fn molt_to_json(value: &Value) -> JsonValue {
    if let Ok(i) = value.as_int() {
        return JsonValue::from(i);
    }
    if let Ok(f) = value.as_float() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return JsonValue::Number(n);
        }
    }
    JsonValue::String(value.as_str().to_string())
}

fn exception_message(exception: &Exception) -> String {
    exception.value().as_str().to_string()
}

fn run_job(job: Job) -> Outcome {
    let mut interp = Interp::new();
    interp.set_recursion_limit(job.config.limits.recursion_limit);

    let state_id = if job.config.enabled {
        // molt mirrors the host environment into `env`
        interp.unset("env");
        restrict_commands(&mut interp, &job.config);
        let state = SandboxState::new(&job.config, job.deadline);
        let id = interp.save_context(state);
        interp.add_context_command("puts", cmd_puts, id);
        interp.add_context_command("package", cmd_package, id);
        interp.add_context_command("after", cmd_after, id);
        install_deadline_guards(&mut interp, &job.config, id);
        Some(id)
    } else {
        None
    };

    let result = evaluate(&mut interp, &job);

    match state_id {
        Some(id) => {
            let state = interp.context::<SandboxState>(id);
            let (stdout, stderr, warnings) = state.finish();
            Outcome {
                result,
                stdout,
                stderr,
                warnings,
            }
        }
        None => Outcome {
            result,
            stdout: String::new(),
            stderr: String::new(),
            warnings: Vec::new(),
        },
    }
}

/// Drop every command that is not on the allow-list, plus the ones we replace
fn restrict_commands(interp: &mut Interp, config: &SandboxConfig) {
    let names: Vec<String> = interp
        .command_names()
        .iter()
        .map(|name| name.as_str().to_string())
        .collect();

    for name in names {
        let replaced = matches!(name.as_str(), "puts" | "package" | "after");
        if replaced || !config.is_command_allowed(&name) {
            interp.remove_command(&name);
        }
    }
}

/// Swap loops and `proc` for versions that stop at the deadline
fn install_deadline_guards(interp: &mut Interp, config: &SandboxConfig, id: ContextID) {
    let loops: [(&str, fn(&mut Interp, ContextID, &[Value]) -> MoltResult); 3] =
        [("while", cmd_while), ("for", cmd_for), ("foreach", cmd_foreach)];
    for (name, command) in loops {
        if interp.has_command(name) {
            interp.add_context_command(name, command, id);
        }
    }

    interp.add_context_command(DEADLINE_CHECK, cmd_deadline, id);
    if config.is_command_allowed("proc") && interp.has_command("proc") {
        interp.rename_command("proc", PROC_DEFINE);
        interp.add_context_command("proc", cmd_proc, id);
    }
}

fn evaluate(interp: &mut Interp, job: &Job) -> Result<Option<JsonValue>, String> {
    for (name, value) in &job.bindings {
        let command = Value::from(vec![Value::from("set"), Value::from(name.as_str()), json_to_molt(value)]);
        interp
            .eval_value(&command)
            .map_err(|e| format!("Failed to bind '{}': {}", name, exception_message(&e)))?;
    }

    if let Err(exception) = interp.eval(&job.code) {
        if exception.is_error() {
            return Err(exception_message(&exception));
        }
    }

    let Some((entry, args)) = &job.entry else {
        return Ok(None);
    };

    let mut call = Vec::with_capacity(args.len() + 1);
    call.push(Value::from(entry.as_str()));
    call.extend(args.iter().map(json_to_molt));

    match interp.eval_value(&Value::from(call)) {
        Ok(value) => Ok(Some(molt_to_json(&value))),
        Err(exception) if !exception.is_error() => Ok(Some(molt_to_json(&exception.value()))),
        Err(exception) => Err(exception_message(&exception)),
    }
}

/// Bounded capture buffer for one output stream
#[derive(Debug)]
struct OutputBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, s: &str) {
        if self.truncated {
            return;
        }

        let remaining = self.limit.saturating_sub(self.text.len());
        if s.len() <= remaining {
            self.text.push_str(s);
            return;
        }

        let mut cut = remaining;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.truncated = true;
    }

    fn finish(&mut self) -> String {
        let mut text = std::mem::take(&mut self.text);
        if self.truncated {
            text.push_str(&format!("\n... [output truncated at {} bytes]", self.limit));
        }
        text
    }
}

/// Per-execution state shared by the host-provided commands
struct SandboxState {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    config: SandboxConfig,
    deadline: Instant,
    warnings: Vec<String>,
}

impl SandboxState {
    fn new(config: &SandboxConfig, deadline: Instant) -> Self {
        Self {
            stdout: OutputBuffer::new(config.max_output_size),
            stderr: OutputBuffer::new(config.max_output_size),
            config: config.clone(),
            deadline,
            warnings: Vec::new(),
        }
    }

    fn finish(&mut self) -> (String, String, Vec<String>) {
        if self.stdout.truncated {
            self.warnings.push("stdout was truncated".to_string());
        }
        if self.stderr.truncated {
            self.warnings.push("stderr was truncated".to_string());
        }
        (
            self.stdout.finish(),
            self.stderr.finish(),
            std::mem::take(&mut self.warnings),
        )
    }
}

/// `puts ?-nonewline? ?channelId? string`
fn cmd_puts(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    let mut args: Vec<&str> = argv.iter().skip(1).map(|v| v.as_str()).collect();

    let newline = if args.first() == Some(&"-nonewline") {
        args.remove(0);
        false
    } else {
        true
    };

    let (channel, text) = match args.as_slice() {
        [text] => ("stdout", *text),
        [channel, text] => (*channel, *text),
        _ => return molt_err!("wrong # args: should be \"puts ?-nonewline? ?channelId? string\""),
    };

    let state = interp.context::<SandboxState>(context_id);
    let buffer = match channel {
        "stdout" => &mut state.stdout,
        "stderr" => &mut state.stderr,
        other => return molt_err!("can not find channel named \"{}\"", other),
    };

    buffer.push(text);
    if newline {
        buffer.push("\n");
    }

    molt_ok!()
}

/// `package require ?-exact? name ?version?`, admitted through the module gate
fn cmd_package(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    let args: Vec<&str> = argv.iter().skip(1).map(|v| v.as_str()).collect();

    match args.first() {
        Some(&"require") | Some(&"present") => {}
        _ => return molt_err!("package: only \"require\" and \"present\" are supported"),
    }

    let Some(module) = args.iter().skip(1).find(|a| !a.starts_with('-')) else {
        return molt_err!("wrong # args: should be \"package require ?-exact? package ?version?\"");
    };
    let module = module.to_string();

    let state = interp.context::<SandboxState>(context_id);
    match state.config.check_module(&module) {
        Ok(()) => {
            state.warnings.push(format!("module '{}' admitted", module));
            molt_ok!("1.0")
        }
        Err(reason) => molt_err!("Security violation: {}", reason),
    }
}

/// `after ms`: blocking sleep that never outlives the execution deadline
fn cmd_after(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    if argv.len() != 2 {
        return molt_err!("wrong # args: should be \"after ms\"");
    }
    let millis = argv[1].as_int()?;
    if millis < 0 {
        return molt_err!("after: negative delay {}", millis);
    }

    let state = interp.context::<SandboxState>(context_id);
    let deadline = state.deadline;
    let timeout_ms = state.config.limits.timeout_ms;

    let requested = Duration::from_millis(millis as u64);
    let remaining = deadline.saturating_duration_since(Instant::now());

    if requested > remaining {
        std::thread::sleep(remaining);
        return molt_err!("{}", timeout_message(timeout_ms));
    }

    std::thread::sleep(requested);
    molt_ok!()
}

fn check_deadline(interp: &mut Interp, context_id: ContextID) -> MoltResult {
    let state = interp.context::<SandboxState>(context_id);
    if Instant::now() >= state.deadline {
        let timeout_ms = state.config.limits.timeout_ms;
        return molt_err!("{}", timeout_message(timeout_ms));
    }
    molt_ok!()
}

/// Run one loop body; `Ok(true)` means `break`
fn loop_body(interp: &mut Interp, body: &Value) -> Result<bool, Exception> {
    match interp.eval_value(body) {
        Ok(_) => Ok(false),
        Err(exception) => match exception.code() {
            ResultCode::Break => Ok(true),
            ResultCode::Continue => Ok(false),
            _ => Err(exception),
        },
    }
}

fn cmd_deadline(interp: &mut Interp, context_id: ContextID, _argv: &[Value]) -> MoltResult {
    check_deadline(interp, context_id)
}

/// `while test command`
fn cmd_while(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 3, 3, "test command")?;

    loop {
        check_deadline(interp, context_id)?;
        if !interp.expr_bool(&argv[1])? || loop_body(interp, &argv[2])? {
            break;
        }
    }

    molt_ok!()
}

/// `for start test next command`
fn cmd_for(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 5, 5, "start test next command")?;

    interp.eval_value(&argv[1])?;
    loop {
        check_deadline(interp, context_id)?;
        if !interp.expr_bool(&argv[2])? || loop_body(interp, &argv[4])? {
            break;
        }
        if let Err(exception) = interp.eval_value(&argv[3]) {
            match exception.code() {
                ResultCode::Break => break,
                ResultCode::Continue => return molt_err!("invoked \"continue\" outside of a loop"),
                _ => return Err(exception),
            }
        }
    }

    molt_ok!()
}

/// `foreach varList list body`
fn cmd_foreach(interp: &mut Interp, context_id: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "varList list body")?;

    let var_list = argv[1].as_list()?;
    let list = argv[2].as_list()?;

    let mut i = 0;
    while i < list.len() {
        check_deadline(interp, context_id)?;
        for var in var_list.iter() {
            let value = list.get(i).cloned().unwrap_or_else(Value::empty);
            interp.set_var(var, value)?;
            i += 1;
        }
        if loop_body(interp, &argv[3])? {
            break;
        }
    }

    molt_ok!()
}

/// `proc name args body`, with a deadline check on every call
fn cmd_proc(interp: &mut Interp, _context_id: ContextID, argv: &[Value]) -> MoltResult {
    check_args(1, argv, 4, 4, "name args body")?;

    let body = format!("{}\n{}", DEADLINE_CHECK, argv[3].as_str());
    let define = vec![
        Value::from(PROC_DEFINE),
        argv[1].clone(),
        argv[2].clone(),
        Value::from(body),
    ];
    interp.eval_value(&Value::from(define))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: JsonValue) -> Map<String, JsonValue> {
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_plain_code_succeeds_without_result() {
        let executor = SandboxExecutor::default();
        let result = executor.execute("set x 1\nincr x", &Map::new(), None, &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert!(result.result.is_none());
    }

    #[test]
    fn test_entry_point_with_named_args() {
        let executor = SandboxExecutor::default();
        let code = "proc add {a b} { return [expr {$a + $b}] }";
        let result = executor.execute(code, &Map::new(), Some("add"), &args(json!({"a": 5, "b": 3})));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(8)));
    }

    #[test]
    fn test_entry_point_defaults_and_errors() {
        let executor = SandboxExecutor::default();
        let code = "proc greet {name {greeting hello}} { return \"$greeting $name\" }";

        let result = executor.execute(code, &Map::new(), Some("greet"), &args(json!({"name": "ada"})));
        assert_eq!(result.result, Some(json!("hello ada")));

        let result = executor.execute(code, &Map::new(), Some("greet"), &args(json!({"nom": "ada"})));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unexpected argument 'nom'"));

        let result = executor.execute(code, &Map::new(), Some("missing"), &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not defined"));
    }

    #[test]
    fn test_bindings_are_visible() {
        let executor = SandboxExecutor::default();
        let code = "proc total {} { return 0 }\nset doubled [expr {$count * 2}]\nputs $doubled";
        let result = executor.execute(code, &args(json!({"count": 21})), None, &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stdout, "42\n");
    }

    #[test]
    fn test_analysis_blocks_execution() {
        let executor = SandboxExecutor::default();
        let result = executor.execute("exec rm -rf /", &Map::new(), None, &Map::new());
        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.starts_with("Security violation"));
        assert!(error.contains("'exec'"));
    }

    #[test]
    fn test_removed_commands_unavailable_at_runtime() {
        let executor = SandboxExecutor::default();
        // name built at run time slips past the analyzer but not the command table
        let result = executor.execute("set c ex\nappend c it\n$c 1", &Map::new(), None, &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exit"));
    }

    #[test]
    fn test_module_gate() {
        let executor = SandboxExecutor::default();

        let result = executor.execute("package require json", &Map::new(), None, &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert!(result.warnings.iter().any(|w| w.contains("module 'json' admitted")));

        let result = executor.execute("package require http", &Map::new(), None, &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("module 'http' is blocked"));
    }

    #[test]
    fn test_output_capture_and_truncation() {
        let executor = SandboxExecutor::new(SandboxConfig::default().with_max_output_size(8));
        let code = "puts -nonewline abcdefghijkl\nputs stderr oops";
        let result = executor.execute(code, &Map::new(), None, &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert!(result.stdout.starts_with("abcdefgh\n... [output truncated"));
        assert_eq!(result.stderr, "oops\n");
        assert!(result.warnings.iter().any(|w| w.contains("stdout was truncated")));
    }

    #[test]
    fn test_timeout() {
        let executor = SandboxExecutor::new(SandboxConfig::default().with_timeout_ms(100));
        let code = "proc slow {} { after 2000; return done }";
        let result = executor.execute(code, &Map::new(), Some("slow"), &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
        assert!(result.execution_time_ms >= 100.0);
    }

    #[test]
    fn test_runaway_scripts_stop_at_deadline() {
        let executor = SandboxExecutor::new(SandboxConfig::default().with_timeout_ms(100));
        let scripts = [
            "while {1} {}",
            "for {set i 0} {1} {incr i} {}",
            "foreach x {1 2 3} { while {1} { catch {after 1} } }",
            "proc fan {} { catch {fan}; catch {fan} }\nfan",
        ];

        for code in scripts {
            let result = executor.execute(code, &Map::new(), None, &Map::new());
            assert!(result.execution_time_ms >= 100.0, "{} returned early", code);
        }

        let waited = Instant::now();
        while executor.running_threads() > 0 && waited.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(executor.running_threads(), 0);
    }

    #[test]
    fn test_loop_timeout_reports_error() {
        let executor = SandboxExecutor::new(SandboxConfig::default().with_timeout_ms(100));
        let code = "proc busy {} { while {1} {} }";
        let result = executor.execute(code, &Map::new(), Some("busy"), &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[test]
    fn test_host_environment_hidden() {
        std::env::set_var("TCL_PLUGIN_HOST_TEST_SECRET", "hunter2");

        // the analyzer rejects direct references
        let executor = SandboxExecutor::default();
        let result = executor.execute("puts [set env(TCL_PLUGIN_HOST_TEST_SECRET)]", &Map::new(), None, &Map::new());
        assert!(!result.success);
        assert!(result.error.unwrap().contains("'env'"));

        // a name assembled at run time finds nothing
        let code = "set name en\nappend name v\nset found [array exists $name]\nputs $found";
        let result = executor.execute(code, &Map::new(), None, &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.stdout, "0\n");
        assert!(!result.stdout.contains("hunter2"));
    }

    #[test]
    fn test_loops_and_procs_still_work() {
        let executor = SandboxExecutor::default();
        let code = r#"
proc total {items} {
    set sum 0
    foreach {a b} $items { incr sum [expr {$a * $b}] }
    for {set i 0} {$i < 3} {incr i} {
        if {$i == 1} { continue }
        incr sum
    }
    set n 0
    while {1} { incr n; if {$n >= 4} { break } }
    return [expr {$sum + $n}]
}
"#;
        let result = executor.execute(code, &Map::new(), Some("total"), &args(json!({"items": [1, 2, 3, 4]})));
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(20)));
    }

    #[test]
    fn test_runtime_error_is_captured() {
        let executor = SandboxExecutor::default();
        let result = executor.execute("error {boom}", &Map::new(), None, &Map::new());
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(result.execution_time_ms >= 0.0);
    }

    #[test]
    fn test_disabled_sandbox_skips_analysis() {
        let executor = SandboxExecutor::new(SandboxConfig::disabled());
        let code = "proc lookup_missing {} { return [info exists nothing] }";
        let result = executor.execute(code, &Map::new(), Some("lookup_missing"), &Map::new());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(0)));
    }

    #[test]
    fn test_json_conversion() {
        let value = json_to_molt(&json!({"name": "ada", "tags": ["a", "b c"]}));
        assert_eq!(value.as_str(), "name ada tags {a {b c}}");
        assert_eq!(molt_to_json(&Value::from("3.5")), json!(3.5));
        assert_eq!(molt_to_json(&Value::from("text")), json!("text"));
    }
}
