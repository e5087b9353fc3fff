//! Sandboxed Lua execution for model-authored scripts.
//!
//! Every call to [`Sandbox::execute`] builds a brand new interpreter, so no state
//! survives between scripts. The only host capability exposed to a script is
//! `print`, which appends one record per call to a capture buffer.
//!
//! # Exposed environment
//!
//! - Lua base functions, minus `dofile`, `loadfile`, `load`, `require` and `collectgarbage`
//! - The `table`, `string`, `math` and `utf8` libraries
//! - `print(...)` - arguments are converted with `tostring` and joined with a tab
//!
//! There is no `io`, `os`, `package` or `debug` library.
//!
//! # Budgets
//!
//! Scripts are stopped when they exceed the wall-clock timeout, the instruction
//! budget or the memory limit from [`SandboxLimits`]. Budget exhaustion is
//! sticky: `pcall` and `xpcall` are wrapped so that a script cannot catch the
//! budget error and keep running.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use mlua::{
    Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Value, Variadic, VmState,
};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default wall-clock budget for a script.
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Default number of VM instructions a script may execute.
pub const DEFAULT_INSTRUCTION_LIMIT: u64 = 10_000_000;

/// Default interpreter memory limit (64MB).
pub const DEFAULT_MEMORY_LIMIT: usize = 64 * 1024 * 1024;

/// Maximum output size to capture from a script (64KB).
pub const DEFAULT_MAX_OUTPUT: usize = 64 * 1024;

/// The instruction hook fires every this many VM instructions.
const HOOK_INTERVAL: u32 = 1_000;

/// Slack given to the blocking task beyond the in-interpreter deadline.
const JOIN_GRACE: Duration = Duration::from_millis(500);

const TRUNCATION_MARKER: &str = "\n[output truncated]";

const REMOVED_GLOBALS: [&str; 5] = ["dofile", "loadfile", "load", "require", "collectgarbage"];

/// Protected-call builtins that must not swallow budget errors.
const GUARDED_CALLS: [&str; 2] = ["pcall", "xpcall"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub instruction_limit: u64,
    pub memory_limit: usize,
    pub max_output: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

/// Outcome of one script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Everything the script printed, possibly empty.
    Output(String),
    /// The interpreter's error message.
    Error(String),
}

impl ExecutionResult {
    pub fn is_error(&self) -> bool {
        matches!(self, ExecutionResult::Error(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("{}", describe_lua_error(.0))]
    Lua(#[from] mlua::Error),
    #[error("{0}")]
    Script(String),
    #[error("script task failed: {0}")]
    Join(String),
    #[error("script timed out after {0}ms")]
    TimedOut(u128),
}

/// Factory for isolated interpreters sharing one set of limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Runs `code` in a fresh interpreter on the blocking pool.
    pub async fn execute(&self, code: &str) -> ExecutionResult {
        let start = Instant::now();
        let limits = self.limits;
        let code = code.to_string();

        // mlua errors are not Send, so they are rendered on the blocking thread.
        let execution = tokio::task::spawn_blocking(move || {
            run_script(&code, &limits).map_err(|err| err.to_string())
        });

        let result = match timeout(limits.timeout + JOIN_GRACE, execution).await {
            Ok(Ok(result)) => result.map_err(SandboxError::Script),
            Ok(Err(err)) => Err(SandboxError::Join(err.to_string())),
            Err(_) => Err(SandboxError::TimedOut(limits.timeout.as_millis())),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                debug!(duration_ms, output_len = output.len(), "Script completed");
                ExecutionResult::Output(output)
            }
            Err(err) => {
                warn!(duration_ms, error = %err, "Script failed");
                ExecutionResult::Error(err.to_string())
            }
        }
    }
}

/// Executes `code` synchronously in a new interpreter.
pub fn run_script(code: &str, limits: &SandboxLimits) -> Result<String, SandboxError> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(limits.memory_limit)?;

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.raw_set(name, Value::Nil)?;
    }

    let capture = Rc::new(RefCell::new(OutputCapture::new(limits.max_output)));
    let sink = Rc::clone(&capture);
    let print = lua.create_function(move |lua, args: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut fields = Vec::with_capacity(args.len());
        for value in args.iter() {
            fields.push(tostring.call::<String>(value.clone())?);
        }
        sink.borrow_mut().push_record(&fields.join("\t"));
        Ok(())
    })?;
    globals.set("print", print)?;

    let budget = Rc::new(Budget::default());
    for name in GUARDED_CALLS {
        let original: Function = globals.get(name)?;
        let key = format!("sandbox.{name}");
        lua.set_named_registry_value(&key, original)?;
        let budget = Rc::clone(&budget);
        let guarded = lua.create_function(move |lua, args: MultiValue| {
            let original: Function = lua.named_registry_value(&key)?;
            let results = original.call::<MultiValue>(args)?;
            budget.check()?;
            Ok(results)
        })?;
        globals.set(name, guarded)?;
    }

    let deadline = Instant::now() + limits.timeout;
    let instruction_limit = limits.instruction_limit;
    let executed = Cell::new(0u64);
    let hook_budget = Rc::clone(&budget);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            hook_budget.check()?;
            let used = executed.get().saturating_add(u64::from(HOOK_INTERVAL));
            executed.set(used);
            if used > instruction_limit {
                return Err(hook_budget.trip(format!(
                    "instruction budget of {instruction_limit} exceeded"
                )));
            }
            if Instant::now() >= deadline {
                return Err(hook_budget.trip("time budget exceeded".to_string()));
            }
            Ok(VmState::Continue)
        },
    );

    lua.load(code).set_name("script").exec()?;
    budget.check()?;

    let output = capture.borrow_mut().finish();
    Ok(output)
}

/// Records the first exhausted budget; every later check fails with it.
#[derive(Debug, Default)]
struct Budget {
    exhausted: RefCell<Option<String>>,
}

impl Budget {
    fn trip(&self, reason: String) -> mlua::Error {
        let mut exhausted = self.exhausted.borrow_mut();
        mlua::Error::RuntimeError(exhausted.get_or_insert(reason).clone())
    }

    fn check(&self) -> mlua::Result<()> {
        match self.exhausted.borrow().as_ref() {
            Some(reason) => Err(mlua::Error::RuntimeError(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Strips callback wrappers so the user sees the root cause.
fn describe_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => describe_lua_error(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(message) => format!("memory limit exceeded: {message}"),
        other => other.to_string(),
    }
}

struct OutputCapture {
    buffer: String,
    max_output: usize,
    truncated: bool,
}

impl OutputCapture {
    fn new(max_output: usize) -> Self {
        Self {
            buffer: String::new(),
            max_output,
            truncated: false,
        }
    }

    fn push_record(&mut self, record: &str) {
        if self.truncated {
            return;
        }
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(record);
        if self.buffer.len() > self.max_output {
            let mut cut = self.max_output;
            while !self.buffer.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.truncate(cut);
            self.truncated = true;
        }
    }

    fn finish(&mut self) -> String {
        let mut output = std::mem::take(&mut self.buffer);
        if self.truncated {
            output.push_str(TRUNCATION_MARKER);
        }
        output
    }
}
