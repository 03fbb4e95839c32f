//! Executable identifiers and the strategies that run them.
//!
//! An identifier is `script:<path>`, `unittest:<module>` or
//! `function:<name>`; a bare path is treated as a script. Scripts are
//! spawned as subprocesses with their output captured in a log file.
//! Unit-test collections and functions are registered in-process.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::entity::ObjectId;
use crate::error::{SyncError, SyncResult};
use crate::property_matrix::MatrixCell;
use crate::runner::result::ResultStatus;

/// Environment variable names exported to scripts.
pub mod env_vars {
    /// Root of the product sources
    pub const SOURCE_PATH: &str = "TCMSYNC_SOURCE_PATH";
    /// Root of the test scripts
    pub const TESTS_PATH: &str = "TCMSYNC_TESTS_PATH";
    /// Directory downloaded spec attachments are stored in
    pub const ATTACHMENTS_PATH: &str = "TCMSYNC_ATTACHMENTS_PATH";
    /// User the results are recorded for
    pub const USERNAME: &str = "TCMSYNC_USERNAME";
    /// Code of the current matrix cell (empty without list properties)
    pub const MATRIX_CODE: &str = "TCMSYNC_MATRIX_CODE";
    /// Plan being executed
    pub const PLAN_ID: &str = "TCMSYNC_PLAN_ID";
    /// Case being executed (unset for assistants above case level)
    pub const CASE_ID: &str = "TCMSYNC_CASE_ID";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    Script(String),
    UnitTest(String),
    Function(String),
}

impl Executable {
    pub fn parse(identifier: &str) -> SyncResult<Self> {
        let identifier = identifier.trim();
        let (kind, target) = match identifier.split_once(':') {
            Some((kind, target)) if matches!(kind, "script" | "unittest" | "function") => {
                (kind, target.trim())
            }
            _ => ("script", identifier),
        };
        if target.is_empty() {
            return Err(SyncError::Configuration(format!(
                "executable identifier '{}' names nothing",
                identifier
            )));
        }
        Ok(match kind {
            "unittest" => Executable::UnitTest(target.to_string()),
            "function" => Executable::Function(target.to_string()),
            _ => Executable::Script(target.to_string()),
        })
    }
}

/// What an in-process function sees of the current invocation.
pub struct CallContext<'c> {
    pub plan_id: ObjectId,
    pub case_id: Option<ObjectId>,
    pub cell: &'c MatrixCell,
    pub env: &'c [(String, String)],
    /// Case arguments, or the assistant phase (`init` / `cleanup`)
    pub arguments: &'c str,
}

pub type Function = Arc<dyn Fn(&CallContext<'_>) -> Result<(), String> + Send + Sync>;
pub type UnitTestFn = Arc<dyn Fn() + Send + Sync>;

/// In-process functions and unit-test collections, by name.
#[derive(Clone, Default)]
pub struct Registry {
    functions: BTreeMap<String, Function>,
    collections: BTreeMap<String, Vec<(String, UnitTestFn)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&CallContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(f));
    }

    /// Register a named test in the collection `module`.
    pub fn register_test<F>(&mut self, module: &str, name: &str, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.collections
            .entry(module.to_string())
            .or_default()
            .push((name.to_string(), Arc::new(f)));
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn collection(&self, module: &str) -> Option<&[(String, UnitTestFn)]> {
        self.collections.get(module).map(Vec::as_slice)
    }
}

/// Outcome of one executable invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: ResultStatus,
    pub detail: String,
    pub output_file: Option<PathBuf>,
}

impl Outcome {
    fn new(status: ResultStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            output_file: None,
        }
    }
}

/// Where scripts are looked up and how they are started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptSettings {
    pub tests_path: PathBuf,
    pub custom_script_path: Option<PathBuf>,
    /// Interpreter prefix, e.g. "bash"
    pub test_driver: Option<String>,
}

impl ScriptSettings {
    /// Absolute path of a script, searched in the tests path, then the
    /// custom script path.
    pub fn resolve(&self, script: &str) -> Option<PathBuf> {
        let path = Path::new(script);
        if path.is_absolute() {
            return path.exists().then(|| path.to_path_buf());
        }
        std::iter::once(&self.tests_path)
            .chain(self.custom_script_path.as_ref())
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.exists())
    }
}

/// Spawn a script with `env` and capture stdout/stderr in `log_path`.
///
/// Exit status 0 is `Passed`, any other exit is `Failed`, a spawn failure
/// is `Error`.
pub fn run_script(
    settings: &ScriptSettings,
    script: &str,
    arguments: &[&str],
    env: &[(String, String)],
    log_path: &Path,
) -> Outcome {
    let Some(resolved) = settings.resolve(script) else {
        return Outcome::new(ResultStatus::Error, format!("script '{}' not found", script));
    };

    if let Some(parent) = log_path.parent()
        && let Err(e) = fs::create_dir_all(parent)
    {
        return Outcome::new(
            ResultStatus::Error,
            format!("cannot create log directory {}: {}", parent.display(), e),
        );
    }
    let log_file = match File::create(log_path) {
        Ok(f) => f,
        Err(e) => {
            return Outcome::new(
                ResultStatus::Error,
                format!("cannot create log file {}: {}", log_path.display(), e),
            );
        }
    };
    let stderr = match log_file.try_clone() {
        Ok(f) => f,
        Err(e) => return Outcome::new(ResultStatus::Error, e.to_string()),
    };

    let mut cmd = match &settings.test_driver {
        Some(driver) => {
            let mut c = Command::new(driver);
            c.arg(&resolved);
            c
        }
        None => Command::new(&resolved),
    };
    cmd.args(arguments);
    for (key, value) in env {
        cmd.env(key, value);
    }
    if let Some(dir) = resolved.parent() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(log_file);
    cmd.stderr(stderr);

    tracing::debug!(script = %resolved.display(), log = %log_path.display(), "spawning script");
    let mut outcome = match cmd.status() {
        Ok(status) if status.success() => Outcome::new(ResultStatus::Passed, ""),
        Ok(status) => Outcome::new(
            ResultStatus::Failed,
            match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            },
        ),
        Err(e) => Outcome::new(
            ResultStatus::Error,
            format!("failed to start {}: {}", resolved.display(), e),
        ),
    };
    outcome.output_file = Some(log_path.to_path_buf());
    outcome
}

/// Run a registered unit-test collection. Panics count as failures.
pub fn run_unittest(registry: &Registry, module: &str) -> Outcome {
    let Some(tests) = registry.collection(module) else {
        return Outcome::new(
            ResultStatus::Error,
            format!("unit test collection '{}' is not registered", module),
        );
    };
    let failing: Vec<&str> = tests
        .iter()
        .filter(|(_, test)| catch_unwind(AssertUnwindSafe(|| test())).is_err())
        .map(|(name, _)| name.as_str())
        .collect();
    if failing.is_empty() {
        Outcome::new(ResultStatus::Passed, format!("{} tests passed", tests.len()))
    } else {
        Outcome::new(
            ResultStatus::Failed,
            format!(
                "{} of {} tests failed: {}",
                failing.len(),
                tests.len(),
                failing.join(", ")
            ),
        )
    }
}

/// Call a registered function. `Err` and panics count as failures.
pub fn run_function(registry: &Registry, name: &str, ctx: &CallContext<'_>) -> Outcome {
    let Some(function) = registry.function(name) else {
        return Outcome::new(
            ResultStatus::Error,
            format!("function '{}' is not registered", name),
        );
    };
    match catch_unwind(AssertUnwindSafe(|| function(ctx))) {
        Ok(Ok(())) => Outcome::new(ResultStatus::Passed, ""),
        Ok(Err(message)) => Outcome::new(ResultStatus::Failed, message),
        Err(_) => Outcome::new(ResultStatus::Failed, format!("function '{}' panicked", name)),
    }
}
