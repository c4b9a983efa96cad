use std::path::{Component, Path, PathBuf};
use std::thread;

use rustpython_vm as vm;
use rustpython_vm::builtins::PyBaseException;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, Interpreter, InterpreterBuilder, PyObjectRef, PyResult, TryFromObject};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum TrustMode {
    /// Safe builtins, allowlisted imports, `open` confined to a scratch directory.
    #[default]
    Restricted,
    Host,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionFault {
    pub message: String,
}

impl ExecutionFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

const SOURCE_NAME: &str = "<codebox>";

// Deep Python recursion runs on the native stack of the worker thread.
const WORKER_STACK_BYTES: usize = 256 * 1024 * 1024;
const RECURSION_SETUP: &str = "import sys\nsys.setrecursionlimit(500)\n";

const CAPTURE_INSTALL: &str = "import io, sys\nsaved_stdout = sys.stdout\nbuffer = io.StringIO()\nsys.stdout = buffer\n";
const CAPTURE_READ: &str = "captured = buffer.getvalue()\n";
const CAPTURE_RESTORE: &str = "import sys\nsys.stdout = saved_stdout\n";

const SAFE_BUILTINS: &[&str] = &[
    "print", "len", "str", "int", "float", "list", "dict", "set", "frozenset", "tuple", "bool",
    "type", "isinstance", "enumerate", "zip", "map", "filter", "sorted", "min", "max",
    "sum", "abs", "round", "chr", "ord", "hex", "bin", "oct", "repr", "ascii", "format",
    "any", "all", "hasattr", "getattr", "setattr", "delattr", "dir",
    "range", "reversed", "slice", "iter", "next", "pow", "divmod", "complex",
    "bytes", "bytearray", "hash", "id", "callable", "issubclass", "super",
    "property", "staticmethod", "classmethod", "object", "__build_class__", "NotImplemented",
    "Ellipsis", "BaseException", "ArithmeticError", "LookupError", "EnvironmentError",
    "AssertionError", "NotImplementedError", "UnicodeError", "Warning", "UserWarning",
    "DeprecationWarning", "RuntimeWarning", "Exception", "ValueError", "TypeError", "KeyError",
    "IndexError", "AttributeError", "FileNotFoundError", "PermissionError", "OSError", "IOError",
    "RuntimeError", "RecursionError", "NameError", "ImportError", "ModuleNotFoundError",
    "ZeroDivisionError", "OverflowError", "StopIteration", "GeneratorExit", "TimeoutError",
];

// `io`, `os` and `sys` are left out: each hands back an unconfined `open`
// or the live module table.
const ALLOWED_MODULES: &[&str] = &[
    "json", "math", "statistics", "random", "re", "itertools", "functools",
    "collections", "datetime", "decimal", "fractions", "time", "string", "textwrap",
    "operator", "heapq", "bisect", "copy", "typing", "dataclasses", "enum",
];

enum SandboxCommand {
    Execute {
        code: String,
        response: oneshot::Sender<Result<String, ExecutionFault>>,
    },
    Shutdown,
}

/// Handle to the interpreter worker thread. Executions run one at a time.
pub struct SandboxExecutor {
    sender: mpsc::UnboundedSender<SandboxCommand>,
    trust: TrustMode,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    pub fn spawn(trust: TrustMode) -> anyhow::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        thread::Builder::new()
            .name("codebox-sandbox".to_owned())
            .stack_size(WORKER_STACK_BYTES)
            .spawn(move || {
                let core = match SandboxCore::new(trust) {
                    Ok(core) => core,
                    Err(err) => {
                        tracing::error!(error = %err, "sandbox interpreter failed to start");
                        return;
                    }
                };
                tracing::info!(?trust, "sandbox interpreter ready");
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        SandboxCommand::Execute { code, response } => {
                            let _ = response.send(core.run(&code));
                        }
                        SandboxCommand::Shutdown => break,
                    }
                }
                tracing::debug!("sandbox worker stopped");
            })?;

        Ok(Self { sender, trust })
    }

    pub fn trust(&self) -> TrustMode {
        self.trust
    }

    /// Runs `code` in a fresh namespace and returns everything it printed.
    ///
    /// Blocks the calling thread; do not call from async code.
    pub fn execute(&self, code: &str) -> Result<String, ExecutionFault> {
        let (response_tx, response_rx) = oneshot::channel();
        self.sender
            .send(SandboxCommand::Execute {
                code: code.to_owned(),
                response: response_tx,
            })
            .map_err(|_| ExecutionFault::new("sandbox worker unavailable"))?;
        response_rx
            .blocking_recv()
            .map_err(|_| ExecutionFault::new("sandbox worker dropped the execution"))?
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        let _ = self.sender.send(SandboxCommand::Shutdown);
    }
}

struct SandboxCore {
    interpreter: Interpreter,
    trust: TrustMode,
    scratch_dir: TempDir,
}

impl SandboxCore {
    fn new(trust: TrustMode) -> anyhow::Result<Self> {
        let interpreter = init_stdlib(InterpreterBuilder::new()).interpreter();
        interpreter
            .enter(|vm: &vm::VirtualMachine| {
                vm.run_string(
                    vm.new_scope_with_builtins(),
                    RECURSION_SETUP,
                    "<codebox_setup>".to_owned(),
                )
                .map(drop)
                .map_err(|exc| exception_text(vm, &exc))
            })
            .map_err(|message| anyhow::anyhow!("interpreter setup failed: {message}"))?;
        let scratch_dir = tempfile::Builder::new()
            .prefix("codebox-scratch-")
            .tempdir()?;
        Ok(Self {
            interpreter,
            trust,
            scratch_dir,
        })
    }

    fn run(&self, code: &str) -> Result<String, ExecutionFault> {
        let scratch_dir = self.scratch_dir.path();
        self.interpreter.enter(|vm: &vm::VirtualMachine| {
            let fault = |exc: vm::PyRef<PyBaseException>| ExecutionFault::new(exception_text(vm, &exc));
            let namespace = fresh_namespace(vm).map_err(fault)?;
            let capture = StdoutCapture::install(vm).map_err(fault)?;
            let restricted = match self.trust {
                TrustMode::Restricted => {
                    Some(RestrictedBuiltins::install(vm, &namespace, scratch_dir).map_err(fault)?)
                }
                TrustMode::Host => None,
            };
            let outcome = match vm.run_string(namespace, code, SOURCE_NAME.to_owned()) {
                Ok(_) => capture.contents().map_err(fault),
                Err(exc) => Err(fault(exc)),
            };
            drop(restricted);
            drop(capture);
            outcome
        })
    }
}

/// Redirects `sys.stdout` into a buffer until dropped.
struct StdoutCapture<'vm> {
    vm: &'vm vm::VirtualMachine,
    slot: Scope,
}

impl<'vm> StdoutCapture<'vm> {
    fn install(vm: &'vm vm::VirtualMachine) -> vm::PyResult<Self> {
        let slot = vm.new_scope_with_builtins();
        vm.run_string(slot.clone(), CAPTURE_INSTALL, "<codebox_capture>".to_owned())?;
        Ok(Self { vm, slot })
    }

    fn contents(&self) -> vm::PyResult<String> {
        self.vm
            .run_string(self.slot.clone(), CAPTURE_READ, "<codebox_capture>".to_owned())?;
        Ok(get_string_from_scope(self.vm, &self.slot, "captured"))
    }
}

impl Drop for StdoutCapture<'_> {
    fn drop(&mut self) {
        if let Err(exc) = self.vm.run_string(
            self.slot.clone(),
            CAPTURE_RESTORE,
            "<codebox_restore>".to_owned(),
        ) {
            tracing::error!(error = %exception_text(self.vm, &exc), "failed to restore sys.stdout");
        }
    }
}

/// Swaps `__import__` and `open` for checked native versions until dropped.
///
/// The hooks go into both the namespace's `__builtins__` and the `builtins`
/// module, whichever one a frame resolves names through.
struct RestrictedBuiltins<'vm> {
    vm: &'vm vm::VirtualMachine,
    host_import: PyObjectRef,
    host_open: PyObjectRef,
}

impl<'vm> RestrictedBuiltins<'vm> {
    fn install(
        vm: &'vm vm::VirtualMachine,
        namespace: &Scope,
        scratch_dir: &Path,
    ) -> vm::PyResult<Self> {
        let host_import = vm.builtins.get_attr("__import__", vm)?;
        let host_open = vm.builtins.get_attr("open", vm)?;
        let import_hook = restricted_import(vm, host_import.clone());
        let open_hook = confined_open(vm, host_open.clone(), scratch_dir.to_path_buf());

        let safe = vm.ctx.new_dict();
        for name in SAFE_BUILTINS {
            if let Ok(value) = vm.builtins.get_attr(*name, vm) {
                safe.set_item(*name, value, vm)?;
            }
        }
        safe.set_item("__import__", import_hook.clone(), vm)?;
        safe.set_item("open", open_hook.clone(), vm)?;
        namespace.globals.set_item("__builtins__", safe.into(), vm)?;

        let guard = Self {
            vm,
            host_import,
            host_open,
        };
        vm.builtins.set_attr("__import__", import_hook, vm)?;
        vm.builtins.set_attr("open", open_hook, vm)?;
        Ok(guard)
    }
}

impl Drop for RestrictedBuiltins<'_> {
    fn drop(&mut self) {
        let vm = self.vm;
        for (name, value) in [("__import__", &self.host_import), ("open", &self.host_open)] {
            if let Err(exc) = vm.builtins.set_attr(name, value.clone(), vm) {
                tracing::error!(builtin = name, error = %exception_text(vm, &exc), "failed to restore builtin");
            }
        }
    }
}

fn argument<'a>(args: &'a FuncArgs, index: usize, name: &str) -> Option<&'a PyObjectRef> {
    args.args.get(index).or_else(|| args.kwargs.get(name))
}

/// True when `globals` is the namespace of a module registered in `sys.modules`.
fn is_module_namespace(vm: &vm::VirtualMachine, globals: &PyObjectRef) -> bool {
    let Ok(name) = vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),)) else {
        return false;
    };
    if vm.is_none(&name) {
        return false;
    }
    let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
        return false;
    };
    let Ok(module) = vm.call_method(&modules, "get", (name,)) else {
        return false;
    };
    module.dict().is_some_and(|dict| dict.is(globals))
}

fn restricted_import(vm: &vm::VirtualMachine, host_import: PyObjectRef) -> PyObjectRef {
    vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &vm::VirtualMachine| -> PyResult {
            // Library modules importing their own dependencies pass through.
            let from_module =
                argument(&args, 1, "globals").is_some_and(|globals| is_module_namespace(vm, globals));
            if !from_module {
                let name = match argument(&args, 0, "name") {
                    Some(name) => name.str_utf8(vm)?.as_str().to_owned(),
                    None => return Err(vm.new_type_error("__import__() missing 'name'".to_owned())),
                };
                let level = match argument(&args, 4, "level") {
                    Some(level) => i64::try_from_object(vm, level.clone())?,
                    None => 0,
                };
                let root = name.split('.').next().unwrap_or_default().to_owned();
                if level != 0 || !ALLOWED_MODULES.contains(&root.as_str()) {
                    return Err(vm.new_import_error(
                        format!("import of '{root}' is blocked in restricted mode"),
                        vm.ctx.new_str(root),
                    ));
                }
            }
            host_import.call(args, vm)
        },
    )
    .into()
}

fn confined_open(vm: &vm::VirtualMachine, host_open: PyObjectRef, root: PathBuf) -> PyObjectRef {
    vm.new_function(
        "open",
        move |mut args: FuncArgs, vm: &vm::VirtualMachine| -> PyResult {
            let requested = match argument(&args, 0, "file") {
                Some(file) => file.str_utf8(vm)?.as_str().to_owned(),
                None => return Err(vm.new_type_error("open() missing 'file'".to_owned())),
            };
            let Some(target) = confine(&root, &requested) else {
                return Err(vm
                    .new_os_subtype_error(
                        vm.ctx.exceptions.permission_error.to_owned(),
                        None,
                        "open is restricted to the scratch directory",
                    )
                    .upcast());
            };
            let target: PyObjectRef = vm.ctx.new_str(target.to_string_lossy().into_owned()).into();
            match args.args.first_mut() {
                Some(file) => *file = target,
                None => {
                    args.kwargs.insert("file".to_owned(), target);
                }
            }
            host_open.call(args, vm)
        },
    )
    .into()
}

/// Resolves `requested` against `root` lexically; `None` if it leaves `root`.
fn confine(root: &Path, requested: &str) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in root.join(requested).components() {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other.as_os_str()),
        }
    }
    resolved.starts_with(root).then_some(resolved)
}

fn fresh_namespace(vm: &vm::VirtualMachine) -> vm::PyResult<Scope> {
    let namespace = vm.new_scope_with_builtins();
    namespace
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)?;
    Ok(namespace)
}

fn exception_text(vm: &vm::VirtualMachine, exc: &vm::PyRef<PyBaseException>) -> String {
    let message = exc
        .as_object()
        .str_utf8(vm)
        .map(|text| text.as_str().to_owned())
        .unwrap_or_default();
    if message.is_empty() {
        exc.as_object().class().name().to_string()
    } else {
        message
    }
}

fn init_stdlib(builder: InterpreterBuilder) -> InterpreterBuilder {
    let defs = rustpython_stdlib::stdlib_module_defs(&builder.ctx);
    builder
        .add_native_modules(&defs)
        .add_frozen_modules(rustpython_pylib::FROZEN_STDLIB)
        .init_hook(set_frozen_stdlib_dir)
}

fn set_frozen_stdlib_dir(vm: &mut vm::VirtualMachine) {
    use rustpython_vm::common::rc::PyRc;

    match PyRc::get_mut(&mut vm.state) {
        Some(state) => state.config.paths.stdlib_dir = Some(rustpython_pylib::LIB_PATH.to_owned()),
        None => tracing::warn!("interpreter state shared during init; stdlib dir left unset"),
    }
}

fn get_string_from_scope(vm: &vm::VirtualMachine, scope: &Scope, name: &str) -> String {
    scope
        .globals
        .get_item(name, vm)
        .ok()
        .and_then(|value| value.try_to_value::<String>(vm).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn restricted() -> SandboxExecutor {
        SandboxExecutor::spawn(TrustMode::Restricted).unwrap()
    }

    #[test]
    fn returns_printed_output_verbatim() {
        let sandbox = restricted();
        let output = sandbox
            .execute("def factorial(n):\n    return 1 if n < 2 else n * factorial(n - 1)\n\nprint(factorial(5))\nprint('done')\n")
            .unwrap();
        assert_eq!(output, "120\ndone\n");
    }

    #[test]
    fn silent_code_returns_empty_output() {
        let sandbox = restricted();
        assert_eq!(sandbox.execute("x = 1 + 1").unwrap(), "");
    }

    #[test]
    fn raising_code_returns_description_not_partial_output() {
        let sandbox = restricted();
        let fault = sandbox
            .execute("print('before')\nraise ValueError('bad input')\n")
            .unwrap_err();
        assert_eq!(fault.message, "bad input");
    }

    #[test]
    fn empty_exception_message_falls_back_to_class_name() {
        let sandbox = restricted();
        let fault = sandbox.execute("raise KeyError()\n").unwrap_err();
        assert_eq!(fault.message, "KeyError");
        let fault = sandbox.execute("print(undefined_name)\n").unwrap_err();
        assert!(fault.message.contains("undefined_name"));
    }

    #[test]
    fn syntax_errors_are_faults() {
        let sandbox = restricted();
        let fault = sandbox.execute("def broken(:\n").unwrap_err();
        assert!(!fault.message.is_empty());
    }

    #[test]
    fn stdout_is_restored_after_failure() {
        let sandbox = restricted();
        assert!(sandbox.execute("raise RuntimeError('boom')").is_err());
        assert_eq!(sandbox.execute("print('after')").unwrap(), "after\n");
    }

    #[test]
    fn stdout_is_restored_when_code_rebinds_it() {
        let sandbox = SandboxExecutor::spawn(TrustMode::Host).unwrap();
        let output = sandbox
            .execute("import io, sys\nprint('kept')\nsys.stdout = io.StringIO()\nprint('lost')\n")
            .unwrap();
        assert_eq!(output, "kept\n");
        assert_eq!(sandbox.execute("print('next')").unwrap(), "next\n");
    }

    #[test]
    fn namespaces_do_not_leak_between_calls() {
        let sandbox = restricted();
        sandbox.execute("secret = 42\n").unwrap();
        let fault = sandbox.execute("print(secret)\n").unwrap_err();
        assert!(fault.message.contains("secret"));
    }

    #[test]
    fn runs_as_main_module() {
        let sandbox = restricted();
        let output = sandbox
            .execute("if __name__ == '__main__':\n    print('main')\n")
            .unwrap();
        assert_eq!(output, "main\n");
    }

    #[test]
    fn classes_and_allowlisted_imports_work_when_restricted() {
        let sandbox = restricted();
        let output = sandbox
            .execute("import math\nfrom collections import Counter\n\nclass Box:\n    def __init__(self, v):\n        self.v = v\n\nprint(Box(math.floor(2.5)).v, Counter('aab')['a'])\n")
            .unwrap();
        assert_eq!(output, "2 2\n");
    }

    #[test]
    fn restricted_mode_blocks_other_imports_and_eval() {
        let sandbox = restricted();
        let fault = sandbox.execute("import os\n").unwrap_err();
        assert!(fault.message.contains("blocked"));
        assert!(sandbox.execute("eval('1 + 1')\n").is_err());
    }

    #[test]
    fn restricted_hooks_do_not_expose_host_functions() {
        let sandbox = restricted();
        assert!(sandbox.execute("__import__.__defaults__[-2]('os')\n").is_err());
        assert!(sandbox.execute("__import__.__closure__[0].cell_contents('os')\n").is_err());
        assert!(sandbox.execute("open.__defaults__[1]('/etc/hostname')\n").is_err());
        let fault = sandbox.execute("__import__('os')\n").unwrap_err();
        assert!(fault.message.contains("blocked"));
    }

    #[test]
    fn modules_with_unconfined_open_are_blocked() {
        let sandbox = restricted();
        let fault = sandbox
            .execute("import io\nprint(io.open('/etc/hostname').read())\n")
            .unwrap_err();
        assert!(fault.message.contains("'io' is blocked"), "{}", fault.message);
        let fault = sandbox.execute("import sys\n").unwrap_err();
        assert!(fault.message.contains("'sys' is blocked"), "{}", fault.message);
    }

    #[test]
    fn allowlisted_modules_load_their_own_dependencies() {
        let sandbox = restricted();
        let output = sandbox
            .execute("import json\nfrom collections import namedtuple\nPoint = namedtuple('Point', 'x y')\nprint(json.dumps({'p': list(Point(1, 2))}))\n")
            .unwrap();
        assert_eq!(output, "{\"p\": [1, 2]}\n");
    }

    #[test]
    fn host_builtins_come_back_after_restricted_call() {
        let sandbox = restricted();
        assert!(sandbox.execute("import os\n").is_err());
        assert_eq!(sandbox.execute("import math\nprint(math.isqrt(49))").unwrap(), "7\n");
        assert!(sandbox.execute("import os\n").is_err());
    }

    #[test]
    fn unbounded_recursion_is_a_fault() {
        let sandbox = restricted();
        let fault = sandbox.execute("def f():\n    return f()\n\nf()\n").unwrap_err();
        assert!(fault.message.contains("recursion"), "{}", fault.message);
        assert_eq!(sandbox.execute("print('alive')").unwrap(), "alive\n");
    }

    #[test]
    fn confine_keeps_paths_inside_root() {
        let root = Path::new("/scratch/box");
        assert_eq!(confine(root, "a/b.txt"), Some(PathBuf::from("/scratch/box/a/b.txt")));
        assert_eq!(confine(root, "./a/../b.txt"), Some(PathBuf::from("/scratch/box/b.txt")));
        assert_eq!(confine(root, "/scratch/box/c"), Some(PathBuf::from("/scratch/box/c")));
        assert_eq!(confine(root, "../escape"), None);
        assert_eq!(confine(root, "/etc/hostname"), None);
        assert_eq!(confine(root, "/scratch/boxed"), None);
    }

    #[test]
    fn restricted_open_is_confined_to_scratch_dir() {
        let sandbox = restricted();
        let output = sandbox
            .execute("with open('note.txt', 'w') as f:\n    f.write('hi')\nwith open('note.txt') as f:\n    print(f.read())\n")
            .unwrap();
        assert_eq!(output, "hi\n");
        let fault = sandbox.execute("open('/etc/hostname')\n").unwrap_err();
        assert!(fault.message.contains("scratch"));
        let fault = sandbox.execute("open('../../etc/hostname')\n").unwrap_err();
        assert!(fault.message.contains("scratch"));
    }

    #[test]
    fn host_mode_exposes_full_imports() {
        let sandbox = SandboxExecutor::spawn(TrustMode::Host).unwrap();
        assert_eq!(sandbox.trust(), TrustMode::Host);
        let output = sandbox.execute("import os\nprint(os.sep)\n").unwrap();
        assert_eq!(output, format!("{}\n", std::path::MAIN_SEPARATOR));
    }

    #[test]
    fn executor_is_shareable_across_threads() {
        let sandbox = std::sync::Arc::new(restricted());
        let handles: Vec<_> = (0..4)
            .map(|idx| {
                let sandbox = sandbox.clone();
                std::thread::spawn(move || sandbox.execute(&format!("print({idx})")).unwrap())
            })
            .collect();
        let mut outputs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        outputs.sort();
        assert_eq!(outputs, vec!["0\n", "1\n", "2\n", "3\n"]);
    }
}
