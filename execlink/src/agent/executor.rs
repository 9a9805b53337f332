//! Executes commands against the class registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bridge::protocol::{ClassBytecodes, Payload, Request, Response, tags};
use crate::error::{ExecutionError, UserException};

use super::context::{AgentStreams, InvocationContext};
use super::gate::ExecutionGate;
use super::loader::{ClassHandle, ClassLoader, LoadError};

/// Exception class reported for a panic in user code.
pub const PANIC_EXCEPTION_CLASS: &str = "rust::panic";

/// Handler for an extension command tag.
pub trait ExtensionHandler: Send + Sync {
    fn handle(
        &self,
        executor: &Executor,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError>;
}

impl<F> ExtensionHandler for F
where
    F: Fn(&Executor, serde_json::Value) -> Result<serde_json::Value, ExecutionError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        executor: &Executor,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        self(executor, argument)
    }
}

pub struct Executor {
    loader: Arc<dyn ClassLoader>,
    registry: Mutex<HashMap<String, Arc<dyn ClassHandle>>>,
    gate: Arc<ExecutionGate>,
    streams: AgentStreams,
    extensions: HashMap<String, Arc<dyn ExtensionHandler>>,
}

impl Executor {
    pub fn new(loader: Arc<dyn ClassLoader>, streams: AgentStreams) -> Self {
        Self {
            loader,
            registry: Mutex::new(HashMap::new()),
            gate: Arc::new(ExecutionGate::new()),
            streams,
            extensions: HashMap::new(),
        }
    }

    /// Register a handler for extension tag `command`.
    pub fn register_extension(
        &mut self,
        command: impl Into<String>,
        handler: Arc<dyn ExtensionHandler>,
    ) -> Result<(), ExecutionError> {
        let command = command.into();
        if tags::is_builtin(&command) {
            return Err(ExecutionError::internal(format!(
                "extension {command} collides with a built-in command"
            )));
        }
        self.extensions.insert(command, handler);
        Ok(())
    }

    pub fn gate(&self) -> &Arc<ExecutionGate> {
        &self.gate
    }

    /// Names of every class in the registry, sorted.
    pub fn loaded_classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().keys().cloned().collect();
        names.sort();
        names
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn ClassHandle>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute one request. Close is acknowledged here; tearing the
    /// session down is the caller's job.
    pub async fn execute(&self, request: Request) -> Response {
        let result = match request {
            Request::Load(classes) => self.load(&classes).map(|()| Payload::Empty),
            Request::Redefine(classes) => self.redefine(&classes).map(|()| Payload::Empty),
            Request::Invoke {
                class_name,
                method_name,
            } => self
                .invoke(&class_name, &method_name)
                .await
                .map(Payload::Text),
            Request::VarValue {
                class_name,
                field_name,
            } => self.var_value(&class_name, &field_name).map(Payload::Text),
            Request::AddClasspath(path) => self.add_to_classpath(&path).map(|()| Payload::Empty),
            Request::Stop => {
                self.stop();
                Ok(Payload::Empty)
            }
            Request::Close => Ok(Payload::Empty),
            Request::Extension { command, argument } => self
                .extension_command(&command, argument)
                .map(Payload::Json),
        };
        Response::from(result)
    }

    /// Define every class, continuing past failures.
    pub fn load(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        let _phase = self.gate.loading();
        let mut installed = Vec::with_capacity(classes.len());
        for class in classes {
            match self.loader.define(class) {
                Ok(handle) => {
                    tracing::debug!(class = %class.name, "Class loaded");
                    self.registry().insert(class.name.clone(), handle);
                    installed.push(true);
                }
                Err(e) => {
                    tracing::warn!(class = %class.name, error = %e, "Class failed to load");
                    installed.push(false);
                }
            }
        }
        install_outcome("load: not all classes loaded", installed)
    }

    /// Replace loaded classes. Classes not yet loaded are reported as not installed.
    pub fn redefine(&self, classes: &[ClassBytecodes]) -> Result<(), ExecutionError> {
        let _phase = self.gate.loading();
        let mut installed = Vec::with_capacity(classes.len());
        for class in classes {
            let current = self.registry().get(&class.name).cloned();
            let Some(current) = current else {
                tracing::warn!(class = %class.name, "Cannot redefine a class that is not loaded");
                installed.push(false);
                continue;
            };
            match self.loader.redefine(&current, class) {
                Ok(handle) => {
                    tracing::debug!(class = %class.name, "Class redefined");
                    self.registry().insert(class.name.clone(), handle);
                    installed.push(true);
                }
                Err(LoadError::Unsupported) => {
                    return Err(ExecutionError::not_implemented(
                        "redefine: not supported by this agent",
                    ));
                }
                Err(e) => {
                    tracing::warn!(class = %class.name, error = %e, "Class failed to redefine");
                    installed.push(false);
                }
            }
        }
        install_outcome("redefine: not all classes redefined", installed)
    }

    /// Registry first, then the loader's classpath. Classpath hits are cached.
    fn find_class(&self, name: &str) -> Option<Arc<dyn ClassHandle>> {
        if let Some(handle) = self.registry().get(name) {
            return Some(Arc::clone(handle));
        }
        let handle = self.loader.find_class(name)?;
        tracing::debug!(class = name, "Class found on classpath");
        self.registry()
            .insert(name.to_string(), Arc::clone(&handle));
        Some(handle)
    }

    fn require_class(&self, name: &str) -> Result<Arc<dyn ClassHandle>, ExecutionError> {
        self.find_class(name)
            .ok_or_else(|| ExecutionError::internal(format!("class not found: {name}")))
    }

    /// Run `class_name.method_name` on a blocking thread and render its result.
    pub async fn invoke(
        &self,
        class_name: &str,
        method_name: &str,
    ) -> Result<String, ExecutionError> {
        let class = self.require_class(class_name)?;
        if !class.has_method(method_name) {
            return Err(ExecutionError::internal(format!(
                "method not found: {class_name}.{method_name}"
            )));
        }

        let gate = Arc::clone(&self.gate);
        let ctx = InvocationContext::new(Arc::clone(&gate), self.streams.clone());
        let method = method_name.to_string();
        tracing::debug!(class = class_name, method = method_name, "Invoking");

        let joined = tokio::task::spawn_blocking(move || {
            let call = gate.enter_user_code();
            let outcome = ctx
                .checkpoint()
                .and_then(|()| class.invoke(&method, &ctx));
            let stopped = call.finish();
            (outcome, stopped)
        })
        .await;

        match joined {
            Ok((_, true)) => {
                tracing::info!(class = class_name, method = method_name, "Invocation stopped");
                Err(ExecutionError::Stopped)
            }
            Ok((Ok(value), false)) => Ok(value.render()),
            Ok((Err(thrown), false)) => Err(thrown.into_error()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::warn!(class = class_name, method = method_name, %message, "User code panicked");
                Err(UserException::new(Some(message), PANIC_EXCEPTION_CLASS, Vec::new()).into())
            }
            Err(e) => Err(ExecutionError::internal(format!(
                "invocation task failed: {e}"
            ))),
        }
    }

    /// Render static field `class_name.field_name`.
    pub fn var_value(&self, class_name: &str, field_name: &str) -> Result<String, ExecutionError> {
        let class = self.require_class(class_name)?;
        class
            .static_field(field_name)
            .map(|value| value.render())
            .ok_or_else(|| {
                ExecutionError::internal(format!("field not found: {class_name}.{field_name}"))
            })
    }

    pub fn add_to_classpath(&self, path: &str) -> Result<(), ExecutionError> {
        self.loader
            .add_to_classpath(path)
            .map_err(|e| ExecutionError::internal(e.to_string()))
    }

    /// Stop running user code, if any. True when an invocation was flagged.
    pub fn stop(&self) -> bool {
        let stopped = self.gate.request_stop();
        if stopped {
            tracing::info!("Stop requested for running invocation");
        } else {
            tracing::debug!("Stop ignored: no invocation in progress");
        }
        stopped
    }

    pub fn extension_command(
        &self,
        command: &str,
        argument: serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        match self.extensions.get(command) {
            Some(handler) => handler.handle(self, argument),
            None => Err(ExecutionError::not_implemented(format!("Command: {command}"))),
        }
    }
}

fn install_outcome(message: &str, installed: Vec<bool>) -> Result<(), ExecutionError> {
    if installed.iter().all(|ok| *ok) {
        Ok(())
    } else {
        Err(ExecutionError::ClassInstall {
            message: message.to_string(),
            installed,
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory loader for tests. A class's bytecode is its behaviour spec:
    //! `ok` defines a class whose `run` returns 42, `bad` fails to define,
    //! `panic` panics in `run`, `spin` loops on the checkpoint, `throw`
    //! throws a chained exception, `echo` prints and copies input to output.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::agent::context::InvocationContext;
    use crate::agent::loader::{ClassHandle, ClassLoader, LoadError, Thrown};
    use crate::bridge::protocol::{ClassBytecodes, StackFrame};
    use crate::value::Value;

    #[derive(Default)]
    pub struct ScriptLoader {
        classpath: Mutex<HashMap<String, String>>,
        pub redefinable: bool,
    }

    impl ScriptLoader {
        pub fn redefinable() -> Self {
            Self {
                redefinable: true,
                ..Self::default()
            }
        }
    }

    pub struct ScriptClass {
        name: String,
        script: String,
    }

    impl ClassHandle for ScriptClass {
        fn name(&self) -> &str {
            &self.name
        }

        fn has_method(&self, method: &str) -> bool {
            method == "run"
        }

        fn invoke(&self, _method: &str, ctx: &InvocationContext) -> Result<Value, Thrown> {
            match self.script.as_str() {
                "panic" => panic!("user code exploded"),
                "spin" => loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(std::time::Duration::from_millis(5));
                },
                "throw" => Err(Thrown::exception("A", Some("outer".into()))
                    .with_stack(vec![StackFrame::new(&self.name, "run", Some("#1".into()), 1)])
                    .with_cause(Thrown::exception("B", Some("middle".into())).with_cause(
                        Thrown::Unresolved {
                            id: 9,
                            stack_trace: vec![StackFrame::new(&self.name, "helper", None, -1)],
                        },
                    ))),
                "echo" => {
                    ctx.print("before\n")?;
                    let mut collected = Vec::new();
                    while let Some(chunk) = ctx.read_input()? {
                        collected.extend_from_slice(&chunk);
                    }
                    ctx.eprint("after\n")?;
                    Ok(Value::Str(String::from_utf8_lossy(&collected).into_owned()))
                }
                other => Ok(Value::Str(other.to_string())),
            }
        }

        fn static_field(&self, field: &str) -> Option<Value> {
            (field == "answer").then_some(Value::Int(42))
        }
    }

    impl ClassLoader for ScriptLoader {
        fn define(&self, class: &ClassBytecodes) -> Result<Arc<dyn ClassHandle>, LoadError> {
            let script = String::from_utf8_lossy(&class.bytecodes).into_owned();
            if script == "bad" {
                return Err(LoadError::Malformed {
                    name: class.name.clone(),
                    reason: "bad magic".to_string(),
                });
            }
            Ok(Arc::new(ScriptClass {
                name: class.name.clone(),
                script,
            }))
        }

        fn redefine(
            &self,
            _current: &Arc<dyn ClassHandle>,
            class: &ClassBytecodes,
        ) -> Result<Arc<dyn ClassHandle>, LoadError> {
            if !self.redefinable {
                return Err(LoadError::Unsupported);
            }
            self.define(class)
        }

        fn find_class(&self, name: &str) -> Option<Arc<dyn ClassHandle>> {
            let classpath = self.classpath.lock().unwrap();
            let script = classpath.get(name)?;
            Some(Arc::new(ScriptClass {
                name: name.to_string(),
                script: script.clone(),
            }))
        }

        fn add_to_classpath(&self, path: &str) -> Result<(), LoadError> {
            // `name=script` entries stand in for directories.
            let (name, script) = path.split_once('=').ok_or_else(|| LoadError::Classpath {
                path: path.to_string(),
                reason: "expected name=script".to_string(),
            })?;
            self.classpath
                .lock()
                .unwrap()
                .insert(name.to_string(), script.to_string());
            Ok(())
        }
    }
}
