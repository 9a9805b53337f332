//! Class loader for JSON class descriptors.
//!
//! A class's bytecode is a descriptor:
//!
//! ```json
//! {
//!   "fields": { "greeting": "hello" },
//!   "methods": {
//!     "main": [ { "print": "hi\n" }, "read", { "return": 42 } ]
//!   }
//! }
//! ```
//!
//! Steps run in order. `read` consumes user input to end of input; a method
//! without `return` yields the input read so far (or `null`). `spin` loops
//! until the invocation is stopped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use execlink::Value;
use execlink::agent::{ClassHandle, ClassLoader, InvocationContext, LoadError, Thrown};
use execlink::bridge::protocol::{ClassBytecodes, StackFrame};
use serde::Deserialize;

const SPIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassDescriptor {
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub methods: BTreeMap<String, Vec<Step>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Print(String),
    Eprint(String),
    Read,
    Return(serde_json::Value),
    Throw {
        class: String,
        #[serde(default)]
        message: Option<String>,
    },
    Spin,
}

impl ClassDescriptor {
    pub fn parse(name: &str, bytes: &[u8]) -> Result<Self, LoadError> {
        serde_json::from_slice(bytes).map_err(|e| LoadError::Malformed {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

pub struct DescriptorClass {
    name: String,
    descriptor: ClassDescriptor,
}

impl DescriptorClass {
    fn frame(&self, method: &str, step: usize) -> StackFrame {
        StackFrame::new(
            &self.name,
            method,
            Some(format!("{}.json", self.name)),
            step as i32 + 1,
        )
    }
}

impl ClassHandle for DescriptorClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_method(&self, method: &str) -> bool {
        self.descriptor.methods.contains_key(method)
    }

    fn invoke(&self, method: &str, ctx: &InvocationContext) -> Result<Value, Thrown> {
        let Some(steps) = self.descriptor.methods.get(method) else {
            return Err(Thrown::exception(
                "NoSuchMethodError",
                Some(format!("{}.{method}", self.name)),
            ));
        };

        let mut input: Option<Vec<u8>> = None;
        for (i, step) in steps.iter().enumerate() {
            ctx.checkpoint()?;
            match step {
                Step::Print(text) => ctx.print(text)?,
                Step::Eprint(text) => ctx.eprint(text)?,
                Step::Read => {
                    let buf = input.get_or_insert_with(Vec::new);
                    while let Some(chunk) = ctx.read_input()? {
                        buf.extend_from_slice(&chunk);
                    }
                }
                Step::Return(value) => return Ok(Value::from_json(value)),
                Step::Throw { class, message } => {
                    return Err(Thrown::exception(class, message.clone())
                        .with_stack(vec![self.frame(method, i)]));
                }
                Step::Spin => loop {
                    ctx.checkpoint()?;
                    std::thread::sleep(SPIN_INTERVAL);
                },
            }
        }

        Ok(match input {
            Some(bytes) => Value::Str(String::from_utf8_lossy(&bytes).into_owned()),
            None => Value::Null,
        })
    }

    fn static_field(&self, field: &str) -> Option<Value> {
        self.descriptor.fields.get(field).map(Value::from_json)
    }
}

/// Defines classes from descriptors and finds `<name>.json` on its classpath.
pub struct DescriptorLoader {
    classpath: Mutex<Vec<PathBuf>>,
}

impl DescriptorLoader {
    pub fn new(classpath: Vec<PathBuf>) -> Self {
        Self {
            classpath: Mutex::new(classpath),
        }
    }

    fn build(&self, name: &str, bytes: &[u8]) -> Result<Arc<dyn ClassHandle>, LoadError> {
        Ok(Arc::new(DescriptorClass {
            name: name.to_string(),
            descriptor: ClassDescriptor::parse(name, bytes)?,
        }))
    }
}

impl ClassLoader for DescriptorLoader {
    fn define(&self, class: &ClassBytecodes) -> Result<Arc<dyn ClassHandle>, LoadError> {
        self.build(&class.name, &class.bytecodes)
    }

    fn redefine(
        &self,
        _current: &Arc<dyn ClassHandle>,
        class: &ClassBytecodes,
    ) -> Result<Arc<dyn ClassHandle>, LoadError> {
        self.build(&class.name, &class.bytecodes)
    }

    fn find_class(&self, name: &str) -> Option<Arc<dyn ClassHandle>> {
        let dirs = self
            .classpath
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let file = format!("{name}.json");
        for dir in dirs {
            let path = dir.join(&file);
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            match self.build(name, &bytes) {
                Ok(class) => {
                    tracing::debug!(class = name, path = %path.display(), "Loaded class from classpath");
                    return Some(class);
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping bad class file"),
            }
        }
        None
    }

    fn add_to_classpath(&self, path: &str) -> Result<(), LoadError> {
        let dir = PathBuf::from(path);
        if !dir.is_dir() {
            return Err(LoadError::Classpath {
                path: path.to_string(),
                reason: "not a directory".to_string(),
            });
        }
        self.classpath
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use execlink::agent::{AgentStreams, ExecutionGate, NoInput};
    use tokio::sync::mpsc;

    fn context(gate: Arc<ExecutionGate>) -> (InvocationContext, mpsc::UnboundedReceiver<Bytes>) {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (err, _) = mpsc::unbounded_channel::<Bytes>();
        let streams = AgentStreams {
            out: Arc::new(out),
            err: Arc::new(err),
            input: Arc::new(NoInput),
        };
        (InvocationContext::new(gate, streams), out_rx)
    }

    fn class(json: &str) -> Arc<dyn ClassHandle> {
        DescriptorLoader::new(Vec::new())
            .define(&ClassBytecodes::new("Greeter", json))
            .unwrap()
    }

    #[test]
    fn steps_run_in_order() {
        let greeter = class(
            r#"{
                "fields": { "greeting": "hello", "sizes": [1, 2] },
                "methods": { "main": [ { "print": "hi\n" }, { "return": 42 } ] }
            }"#,
        );
        let (ctx, mut out) = context(Arc::new(ExecutionGate::new()));

        assert!(greeter.has_method("main"));
        assert_eq!(greeter.invoke("main", &ctx).unwrap(), Value::Int(42));
        assert_eq!(out.try_recv().unwrap(), Bytes::from_static(b"hi\n"));
        assert_eq!(
            greeter.static_field("greeting"),
            Some(Value::Str("hello".into()))
        );
        assert_eq!(greeter.static_field("sizes").unwrap().render(), "long[2] { 1, 2 }");
        assert_eq!(greeter.static_field("missing"), None);
    }

    #[test]
    fn read_without_return_yields_input() {
        let reader = class(r#"{ "methods": { "main": [ "read" ] } }"#);
        let (ctx, _out) = context(Arc::new(ExecutionGate::new()));
        assert_eq!(reader.invoke("main", &ctx).unwrap(), Value::Str(String::new()));

        let idle = class(r#"{ "methods": { "main": [] } }"#);
        assert_eq!(idle.invoke("main", &ctx).unwrap(), Value::Null);
    }

    #[test]
    fn throw_reports_step_position() {
        let thrower = class(
            r#"{ "methods": { "main": [
                { "print": "about to fail" },
                { "throw": { "class": "IllegalStateException", "message": "nope" } }
            ] } }"#,
        );
        let (ctx, _out) = context(Arc::new(ExecutionGate::new()));
        let Err(Thrown::Exception {
            message,
            class_name,
            stack_trace,
            ..
        }) = thrower.invoke("main", &ctx)
        else {
            panic!("expected an exception");
        };
        assert_eq!(class_name, "IllegalStateException");
        assert_eq!(message.as_deref(), Some("nope"));
        assert_eq!(stack_trace[0].to_string(), "Greeter.main(Greeter.json:2)");
    }

    #[test]
    fn spin_ends_on_stop() {
        let spinner = class(r#"{ "methods": { "main": [ "spin" ] } }"#);
        let gate = Arc::new(ExecutionGate::new());
        let (ctx, _out) = context(Arc::clone(&gate));
        let _call = gate.enter_user_code();
        assert!(gate.request_stop());
        assert_eq!(spinner.invoke("main", &ctx), Err(Thrown::Stopped));
    }

    #[test]
    fn malformed_descriptor_is_rejected() {
        let loader = DescriptorLoader::new(Vec::new());
        let err = loader
            .define(&ClassBytecodes::new("Broken", "{ not json"))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Malformed { ref name, .. } if name == "Broken"));

        let err = loader
            .define(&ClassBytecodes::new("Odd", r#"{ "methods": { "main": [ "dance" ] } }"#))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Malformed { .. }));
    }

    #[test]
    fn classpath_directories_are_searched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Lib.json"),
            r#"{ "methods": { "main": [ { "return": "from disk" } ] } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("Bad.json"), "garbage").unwrap();

        let loader = DescriptorLoader::new(Vec::new());
        assert!(loader.find_class("Lib").is_none());
        assert!(matches!(
            loader.add_to_classpath("/nonexistent/classes"),
            Err(LoadError::Classpath { .. })
        ));
        loader
            .add_to_classpath(dir.path().to_str().unwrap())
            .unwrap();

        let lib = loader.find_class("Lib").expect("found on classpath");
        let (ctx, _out) = context(Arc::new(ExecutionGate::new()));
        assert_eq!(
            lib.invoke("main", &ctx).unwrap(),
            Value::Str("from disk".into())
        );
        assert!(loader.find_class("Bad").is_none());
        assert!(loader.find_class("Missing").is_none());
    }

    #[test]
    fn redefinition_replaces_descriptor() {
        let loader = DescriptorLoader::new(Vec::new());
        let v1 = loader
            .define(&ClassBytecodes::new("A", r#"{ "methods": { "main": [] } }"#))
            .unwrap();
        let v2 = loader
            .redefine(
                &v1,
                &ClassBytecodes::new("A", r#"{ "methods": { "other": [] } }"#),
            )
            .unwrap();
        assert!(!v2.has_method("main"));
        assert!(v2.has_method("other"));
    }
}
