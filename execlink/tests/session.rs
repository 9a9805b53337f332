//! End-to-end sessions: a real agent and a host-side control over one stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use execlink::agent::{
    AgentOptions, ClassHandle, ClassLoader, InvocationContext, LoadError, Thrown, run_agent,
};
use execlink::bridge::codec::ResponseCodec;
use execlink::bridge::mux::Multiplexer;
use execlink::bridge::protocol::{COMMAND_CHANNEL, ClassBytecodes, Response, STOP_CHANNEL, StackFrame};
use execlink::bridge::transport::connect;
use execlink::control::{DebugControl, ExecutionControl};
use execlink::error::{ExecutionError, Link};
use execlink::forwarder::StreamingExecutionControl;
use execlink::io::{CapturedOutput, ScriptedInput, SessionIo};
use execlink::provider::{ProviderEnv, generate};
use execlink::remote::StopChannel;
use execlink::supervisor::{AgentLauncher, LaunchRequest, ProcessLauncher, SpawnError, SupervisorError};
use execlink::{ExecutionSpec, ProtocolConfig, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Child;

/// Bytecode is a behaviour name; anything unrecognised is returned as a string.
#[derive(Default)]
struct TestLoader {
    classpath: Mutex<HashMap<String, String>>,
}

struct TestClass {
    name: String,
    script: String,
}

impl ClassHandle for TestClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_method(&self, method: &str) -> bool {
        method == "main"
    }

    fn invoke(&self, _method: &str, ctx: &InvocationContext) -> Result<Value, Thrown> {
        match self.script.as_str() {
            "spin" => loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(2));
            },
            "echo" => {
                ctx.print("before\n")?;
                let mut input = Vec::new();
                while let Some(chunk) = ctx.read_input()? {
                    input.extend_from_slice(&chunk);
                }
                ctx.eprint("after\n")?;
                Ok(Value::Str(String::from_utf8_lossy(&input).into_owned()))
            }
            "chatty" => {
                for i in 0..50 {
                    ctx.print(&format!("line {i}\n"))?;
                }
                Ok(Value::Int(50))
            }
            "throw" => Err(Thrown::exception("IllegalStateException", Some("outer".into()))
                .with_stack(vec![StackFrame::new(&self.name, "main", Some("#1".into()), 3)])
                .with_cause(
                    Thrown::exception("IOException", Some("inner".into())).with_cause(
                        Thrown::Unresolved {
                            id: 7,
                            stack_trace: vec![StackFrame::new(&self.name, "helper", None, -1)],
                        },
                    ),
                )),
            "array" => Ok(Value::array(
                "int",
                vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            )),
            other => Ok(Value::Str(other.to_string())),
        }
    }

    fn static_field(&self, field: &str) -> Option<Value> {
        (field == "script").then(|| Value::Str(self.script.clone()))
    }
}

impl ClassLoader for TestLoader {
    fn define(&self, class: &ClassBytecodes) -> Result<Arc<dyn ClassHandle>, LoadError> {
        let script = String::from_utf8_lossy(&class.bytecodes).into_owned();
        if script == "bad" {
            return Err(LoadError::Malformed {
                name: class.name.clone(),
                reason: "not a class".to_string(),
            });
        }
        Ok(Arc::new(TestClass {
            name: class.name.clone(),
            script,
        }))
    }

    fn find_class(&self, name: &str) -> Option<Arc<dyn ClassHandle>> {
        let script = self.classpath.lock().unwrap().get(name)?.clone();
        Some(Arc::new(TestClass {
            name: name.to_string(),
            script,
        }))
    }

    fn add_to_classpath(&self, path: &str) -> Result<(), LoadError> {
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

fn echo_extension(
    _: &execlink::Executor,
    argument: serde_json::Value,
) -> Result<serde_json::Value, ExecutionError> {
    Ok(serde_json::json!({ "echo": argument }))
}

fn agent_options() -> AgentOptions {
    AgentOptions::default().with_extension("ECHO_JSON", Arc::new(echo_extension))
}

fn session(io: SessionIo) -> StreamingExecutionControl {
    let (host, agent) = tokio::io::duplex(64 * 1024);
    tokio::spawn(run_agent(agent, Arc::new(TestLoader::default()), agent_options()));
    StreamingExecutionControl::connect(host, io, ProtocolConfig::default())
}

fn captured_session() -> (StreamingExecutionControl, CapturedOutput) {
    let (io, captured) = SessionIo::capture();
    (session(io), captured)
}

fn classes(specs: &[(&str, &str)]) -> Vec<ClassBytecodes> {
    specs
        .iter()
        .map(|(name, script)| ClassBytecodes::new(*name, *script))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_load_reports_per_class_flags() {
    let (control, _captured) = captured_session();
    let err = control
        .load(&classes(&[("A", "alpha"), ("B", "bad"), ("C", "gamma")]))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ExecutionError::ClassInstall {
            message: "load: not all classes loaded".to_string(),
            installed: vec![true, false, true],
        }
    );

    assert_eq!(control.invoke("A", "main").await.unwrap(), "\"alpha\"");
    assert_eq!(control.invoke("C", "main").await.unwrap(), "\"gamma\"");
    assert!(matches!(
        control.invoke("B", "main").await,
        Err(ExecutionError::InternalProblem(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn redefine_without_support_is_not_implemented() {
    let (control, _captured) = captured_session();
    control.load(&classes(&[("A", "alpha")])).await.unwrap();
    let err = control
        .redefine(&classes(&[("A", "beta")]))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::NotImplemented(_)), "{err}");
    assert_eq!(control.invoke("A", "main").await.unwrap(), "\"alpha\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn exception_chain_survives_the_wire() {
    let (control, _captured) = captured_session();
    control.load(&classes(&[("Snippet", "throw")])).await.unwrap();

    let err = control.invoke("Snippet", "main").await.unwrap_err();
    let ExecutionError::User(outer) = &err else {
        panic!("expected a user exception, got {err}");
    };
    assert_eq!(outer.stack_trace[0].line_number, 3);

    let links: Vec<String> = outer
        .chain()
        .map(|link| match link {
            Link::User(user) => format!(
                "{}: {}",
                user.exception_class,
                user.message.as_deref().unwrap_or_default()
            ),
            Link::Resolution(unresolved) => format!("unresolved #{}", unresolved.id),
            Link::Internal(message) => format!("internal: {message}"),
        })
        .collect();
    assert_eq!(
        links,
        [
            "IllegalStateException: outer",
            "IOException: inner",
            "unresolved #7"
        ]
    );
    assert!(!control.is_terminated(), "user exceptions keep the session");
}

#[tokio::test(flavor = "multi_thread")]
async fn values_are_rendered_by_the_agent() {
    let (control, _captured) = captured_session();
    control
        .load(&classes(&[("Arr", "array"), ("Quote", "tab\there \"quoted\"")]))
        .await
        .unwrap();

    assert_eq!(control.invoke("Arr", "main").await.unwrap(), "int[3] { 1, 2, 3 }");
    assert_eq!(
        control.invoke("Quote", "main").await.unwrap(),
        r#""tab\there \"quoted\"""#
    );
    assert_eq!(
        control.var_value("Arr", "script").await.unwrap(),
        "\"array\""
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn classpath_classes_are_found_on_demand() {
    let (control, _captured) = captured_session();
    assert!(matches!(
        control.add_to_classpath("no separator").await,
        Err(ExecutionError::InternalProblem(_))
    ));
    control.add_to_classpath("Lib=from classpath").await.unwrap();
    assert_eq!(
        control.invoke("Lib", "main").await.unwrap(),
        "\"from classpath\""
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_callers_get_their_own_responses() {
    let (control, _captured) = captured_session();
    let control = Arc::new(control);
    let names: Vec<String> = (0..8).map(|i| format!("C{i}")).collect();
    let specs: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), n.as_str())).collect();
    control.load(&classes(&specs)).await.unwrap();

    let mut calls = Vec::new();
    for name in names {
        let control = Arc::clone(&control);
        calls.push(tokio::spawn(async move {
            let result = control.invoke(&name, "main").await.unwrap();
            (name, result)
        }));
    }
    for call in calls {
        let (name, result) = call.await.unwrap();
        assert_eq!(result, format!("\"{name}\""));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn output_arrives_before_the_response() {
    let (control, mut captured) = captured_session();
    control.load(&classes(&[("Chatty", "chatty")])).await.unwrap();

    assert_eq!(control.invoke("Chatty", "main").await.unwrap(), "50");
    let out = captured.take_out();
    assert_eq!(out.lines().count(), 50);
    assert!(out.ends_with("line 49\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn input_is_forwarded_on_request() {
    let (io, mut captured) = SessionIo::capture();
    let io = io.with_input(Arc::new(ScriptedInput::new(["hello ", "agent"])));
    let control = session(io);
    control.load(&classes(&[("Echo", "echo")])).await.unwrap();

    assert_eq!(
        control.invoke("Echo", "main").await.unwrap(),
        "\"hello agent\""
    );
    assert_eq!(captured.take_out(), "before\n");
    assert_eq!(captured.take_err(), "after\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_input_provider_reads_end_of_input() {
    let (control, _captured) = captured_session();
    control.load(&classes(&[("Echo", "echo")])).await.unwrap();
    assert_eq!(control.invoke("Echo", "main").await.unwrap(), "\"\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn extension_commands_carry_json() {
    let (control, _captured) = captured_session();
    let result = control
        .extension_command("ECHO_JSON", serde_json::json!({ "n": [1, 2] }))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({ "echo": { "n": [1, 2] } }));

    let err = control
        .extension_command("MISSING", serde_json::Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err, ExecutionError::not_implemented("Command: MISSING"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_command_when_idle_is_a_no_op() {
    let (control, _captured) = captured_session();
    control.stop().await.unwrap();
    control.load(&classes(&[("A", "alpha")])).await.unwrap();
    assert_eq!(control.invoke("A", "main").await.unwrap(), "\"alpha\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_side_channel_interrupts_running_code() {
    let (control, _captured) = captured_session();
    let control = Arc::new(control);
    control.load(&classes(&[("Spin", "spin")])).await.unwrap();
    let stop = StopChannel::new(control.side_channel(STOP_CHANNEL));

    let running = {
        let control = Arc::clone(&control);
        tokio::spawn(async move { control.invoke("Spin", "main").await })
    };
    let result = loop {
        stop.interrupt().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        if running.is_finished() {
            break running.await.unwrap();
        }
    };
    assert_eq!(result, Err(ExecutionError::Stopped));
    assert_eq!(control.var_value("Spin", "script").await.unwrap(), "\"spin\"");
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_agent_is_terminal_and_sticky() {
    let (host, mut agent) = tokio::io::duplex(4096);
    // Reads the first request, then dies.
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let _ = agent.read(&mut buf).await;
    });
    let (io, _captured) = SessionIo::capture();
    let control = StreamingExecutionControl::connect(host, io, ProtocolConfig::default());

    let first = control.invoke("A", "main").await.unwrap_err();
    assert!(first.is_terminal(), "{first}");
    assert_eq!(control.load(&[]).await.unwrap_err(), first);
    assert_eq!(
        control
            .extension_command("ECHO_JSON", serde_json::Value::Null)
            .await
            .unwrap_err(),
        first
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_reported_termination_is_sticky() {
    let (host, agent) = tokio::io::duplex(4096);
    tokio::spawn(async move {
        let (_read, write) = tokio::io::split(agent);
        let mux = Multiplexer::new(write);
        mux.channel(COMMAND_CHANNEL)
            .send(
                &mut ResponseCodec::default(),
                Response::Failure(ExecutionError::terminated("agent shutting down")),
            )
            .await
            .unwrap();
        // Keep the stream open: later calls must fail without reaching it.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    let (io, _captured) = SessionIo::capture();
    let control = StreamingExecutionControl::connect(host, io, ProtocolConfig::default());

    let expected = ExecutionError::terminated("agent shutting down");
    assert_eq!(control.invoke("A", "main").await.unwrap_err(), expected);
    assert_eq!(control.stop().await.unwrap_err(), expected);
}

/// Runs agents named `execlink-agent` in this process; everything else is
/// spawned for real.
struct TestLauncher;

impl AgentLauncher for TestLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<Option<Child>, SpawnError> {
        if request.program != "execlink-agent" {
            return ProcessLauncher.launch(request);
        }
        let address = request.address.clone();
        tokio::spawn(async move {
            let stream = connect(&address).await?;
            run_agent(stream, Arc::new(TestLoader::default()), agent_options()).await
        });
        Ok(None)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_provider_runs_a_full_session() {
    let (io, mut captured) = SessionIo::capture();
    let env = ProviderEnv::new(io).with_launcher(Arc::new(TestLauncher));
    let spec = ExecutionSpec::parse("remote:hostname(127.0.0.1),launch(true)").unwrap();
    let control = match generate(&spec, &env).await {
        Ok(control) => control,
        Err(e) => panic!("remote session failed: {e}"),
    };

    control.load(&classes(&[("Chatty", "chatty")])).await.unwrap();
    assert_eq!(control.invoke("Chatty", "main").await.unwrap(), "50");
    assert_eq!(captured.take_out().lines().count(), 50);

    control.close().await;
    assert!(control.load(&[]).await.unwrap_err().is_terminal());
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_skips_broken_agents() {
    let (io, _captured) = SessionIo::capture();
    let env = ProviderEnv::new(io).with_launcher(Arc::new(TestLauncher));
    let spec = ExecutionSpec::parse(
        "failover:0(remote:remoteAgent(/nonexistent/agent),hostname(127.0.0.1)),1(remote:hostname(127.0.0.1))",
    )
    .unwrap();
    let control = match generate(&spec, &env).await {
        Ok(control) => control,
        Err(e) => panic!("failover found no agent: {e}"),
    };
    control.load(&classes(&[("A", "alpha")])).await.unwrap();
    assert_eq!(control.invoke("A", "main").await.unwrap(), "\"alpha\"");
    control.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_exhaustion_names_each_attempt() {
    let (io, _captured) = SessionIo::capture();
    let env = ProviderEnv::new(io).with_launcher(Arc::new(TestLauncher));
    let spec = ExecutionSpec::parse(
        "failover:0(remote:remoteAgent(/nonexistent/one),hostname(127.0.0.1)),1(remote:remoteAgent(/nonexistent/two),hostname(127.0.0.1))",
    )
    .unwrap();
    let err = match generate(&spec, &env).await {
        Ok(_) => panic!("no alternative can connect"),
        Err(e) => e,
    };
    let SupervisorError::Exhausted {
        attempts,
        summary,
        last,
    } = &err
    else {
        panic!("expected exhaustion, got {err}");
    };
    assert_eq!(*attempts, 2);
    assert!(summary.contains("/nonexistent/one"), "{summary}");
    assert!(summary.contains("/nonexistent/two"), "{summary}");
    assert!(matches!(**last, SupervisorError::Spawn(_)));
}
