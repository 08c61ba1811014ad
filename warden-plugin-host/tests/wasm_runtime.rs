//! WebAssembly guests talking to the host through the `warden` import module.

mod common;

use common::{config, host, pid};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_plugin_host::{
    Capability, PluginHostError, PluginManifest, RuntimeKind, SandboxState, StaticConsent,
};

const IMPORTS: &str = r#"
  (import "warden" "call" (func $call (param i32 i32) (result i64)))
  (import "warden" "take_response" (func $take (param i32)))
  (memory (export "memory") 1)
"#;

fn wasm(id: &str, wat: String) -> PluginManifest {
    PluginManifest::new(pid(id), RuntimeKind::Wasm, wat).with_permissions([Capability::Logger])
}

/// A module that performs one host call with `request` and returns
/// `body` as its result.
fn calling_module(request: &str, body: &str) -> String {
    let escaped = request.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"(module {IMPORTS}
  (data (i32.const 0) "{escaped}")
  (func (export "run") (result i32)
    {body}))"#,
        body = body.replace("$LEN", &request.len().to_string()),
    )
}

#[tokio::test]
async fn host_call_returns_reply_length() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-logger");
    let module = calling_module(
        r#"{"method":"logger.log","args":["hello from wasm"]}"#,
        "(i32.wrap_i64 (call $call (i32.const 0) (i32.const $LEN)))",
    );
    host.manager.load(wasm("wasm-logger", module)).unwrap();

    // `{"ok":null}`
    assert_eq!(host.manager.execute(&id).await.unwrap(), json!(11));
}

#[tokio::test]
async fn take_response_copies_reply_into_guest_memory() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-reader");
    let module = calling_module(
        r#"{"method":"logger.log","args":["x"]}"#,
        "(drop (call $call (i32.const 0) (i32.const $LEN)))
    (call $take (i32.const 1024))
    (i32.load8_u (i32.const 1026))",
    );
    host.manager.load(wasm("wasm-reader", module)).unwrap();

    // Third byte of `{"ok":null}`.
    assert_eq!(host.manager.execute(&id).await.unwrap(), json!(i32::from(b'o')));
}

#[tokio::test]
async fn denied_call_is_an_error_reply_not_a_trap() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-store");
    // Storage is not granted and consent denies it; the reply is
    // `{"error":{...}}`, starting with `{"e`.
    let module = calling_module(
        r#"{"method":"storage.get","args":["k"],"reason":"cache"}"#,
        "(drop (call $call (i32.const 0) (i32.const $LEN)))
    (call $take (i32.const 1024))
    (i32.load8_u (i32.const 1026))",
    );
    host.manager.load(wasm("wasm-store", module)).unwrap();

    assert_eq!(host.manager.execute(&id).await.unwrap(), json!(i32::from(b'e')));
    assert_eq!(host.manager.broker().prompts_issued(), 1);
}

#[tokio::test]
async fn infinite_loop_is_interrupted_by_timeout() {
    let mut config = config();
    config.sandbox.execution_timeout_ms = 200;
    let host = host(config, Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-spin");
    let module = format!(
        r#"(module {IMPORTS}
  (func (export "run") (result i32)
    (loop $forever (br $forever))
    (i32.const 0)))"#
    );
    let instance = host.manager.load(wasm("wasm-spin", module)).unwrap();

    let started = Instant::now();
    let err = host.manager.execute(&id).await.unwrap_err();
    assert!(matches!(err, PluginHostError::ExecutionTimeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(instance.state(), SandboxState::Terminated);
}

#[tokio::test]
async fn timeout_during_compilation_still_stops_the_guest() {
    let mut config = config();
    config.sandbox.execution_timeout_ms = 5;
    config.sandbox.shutdown_grace_ms = 20_000;
    let host = host(config, Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-bulky");
    let filler: String = (0..3_000)
        .map(|i| format!("(func $f{i} (result i32) (i32.add (i32.const {i}) (i32.const 1)))\n"))
        .collect();
    let module = format!(
        r#"(module {IMPORTS}
  {filler}
  (func (export "run") (result i32)
    (loop $forever (br $forever))
    (i32.const 0)))"#
    );
    let instance = host.manager.load(wasm("wasm-bulky", module)).unwrap();

    let started = Instant::now();
    let err = host.manager.execute(&id).await.unwrap_err();
    assert!(matches!(err, PluginHostError::ExecutionTimeout { .. }), "{err:?}");
    // The guest thread exited on its own instead of outliving the grace period.
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(instance.state(), SandboxState::Terminated);
}

#[tokio::test]
async fn trap_faults_the_sandbox() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-trap");
    let module = format!(
        r#"(module {IMPORTS}
  (func (export "run") (result i32)
    unreachable))"#
    );
    let instance = host.manager.load(wasm("wasm-trap", module)).unwrap();

    assert!(matches!(
        host.manager.execute(&id).await,
        Err(PluginHostError::SandboxFaulted { .. })
    ));
    assert_eq!(instance.state(), SandboxState::Terminated);
}

#[tokio::test]
async fn memory_growth_is_capped() {
    let mut config = config();
    config.sandbox.max_memory_bytes = 2 * 65_536;
    let host = host(config, Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-hog");
    let module = format!(
        r#"(module {IMPORTS}
  (func (export "run") (result i32)
    (memory.grow (i32.const 16))))"#
    );
    host.manager.load(wasm("wasm-hog", module)).unwrap();

    // memory.grow reports failure as -1.
    assert_eq!(host.manager.execute(&id).await.unwrap(), json!(-1));
}

#[tokio::test]
async fn invalid_module_faults() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("wasm-bad");
    host.manager
        .load(wasm("wasm-bad", "(module (func".to_string()))
        .unwrap();

    match host.manager.execute(&id).await.unwrap_err() {
        PluginHostError::SandboxFaulted { message, .. } => {
            assert!(message.contains("invalid module"), "{message}");
        }
        other => panic!("expected SandboxFaulted, got {other:?}"),
    }
}
