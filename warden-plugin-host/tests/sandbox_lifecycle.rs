//! Sandbox state machine: timeouts, faults, unload and reuse.

mod common;

use common::{config, host, pid, script};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use warden_plugin_host::{
    Capability, ChannelConsent, HostConfig, PluginHostError, SandboxState, StaticConsent,
};

fn short_timeout(ms: u64) -> HostConfig {
    let mut config = config();
    config.sandbox.execution_timeout_ms = ms;
    config
}

#[tokio::test]
async fn successful_execution_moves_to_ready() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("hello");
    let instance = host.manager.load(script("hello", r#"return {"hello": "world"}"#)).unwrap();
    assert_eq!(instance.state(), SandboxState::Created);

    assert_eq!(host.manager.execute(&id).await.unwrap(), json!({ "hello": "world" }));
    assert_eq!(instance.state(), SandboxState::Ready);

    // Ready instances accept another execute.
    assert_eq!(instance.execute("return 2").await.unwrap(), json!(2));
    assert_eq!(instance.state(), SandboxState::Ready);
}

#[tokio::test]
async fn runaway_guest_is_terminated_on_timeout() {
    let host = host(short_timeout(200), Arc::new(StaticConsent::deny_all()));
    let id = pid("spinner");
    let instance = host.manager.load(script("spinner", "spin")).unwrap();

    let started = Instant::now();
    let err = host.manager.execute(&id).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    match err {
        PluginHostError::ExecutionTimeout {
            plugin_id,
            timeout_ms,
            rejected_calls,
        } => {
            assert_eq!(plugin_id, "spinner");
            assert_eq!(timeout_ms, 200);
            assert_eq!(rejected_calls, 0);
        }
        other => panic!("expected ExecutionTimeout, got {other:?}"),
    }
    assert_eq!(instance.state(), SandboxState::Terminated);

    // No auto-restart.
    assert!(matches!(
        host.manager.execute(&id).await,
        Err(PluginHostError::Terminated { .. })
    ));
}

#[tokio::test]
async fn timeout_rejects_calls_still_waiting_on_consent() {
    // The prompt is delivered but never answered.
    let (consent, mut prompts) = ChannelConsent::new(4);
    let host = host(short_timeout(300), Arc::new(consent));
    let id = pid("stuck");
    host.manager
        .load(script("stuck", r#"call storage.get ["k"] because needs state"#))
        .unwrap();

    let (result, prompt) = tokio::join!(host.manager.execute(&id), prompts.recv());
    assert_eq!(prompt.unwrap().request.capability, Capability::Storage);
    assert!(matches!(
        result,
        Err(PluginHostError::ExecutionTimeout {
            rejected_calls: 1,
            ..
        })
    ));
    assert_eq!(host.manager.instance(&id).unwrap().state(), SandboxState::Terminated);
}

#[tokio::test]
async fn raised_failure_faults_the_sandbox() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("broken");
    let instance = host.manager.load(script("broken", "fail disk on fire")).unwrap();

    match host.manager.execute(&id).await.unwrap_err() {
        PluginHostError::SandboxFaulted { message, cause, .. } => {
            assert!(message.contains("disk on fire"), "{message}");
            assert!(cause.is_none());
        }
        other => panic!("expected SandboxFaulted, got {other:?}"),
    }
    assert_eq!(instance.state(), SandboxState::Terminated);
}

#[tokio::test]
async fn syntax_error_faults_before_any_call() {
    let host = host(config(), Arc::new(StaticConsent::grant_all()));
    let id = pid("typo");
    host.manager
        .load(script("typo", "call storage.set [\"k\", 1]\nexfiltrate everything"))
        .unwrap();

    match host.manager.execute(&id).await.unwrap_err() {
        PluginHostError::SandboxFaulted { message, .. } => {
            assert!(message.contains("line 2"), "{message}");
        }
        other => panic!("expected SandboxFaulted, got {other:?}"),
    }
    // Parsing failed up front, so storage was never touched.
    assert_eq!(host.manager.broker().prompts_issued(), 0);
}

#[tokio::test]
async fn unload_interrupts_running_execution() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let instance = host.manager.load(script("spinner", "spin")).unwrap();

    let started = Instant::now();
    let (result, ()) = tokio::join!(instance.execute("spin"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        instance.unload().await;
    });
    assert!(matches!(result, Err(PluginHostError::Terminated { .. })));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(instance.state(), SandboxState::Terminated);
}

#[tokio::test]
async fn overlapping_execute_is_rejected() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let instance = host.manager.load(script("slow", "")).unwrap();

    let (first, second) = tokio::join!(instance.execute("sleep 200\nreturn 1"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        instance.execute("return 2").await
    });
    assert_eq!(first.unwrap(), json!(1));
    assert!(matches!(second, Err(PluginHostError::ExecutionInProgress { .. })));
    assert_eq!(instance.state(), SandboxState::Ready);
}

#[tokio::test]
async fn terminated_plugin_can_be_loaded_again() {
    let host = host(short_timeout(100), Arc::new(StaticConsent::deny_all()));
    let id = pid("spinner");
    host.manager.load(script("spinner", "spin")).unwrap();
    assert!(host.manager.execute(&id).await.is_err());

    let fresh = host.manager.load(script("spinner", "return 1")).unwrap();
    assert_eq!(fresh.state(), SandboxState::Created);
    assert_eq!(host.manager.execute(&id).await.unwrap(), json!(1));
}

#[tokio::test]
async fn shutdown_unloads_everything() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let a = host.manager.load(script("a", "return 1")).unwrap();
    host.manager.load(script("b", "return 2")).unwrap();
    assert_eq!(host.manager.loaded(), vec![pid("a"), pid("b")]);

    host.manager.shutdown().await;
    assert_eq!(host.manager.plugin_count(), 0);
    assert_eq!(a.state(), SandboxState::Terminated);
}
