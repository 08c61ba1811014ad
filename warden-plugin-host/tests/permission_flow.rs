//! Consent flow between guest calls, the broker and the grant ledger.

mod common;

use common::{config, host, pid, script};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use warden_plugin_host::{
    Capability, ChannelConsent, Decision, ErrorCode, GrantSource, PluginHostError, StaticConsent,
};

const FETCH_WITH_CATCH: &str = r#"
try call network.fetch ["https://api.example.com/feed"] because sync your feed
return $last
"#;

#[tokio::test]
async fn granted_capability_is_not_prompted_again() {
    let (consent, mut prompts) = ChannelConsent::new(4);
    let host = host(config(), Arc::new(consent));
    let id = pid("notes");
    host.manager
        .load(script(
            "notes",
            r#"
            call storage.set ["greeting", "hi"] because remember your greeting
            call storage.get ["greeting"]
            return $last
            "#,
        ))
        .unwrap();

    let (result, ()) = tokio::join!(host.manager.execute(&id), async {
        let prompt = prompts.recv().await.unwrap();
        assert_eq!(prompt.request.plugin_id, pid("notes"));
        assert_eq!(prompt.request.capability, Capability::Storage);
        assert_eq!(prompt.request.reason, "remember your greeting");
        prompt.grant();
    });
    assert_eq!(result.unwrap(), json!("hi"));

    // Same instance, second execution: no new prompt.
    assert_eq!(host.manager.execute(&id).await.unwrap(), json!("hi"));
    assert_eq!(host.manager.broker().prompts_issued(), 1);
    assert!(prompts.try_recv().is_err());

    let instance = host.manager.instance(&id).unwrap();
    assert!(instance.granted().contains(&Capability::Storage));
    let events = instance.ledger_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].source, GrantSource::Consent);
    assert_eq!(events[0].reason.as_deref(), Some("remember your greeting"));
}

#[tokio::test]
async fn denial_is_reported_and_prompts_again() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("feeds");
    host.manager.load(script("feeds", FETCH_WITH_CATCH)).unwrap();

    let first = host.manager.execute(&id).await.unwrap();
    assert_eq!(first["error"]["code"], json!("permission-denied"));
    assert_eq!(first["error"]["detail"]["capability"], json!("network"));
    assert_eq!(first["error"]["detail"]["reason"], json!("sync your feed"));
    assert_eq!(first["error"]["detail"]["remembered"], json!(false));

    let second = host.manager.execute(&id).await.unwrap();
    assert_eq!(second["error"]["code"], json!("permission-denied"));
    assert_eq!(host.manager.broker().prompts_issued(), 2);
    assert!(host.fetcher.requests().is_empty());

    let instance = host.manager.instance(&id).unwrap();
    assert!(!instance.granted().contains(&Capability::Network));
    assert!(
        instance
            .ledger_events()
            .iter()
            .all(|e| e.decision == Decision::Denied)
    );
}

#[tokio::test]
async fn remembered_denial_skips_prompt() {
    let mut config = config();
    config.permissions.remember_denials = true;
    let host = host(config, Arc::new(StaticConsent::deny_all()));
    let id = pid("feeds");
    host.manager.load(script("feeds", FETCH_WITH_CATCH)).unwrap();

    host.manager.execute(&id).await.unwrap();
    let second = host.manager.execute(&id).await.unwrap();
    assert_eq!(second["error"]["code"], json!("permission-denied"));
    assert_eq!(second["error"]["detail"]["remembered"], json!(true));
    assert_eq!(host.manager.broker().prompts_issued(), 1);
}

#[tokio::test]
async fn uncaught_denial_faults_the_sandbox() {
    let host = host(config(), Arc::new(StaticConsent::deny_all()));
    let id = pid("feeds");
    host.manager
        .load(script("feeds", r#"call network.fetch ["https://api.example.com/feed"]"#))
        .unwrap();

    let err = host.manager.execute(&id).await.unwrap_err();
    match err {
        PluginHostError::SandboxFaulted { plugin_id, cause, .. } => {
            assert_eq!(plugin_id, "feeds");
            assert_eq!(cause.unwrap().code, ErrorCode::PermissionDenied);
        }
        other => panic!("expected SandboxFaulted, got {other:?}"),
    }
    assert!(matches!(
        host.manager.execute(&id).await,
        Err(PluginHostError::Terminated { .. })
    ));
}

#[tokio::test]
async fn guest_permission_request_grows_grant_set() {
    let host = host(config(), Arc::new(StaticConsent::grant_all()));
    let id = pid("feeds");
    host.manager
        .load(script("feeds", "request network because fetch feeds\nreturn $last"))
        .unwrap();

    assert_eq!(host.manager.execute(&id).await.unwrap(), json!({ "granted": true }));

    let instance = host.manager.instance(&id).unwrap();
    assert!(instance.granted().contains(&Capability::Network));
    let last = instance.ledger_events().pop().unwrap();
    assert_eq!(last.capability, Capability::Network);
    assert_eq!(last.reason.as_deref(), Some("fetch feeds"));
}

#[tokio::test]
async fn manifest_and_default_grants_never_prompt() {
    let mut config = config();
    config.permissions.default_grants = vec![Capability::Logger];
    let host = host(config, Arc::new(StaticConsent::deny_all()));
    let id = pid("quiet");
    host.manager
        .load(
            script(
                "quiet",
                "call logger.log [\"starting\"]\ncall storage.keys\nreturn $last",
            )
            .with_permissions([Capability::Storage]),
        )
        .unwrap();

    assert_eq!(host.manager.execute(&id).await.unwrap(), json!([]));
    assert_eq!(host.manager.broker().prompts_issued(), 0);
}
