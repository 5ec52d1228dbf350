use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use convoy::config::ServiceManager;
use convoy::dispatch::{QueueEventSink, Trigger};
use convoy::error::ConvoyError;
use convoy::operation::{Operation, OperationContext, OperationRegistry, OutputLog};
use convoy::queue::SharedQueue;
use convoy::store::{KvStore, MemoryStore};
use serde_json::json;
use tempfile::TempDir;

struct Fixture {
    store: Arc<MemoryStore>,
    triggers: SharedQueue<Trigger>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let triggers = SharedQueue::new(store.clone(), "convoy/queue/events");
        Self {
            store,
            triggers,
            dir: TempDir::new().unwrap(),
        }
    }

    fn context(&self) -> OperationContext {
        let mut variables = HashMap::new();
        variables.insert("node".to_string(), "web-1".to_string());
        variables.insert("version".to_string(), "1.2".to_string());
        OperationContext {
            variables,
            store: self.store.clone(),
            events: Arc::new(QueueEventSink::new(self.triggers.clone())),
            service_manager: ServiceManager::Init,
            pattern: "web".into(),
            pattern_dir: self.dir.path().to_path_buf(),
            roles: vec!["web".into()],
            token: Some("s3cret".into()),
            output: OutputLog::new(),
        }
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
}

async fn run(
    ctx: &mut OperationContext,
    declaration: serde_json::Value,
) -> Result<(), ConvoyError> {
    let op = OperationRegistry::builtin().build(declaration)?;
    op.run(ctx).await
}

#[tokio::test]
async fn test_echo_renders_variables() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    run(&mut ctx, json!({"echo": "deploy {{version}} on {{node}}"}))
        .await
        .unwrap();
    assert_eq!(ctx.output.contents(), "deploy 1.2 on web-1\n");
}

#[tokio::test]
async fn test_execute_captures_output() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    run(&mut ctx, json!({"execute": "echo hello {{node}}; echo oops >&2"}))
        .await
        .unwrap();
    let output = ctx.output.contents();
    assert!(output.contains("hello web-1"));
    assert!(output.contains("oops"));
}

#[tokio::test]
async fn test_execute_runs_in_pattern_dir() {
    let fixture = Fixture::new();
    std::fs::write(fixture.dir.path().join("marker.txt"), "found").unwrap();
    let mut ctx = fixture.context();
    run(&mut ctx, json!({"execute": {"script": "cat marker.txt"}}))
        .await
        .unwrap();
    assert!(ctx.output.contents().contains("found"));
}

#[tokio::test]
async fn test_execute_nonzero_exit_is_error() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let err = run(&mut ctx, json!({"execute": "exit 7"})).await.unwrap_err();
    match err {
        ConvoyError::Operation { name, message } => {
            assert_eq!(name, "execute");
            assert!(message.contains('7'));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_abandoned_execute_kills_script() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    let op = OperationRegistry::builtin()
        .build(json!({"execute": "sleep 1; touch late.txt"}))
        .unwrap();
    let abandoned = tokio::time::timeout(Duration::from_millis(200), op.run(&mut ctx)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!fixture.dir.path().join("late.txt").exists());
}

#[tokio::test]
async fn test_execute_file_relative_to_pattern() {
    let fixture = Fixture::new();
    fixture.script("setup.sh", "#!/bin/sh\necho from file\n");
    let mut ctx = fixture.context();
    run(&mut ctx, json!({"execute": {"file": "setup.sh"}}))
        .await
        .unwrap();
    assert!(ctx.output.contents().contains("from file"));

    let missing = run(&mut ctx, json!({"execute": {"file": "nope.sh"}})).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_kvs_put_get_delete() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();

    run(&mut ctx, json!({"kvs": {"action": "put", "key": "app/{{node}}", "value": "v{{version}}"}}))
        .await
        .unwrap();
    let stored = fixture.store.get("app/web-1").await.unwrap().unwrap();
    assert_eq!(stored.value_str(), "v1.2");

    run(&mut ctx, json!({"kvs": {"action": "get", "key": "app/web-1", "name": "current"}}))
        .await
        .unwrap();
    assert_eq!(ctx.variables.get("current").map(String::as_str), Some("v1.2"));

    run(&mut ctx, json!({"kvs": {"action": "delete", "key": "app/web-1"}}))
        .await
        .unwrap();
    assert!(fixture.store.get("app/web-1").await.unwrap().is_none());

    let missing = run(
        &mut ctx,
        json!({"kvs": {"action": "get", "key": "app/web-1", "name": "x"}}),
    )
    .await;
    assert!(matches!(missing, Err(ConvoyError::Operation { .. })));
}

#[tokio::test]
async fn test_event_fires_onto_queue() {
    let fixture = Fixture::new();
    let mut ctx = fixture.context();
    run(
        &mut ctx,
        json!({"event": {"name": "restart-{{node}}", "filter": {"service": "app", "tag": "blue"}}}),
    )
    .await
    .unwrap();

    let queued = fixture.triggers.items().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].name, "restart-web-1");
    assert_eq!(queued[0].payload.as_deref(), Some("s3cret"));
    assert!(ctx.output.contents().contains(&queued[0].id));
}

#[tokio::test]
async fn test_unknown_step_type_is_rejected() {
    let err = OperationRegistry::builtin()
        .build(json!({"teleport": {}}))
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Definition(_)));

    let err = OperationRegistry::builtin()
        .build(json!({"echo": "a", "execute": "b"}))
        .unwrap_err();
    assert!(matches!(err, ConvoyError::Definition(_)));
}
