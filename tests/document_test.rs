use std::collections::HashMap;

use cmdbatch::document::{BatchDocument, BatchTemplate, DocumentError};
use cmdbatch::executor::ExecutorEvent;
use cmdbatch::graph::{GraphValidator, PlanBuilder};
use cmdbatch::lifecycle::{Batch, BatchState};
use cmdbatch::model::{
    BatchConfiguration, BatchDraft, Command, CommandSpec, CommandType, Dependency, ExecutionMode, HttpRequestParams,
    Priority,
};
use cmdbatch::recovery::{CommandError, SuggestedFix};
use cmdbatch::registry::BatchRegistry;
use pretty_assertions::assert_eq;
use serde_json::json;

fn release_draft() -> BatchDraft {
    let notify = Command::new(
        "notify",
        CommandSpec::HttpRequest(HttpRequestParams {
            method: "POST".to_string(),
            url: "https://hooks.example.com/release".to_string(),
            headers: Default::default(),
            body: Some(json!({"text": "released"})),
        }),
    )
    .with_priority(Priority::High)
    .with_name("Notify channel");

    BatchDraft::new("release")
        .add_command(Command::shell("build", "make"))
        .add_command(Command::wait("settle", 2_000))
        .add_command(notify)
        .depend("build", "settle")
        .add_dependency(Dependency::success("settle", "notify"))
        .with_configuration(
            BatchConfiguration::new("release")
                .with_execution_mode(ExecutionMode::Mixed)
                .with_tag("prod"),
        )
}

#[test]
fn test_document_round_trip_keeps_ledger() {
    let mut batch = Batch::new(release_draft());
    batch.queue(&GraphValidator::new(), &PlanBuilder::new()).unwrap();
    batch.apply_event(ExecutorEvent::succeeded("build"));
    batch.apply_event(ExecutorEvent::failed(
        CommandError::new("settle", CommandType::Wait, "interrupted")
            .retryable(true)
            .with_fix(SuggestedFix::new("shorter", "Use a shorter wait").with_override("duration_ms", json!(500))),
    ));

    let json = BatchDocument::new(batch.clone()).to_json().unwrap();
    let restored = BatchDocument::from_json(&json).unwrap().into_batch();

    assert_eq!(restored.id(), batch.id());
    assert_eq!(restored.state(), BatchState::Executing);
    assert_eq!(restored.commands(), batch.commands());
    assert_eq!(restored.active_errors(), batch.active_errors());
    assert_eq!(restored.plan(), batch.plan());
}

#[test]
fn test_document_with_missing_records_is_rejected() {
    let batch = Batch::new(release_draft());
    let mut value = serde_json::to_value(BatchDocument::new(batch)).unwrap();
    value["batch"]["records"].as_object_mut().unwrap().remove("notify");

    let err = BatchDocument::from_json(&value.to_string()).unwrap_err();
    assert!(matches!(err, DocumentError::Inconsistent(_)));
}

#[test]
fn test_template_instantiates_with_original_values() {
    let draft = release_draft();
    let template = BatchTemplate::from_draft(&draft);

    let mut bindings = HashMap::new();
    for command in &draft.commands {
        for (key, value) in command.spec.parameters() {
            bindings.insert(format!("{}.{}", command.id, key), value);
        }
    }
    assert_eq!(bindings.len(), template.placeholders().len());

    let restored = BatchTemplate::from_json(&template.to_json().unwrap())
        .unwrap()
        .instantiate(&bindings)
        .unwrap();
    assert_eq!(restored, draft);
}

#[test]
fn test_template_rejects_ill_typed_binding() {
    let template = BatchTemplate::from_draft(&release_draft());
    let mut bindings: HashMap<String, serde_json::Value> = template
        .placeholders()
        .into_iter()
        .map(|name| (name, json!("x")))
        .collect();
    bindings.insert("notify.body".to_string(), json!(null));

    let err = template.instantiate(&bindings).unwrap_err();
    assert!(matches!(err, DocumentError::InvalidParameters { ref command_id, .. } if command_id == "settle"));
}

#[test]
fn test_registry_routes_events() {
    let registry = BatchRegistry::new();
    let id = registry.create(release_draft());
    let other = registry.create(release_draft());

    registry
        .with_batch(&id, |batch| batch.queue(&GraphValidator::new(), &PlanBuilder::new()))
        .unwrap()
        .unwrap();
    for command in ["build", "settle", "notify"] {
        registry.apply_event(&id, ExecutorEvent::succeeded(command)).unwrap();
    }

    assert_eq!(registry.status(&id).map(|s| s.state), Some(BatchState::Completed));
    assert_eq!(registry.status(&other).map(|s| s.state), Some(BatchState::Pending));

    let mut ids = registry.ids();
    ids.sort();
    let mut expected = vec![id, other];
    expected.sort();
    assert_eq!(ids, expected);

    assert!(registry.remove(&id).is_some());
    assert_eq!(registry.len(), 1);
}
