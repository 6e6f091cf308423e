//! End-to-end control plane scenarios driven over HTTP.

use std::time::Duration;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use masterchef_core::{events::EventQuery, queue::JobStatus};
use serde_json::{Value, json};

#[path = "support/mod.rs"]
mod support;

use support::{build_test_app, eventually, str_field, test_config};

#[tokio::test]
async fn high_priority_job_finishes_first_after_resume() -> Result<()> {
    let app = build_test_app(test_config(), true)?;

    app.server
        .post("/v1/control/queue")
        .json(&json!({ "action": "pause" }))
        .await
        .assert_status_ok();

    let low = app
        .server
        .post("/v1/jobs")
        .json(&json!({ "config_path": "c.yaml", "priority": "low" }))
        .await;
    low.assert_status(StatusCode::ACCEPTED);
    let low_id = str_field(&low.json::<Value>(), "id").to_string();

    let high = app
        .server
        .post("/v1/jobs")
        .json(&json!({ "config_path": "c.yaml", "priority": "high" }))
        .await;
    high.assert_status(StatusCode::ACCEPTED);
    let high_id = str_field(&high.json::<Value>(), "id").to_string();

    app.server
        .post("/v1/control/queue")
        .json(&json!({ "action": "resume" }))
        .await
        .assert_status_ok();

    let events = app.control.events().clone();
    let succeeded = eventually(Duration::from_secs(5), || {
        let done = events.query(&EventQuery {
            type_prefix: Some("job.succeeded".into()),
            ..Default::default()
        });
        (done.len() == 2).then_some(done)
    })
    .await
    .expect("both jobs succeed");

    let order: Vec<&str> = succeeded
        .iter()
        .filter_map(|event| event.fields.get("job_id").and_then(Value::as_str))
        .collect();
    assert_eq!(order, vec![high_id.as_str(), low_id.as_str()]);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn freeze_blocks_enqueue_unless_forced() -> Result<()> {
    let app = build_test_app(test_config(), false)?;

    app.server
        .post("/v1/control/freeze")
        .json(&json!({ "enabled": true, "duration_seconds": 120 }))
        .await
        .assert_status_ok();

    let denied = app
        .server
        .post("/v1/jobs")
        .json(&json!({ "config_path": "c.yaml" }))
        .await;
    denied.assert_status(StatusCode::CONFLICT);
    let body: Value = denied.json();
    assert_eq!(body["gate"], "freeze");
    assert!(body["reason"].is_string());

    let forced = app
        .server
        .post("/v1/jobs")
        .add_header("X-Force-Apply", "true")
        .json(&json!({ "config_path": "c.yaml" }))
        .await;
    forced.assert_status(StatusCode::ACCEPTED);
    assert_eq!(forced.json::<Value>()["force"], true);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rule_enqueues_job_for_matching_event() -> Result<()> {
    let app = build_test_app(test_config(), true)?;

    let created = app
        .server
        .post("/v1/rules")
        .json(&json!({
            "name": "critical alerts",
            "source_prefix": "external.alert",
            "conditions": [{ "field": "fields.sev", "comparator": "eq", "value": "critical" }],
            "actions": [{ "enqueue_apply": { "config_path": "c.yaml", "priority": "high" } }]
        }))
        .await;
    created.assert_status(StatusCode::CREATED);
    let rule_id = str_field(&created.json::<Value>(), "id").to_string();

    let events = app.control.events().clone();
    eventually(Duration::from_secs(2), || {
        (events.subscriber_count() > 0).then_some(())
    })
    .await
    .expect("rule engine subscribed");

    app.server
        .post("/v1/events/ingest")
        .json(&json!({ "type": "external.alert", "fields": { "sev": "critical" } }))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let queue = app.control.queue().clone();
    let source = format!("rule:{rule_id}");
    let job = eventually(Duration::from_secs(2), || {
        queue
            .list(&Default::default())
            .into_iter()
            .find(|job| job.source == source)
    })
    .await
    .expect("rule enqueued a job within 2s");
    assert_eq!(job.priority.as_str(), "high");
    assert_eq!(job.config_path, "c.yaml");

    let listed: Value = app.server.get("/v1/jobs").await.json();
    assert!(
        listed
            .as_array()
            .is_some_and(|jobs| jobs.iter().any(|j| j["id"] == job.id.as_str()))
    );

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn converge_trigger_is_blocked_during_freeze() -> Result<()> {
    let app = build_test_app(test_config(), false)?;

    app.server
        .post("/v1/control/freeze")
        .json(&json!({ "enabled": true, "duration_seconds": 120, "reason": "release" }))
        .await
        .assert_status_ok();

    let response = app
        .server
        .post("/v1/converge/triggers")
        .json(&json!({
            "source": "package",
            "event_type": "package.updated",
            "config_path": "c.yaml"
        }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert!(response.text().contains("\"status\":\"blocked\""));

    let body: Value = response.json();
    assert!(body.get("job_id").is_none());
    assert!(app.control.queue().list(&Default::default()).is_empty());

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn expired_run_lease_is_recovered_once_and_fails_its_job() -> Result<()> {
    let app = build_test_app(test_config(), false)?;

    let job: Value = app
        .server
        .post("/v1/jobs")
        .json(&json!({ "config_path": "c.yaml" }))
        .await
        .json();
    let job_id = str_field(&job, "id").to_string();

    let lease = app
        .server
        .post("/v1/control/run-leases")
        .json(&json!({ "job_id": job_id, "holder": "H", "ttl": 1 }))
        .await;
    lease.assert_status(StatusCode::CREATED);
    let acquired_at: DateTime<Utc> = str_field(&lease.json::<Value>(), "acquired_at").parse()?;
    let now = acquired_at + chrono::Duration::seconds(2);

    let first: Value = app
        .server
        .post("/v1/control/run-leases/recover")
        .json(&json!({ "now": now }))
        .await
        .json();
    assert_eq!(first["recovered"], 1);

    let second: Value = app
        .server
        .post("/v1/control/run-leases/recover")
        .json(&json!({ "now": now }))
        .await
        .json();
    assert_eq!(second["recovered"], 0);

    let failed = app.control.queue().get(&job_id).expect("job exists");
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("stale run lease recovered"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn integrity_check_reports_tampered_event() -> Result<()> {
    let app = build_test_app(test_config(), false)?;

    for n in 0..6 {
        app.server
            .post("/v1/events/ingest")
            .json(&json!({ "type": "external.metric", "fields": { "n": n } }))
            .await
            .assert_status(StatusCode::ACCEPTED);
    }

    let report: Value = app.server.get("/v1/activity/integrity").await.json();
    assert_eq!(report["valid"], true);

    let events = app.control.events();
    let middle = events.len() / 2;
    assert!(events.tamper(middle, |event| event.message = "rewritten".into()));

    let report: Value = app.server.get("/v1/activity/integrity").await.json();
    assert_eq!(report["valid"], false);
    assert_eq!(report["break_at"], middle);

    app.shutdown().await;
    Ok(())
}
