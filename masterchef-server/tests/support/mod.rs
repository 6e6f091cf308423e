#![allow(dead_code)]

use std::{fs, sync::Arc, time::Duration};

use anyhow::Result;
use axum_test::TestServer;
use masterchef_core::{ControlPlane, config::ControlPlaneConfig};
use masterchef_server::{AppState, create_app};
use serde_json::Value;
use tempfile::TempDir;

pub const CONFIG: &str =
    "resources:\n  - id: motd\n    type: file\n    path: motd\n    content: hello\n";

pub struct TestApp {
    pub server: TestServer,
    pub control: Arc<ControlPlane>,
    pub dir: TempDir,
}

impl TestApp {
    pub async fn shutdown(self) {
        self.control.shutdown(Duration::from_secs(5)).await;
    }
}

/// One worker, so completion order follows pickup order.
pub fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.queue.workers = 1;
    config
}

pub fn build_test_app(config: ControlPlaneConfig, start: bool) -> Result<TestApp> {
    let dir = TempDir::new()?;
    let workdir = dir.path().join("work");
    fs::create_dir_all(&workdir)?;
    fs::write(workdir.join("c.yaml"), CONFIG)?;

    let control = ControlPlane::builder(config, dir.path().join("state"), workdir)
        .build()?;
    if start {
        control.start();
    }

    let server = TestServer::builder()
        .build(create_app(AppState::new(control.clone())))
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;

    Ok(TestApp {
        server,
        control,
        dir,
    })
}

/// Polls `check` until it yields a value or `timeout` elapses.
pub async fn eventually<T>(timeout: Duration, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn str_field<'a>(body: &'a Value, key: &str) -> &'a str {
    body[key]
        .as_str()
        .unwrap_or_else(|| panic!("missing string field {key} in {body}"))
}
