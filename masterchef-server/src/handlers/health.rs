use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::AppState;

pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let control = state.control();
    let status = if control.is_shutting_down() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "time": control.clock().now().to_rfc3339(),
        "started_at": state.started_at.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "last_event_seq": control.events().last_seq(),
    }))
}
