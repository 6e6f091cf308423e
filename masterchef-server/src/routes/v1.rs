use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::{
        activity, control, events, jobs, leases, locks, query, rules, runs,
        schedules, triggers,
    },
};

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .merge(create_job_routes())
        .merge(create_activity_routes())
        .merge(create_automation_routes())
        .merge(create_control_routes())
        .merge(create_execution_routes())
        .route(
            "/query",
            get(query::list_entities).post(query::run_query),
        )
        .route("/runs", get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run))
}

fn create_job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", get(jobs::list_jobs).post(jobs::enqueue_job))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::cancel_job))
}

fn create_activity_routes() -> Router<AppState> {
    Router::new()
        .route("/activity", get(activity::list_activity))
        .route("/activity/stream", get(activity::activity_stream))
        .route("/activity/integrity", get(activity::activity_integrity))
        .route("/events/ingest", post(events::ingest_event))
        .route("/beacons", post(events::ingest_beacon))
}

/// Schedules, rules and converge triggers: everything that enqueues on
/// someone else's behalf.
fn create_automation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/schedules",
            get(schedules::list_schedules).post(schedules::create_schedule),
        )
        .route("/schedules/{id}", get(schedules::get_schedule))
        .route("/schedules/{id}/enable", post(schedules::enable_schedule))
        .route("/schedules/{id}/disable", post(schedules::disable_schedule))
        .route("/rules", get(rules::list_rules).post(rules::create_rule))
        .route("/rules/flags", get(rules::list_flags))
        .route("/rules/{id}", get(rules::get_rule))
        .route("/rules/{id}/enable", post(rules::enable_rule))
        .route("/rules/{id}/disable", post(rules::disable_rule))
        .route(
            "/converge/triggers",
            get(triggers::list_triggers).post(triggers::ingest_trigger),
        )
        .route("/converge/triggers/{id}", get(triggers::get_trigger))
}

fn create_control_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/control/emergency-stop",
            get(control::get_emergency_stop).post(control::set_emergency_stop),
        )
        .route(
            "/control/freeze",
            get(control::get_freeze).post(control::set_freeze),
        )
        .route(
            "/control/maintenance",
            get(control::list_maintenance).post(control::set_maintenance),
        )
        .route(
            "/control/queue",
            get(control::queue_status).post(control::queue_action),
        )
        .route("/control/recover-stuck", post(control::recover_stuck))
        .route(
            "/control/tenant-limits",
            get(control::list_tenant_limits).post(control::set_tenant_limit),
        )
        .route(
            "/control/cost-policy",
            get(control::get_cost_policy).post(control::set_cost_policy),
        )
        .route(
            "/control/topology-policies",
            get(control::list_topology_policies)
                .post(control::set_topology_policy),
        )
        .route(
            "/control/run-leases",
            get(leases::list_leases).post(leases::acquire_lease),
        )
        .route("/control/run-leases/heartbeat", post(leases::heartbeat_lease))
        .route("/control/run-leases/release", post(leases::release_lease))
        .route("/control/run-leases/recover", post(leases::recover_leases))
}

fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/execution/locks",
            get(locks::list_locks).post(locks::acquire_lock),
        )
        .route("/execution/locks/release", post(locks::release_lock))
        .route("/execution/locks/cleanup", post(locks::cleanup_locks))
}
