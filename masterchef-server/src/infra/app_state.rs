use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use masterchef_core::ControlPlane;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlPlane>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(control: Arc<ControlPlane>) -> Self {
        let started_at = control.clock().now();
        Self {
            control,
            started_at,
        }
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
