use std::sync::Arc;

use crate::{queue::ReplicationQueue, staging::LocalStaging};

#[derive(Clone)]
pub struct AppState {
    pub staging: Arc<LocalStaging>,
    pub queue: Arc<ReplicationQueue>,
    pub body_limit_bytes: usize,
}

impl AppState {
    pub fn new(
        staging: Arc<LocalStaging>,
        queue: Arc<ReplicationQueue>,
        body_limit_bytes: usize,
    ) -> Self {
        Self {
            staging,
            queue,
            body_limit_bytes,
        }
    }
}
