use std::sync::Arc;
use std::time::Instant;

use crate::client::PersistentQueue;
use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub queue: Arc<PersistentQueue>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, queue: Arc<PersistentQueue>) -> Self {
        Self {
            settings: Arc::new(settings),
            queue,
            start_time: Instant::now(),
        }
    }
}
