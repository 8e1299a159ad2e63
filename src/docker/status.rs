use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::models::{ServerHooks, ServerStatus};

/// The one place a server's status is written. Every change is reported to the server.
pub struct StatusCell {
    tx: watch::Sender<ServerStatus>,
    server: Arc<dyn ServerHooks>,
}

impl StatusCell {
    pub fn new(initial: ServerStatus, server: Arc<dyn ServerHooks>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, server }
    }

    pub fn get(&self) -> ServerStatus {
        *self.tx.borrow()
    }

    pub fn transition(&self, to: ServerStatus) {
        let from = self.tx.send_replace(to);
        if from != to {
            info!("Server {} status {} -> {}", self.server.uuid(), from, to);
            self.server.status_changed(to);
        }
    }
}
