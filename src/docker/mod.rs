mod client;
mod controller;
mod error;
mod rebuild;
mod session;
mod spec;
mod status;
mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::RwLock;

pub use client::{ContainerRuntime, DockerClient, ImageStore};
pub use controller::{ContainerController, ControllerSettings};
pub use telemetry::UsageSnapshot;

/// Reference to one engine container. Replaced on rebuild, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    id: String,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The handle a controller currently operates against.
#[derive(Debug)]
pub struct HandleCell(RwLock<ContainerHandle>);

impl HandleCell {
    pub fn new(handle: ContainerHandle) -> Self {
        Self(RwLock::new(handle))
    }

    pub fn current(&self) -> ContainerHandle {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs `next` and hands back the handle it displaced.
    pub fn replace(&self, next: ContainerHandle) -> ContainerHandle {
        let mut current = self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, next)
    }
}
