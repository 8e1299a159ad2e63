use tracing::{error, info};

use super::client::{ContainerRuntime, ImageStore};
use super::error::{ContainerError, Result};
use super::spec::{ContainerDescriptor, NetworkBindings};
use super::{ContainerHandle, HandleCell};
use crate::models::{BuildConfig, ServerHooks};

/// Outcome of a rebuild that got as far as creating the new container.
#[derive(Debug)]
pub struct RebuildResult {
    pub container_id: String,
    pub image: String,
    /// Set when the previous container could not be removed. The new container is current regardless.
    pub removal_error: Option<ContainerError>,
}

impl RebuildResult {
    pub fn is_clean(&self) -> bool {
        self.removal_error.is_none()
    }
}

pub struct RebuildPipeline<'a> {
    runtime: &'a dyn ContainerRuntime,
    images: &'a dyn ImageStore,
    autoupdate_images: bool,
}

impl<'a> RebuildPipeline<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        images: &'a dyn ImageStore,
        autoupdate_images: bool,
    ) -> Self {
        Self {
            runtime,
            images,
            autoupdate_images,
        }
    }

    /// Image, bindings, creation, then retirement of the old container.
    /// Nothing is touched unless creation succeeds.
    pub async fn run(&self, handle: &HandleCell, server: &dyn ServerHooks) -> Result<RebuildResult> {
        let build = server.build();
        let uuid = server.uuid();

        info!("Rebuilding container for server {} with image {}", uuid, build.image);

        self.ensure_image(&build.image).await?;

        let network = Self::bind_network(&build);
        let descriptor =
            ContainerDescriptor::new(uuid.to_string(), &build, network, &server.data_path());
        let container_id = self.create(&descriptor).await?;

        let previous = handle.replace(ContainerHandle::new(container_id.clone()));
        info!(
            "Server {} now uses container {} (was {})",
            uuid,
            container_id,
            previous.id()
        );

        let removal_error = self.retire(previous.id()).await.err();

        Ok(RebuildResult {
            container_id,
            image: build.image,
            removal_error,
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let unavailable = |source| ContainerError::ImageUnavailable {
            image: image.to_string(),
            source,
        };

        if !self.autoupdate_images {
            if self.images.image_exists(image).await.map_err(unavailable)? {
                return Ok(());
            }
            info!("Image {} is not present locally, pulling it", image);
        }

        self.images.pull_image(image).await.map_err(unavailable)
    }

    fn bind_network(build: &BuildConfig) -> NetworkBindings {
        NetworkBindings::from_ports(&build.ports)
    }

    async fn create(&self, descriptor: &ContainerDescriptor) -> Result<String> {
        self.runtime
            .create(descriptor)
            .await
            .map_err(ContainerError::ContainerCreateFailed)
    }

    async fn retire(&self, id: &str) -> Result<()> {
        self.runtime.remove(id).await.map_err(|source| {
            error!("Failed to remove previous container {}: {:#}", id, source);
            ContainerError::ContainerRemoveFailed {
                id: id.to_string(),
                source,
            }
        })
    }
}
