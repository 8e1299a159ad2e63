use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("another console session is already open for this container")]
    SessionBusy,

    #[error("no console session is attached to this container")]
    NoActiveStream,

    #[error("container runtime error: {0:#}")]
    Runtime(#[from] anyhow::Error),

    #[error("image {image} is unavailable: {source:#}")]
    ImageUnavailable {
        image: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to create container: {0:#}")]
    ContainerCreateFailed(#[source] anyhow::Error),

    #[error("failed to remove container {id}: {source:#}")]
    ContainerRemoveFailed {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, ContainerError>;
