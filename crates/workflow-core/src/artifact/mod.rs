mod error;
mod store;

pub use error::ArtifactError;
pub use store::{ArtifactKey, ArtifactService, FsArtifactService};
