//! Build artifacts handed to downstream consumers

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{BuildConfig, ExportConfig};
use crate::error::EngineError;
use crate::state::BuildState;

/// The immutable result of a successful build: the captured image plus
/// carried-forward metadata for chained post-processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub image_id: String,
    pub image_name: String,
    pub metadata: BTreeMap<String, String>,
}

impl Artifact {
    /// Assemble the artifact of a finished build pipeline.
    pub fn from_build(config: &BuildConfig, state: &BuildState) -> Result<Self, EngineError> {
        let image_id = state.require_image_id()?.to_string();
        let image_name = state
            .image_name
            .clone()
            .unwrap_or_else(|| config.image_name.clone());

        let mut metadata = BTreeMap::new();
        metadata.insert("region".into(), config.region.clone());
        metadata.insert("image_id".into(), image_id.clone());
        metadata.insert("image_name".into(), image_name.clone());
        for (region, replica_id) in &state.replicas {
            metadata.insert(format!("replica:{region}"), replica_id.clone());
        }

        Ok(Self {
            image_id,
            image_name,
            metadata,
        })
    }

    /// Assemble the artifact of a finished export pipeline.
    pub fn from_export(config: &ExportConfig, state: &BuildState) -> Result<Self, EngineError> {
        let job_id = state
            .export_job_id
            .clone()
            .ok_or(EngineError::MissingState("export_job_id"))?;
        let image_name = config
            .image_name
            .clone()
            .unwrap_or_else(|| config.image_id.clone());

        let mut metadata = BTreeMap::new();
        metadata.insert("region".into(), config.region.clone());
        metadata.insert("image_id".into(), config.image_id.clone());
        metadata.insert("image_name".into(), image_name.clone());
        metadata.insert("export_job_id".into(), job_id);

        Ok(Self {
            image_id: config.image_id.clone(),
            image_name,
            metadata,
        })
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Image Name: {} || Image ID: {}",
            self.image_name, self.image_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;

    fn config() -> BuildConfig {
        BuildConfig::builder()
            .region("us-south")
            .subnet_id("subnet-1")
            .profile("bx2-2x8")
            .image_id("img-base")
            .output_image_name("golden")
            .build()
            .unwrap()
    }

    #[test]
    fn build_artifact_requires_an_image() {
        let state = BuildState::new();
        assert!(matches!(
            Artifact::from_build(&config(), &state),
            Err(EngineError::MissingState("image_id"))
        ));
    }

    #[test]
    fn build_artifact_carries_forward_metadata() {
        let mut state = BuildState::new();
        state.image_id = Some("img-9".into());
        state.image_name = Some("golden".into());
        state.replicas.insert("eu-de".into(), "img-9-eu".into());

        let artifact = Artifact::from_build(&config(), &state).unwrap();
        assert_eq!(artifact.image_id, "img-9");
        assert_eq!(artifact.metadata_value("region"), Some("us-south"));
        assert_eq!(artifact.metadata_value("replica:eu-de"), Some("img-9-eu"));
        assert_eq!(artifact.to_string(), "Image Name: golden || Image ID: img-9");
    }
}
