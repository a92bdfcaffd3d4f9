//! Deployment artifact writer.
//!
//! Writes the template and a small manifest naming it, in the layout the
//! provisioning tooling reads from an output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::StackResult;
use crate::template::Template;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: &str = "1.0.0";
pub const STACK_ARTIFACT_TYPE: &str = "aws:cloudformation:stack";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub version: String,
    pub artifacts: BTreeMap<String, StackArtifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackArtifact {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub properties: StackArtifactProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackArtifactProperties {
    pub template_file: String,
}

impl ArtifactManifest {
    pub fn from_file(path: &Path) -> StackResult<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Writes synthesized stacks into one output directory.
pub struct ArtifactWriter {
    output_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn template_file_name(stack_name: &str) -> String {
        format!("{}.template.json", stack_name)
    }

    /// Write `<stack>.template.json` and `manifest.json`; returns the
    /// template path.
    pub fn write(&self, stack_name: &str, template: &Template) -> StackResult<PathBuf> {
        fs::create_dir_all(&self.output_dir)?;

        let template_file = Self::template_file_name(stack_name);
        let template_path = self.output_dir.join(&template_file);
        fs::write(&template_path, template.to_json_pretty()?)?;

        let manifest = ArtifactManifest {
            version: MANIFEST_VERSION.to_string(),
            artifacts: BTreeMap::from([(
                stack_name.to_string(),
                StackArtifact {
                    artifact_type: STACK_ARTIFACT_TYPE.to_string(),
                    properties: StackArtifactProperties { template_file },
                },
            )]),
        };
        fs::write(
            self.output_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        info!(
            "Wrote {} with {} resources to {:?}",
            stack_name,
            template.resources.len(),
            self.output_dir
        );
        Ok(template_path)
    }
}
