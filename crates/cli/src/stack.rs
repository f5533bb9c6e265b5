use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value as Json};
use std::collections::BTreeSet;
use std::path::Path;

use mlinfra_aws::{outputs_tf_json, AwsProvider, AwsResource, Variables};
use mlinfra_tfcompat::merge;

#[derive(Debug, Deserialize)]
pub struct Stack {
    pub project: Option<String>,
    pub provider: Providers,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub resources: Vec<AwsResource>,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
    #[serde(default)] pub aws: Option<AwsProvider>,
}

impl Stack {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("read stack {}", path.display()))?;
        serde_yaml::from_slice(&raw).with_context(|| format!("parse stack {}", path.display()))
    }

    /// Builds `main.tf.json`. Buckets without their own environment inherit the stack's.
    pub fn render(&self) -> Result<Json> {
        let Some(aws) = &self.provider.aws else {
            anyhow::bail!("stack has no 'provider.aws' section");
        };
        let mut tf = json!({ "terraform": { "required_providers": {
            "aws": { "source": "hashicorp/aws", "version": "~> 5.0" }
        }}});
        tf = merge(tf, aws.to_tf_json());
        tf = merge(tf, self.variables.to_tf_json(Some(&aws.region)));

        let mut seen = BTreeSet::new();
        for r in &self.resources {
            if !seen.insert(r.name()) {
                anyhow::bail!("duplicate resource name '{}'", r.name());
            }
            let r = match r {
                AwsResource::SecureBucket { name, config } if config.environment.is_empty() => {
                    let mut config = config.clone();
                    config.environment = self.variables.environment.clone().unwrap_or_default();
                    AwsResource::SecureBucket { name: name.clone(), config }
                }
                other => other.clone(),
            };
            tf = merge(tf, r.to_tf_json());
        }
        tf = merge(tf, outputs_tf_json(&self.resources));
        tracing::debug!(project = ?self.project, resources = self.resources.len(), "rendered stack");
        Ok(tf)
    }
}
