//! EKS cluster rendered as a `terraform-aws-modules/eks/aws` module block.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

pub const EKS_MODULE_SOURCE: &str = "terraform-aws-modules/eks/aws";
pub const EKS_MODULE_VERSION: &str = "~> 20.0";

fn default_cluster_version() -> String { "1.29".to_string() }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub instance_types: Vec<String>,
    pub min_size: u32,
    pub max_size: u32,
    pub desired_size: u32,
}

impl Default for NodeGroup {
    fn default() -> Self {
        Self { instance_types: vec!["m5.large".to_string()], min_size: 1, max_size: 3, desired_size: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EksCluster {
    pub cluster_name: String,
    #[serde(default = "default_cluster_version")]
    pub cluster_version: String,
    #[serde(default)]
    pub node_groups: BTreeMap<String, NodeGroup>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl EksCluster {
    pub fn to_tf_json(&self, name: &str) -> Json {
        let node_groups = if self.node_groups.is_empty() {
            BTreeMap::from([("default".to_string(), NodeGroup::default())])
        } else {
            self.node_groups.clone()
        };
        let mut tags: BTreeMap<String, String> = self.tags.clone();
        tags.entry("Environment".to_string()).or_insert_with(|| "${var.environment}".to_string());
        json!({
            "module": { name: {
                "source": EKS_MODULE_SOURCE,
                "version": EKS_MODULE_VERSION,
                "cluster_name": self.cluster_name,
                "cluster_version": self.cluster_version,
                "cluster_endpoint_public_access": true,
                "vpc_id": "${var.vpc_id}",
                "subnet_ids": "${var.private_subnets}",
                "eks_managed_node_groups": node_groups,
                "tags": tags
            }}
        })
    }
}
