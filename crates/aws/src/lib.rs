use serde::{Serialize, Deserialize};
use serde_json::{json, Value as Json};

pub mod bucket;
pub mod eks;

pub use bucket::{BucketSecurityConfig, BucketSecurityPlan, EncryptionRule, PolicyStatement, PublicAccessBlock};
pub use eks::{EksCluster, NodeGroup};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsProvider { pub region: String }
impl AwsProvider {
    /// Provider block bound to `var.aws_region`; `region` becomes that variable's default.
    pub fn to_tf_json(&self) -> Json {
        json!({ "provider": { "aws": { "region": "${var.aws_region}" } } })
    }
}

/// Stack-level inputs exposed as Terraform variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variables {
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub vpc_id: Option<String>,
    #[serde(default)]
    pub private_subnets: Vec<String>,
}

impl Variables {
    pub fn to_tf_json(&self, region: Option<&str>) -> Json {
        let mut vars = json!({
            "aws_region":      { "type": "string", "description": "AWS region" },
            "environment":     { "type": "string", "description": "Environment name" },
            "vpc_id":          { "type": "string", "description": "VPC hosting the cluster" },
            "private_subnets": { "type": "list(string)", "description": "Private subnet IDs for the cluster" },
        });
        if let Some(r) = region { vars["aws_region"]["default"] = json!(r); }
        if let Some(e) = &self.environment { vars["environment"]["default"] = json!(e); }
        if let Some(v) = &self.vpc_id { vars["vpc_id"]["default"] = json!(v); }
        if !self.private_subnets.is_empty() { vars["private_subnets"]["default"] = json!(self.private_subnets); }
        json!({ "variable": vars })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag="kind")]
pub enum AwsResource {
    #[serde(rename="secure_bucket")]
    SecureBucket {
        name: String,
        #[serde(flatten)]
        config: BucketSecurityConfig,
    },
    #[serde(rename="eks_cluster")]
    EksCluster {
        name: String,
        #[serde(flatten)]
        cluster: EksCluster,
    },
}

impl AwsResource {
    pub fn name(&self) -> &str {
        match self {
            AwsResource::SecureBucket { name, .. } | AwsResource::EksCluster { name, .. } => name,
        }
    }

    pub fn to_tf_json(&self) -> Json {
        match self {
            AwsResource::SecureBucket { name, config } => config.resolve().to_tf_json(name),
            AwsResource::EksCluster { name, cluster } => cluster.to_tf_json(name),
        }
    }
}

/// `bucket_name`, `cluster_endpoint` and `cluster_name`, taken from the first
/// bucket and the first cluster in the stack.
pub fn outputs_tf_json(resources: &[AwsResource]) -> Json {
    let mut out = json!({});
    if let Some(name) = resources.iter().find_map(|r| match r {
        AwsResource::SecureBucket { name, .. } => Some(name),
        _ => None,
    }) {
        out["bucket_name"] = json!({ "description": "Secure bucket name", "value": format!("${{aws_s3_bucket.{name}.id}}") });
    }
    if let Some(name) = resources.iter().find_map(|r| match r {
        AwsResource::EksCluster { name, .. } => Some(name),
        _ => None,
    }) {
        out["cluster_endpoint"] = json!({ "description": "EKS API endpoint", "value": format!("${{module.{name}.cluster_endpoint}}") });
        out["cluster_name"] = json!({ "description": "EKS cluster name", "value": format!("${{module.{name}.cluster_name}}") });
    }
    if out.as_object().map_or(true, |o| o.is_empty()) { return json!({}); }
    json!({ "output": out })
}
