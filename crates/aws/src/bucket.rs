//! Secure S3 bucket: public-access block, optional default encryption and a
//! bucket policy that denies every request made without TLS.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeMap;

fn default_true() -> bool { true }
fn default_sse() -> String { "AES256".to_string() }

/// Caller-supplied options for one bucket. Resolved once per render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSecurityConfig {
    pub bucket_name: String,
    /// Empty means "inherit the stack's environment".
    #[serde(default)]
    pub environment: String,
    #[serde(default = "default_true")]
    pub block_public_access: bool,
    #[serde(default = "default_true")]
    pub enable_encryption: bool,
    /// Passed to the provider as-is; `AES256` or `aws:kms`.
    #[serde(default = "default_sse")]
    pub encryption_type: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccessBlock {
    pub block_public_acls: bool,
    pub block_public_policy: bool,
    pub ignore_public_acls: bool,
    pub restrict_public_buckets: bool,
}

impl PublicAccessBlock {
    pub fn uniform(on: bool) -> Self {
        Self { block_public_acls: on, block_public_policy: on, ignore_public_acls: on, restrict_public_buckets: on }
    }

    pub fn blocks_all(&self) -> bool {
        self.block_public_acls && self.block_public_policy && self.ignore_public_acls && self.restrict_public_buckets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionRule { pub sse_algorithm: String }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Effect")]
    pub effect: String,
    #[serde(rename = "Principal")]
    pub principal: String,
    #[serde(rename = "Action")]
    pub action: String,
    #[serde(rename = "Resource")]
    pub resource: Vec<String>,
    #[serde(rename = "Condition")]
    pub condition: Json,
}

impl PolicyStatement {
    pub fn deny_insecure_transport(bucket: &str) -> Self {
        let arn = format!("arn:aws:s3:::{bucket}");
        Self {
            sid: "DenyInsecureTransport".to_string(),
            effect: "Deny".to_string(),
            principal: "*".to_string(),
            action: "s3:*".to_string(),
            resource: vec![arn.clone(), format!("{arn}/*")],
            condition: json!({ "Bool": { "aws:SecureTransport": "false" } }),
        }
    }
}

/// Settings derived from a [`BucketSecurityConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSecurityPlan {
    pub bucket_name: String,
    pub tags: BTreeMap<String, String>,
    pub public_access_block: PublicAccessBlock,
    pub encryption_rule: Option<EncryptionRule>,
    pub deny_insecure_transport: PolicyStatement,
}

impl BucketSecurityConfig {
    pub fn resolve(&self) -> BucketSecurityPlan {
        let mut tags = self.tags.clone();
        if !self.environment.is_empty() {
            tags.entry("Environment".to_string()).or_insert_with(|| self.environment.clone());
        }
        BucketSecurityPlan {
            bucket_name: self.bucket_name.clone(),
            tags,
            public_access_block: PublicAccessBlock::uniform(self.block_public_access),
            encryption_rule: self.enable_encryption
                .then(|| EncryptionRule { sse_algorithm: self.encryption_type.clone() }),
            deny_insecure_transport: PolicyStatement::deny_insecure_transport(&self.bucket_name),
        }
    }
}

impl BucketSecurityPlan {
    pub fn policy_document(&self) -> Json {
        json!({ "Version": "2012-10-17", "Statement": [ self.deny_insecure_transport ] })
    }

    /// Terraform JSON for the bucket and its satellite resources, all keyed by `name`.
    pub fn to_tf_json(&self, name: &str) -> Json {
        let bucket_ref = format!("${{aws_s3_bucket.{name}.id}}");
        let pab = &self.public_access_block;
        let mut o = json!({
            "resource": {
                "aws_s3_bucket": {
                    name: { "bucket": self.bucket_name, "tags": self.tags }
                },
                "aws_s3_bucket_public_access_block": {
                    name: {
                        "bucket": bucket_ref,
                        "block_public_acls": pab.block_public_acls,
                        "block_public_policy": pab.block_public_policy,
                        "ignore_public_acls": pab.ignore_public_acls,
                        "restrict_public_buckets": pab.restrict_public_buckets
                    }
                },
                "aws_s3_bucket_policy": {
                    name: { "bucket": bucket_ref, "policy": self.policy_document().to_string() }
                }
            }
        });
        if let Some(rule) = &self.encryption_rule {
            o["resource"]["aws_s3_bucket_server_side_encryption_configuration"] = json!({
                name: {
                    "bucket": bucket_ref,
                    "rule": [{ "apply_server_side_encryption_by_default": {
                        "sse_algorithm": rule.sse_algorithm
                    }}]
                }
            });
        }
        o
    }
}
