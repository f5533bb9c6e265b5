//! Live compliance audit of an S3 bucket through the AWS CLI.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::process::Command;
use std::sync::OnceLock;
use thiserror::Error;

use mlinfra_aws::PublicAccessBlock;

pub mod checker;

pub use checker::{CheckOutcome, ComplianceChecker, ComplianceReport, Violation};

pub const NO_ENCRYPTION: &str = "ServerSideEncryptionConfigurationNotFoundError";
pub const NO_PUBLIC_ACCESS_BLOCK: &str = "NoSuchPublicAccessBlockConfiguration";
pub const NO_BUCKET_POLICY: &str = "NoSuchBucketPolicy";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("aws cli not found in PATH")]
    MissingCli,
    #[error("{code}: {message}")]
    Service { code: String, message: String },
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Service { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Classifies AWS CLI stderr (`An error occurred (Code) when calling ...`).
    pub fn from_stderr(stderr: &str) -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"An error occurred \(([A-Za-z0-9.]+)\)").expect("static regex"));
        let message = stderr.trim().to_string();
        match re.captures(stderr) {
            Some(c) => ApiError::Service { code: c[1].to_string(), message },
            None => ApiError::Other(message),
        }
    }
}

/// The S3 control-plane calls the audit needs.
pub trait S3Api {
    /// Default SSE algorithms, one per rule.
    fn get_bucket_encryption(&self, bucket: &str) -> Result<Vec<String>, ApiError>;
    fn get_public_access_block(&self, bucket: &str) -> Result<PublicAccessBlock, ApiError>;
    fn get_bucket_policy(&self, bucket: &str) -> Result<Json, ApiError>;
    fn put_bucket_encryption(&self, bucket: &str, algorithm: &str) -> Result<(), ApiError>;
    fn put_public_access_block(&self, bucket: &str, pab: PublicAccessBlock) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionResponse { server_side_encryption_configuration: EncryptionConfiguration }
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionConfiguration { #[serde(default)] rules: Vec<EncryptionRuleWire> }
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionRuleWire { apply_server_side_encryption_by_default: Option<SseDefault> }
#[derive(Debug, Deserialize)]
struct SseDefault { #[serde(rename = "SSEAlgorithm")] sse_algorithm: String }

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublicAccessBlockWire {
    #[serde(default)] block_public_acls: bool,
    #[serde(default)] ignore_public_acls: bool,
    #[serde(default)] block_public_policy: bool,
    #[serde(default)] restrict_public_buckets: bool,
}
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublicAccessBlockResponse { public_access_block_configuration: PublicAccessBlockWire }

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PolicyResponse { policy: String }

impl From<PublicAccessBlockWire> for PublicAccessBlock {
    fn from(w: PublicAccessBlockWire) -> Self {
        PublicAccessBlock {
            block_public_acls: w.block_public_acls,
            block_public_policy: w.block_public_policy,
            ignore_public_acls: w.ignore_public_acls,
            restrict_public_buckets: w.restrict_public_buckets,
        }
    }
}

impl From<PublicAccessBlock> for PublicAccessBlockWire {
    fn from(p: PublicAccessBlock) -> Self {
        PublicAccessBlockWire {
            block_public_acls: p.block_public_acls,
            ignore_public_acls: p.ignore_public_acls,
            block_public_policy: p.block_public_policy,
            restrict_public_buckets: p.restrict_public_buckets,
        }
    }
}

pub fn parse_encryption(raw: &[u8]) -> Result<Vec<String>, ApiError> {
    let r: EncryptionResponse = serde_json::from_slice(raw).map_err(|e| ApiError::Other(e.to_string()))?;
    Ok(r.server_side_encryption_configuration.rules.into_iter()
        .filter_map(|r| r.apply_server_side_encryption_by_default)
        .map(|d| d.sse_algorithm)
        .collect())
}

pub fn parse_public_access_block(raw: &[u8]) -> Result<PublicAccessBlock, ApiError> {
    let r: PublicAccessBlockResponse = serde_json::from_slice(raw).map_err(|e| ApiError::Other(e.to_string()))?;
    Ok(r.public_access_block_configuration.into())
}

/// `get-bucket-policy` returns the document as an embedded JSON string.
pub fn parse_bucket_policy(raw: &[u8]) -> Result<Json, ApiError> {
    let r: PolicyResponse = serde_json::from_slice(raw).map_err(|e| ApiError::Other(e.to_string()))?;
    serde_json::from_str(&r.policy).map_err(|e| ApiError::Other(format!("bucket policy is not JSON: {e}")))
}

/// [`S3Api`] backed by `aws s3api`.
#[derive(Debug, Clone)]
pub struct AwsCli { bin: std::path::PathBuf, region: String }

impl AwsCli {
    pub fn new(region: impl Into<String>) -> Result<Self, ApiError> {
        let bin = which::which("aws").map_err(|_| ApiError::MissingCli)?;
        Ok(Self { bin, region: region.into() })
    }

    fn s3api(&self, args: &[&str]) -> Result<Vec<u8>, ApiError> {
        tracing::debug!(op = args[0], region = %self.region, "aws s3api");
        let out = Command::new(&self.bin)
            .arg("s3api").args(args)
            .args(["--region", &self.region, "--output", "json"])
            .output()
            .map_err(|e| ApiError::Other(format!("spawn aws s3api {}: {e}", args[0])))?;
        if out.status.success() { Ok(out.stdout) }
        else { Err(ApiError::from_stderr(&String::from_utf8_lossy(&out.stderr))) }
    }
}

impl S3Api for AwsCli {
    fn get_bucket_encryption(&self, bucket: &str) -> Result<Vec<String>, ApiError> {
        parse_encryption(&self.s3api(&["get-bucket-encryption", "--bucket", bucket])?)
    }

    fn get_public_access_block(&self, bucket: &str) -> Result<PublicAccessBlock, ApiError> {
        parse_public_access_block(&self.s3api(&["get-public-access-block", "--bucket", bucket])?)
    }

    fn get_bucket_policy(&self, bucket: &str) -> Result<Json, ApiError> {
        parse_bucket_policy(&self.s3api(&["get-bucket-policy", "--bucket", bucket])?)
    }

    fn put_bucket_encryption(&self, bucket: &str, algorithm: &str) -> Result<(), ApiError> {
        let cfg = json!({ "Rules": [{ "ApplyServerSideEncryptionByDefault": { "SSEAlgorithm": algorithm } }] });
        self.s3api(&["put-bucket-encryption", "--bucket", bucket,
            "--server-side-encryption-configuration", &cfg.to_string()])?;
        Ok(())
    }

    fn put_public_access_block(&self, bucket: &str, pab: PublicAccessBlock) -> Result<(), ApiError> {
        let cfg = serde_json::to_string(&PublicAccessBlockWire::from(pab))
            .map_err(|e| ApiError::Other(e.to_string()))?;
        self.s3api(&["put-public-access-block", "--bucket", bucket,
            "--public-access-block-configuration", &cfg])?;
        Ok(())
    }
}
