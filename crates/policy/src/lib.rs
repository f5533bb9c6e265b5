use regex::Regex;
use serde_json::Value as Json;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("Policy: {}", .0.join("; "))]
    Violations(Vec<String>),
}

fn identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("static regex"))
}

const PUBLIC_ACCESS_FLAGS: [&str; 4] =
    ["block_public_acls", "block_public_policy", "ignore_public_acls", "restrict_public_buckets"];

fn resource<'a>(tf: &'a Json, type_name: &str, name: &str) -> Option<&'a Json> {
    tf.get("resource")?.get(type_name)?.get(name)
}

/// Plan-time checks over rendered Terraform JSON.
pub struct Policy { pub allow_unencrypted: bool, pub allow_public_access: bool }

impl Policy {
    pub fn new(allow_unencrypted: bool, allow_public_access: bool) -> Self {
        Self { allow_unencrypted, allow_public_access }
    }

    pub fn check_tf_json(&self, tf: &Json) -> Result<(), PolicyError> {
        let mut violations = Vec::new();
        let resources = tf.get("resource");

        for block in ["resource", "module", "output", "variable"] {
            let Some(items) = tf.get(block).and_then(Json::as_object) else { continue };
            let names: Vec<&String> = if block == "resource" {
                items.values().filter_map(Json::as_object).flat_map(|m| m.keys()).collect()
            } else {
                items.keys().collect()
            };
            for n in names {
                if !identifier().is_match(n) {
                    violations.push(format!("{block} name '{n}' is not a valid identifier"));
                }
            }
        }

        if let Some(buckets) = resources.and_then(|r| r.get("aws_s3_bucket")).and_then(Json::as_object) {
            for name in buckets.keys() {
                let has_enc = resource(tf, "aws_s3_bucket_server_side_encryption_configuration", name).is_some();
                if !has_enc && !self.allow_unencrypted {
                    violations.push(format!("S3 bucket '{name}' requires encryption (SSE-S3 or KMS)"));
                }

                match resource(tf, "aws_s3_bucket_public_access_block", name) {
                    _ if self.allow_public_access => {}
                    None => violations.push(format!("S3 bucket '{name}' has no public access block")),
                    Some(pab) => {
                        let open: Vec<&str> = PUBLIC_ACCESS_FLAGS.iter().copied()
                            .filter(|f| pab.get(*f).and_then(Json::as_bool) != Some(true))
                            .collect();
                        if !open.is_empty() {
                            violations.push(format!("S3 bucket '{name}' leaves public access open: {}", open.join(", ")));
                        }
                    }
                }

                let denies_plain_http = resource(tf, "aws_s3_bucket_policy", name)
                    .and_then(|p| p.get("policy"))
                    .and_then(Json::as_str)
                    .and_then(|raw| serde_json::from_str::<Json>(raw).ok())
                    .is_some_and(|doc| denies_insecure_transport(&doc));
                if !denies_plain_http {
                    violations.push(format!("S3 bucket '{name}' must deny requests without TLS"));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            for v in &violations { tracing::warn!(violation = %v, "policy check failed"); }
            Err(PolicyError::Violations(violations))
        }
    }
}

/// True when some `Deny` statement is conditioned on `aws:SecureTransport = false`.
pub fn denies_insecure_transport(doc: &Json) -> bool {
    let statements = match doc.get("Statement") {
        Some(Json::Array(a)) => a.iter().collect::<Vec<_>>(),
        Some(s @ Json::Object(_)) => vec![s],
        _ => return false,
    };
    statements.into_iter().any(|s| {
        let deny = s.get("Effect").and_then(Json::as_str) == Some("Deny");
        let insecure = match s.pointer("/Condition/Bool/aws:SecureTransport") {
            Some(Json::String(v)) => v == "false",
            Some(Json::Bool(b)) => !b,
            _ => false,
        };
        deny && insecure
    })
}
