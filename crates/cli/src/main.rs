use anyhow::{Result, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use mlinfra_policy::Policy;
use mlinfra_tfcompat as tfc;
use mlinfra_s3audit::{AwsCli, ComplianceChecker, S3Api};
use mlinfra_diag::{DiagnosisConfig, Diagnoser, SystemExec};

mod stack;

use stack::Stack;

#[derive(Parser, Debug)]
#[command(author, version, about="mlinfra: secure S3 + EKS provisioning (Terraform/OpenTofu), bucket compliance and latency diagnosis")]
struct Cli {
    /// Stack file (YAML)
    #[arg(short, long, global = true, default_value="stack.yaml")]
    file: PathBuf,

    /// Output directory
    #[arg(short, long, default_value="out", global = true)]
    out: PathBuf,

    /// Runner
    #[arg(long, value_enum, default_value_t=Runner::Auto, global = true)]
    runner: Runner,

    /// Allow unencrypted buckets
    #[arg(long, default_value_t=false, global = true)]
    allow_unencrypted: bool,

    /// Allow buckets without a full public access block
    #[arg(long, default_value_t=false, global = true)]
    allow_public_access: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum Runner { Auto, Terraform, Tofu }

#[derive(Subcommand, Debug)] enum Cmd {
    /// Write main.tf.json without running terraform
    Render,
    Init,
    Plan,
    Apply,
    Destroy,
    /// Print bucket name, cluster endpoint and cluster name after apply
    Outputs,
    /// Audit a live bucket's encryption, public access block and policy
    Comply {
        #[arg(long)] bucket: String,
        /// Remediate violations
        #[arg(long, default_value_t=false)] fix: bool,
        #[arg(long, env="AWS_REGION", default_value=mlinfra_diag::DEFAULT_REGION)] region: String,
    },
    /// Gather latency-debugging information from a running pod
    Diagnose {
        /// Pod name; defaults to the first pod matching --selector
        pod: Option<String>,
        #[arg(short='n', long, default_value="default")] namespace: String,
        #[arg(short='l', long, default_value="app=ml-inference")] selector: String,
        #[arg(long, default_value_t=8000)] container_port: u16,
        #[arg(long, default_value="/health")] health_path: String,
        #[arg(long)] prometheus_url: Option<String>,
        /// EKS cluster name; defaults to the current kubectl context
        #[arg(long)] cluster: Option<String>,
        #[arg(long, env="AWS_REGION", default_value=mlinfra_diag::DEFAULT_REGION)] region: String,
    },
}

fn render(cli: &Cli) -> Result<()> {
    let cfg = Stack::load(&cli.file)?;
    let tf = cfg.render()?;
    Policy::new(cli.allow_unencrypted, cli.allow_public_access).check_tf_json(&tf)?;
    tfc::write_tf_json(&tf, &cli.out)
}

/// Prints the audit report; fails when the audit found any violation,
/// including ones `--fix` has since remediated.
fn comply<A: S3Api>(api: &A, bucket: &str, fix: bool, mut out: impl Write) -> Result<()> {
    let report = ComplianceChecker::new(api, bucket, fix).run();
    writeln!(out, "{report}")?;
    if !report.passed() {
        if !fix { writeln!(out, "\nRe-run with --fix to remediate automatically")?; }
        anyhow::bail!("bucket '{}' is not compliant", bucket);
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let r = match cli.runner {
        Runner::Terraform => Some(tfc::Runner::Terraform),
        Runner::Tofu      => Some(tfc::Runner::Tofu),
        Runner::Auto      => None
    };

    match &cli.cmd {
      Cmd::Render  => render(&cli)?,
      Cmd::Init    => {
          render(&cli)?;
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
      },
      Cmd::Plan    => {
          render(&cli)?;
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_plan(runner, &cli.out)?;
      },
      Cmd::Apply   => {
          render(&cli)?;
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_apply(runner, &cli.out)?;
      },
      Cmd::Destroy => {
          render(&cli)?;
          let runner = tfc::pick_runner(r)?;
          tfc::run_init(runner, &cli.out)?;
          tfc::run_destroy(runner, &cli.out)?;
      },
      Cmd::Outputs => {
          let runner = tfc::pick_runner(r)?;
          let outputs = tfc::read_outputs(runner, &cli.out)?;
          println!("{}", serde_json::to_string_pretty(&outputs)?);
      },
      Cmd::Comply { bucket, fix, region } => {
          let api = AwsCli::new(region.as_str()).context("'aws' CLI not found in PATH. Install AWS CLI v2.")?;
          comply(&api, bucket, *fix, std::io::stdout().lock())?;
      },
      Cmd::Diagnose { pod, namespace, selector, container_port, health_path, prometheus_url, cluster, region } => {
          let cfg = DiagnosisConfig {
              pod: pod.clone(),
              namespace: namespace.clone(),
              selector: selector.clone(),
              region: region.clone(),
              container_port: *container_port,
              health_path: health_path.clone(),
              prometheus_url: prometheus_url.clone(),
              cluster: cluster.clone(),
          };
          let stdout = std::io::stdout();
          let summary = Diagnoser::new(&SystemExec, stdout.lock()).run(&cfg)?;
          tracing::info!(pod = %summary.pod, completed = summary.completed.len(),
              unavailable = summary.unavailable.len(), "diagnosis finished");
      },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use mlinfra_aws::PublicAccessBlock;
    use mlinfra_s3audit::ApiError;
    use serde_json::Value as Json;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn diagnose_pod_is_optional_positional() {
        let cli = Cli::try_parse_from(["mlinfra", "diagnose", "-n", "ml", "--cluster", "c"]).unwrap();
        match cli.cmd {
            Cmd::Diagnose { pod, namespace, container_port, .. } => {
                assert_eq!(pod, None);
                assert_eq!(namespace, "ml");
                assert_eq!(container_port, 8000);
            }
            other => panic!("unexpected {other:?}"),
        }
        let cli = Cli::try_parse_from(["mlinfra", "diagnose", "api-0"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::Diagnose { pod: Some(p), .. } if p == "api-0"));
    }

    #[test]
    fn comply_requires_bucket() {
        assert!(Cli::try_parse_from(["mlinfra", "comply"]).is_err());
        let cli = Cli::try_parse_from(["mlinfra", "comply", "--bucket", "b", "--fix", "--region", "eu-west-1"]).unwrap();
        assert!(matches!(cli.cmd, Cmd::Comply { fix: true, ref region, .. } if region == "eu-west-1"));
    }

    #[derive(Default)]
    struct Bucket {
        algorithms: std::cell::RefCell<Vec<String>>,
        pab: std::cell::RefCell<Option<PublicAccessBlock>>,
    }

    fn missing(code: &str) -> ApiError { ApiError::Service { code: code.to_string(), message: String::new() } }

    impl S3Api for Bucket {
        fn get_bucket_encryption(&self, _: &str) -> Result<Vec<String>, ApiError> {
            let a = self.algorithms.borrow();
            if a.is_empty() { Err(missing(mlinfra_s3audit::NO_ENCRYPTION)) } else { Ok(a.clone()) }
        }
        fn get_public_access_block(&self, _: &str) -> Result<PublicAccessBlock, ApiError> {
            (*self.pab.borrow()).ok_or_else(|| missing(mlinfra_s3audit::NO_PUBLIC_ACCESS_BLOCK))
        }
        fn get_bucket_policy(&self, _: &str) -> Result<Json, ApiError> {
            Err(missing(mlinfra_s3audit::NO_BUCKET_POLICY))
        }
        fn put_bucket_encryption(&self, _: &str, algorithm: &str) -> Result<(), ApiError> {
            self.algorithms.borrow_mut().push(algorithm.to_string());
            Ok(())
        }
        fn put_public_access_block(&self, _: &str, pab: PublicAccessBlock) -> Result<(), ApiError> {
            *self.pab.borrow_mut() = Some(pab);
            Ok(())
        }
    }

    #[test]
    fn comply_fails_when_violations_were_found_even_if_fixed() {
        let api = Bucket::default();
        let mut out = Vec::new();
        let err = comply(&api, "b", true, &mut out).unwrap_err();
        assert_eq!(err.to_string(), "bucket 'b' is not compliant");
        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("COMPLIANT after fixes (2 violation(s) found)"), "{printed}");
        assert!(!printed.contains("Re-run with --fix"));

        // the bucket is clean now, so a second audit passes
        let mut out = Vec::new();
        comply(&api, "b", false, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().trim_end().ends_with("COMPLIANT"));
    }

    #[test]
    fn comply_without_fix_suggests_it() {
        let mut out = Vec::new();
        assert!(comply(&Bucket::default(), "b", false, &mut out).is_err());
        assert!(String::from_utf8(out).unwrap().contains("Re-run with --fix"));
    }

    #[test]
    fn render_allows_open_bucket_only_with_override() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stack.yaml");
        std::fs::write(&file, "provider: { aws: { region: us-east-1 } }\nresources:\n  - { kind: secure_bucket, name: web, bucket_name: web, block_public_access: false }\n").unwrap();
        let out = dir.path().join("out");
        let args = |extra: &[&str]| {
            let mut v = vec!["mlinfra", "-f", file.to_str().unwrap(), "-o", out.to_str().unwrap()];
            v.extend_from_slice(extra);
            v.push("render");
            Cli::try_parse_from(v).unwrap()
        };
        let err = render(&args(&["--allow-unencrypted"])).unwrap_err();
        assert!(err.to_string().contains("leaves public access open"));
        render(&args(&["--allow-public-access"])).unwrap();
        let tf: Json = serde_json::from_str(&std::fs::read_to_string(out.join(tfc::TF_JSON_FILE)).unwrap()).unwrap();
        let pab = &tf["resource"]["aws_s3_bucket_public_access_block"]["web"];
        for flag in ["block_public_acls", "block_public_policy", "ignore_public_acls", "restrict_public_buckets"] {
            assert_eq!(pab[flag], false, "{flag}");
        }
    }

    #[test]
    fn render_writes_checked_json() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stack.yaml");
        std::fs::write(&file, "provider: { aws: { region: us-east-1 } }\nresources:\n  - { kind: secure_bucket, name: b, bucket_name: b, enable_encryption: false }\n").unwrap();
        let out = dir.path().join("out");
        let args = |extra: &[&str]| {
            let mut v = vec!["mlinfra", "-f", file.to_str().unwrap(), "-o", out.to_str().unwrap()];
            v.extend_from_slice(extra);
            v.push("render");
            Cli::try_parse_from(v).unwrap()
        };
        assert!(render(&args(&[])).is_err());
        render(&args(&["--allow-unencrypted"])).unwrap();
        assert!(out.join(tfc::TF_JSON_FILE).exists());
    }
}
