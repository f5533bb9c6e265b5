use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

pub const TF_JSON_FILE: &str = "main.tf.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner { Terraform, Tofu }

pub fn pick_runner(prefer: Option<Runner>) -> Result<Runner> {
    if let Some(p) = prefer { return Ok(p); }
    if which::which("tofu").is_ok() { Ok(Runner::Tofu) }
    else if which::which("terraform").is_ok() { Ok(Runner::Terraform) }
    else { anyhow::bail!("Neither 'tofu' nor 'terraform' found in PATH") }
}

/// Deep-merges `b` into `a`; on non-object collisions `b` wins.
pub fn merge(a: Json, b: Json) -> Json {
    match (a, b) {
        (Json::Object(mut ma), Json::Object(mb)) => {
            for (k, v) in mb {
                let existing = ma.remove(&k).unwrap_or(Json::Null);
                ma.insert(k, merge(existing, v));
            }
            Json::Object(ma)
        }
        (_, v) => v,
    }
}

pub fn write_tf_json(tf: &Json, out: &Path) -> Result<()> {
    std::fs::create_dir_all(out).with_context(|| format!("create {}", out.display()))?;
    let path = out.join(TF_JSON_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(tf)?)
        .with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), "wrote terraform json");
    Ok(())
}

fn bin(r: Runner) -> &'static str { match r { Runner::Terraform => "terraform", Runner::Tofu => "tofu" } }

fn chdir(out: &Path) -> String { format!("-chdir={}", out.display()) }

fn run(r: Runner, out: &Path, args: &[&str]) -> Result<()> {
    let verb = args[0];
    tracing::info!(runner = bin(r), verb, dir = %out.display(), "running");
    let st = Command::new(bin(r)).arg(chdir(out)).args(args).status()
        .with_context(|| format!("spawn {verb}"))?;
    if !st.success() { anyhow::bail!("{verb} failed") }
    Ok(())
}

pub fn run_init(r: Runner, out: &Path) -> Result<()> { run(r, out, &["init", "-input=false"]) }
pub fn run_plan(r: Runner, out: &Path) -> Result<()> { run(r, out, &["plan", "-input=false"]) }
pub fn run_apply(r: Runner, out: &Path) -> Result<()> { run(r, out, &["apply", "-input=false", "-auto-approve"]) }
pub fn run_destroy(r: Runner, out: &Path) -> Result<()> { run(r, out, &["destroy", "-input=false", "-auto-approve"]) }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    #[serde(default)]
    pub sensitive: bool,
    pub value: Json,
}

/// Reads `terraform output -json` into name -> value.
pub fn read_outputs(r: Runner, out: &Path) -> Result<BTreeMap<String, Json>> {
    let o = Command::new(bin(r)).arg(chdir(out)).args(["output", "-json"]).output()
        .context("spawn output")?;
    if !o.status.success() {
        anyhow::bail!("output failed: {}", String::from_utf8_lossy(&o.stderr).trim())
    }
    parse_outputs(&o.stdout)
}

pub fn parse_outputs(raw: &[u8]) -> Result<BTreeMap<String, Json>> {
    let parsed: BTreeMap<String, OutputValue> = serde_json::from_slice(raw).context("parse terraform outputs")?;
    Ok(parsed.into_iter().map(|(k, v)| (k, v.value)).collect())
}
