//! Latency diagnosis for a pod on EKS: a fixed sequence of `kubectl`, `curl`
//! and `aws` invocations, each printed under its own section heading.
//!
//! Required steps abort the run when they fail. Best-effort steps print
//! `<section>: not available` and the run continues.

use regex::Regex;
use std::io::Write;
use std::sync::OnceLock;
use thiserror::Error;

mod exec;

pub use exec::{Captured, Exec, SystemExec};

pub const DEFAULT_REGION: &str = "us-east-1";
pub const LATENCY_METRIC: &str = "mlops_inference_inference_latency_seconds";
pub const CURL_TIMING: &str =
    "dns=%{time_namelookup}s connect=%{time_connect}s tls=%{time_appconnect}s ttfb=%{time_starttransfer}s total=%{time_total}s http=%{http_code}\n";

#[derive(Error, Debug)]
pub enum DiagError {
    #[error("'{0}' not found in PATH")]
    MissingTool(String),
    #[error("spawn {program}: {source}")]
    Spawn { program: String, #[source] source: std::io::Error },
    #[error("{section} failed: {stderr}")]
    StepFailed { section: String, stderr: String },
    #[error("no pod matches selector '{selector}' in namespace '{namespace}'")]
    NoPod { namespace: String, selector: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisConfig {
    pub pod: Option<String>,
    pub namespace: String,
    pub selector: String,
    pub region: String,
    pub container_port: u16,
    pub health_path: String,
    pub prometheus_url: Option<String>,
    pub cluster: Option<String>,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            pod: None,
            namespace: "default".to_string(),
            selector: "app=ml-inference".to_string(),
            region: DEFAULT_REGION.to_string(),
            container_port: 8000,
            health_path: "/health".to_string(),
            prometheus_url: None,
            cluster: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub section: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
    pub required: bool,
}

impl Step {
    fn new(section: &'static str, program: &'static str, args: &[&str], required: bool) -> Self {
        Self { section, program, args: args.iter().map(|a| a.to_string()).collect(), required }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosisSummary {
    pub pod: String,
    pub cluster: Option<String>,
    pub completed: Vec<&'static str>,
    pub unavailable: Vec<&'static str>,
}

/// Cluster name from an EKS kubectl context (`arn:aws:eks:<region>:<account>:cluster/<name>`).
pub fn cluster_from_context(context: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^arn:aws[a-z-]*:eks:[a-z0-9-]+:\d+:cluster/([A-Za-z0-9][A-Za-z0-9_-]*)$").expect("static regex")
    });
    re.captures(context.trim()).map(|c| c[1].to_string())
}

/// The section sequence for `pod`; the EKS sections need a cluster name.
pub fn plan(cfg: &DiagnosisConfig, pod: &str, cluster: Option<&str>) -> Vec<(Step, bool)> {
    let ns = cfg.namespace.as_str();
    let url = format!("http://localhost:{}{}", cfg.container_port, cfg.health_path);
    let mut steps = vec![
        (Step::new("Pod status", "kubectl", &["get", "pod", pod, "-n", ns, "-o", "wide"], true), true),
        (Step::new("Pod details", "kubectl", &["describe", "pod", pod, "-n", ns], true), true),
        (Step::new("Resource usage", "kubectl", &["top", "pod", pod, "-n", ns, "--containers"], false), true),
        (Step::new("Node usage", "kubectl", &["top", "node"], false), true),
        (Step::new("Recent logs", "kubectl", &["logs", pod, "-n", ns, "--tail=50"], false), true),
        (Step::new("DNS resolution", "kubectl",
            &["exec", pod, "-n", ns, "--", "nslookup", "kubernetes.default"], false), true),
        (Step::new("Network reachability", "kubectl",
            &["exec", pod, "-n", ns, "--", "ping", "-c", "3", "-W", "2", "kubernetes.default"], false), true),
        (Step::new("HTTP latency", "kubectl",
            &["exec", pod, "-n", ns, "--", "curl", "-s", "-o", "/dev/null", "--max-time", "10", "-w", CURL_TIMING, url.as_str()], false), true),
    ];

    let query = format!("query=histogram_quantile(0.95, sum(rate({LATENCY_METRIC}_bucket[5m])) by (le))");
    let prom = cfg.prometheus_url.as_deref().map(|u| format!("{}/api/v1/query", u.trim_end_matches('/')));
    steps.push((
        Step::new("Prometheus p95 latency", "curl",
            &["-s", "--max-time", "10", "-G", prom.as_deref().unwrap_or_default(), "--data-urlencode", query.as_str()], false),
        prom.is_some(),
    ));

    let name = cluster.unwrap_or_default();
    let region = cfg.region.as_str();
    steps.push((
        Step::new("EKS cluster", "aws", &["eks", "describe-cluster", "--name", name, "--region", region,
            "--query", "cluster.{status:status,version:version,endpoint:endpoint}", "--output", "table"], false),
        cluster.is_some(),
    ));
    steps.push((
        Step::new("EKS node groups", "aws",
            &["eks", "list-nodegroups", "--cluster-name", name, "--region", region, "--output", "table"], false),
        cluster.is_some(),
    ));
    steps
}

pub struct Diagnoser<'a, E: Exec, W: Write> {
    exec: &'a E,
    out: W,
}

impl<'a, E: Exec, W: Write> Diagnoser<'a, E, W> {
    pub fn new(exec: &'a E, out: W) -> Self { Self { exec, out } }

    pub fn resolve_pod(&self, cfg: &DiagnosisConfig) -> Result<String, DiagError> {
        if let Some(p) = &cfg.pod { return Ok(p.clone()); }
        let args: Vec<String> = ["get", "pods", "-n", cfg.namespace.as_str(), "-l", cfg.selector.as_str(),
            "-o", "jsonpath={.items[0].metadata.name}"].iter().map(|a| a.to_string()).collect();
        let c = self.exec.run("kubectl", &args)?;
        if !c.success {
            return Err(DiagError::StepFailed { section: "Pod lookup".to_string(), stderr: c.stderr.trim().to_string() });
        }
        let pod = c.stdout.trim();
        if pod.is_empty() {
            return Err(DiagError::NoPod { namespace: cfg.namespace.clone(), selector: cfg.selector.clone() });
        }
        Ok(pod.to_string())
    }

    fn resolve_cluster(&self, cfg: &DiagnosisConfig) -> Option<String> {
        if cfg.cluster.is_some() { return cfg.cluster.clone(); }
        let args = vec!["config".to_string(), "current-context".to_string()];
        match self.exec.run("kubectl", &args) {
            Ok(c) if c.success => cluster_from_context(&c.stdout),
            _ => None,
        }
    }

    pub fn run(&mut self, cfg: &DiagnosisConfig) -> Result<DiagnosisSummary, DiagError> {
        let pod = self.resolve_pod(cfg)?;
        let cluster = self.resolve_cluster(cfg);
        tracing::info!(pod = %pod, namespace = %cfg.namespace, cluster = ?cluster, region = %cfg.region, "diagnosing latency");
        writeln!(self.out, "Latency diagnosis: pod {pod} (namespace {}, region {})", cfg.namespace, cfg.region)?;

        let mut summary = DiagnosisSummary { pod: pod.clone(), cluster: cluster.clone(), ..Default::default() };
        for (step, enabled) in plan(cfg, &pod, cluster.as_deref()) {
            writeln!(self.out, "\n=== {} ===", step.section)?;
            let result = if enabled { Some(self.exec.run(step.program, &step.args)) } else { None };
            match result {
                Some(Ok(c)) if c.success => {
                    write!(self.out, "{}", c.stdout)?;
                    if !c.stdout.ends_with('\n') { writeln!(self.out)?; }
                    summary.completed.push(step.section);
                }
                Some(Ok(c)) if step.required => {
                    return Err(DiagError::StepFailed { section: step.section.to_string(), stderr: c.stderr.trim().to_string() });
                }
                Some(Err(e)) if step.required => return Err(e),
                other => {
                    if let Some(Err(e)) = &other { tracing::warn!(section = step.section, error = %e, "step unavailable"); }
                    else { tracing::warn!(section = step.section, "step unavailable"); }
                    writeln!(self.out, "{}: not available", step.section)?;
                    summary.unavailable.push(step.section);
                }
            }
        }
        self.out.flush()?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    /// Answers by first matching `(program, first-arg-containing)` rule; unknown calls fail.
    struct Scripted {
        rules: Vec<(&'static str, &'static str, Result<Captured, &'static str>)>,
        calls: RefCell<Vec<String>>,
    }

    fn ok(out: &str) -> Result<Captured, &'static str> {
        Ok(Captured { success: true, stdout: out.to_string(), stderr: String::new() })
    }

    fn failed(err: &str) -> Result<Captured, &'static str> {
        Ok(Captured { success: false, stdout: String::new(), stderr: err.to_string() })
    }

    impl Exec for Scripted {
        fn run(&self, program: &str, args: &[String]) -> Result<Captured, DiagError> {
            let line = format!("{program} {}", args.join(" "));
            self.calls.borrow_mut().push(line.clone());
            for (p, needle, res) in &self.rules {
                if *p == program && line.contains(needle) {
                    return res.clone().map_err(|t| DiagError::MissingTool(t.to_string()));
                }
            }
            Ok(Captured { success: false, stdout: String::new(), stderr: "unscripted".to_string() })
        }
    }

    fn healthy() -> Vec<(&'static str, &'static str, Result<Captured, &'static str>)> {
        vec![
            ("kubectl", "get pods", ok("api-7d9f\n")),
            ("kubectl", "current-context", ok("arn:aws:eks:us-east-1:123456789012:cluster/mlops-dev\n")),
            ("kubectl", "get pod api-7d9f", ok("NAME READY\napi-7d9f 1/1\n")),
            ("kubectl", "describe pod", ok("Events: <none>")),
        ]
    }

    fn run(rules: Vec<(&'static str, &'static str, Result<Captured, &'static str>)>, cfg: &DiagnosisConfig)
        -> (Result<DiagnosisSummary, DiagError>, String, Vec<String>)
    {
        let exec = Scripted { rules, calls: RefCell::new(Vec::new()) };
        let mut out = Vec::new();
        let res = Diagnoser::new(&exec, &mut out).run(cfg);
        (res, String::from_utf8(out).unwrap(), exec.calls.into_inner())
    }

    #[test]
    fn best_effort_sections_degrade_to_not_available() {
        let (res, out, calls) = run(healthy(), &DiagnosisConfig::default());
        let s = res.unwrap();
        assert_eq!(s.pod, "api-7d9f");
        assert_eq!(s.cluster.as_deref(), Some("mlops-dev"));
        assert_eq!(s.completed, vec!["Pod status", "Pod details"]);
        assert!(out.contains("=== Pod status ===\nNAME READY\napi-7d9f 1/1\n"));
        assert!(out.contains("Events: <none>\n"));
        assert!(out.contains("Resource usage: not available"));
        assert!(out.contains("Prometheus p95 latency: not available"));
        // prometheus is skipped without a URL; everything else was attempted
        assert!(!calls.iter().any(|c| c.starts_with("curl ")));
        assert!(calls.iter().any(|c| c.contains("describe-cluster --name mlops-dev --region us-east-1")));
    }

    #[test]
    fn sections_print_in_fixed_order() {
        let (_, out, _) = run(healthy(), &DiagnosisConfig::default());
        let order: Vec<&str> = out.lines().filter_map(|l| l.strip_prefix("=== ")?.strip_suffix(" ===")).collect();
        assert_eq!(order, vec![
            "Pod status", "Pod details", "Resource usage", "Node usage", "Recent logs", "DNS resolution",
            "Network reachability", "HTTP latency", "Prometheus p95 latency", "EKS cluster", "EKS node groups",
        ]);
    }

    #[test]
    fn required_step_failure_aborts() {
        let mut rules = healthy();
        rules.insert(0, ("kubectl", "describe pod", failed("pods \"api-7d9f\" not found")));
        let (res, out, _) = run(rules, &DiagnosisConfig::default());
        match res {
            Err(DiagError::StepFailed { section, stderr }) => {
                assert_eq!(section, "Pod details");
                assert!(stderr.contains("not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!out.contains("Resource usage"));
    }

    #[test]
    fn missing_pod_is_an_error() {
        let rules = vec![("kubectl", "get pods", ok(""))];
        let (res, _, _) = run(rules, &DiagnosisConfig::default());
        assert!(matches!(res, Err(DiagError::NoPod { .. })));
    }

    #[test]
    fn explicit_pod_and_prometheus() {
        let mut rules = healthy();
        rules.push(("kubectl", "get pod web-1", ok("web-1 Running")));
        rules.push(("curl", "api/v1/query", ok("{\"status\":\"success\"}")));
        let cfg = DiagnosisConfig {
            pod: Some("web-1".to_string()),
            prometheus_url: Some("http://prometheus:9090/".to_string()),
            cluster: Some("prod".to_string()),
            ..Default::default()
        };
        let (res, out, calls) = run(rules, &cfg);
        let s = res.unwrap();
        assert!(s.completed.contains(&"Prometheus p95 latency"));
        assert!(out.contains("web-1 Running\n"));
        assert!(!calls.iter().any(|c| c.contains("get pods") || c.contains("current-context")));
        assert!(calls.iter().any(|c| c.contains("http://prometheus:9090/api/v1/query")
            && c.contains("mlops_inference_inference_latency_seconds_bucket[5m]")));
    }

    #[test]
    fn missing_tool_on_best_effort_step_is_tolerated() {
        let mut rules = healthy();
        rules.push(("aws", "eks", Err("aws")));
        let (res, out, _) = run(rules, &DiagnosisConfig::default());
        assert!(res.is_ok());
        assert!(out.contains("EKS cluster: not available"));
    }

    #[test]
    fn eks_context_parsing() {
        assert_eq!(cluster_from_context("arn:aws:eks:eu-west-1:123456789012:cluster/ml-prod\n").as_deref(), Some("ml-prod"));
        assert_eq!(cluster_from_context("kind-local"), None);
        assert_eq!(cluster_from_context("arn:aws:iam::123:role/x"), None);
    }

    #[test]
    fn no_cluster_skips_aws_sections() {
        let rules = healthy().into_iter().filter(|r| r.1 != "current-context").collect();
        let (res, out, calls) = run(rules, &DiagnosisConfig::default());
        assert_eq!(res.unwrap().cluster, None);
        assert!(out.contains("EKS node groups: not available"));
        assert!(!calls.iter().any(|c| c.starts_with("aws ")));
    }
}
