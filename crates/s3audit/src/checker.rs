use serde_json::Value as Json;
use std::fmt;

use mlinfra_aws::PublicAccessBlock;

use crate::{ApiError, S3Api, NO_BUCKET_POLICY, NO_ENCRYPTION, NO_PUBLIC_ACCESS_BLOCK};

/// Algorithm applied when fixing a bucket with no default encryption.
pub const FIX_ALGORITHM: &str = "AES256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    EncryptionDisabled,
    PublicAccessOpen(Vec<&'static str>),
    PublicPolicy,
}

impl Violation {
    fn exposes_public_access(&self) -> bool {
        matches!(self, Violation::PublicAccessOpen(_) | Violation::PublicPolicy)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::EncryptionDisabled => write!(f, "encryption not enabled"),
            Violation::PublicAccessOpen(flags) => write!(f, "insufficient public access block: {}", flags.join(", ")),
            Violation::PublicPolicy => write!(f, "bucket policy allows public access"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass(String),
    Violation(Violation),
    /// The check itself failed (permissions, network); not counted as a violation.
    Inconclusive(String),
    /// Still present, but neutralized by a fully blocking public access block.
    Mitigated(Violation),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComplianceReport {
    pub bucket: String,
    pub checks: Vec<(&'static str, CheckOutcome)>,
    /// Violations found before any fix ran.
    pub initial_violations: usize,
    pub fixes_applied: usize,
    pub failed_fixes: Vec<String>,
}

impl ComplianceReport {
    pub fn violations(&self) -> Vec<&Violation> {
        self.checks.iter().filter_map(|(_, o)| match o {
            CheckOutcome::Violation(v) => Some(v),
            _ => None,
        }).collect()
    }

    /// Current state of the bucket, after fixes if any ran.
    pub fn is_compliant(&self) -> bool { self.violations().is_empty() }

    /// Audit verdict: fails whenever the first pass found a violation, even
    /// if every violation was fixed afterwards.
    pub fn passed(&self) -> bool { self.initial_violations == 0 && self.is_compliant() }
}

impl fmt::Display for ComplianceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compliance report for bucket: {}", self.bucket)?;
        writeln!(f, "{}", "-".repeat(50))?;
        for (name, outcome) in &self.checks {
            match outcome {
                CheckOutcome::Pass(detail) => writeln!(f, "[ok]   {name}: {detail}")?,
                CheckOutcome::Violation(v) => writeln!(f, "[fail] {name}: {v}")?,
                CheckOutcome::Inconclusive(e) => writeln!(f, "[??]   {name}: check failed: {e}")?,
                CheckOutcome::Mitigated(v) => writeln!(f, "[warn] {name}: {v} (blocked by public access block)")?,
            }
        }
        if self.fixes_applied > 0 || !self.failed_fixes.is_empty() {
            writeln!(f, "fixes applied: {}", self.fixes_applied)?;
            for e in &self.failed_fixes { writeln!(f, "fix failed: {e}")?; }
        }
        writeln!(f, "{}", "=".repeat(50))?;
        let v = self.violations();
        if v.is_empty() && self.initial_violations > 0 {
            write!(f, "COMPLIANT after fixes ({} violation(s) found)", self.initial_violations)
        } else if v.is_empty() {
            write!(f, "COMPLIANT")
        } else {
            writeln!(f, "NON-COMPLIANT: {} violation(s)", v.len())?;
            for (i, v) in v.iter().enumerate() { writeln!(f, "  {}. {v}", i + 1)?; }
            Ok(())
        }
    }
}

pub struct ComplianceChecker<'a, A: S3Api> {
    api: &'a A,
    bucket: String,
    fix: bool,
}

impl<'a, A: S3Api> ComplianceChecker<'a, A> {
    pub fn new(api: &'a A, bucket: impl Into<String>, fix: bool) -> Self {
        Self { api, bucket: bucket.into(), fix }
    }

    pub fn check_encryption(&self) -> CheckOutcome {
        match self.api.get_bucket_encryption(&self.bucket) {
            Ok(algs) if !algs.is_empty() => CheckOutcome::Pass(format!("encrypted with {}", algs[0])),
            Ok(_) => CheckOutcome::Violation(Violation::EncryptionDisabled),
            Err(e) if e.code() == Some(NO_ENCRYPTION) => CheckOutcome::Violation(Violation::EncryptionDisabled),
            Err(e) => CheckOutcome::Inconclusive(e.to_string()),
        }
    }

    pub fn check_public_access(&self) -> CheckOutcome {
        let pab = match self.api.get_public_access_block(&self.bucket) {
            Ok(p) => p,
            Err(e) if e.code() == Some(NO_PUBLIC_ACCESS_BLOCK) => PublicAccessBlock::uniform(false),
            Err(e) => return CheckOutcome::Inconclusive(e.to_string()),
        };
        let open: Vec<&'static str> = [
            ("block_public_acls", pab.block_public_acls),
            ("block_public_policy", pab.block_public_policy),
            ("ignore_public_acls", pab.ignore_public_acls),
            ("restrict_public_buckets", pab.restrict_public_buckets),
        ].into_iter().filter(|(_, on)| !on).map(|(n, _)| n).collect();
        if open.is_empty() {
            CheckOutcome::Pass("public access blocked".to_string())
        } else {
            CheckOutcome::Violation(Violation::PublicAccessOpen(open))
        }
    }

    pub fn check_bucket_policy(&self) -> CheckOutcome {
        match self.api.get_bucket_policy(&self.bucket) {
            Ok(doc) if allows_public(&doc) => CheckOutcome::Violation(Violation::PublicPolicy),
            Ok(_) => CheckOutcome::Pass("no public statements".to_string()),
            Err(e) if e.code() == Some(NO_BUCKET_POLICY) => CheckOutcome::Pass("no bucket policy".to_string()),
            Err(e) => CheckOutcome::Inconclusive(e.to_string()),
        }
    }

    fn run_checks(&self) -> Vec<(&'static str, CheckOutcome)> {
        vec![
            ("encryption", self.check_encryption()),
            ("public_access", self.check_public_access()),
            ("bucket_policy", self.check_bucket_policy()),
        ]
    }

    /// Runs every check; with fixing enabled, remediates and re-checks. After
    /// a fix, a public policy behind a fully blocking public access block is
    /// reported as mitigated rather than as a violation.
    pub fn run(&self) -> ComplianceReport {
        tracing::info!(bucket = %self.bucket, fix = self.fix, "checking compliance");
        let checks = self.run_checks();
        let mut report = ComplianceReport { bucket: self.bucket.clone(), checks, ..Default::default() };
        report.initial_violations = report.violations().len();
        if report.is_compliant() || !self.fix { return report; }

        let violations: Vec<Violation> = report.violations().into_iter().cloned().collect();
        if violations.contains(&Violation::EncryptionDisabled) {
            self.apply_fix(&mut report, "encryption", || self.api.put_bucket_encryption(&self.bucket, FIX_ALGORITHM));
        }
        if violations.iter().any(Violation::exposes_public_access) {
            self.apply_fix(&mut report, "public_access", || {
                self.api.put_public_access_block(&self.bucket, PublicAccessBlock::uniform(true))
            });
        }
        if report.fixes_applied > 0 {
            let mut checks = self.run_checks();
            if matches!(checks[1].1, CheckOutcome::Pass(_))
                && checks[2].1 == CheckOutcome::Violation(Violation::PublicPolicy)
            {
                checks[2].1 = CheckOutcome::Mitigated(Violation::PublicPolicy);
            }
            report.checks = checks;
        }
        report
    }

    fn apply_fix(&self, report: &mut ComplianceReport, what: &str, f: impl FnOnce() -> Result<(), ApiError>) {
        match f() {
            Ok(()) => {
                tracing::info!(bucket = %self.bucket, fix = what, "fix applied");
                report.fixes_applied += 1;
            }
            Err(e) => {
                tracing::error!(bucket = %self.bucket, fix = what, error = %e, "fix failed");
                report.failed_fixes.push(format!("{what}: {e}"));
            }
        }
    }
}

/// An `Allow` statement whose principal is everyone.
pub fn allows_public(doc: &Json) -> bool {
    let statements = match doc.get("Statement") {
        Some(Json::Array(a)) => a.iter().collect::<Vec<_>>(),
        Some(s @ Json::Object(_)) => vec![s],
        _ => return false,
    };
    let is_wildcard = |p: &Json| match p {
        Json::String(s) => s == "*",
        Json::Array(a) => a.iter().any(|v| v == "*"),
        _ => false,
    };
    statements.into_iter().any(|s| {
        s.get("Effect").and_then(Json::as_str) == Some("Allow")
            && match s.get("Principal") {
                Some(p @ (Json::String(_) | Json::Array(_))) => is_wildcard(p),
                Some(Json::Object(m)) => m.get("AWS").is_some_and(|v| is_wildcard(v)),
                _ => false,
            }
    })
}
