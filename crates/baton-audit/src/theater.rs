//! Stage 1: static detection of "theater" in produced artifacts.
//!
//! Theater is work that looks finished without being finished: placeholder
//! markers, stub bodies, assertions that cannot fail and hard-coded success
//! output. Each rule carries a weight; an artifact's score is the sum of the
//! weights of every match, and a score above the threshold fails the stage.

use crate::report::{AuditStage, Finding, Severity};
use baton_core::{BatonError, BatonResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default failure threshold.
pub const DEFAULT_THEATER_THRESHOLD: f64 = 40.0;

/// A pattern rule as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Rule id reported in findings.
    pub id: String,
    /// Regular expression matched line by line.
    pub pattern: String,
    /// Score added per matching line.
    pub weight: f64,
    /// What the rule detects.
    pub description: String,
}

impl RuleDefinition {
    fn new(id: &str, pattern: &str, weight: f64, description: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            weight,
            description: description.to_string(),
        }
    }
}

/// Built-in rule set.
pub fn default_rules() -> Vec<RuleDefinition> {
    vec![
        RuleDefinition::new(
            "placeholder-marker",
            r"\b(TODO|FIXME|XXX|HACK)\b",
            5.0,
            "placeholder marker left in the output",
        ),
        RuleDefinition::new(
            "unimplemented",
            r"\b(unimplemented!|todo!)\s*\(|raise\s+NotImplementedError|throw\s+new\s+Error\(\s*['\x22]not implemented",
            25.0,
            "body explicitly left unimplemented",
        ),
        RuleDefinition::new(
            "empty-stub",
            r"^\s*(pass|\.\.\.)\s*$|\bfn\s+\w+\s*\([^)]*\)\s*(->\s*[^{]+)?\{\s*\}|\bfunction\s+\w+\s*\([^)]*\)\s*\{\s*\}",
            15.0,
            "function or block with an empty body",
        ),
        RuleDefinition::new(
            "always-true-assert",
            r"assert!\s*\(\s*true\s*\)|assert_eq!\s*\(\s*(true\s*,\s*true|1\s*,\s*1)\s*\)|\bassert\s+True\b|\bassert\s+1\s*==\s*1\b|expect\(\s*true\s*\)\.toBe\(\s*true\s*\)",
            30.0,
            "assertion that cannot fail",
        ),
        RuleDefinition::new(
            "hardcoded-success",
            r"(?i)\b(mock|fake|dummy|stub)_?(result|response|success|output)\b|(print\w*!?|console\.log)\s*\(\s*['\x22](all\s+)?tests?\s+passed",
            20.0,
            "success reported without being computed",
        ),
    ]
}

#[derive(Debug)]
struct CompiledRule {
    def: RuleDefinition,
    regex: Regex,
}

/// Outcome of scanning one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Sum of matched rule weights.
    pub score: f64,
    /// One finding per matching line and rule.
    pub findings: Vec<Finding>,
}

/// Weighted pattern scanner.
#[derive(Debug)]
pub struct TheaterScanner {
    rules: Vec<CompiledRule>,
    threshold: f64,
}

impl TheaterScanner {
    /// Scanner with the built-in rules.
    pub fn new(threshold: f64) -> BatonResult<Self> {
        Self::with_rules(threshold, default_rules())
    }

    /// Scanner with a custom rule set.
    pub fn with_rules(threshold: f64, definitions: Vec<RuleDefinition>) -> BatonResult<Self> {
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(BatonError::Config(format!(
                "theater threshold must be positive, got {threshold}"
            )));
        }
        let rules = definitions
            .into_iter()
            .map(|def| {
                let regex = Regex::new(&def.pattern).map_err(|e| {
                    BatonError::Config(format!("theater rule '{}': {e}", def.id))
                })?;
                Ok(CompiledRule { def, regex })
            })
            .collect::<BatonResult<Vec<_>>>()?;
        Ok(Self { rules, threshold })
    }

    /// Failure threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether a score fails the stage.
    pub fn fails(&self, score: f64) -> bool {
        score > self.threshold
    }

    /// Scans `content`, attributing findings to `file`.
    pub fn scan(&self, file: &str, content: &str) -> ScanReport {
        let mut score = 0.0;
        let mut findings = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            for rule in &self.rules {
                if rule.regex.is_match(line) {
                    score += rule.def.weight;
                    findings.push(
                        Finding::new(
                            AuditStage::TheaterScan,
                            &rule.def.id,
                            severity_for(rule.def.weight),
                            format!("{}: {}", rule.def.description, line.trim()),
                        )
                        .at(file, idx + 1),
                    );
                }
            }
        }
        ScanReport { score, findings }
    }
}

fn severity_for(weight: f64) -> Severity {
    if weight >= 30.0 {
        Severity::High
    } else if weight >= 15.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}
