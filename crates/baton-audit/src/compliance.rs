use crate::report::{AuditDecision, AuditStage, Finding, Severity};
use baton_core::{BatonError, BatonResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Relative weight of each structural check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceWeights {
    /// Out-of-bounds prone indexing, narrowing casts, unchecked access.
    #[serde(default = "default_bounds_weight")]
    pub bounds: f64,
    /// Unwraps, panics and swallowed errors outside test code.
    #[serde(default = "default_error_handling_weight")]
    pub error_handling: f64,
    /// Ratio of tests to non-test functions.
    #[serde(default = "default_tests_weight")]
    pub tests: f64,
}

fn default_bounds_weight() -> f64 {
    0.3
}
fn default_error_handling_weight() -> f64 {
    0.3
}
fn default_tests_weight() -> f64 {
    0.4
}

impl Default for ComplianceWeights {
    fn default() -> Self {
        Self {
            bounds: default_bounds_weight(),
            error_handling: default_error_handling_weight(),
            tests: default_tests_weight(),
        }
    }
}

/// Score of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckScore {
    /// Check name.
    pub check: String,
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Weight it was aggregated with.
    pub weight: f64,
}

/// Stage 3 output.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceReport {
    /// Weighted aggregate in `[0, 1]`.
    pub score: f64,
    /// Per-check scores.
    pub checks: Vec<CheckScore>,
    /// Violations found.
    pub findings: Vec<Finding>,
    /// Decision implied by the score.
    pub decision: AuditDecision,
}

struct Pattern {
    rule: &'static str,
    regex: Regex,
}

fn compile(rules: &[(&'static str, &str)]) -> BatonResult<Vec<Pattern>> {
    rules
        .iter()
        .map(|&(rule, pattern)| {
            Regex::new(pattern)
                .map(|regex| Pattern { rule, regex })
                .map_err(|e| BatonError::Config(format!("compliance rule '{rule}': {e}")))
        })
        .collect()
}

/// Weighted structural scoring with GO / CAUTION / NO-GO bars.
pub struct ComplianceScorer {
    weights: ComplianceWeights,
    go: f64,
    caution: f64,
    bounds: Vec<Pattern>,
    errors: Vec<Pattern>,
    test_markers: Regex,
    functions: Regex,
    test_section: Regex,
}

impl ComplianceScorer {
    /// Score at or above which the decision is GO.
    pub const GO: f64 = 0.95;
    /// Score at or above which the decision is CAUTION.
    pub const CAUTION: f64 = 0.90;

    /// Scorer with the standard bars.
    pub fn new(weights: ComplianceWeights) -> BatonResult<Self> {
        Self::with_thresholds(weights, Self::GO, Self::CAUTION)
    }

    /// Scorer with custom bars; requires `0 <= caution <= go <= 1`.
    pub fn with_thresholds(weights: ComplianceWeights, go: f64, caution: f64) -> BatonResult<Self> {
        let w = [weights.bounds, weights.error_handling, weights.tests];
        if w.iter().any(|x| !x.is_finite() || *x < 0.0) || w.iter().sum::<f64>() <= 0.0 {
            return Err(BatonError::Config(
                "compliance weights must be non-negative with a positive sum".into(),
            ));
        }
        if !(0.0..=1.0).contains(&caution) || !(caution..=1.0).contains(&go) {
            return Err(BatonError::Config(format!(
                "compliance thresholds must satisfy 0 <= caution ({caution}) <= go ({go}) <= 1"
            )));
        }
        let regex = |p: &str| {
            Regex::new(p).map_err(|e| BatonError::Config(format!("compliance pattern: {e}")))
        };
        Ok(Self {
            weights,
            go,
            caution,
            bounds: compile(&[
                ("index-arithmetic", r"\[[^\[\]]*[+-]\s*1\s*\]"),
                ("narrowing-cast", r"\bas\s+(u8|u16|u32|i8|i16|i32)\b"),
                ("unchecked-access", r"\.get_unchecked(_mut)?\s*\("),
                ("unsafe-block", r"\bunsafe\s*\{"),
            ])?,
            errors: compile(&[
                ("unwrap", r"\.unwrap\(\)"),
                ("expect", r"\.expect\("),
                ("panic", r"\bpanic!\s*\("),
                ("bare-except", r"^\s*except\s*:"),
                ("swallowed-error", r"catch\s*\([^)]*\)\s*\{\s*\}"),
                ("ignored-failure", r"\|\|\s*true\s*$"),
            ])?,
            test_markers: regex(
                r"#\[(tokio::)?test\]|^\s*def\s+test_\w+|^\s*(it|test)\s*\(\s*['\x22]",
            )?,
            functions: regex(r"\bfn\s+\w+|^\s*def\s+\w+|\bfunction\s+\w+|^\s*\w+\s*\(\)\s*\{")?,
            test_section: regex(r"#\[cfg\(test\)\]|^\s*(class\s+Test|describe\s*\()")?,
        })
    }

    /// Decision for a score.
    pub fn decide(&self, score: f64) -> AuditDecision {
        if score >= self.go {
            AuditDecision::Go
        } else if score >= self.caution {
            AuditDecision::Caution
        } else {
            AuditDecision::NoGo
        }
    }

    /// Scores a set of `(file name, content)` sources.
    pub fn score<'a, I>(&self, sources: I) -> ComplianceReport
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut findings = Vec::new();
        let mut bound_hits = 0usize;
        let mut error_hits = 0usize;
        let mut tests = 0usize;
        let mut functions = 0usize;

        for (file, content) in sources {
            let mut in_tests = file.contains("test");
            for (idx, line) in content.lines().enumerate() {
                let line_no = idx + 1;
                if self.test_section.is_match(line) {
                    in_tests = true;
                }
                if self.test_markers.is_match(line) {
                    tests += 1;
                }
                if self.functions.is_match(line) {
                    functions += 1;
                }
                for p in &self.bounds {
                    if p.regex.is_match(line) {
                        bound_hits += 1;
                        findings.push(
                            Finding::new(
                                AuditStage::Compliance,
                                p.rule,
                                Severity::Medium,
                                format!("bounds: {}", line.trim()),
                            )
                            .at(file, line_no),
                        );
                    }
                }
                if in_tests {
                    continue;
                }
                for p in &self.errors {
                    if p.regex.is_match(line) {
                        error_hits += 1;
                        findings.push(
                            Finding::new(
                                AuditStage::Compliance,
                                p.rule,
                                Severity::Medium,
                                format!("error handling: {}", line.trim()),
                            )
                            .at(file, line_no),
                        );
                    }
                }
            }
        }

        // Test functions match the function pattern too.
        let code_functions = functions.saturating_sub(tests);
        let coverage = if code_functions == 0 {
            1.0
        } else {
            (tests as f64 / code_functions as f64).min(1.0)
        };
        if coverage < 1.0 {
            findings.push(Finding::new(
                AuditStage::Compliance,
                "test-coverage",
                if tests == 0 { Severity::High } else { Severity::Low },
                format!("{tests} tests for {code_functions} functions"),
            ));
        }

        let checks = vec![
            CheckScore {
                check: "bounds".into(),
                score: (1.0 - 0.25 * bound_hits as f64).max(0.0),
                weight: self.weights.bounds,
            },
            CheckScore {
                check: "error_handling".into(),
                score: (1.0 - 0.2 * error_hits as f64).max(0.0),
                weight: self.weights.error_handling,
            },
            CheckScore {
                check: "tests".into(),
                score: coverage,
                weight: self.weights.tests,
            },
        ];
        let total_weight: f64 = checks.iter().map(|c| c.weight).sum();
        let score = checks.iter().map(|c| c.score * c.weight).sum::<f64>() / total_weight;

        ComplianceReport {
            score,
            decision: self.decide(score),
            checks,
            findings,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const CLEAN: &str = "pub fn add(a: i64, b: i64) -> i64 {\n    a + b\n}\n\n#[cfg(test)]\nmod tests {\n    #[test]\n    fn adds() {\n        assert_eq!(super::add(2, 2), 4);\n        let v: Vec<i64> = Vec::new();\n        assert!(v.first().is_none());\n        \"1\".parse::<i64>().unwrap();\n    }\n}\n";

    fn scorer() -> ComplianceScorer {
        ComplianceScorer::new(ComplianceWeights::default()).unwrap()
    }

    #[test]
    fn test_clean_code_is_go() {
        let report = scorer().score([("lib.rs", CLEAN)]);
        assert!((report.score - 1.0).abs() < 1e-9, "{report:?}");
        assert_eq!(report.decision, AuditDecision::Go);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_one_unwrap_is_caution() {
        let code = CLEAN.replace("    a + b\n", "    let _ = \"1\".parse::<i64>().unwrap();\n    a + b\n");
        let report = scorer().score([("lib.rs", code.as_str())]);
        // 0.3 * 1.0 + 0.3 * 0.8 + 0.4 * 1.0
        assert!((report.score - 0.94).abs() < 1e-9, "{report:?}");
        assert_eq!(report.decision, AuditDecision::Caution);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].rule, "unwrap");
        assert_eq!(report.findings[0].line, Some(2));
    }

    #[test]
    fn test_missing_tests_is_no_go() {
        let code = "pub fn add(a: i64, b: i64) -> i64 {\n    a + b\n}\n";
        let report = scorer().score([("lib.rs", code)]);
        assert!((report.score - 0.6).abs() < 1e-9);
        assert_eq!(report.decision, AuditDecision::NoGo);
        assert!(report.findings.iter().any(|f| f.rule == "test-coverage"));
    }

    #[test]
    fn test_non_code_output_scores_full() {
        let report = scorer().score([("result.json", "{\n  \"verdict\": \"approve\"\n}")]);
        assert_eq!(report.decision, AuditDecision::Go);
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let s = scorer();
        assert_eq!(s.decide(0.95), AuditDecision::Go);
        assert_eq!(s.decide(0.9), AuditDecision::Caution);
        assert_eq!(s.decide(0.8999), AuditDecision::NoGo);
    }

    #[test]
    fn test_invalid_configuration() {
        let zero = ComplianceWeights {
            bounds: 0.0,
            error_handling: 0.0,
            tests: 0.0,
        };
        assert!(ComplianceScorer::new(zero).is_err());
        assert!(ComplianceScorer::with_thresholds(ComplianceWeights::default(), 0.8, 0.9).is_err());
    }
}
