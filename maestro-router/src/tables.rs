//! Routing rule tables: keyword weights, thresholds, file and error
//! suggestion rules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Routing thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Score at or above which the keyword leader wins outright.
    pub hard_threshold: f32,
    /// Gap below which the top two candidates count as ambiguous.
    pub ambiguity_band: f32,
    /// Score below which routing fails with suggestions.
    pub min_threshold: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            hard_threshold: 0.65,
            ambiguity_band: 0.1,
            min_threshold: 0.2,
        }
    }
}

/// One weighted keyword (a word or a phrase) for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    /// The normalized keyword; phrases allowed.
    pub keyword: String,
    /// Score contribution when present.
    pub weight: f32,
}

impl KeywordRule {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(keyword: &str, weight: f32) -> Self {
        Self {
            keyword: keyword.into(),
            weight,
        }
    }
}

/// All routing rule tables.
#[derive(Debug, Clone, Default)]
pub struct RoutingTables {
    /// Weighted keywords per workflow.
    pub keywords: HashMap<String, Vec<KeywordRule>>,
    /// File extension (without dot) to score multipliers per workflow.
    pub extension_boosts: HashMap<String, Vec<(String, f32)>>,
    /// File extension to suggested workflows, best first.
    pub file_suggestions: HashMap<String, Vec<String>>,
    /// Error class to suggested workflows, best first.
    pub error_suggestions: HashMap<String, Vec<String>>,
}

impl RoutingTables {
    /// The built-in tables covering the five flagship workflows.
    #[must_use]
    pub fn builtin() -> Self {
        let mut keywords = HashMap::new();
        keywords.insert(
            "code-review".to_string(),
            vec![
                KeywordRule::new("review", 0.5),
                KeywordRule::new("code review", 0.7),
                KeywordRule::new("diff", 0.35),
                KeywordRule::new("pull request", 0.5),
                KeywordRule::new("pr", 0.3),
                KeywordRule::new("refactor", 0.3),
                KeywordRule::new("readability", 0.3),
            ],
        );
        keywords.insert(
            "security-audit".to_string(),
            vec![
                KeywordRule::new("security", 0.55),
                KeywordRule::new("audit", 0.45),
                KeywordRule::new("vulnerability", 0.6),
                KeywordRule::new("vulnerabilities", 0.6),
                KeywordRule::new("cve", 0.5),
                KeywordRule::new("injection", 0.4),
                KeywordRule::new("owasp", 0.5),
            ],
        );
        keywords.insert(
            "bug-predict".to_string(),
            vec![
                KeywordRule::new("bug", 0.5),
                KeywordRule::new("bugs", 0.5),
                KeywordRule::new("crash", 0.45),
                KeywordRule::new("regression", 0.45),
                KeywordRule::new("error prone", 0.4),
                KeywordRule::new("hotspot", 0.35),
                KeywordRule::new("predict", 0.3),
            ],
        );
        keywords.insert(
            "test-gen".to_string(),
            vec![
                KeywordRule::new("test", 0.5),
                KeywordRule::new("tests", 0.5),
                KeywordRule::new("unit test", 0.6),
                KeywordRule::new("unit tests", 0.6),
                KeywordRule::new("coverage", 0.45),
                KeywordRule::new("generate tests", 0.7),
            ],
        );
        keywords.insert(
            "release-prep".to_string(),
            vec![
                KeywordRule::new("release", 0.55),
                KeywordRule::new("changelog", 0.6),
                KeywordRule::new("version bump", 0.5),
                KeywordRule::new("publish", 0.4),
                KeywordRule::new("ship", 0.3),
                KeywordRule::new("tag", 0.25),
            ],
        );

        let mut extension_boosts = HashMap::new();
        for ext in ["rs", "py", "ts", "js", "go", "java"] {
            extension_boosts.insert(
                ext.to_string(),
                vec![
                    ("code-review".to_string(), 1.2),
                    ("test-gen".to_string(), 1.1),
                ],
            );
        }
        extension_boosts.insert(
            "yml".to_string(),
            vec![("release-prep".to_string(), 1.2), ("security-audit".to_string(), 1.1)],
        );

        let mut file_suggestions = HashMap::new();
        for ext in ["rs", "py", "ts", "js", "go", "java"] {
            file_suggestions.insert(
                ext.to_string(),
                vec![
                    "code-review".to_string(),
                    "test-gen".to_string(),
                    "bug-predict".to_string(),
                ],
            );
        }
        for ext in ["yml", "yaml", "toml", "json"] {
            file_suggestions.insert(
                ext.to_string(),
                vec!["release-prep".to_string(), "security-audit".to_string()],
            );
        }
        file_suggestions.insert(
            "dockerfile".to_string(),
            vec!["security-audit".to_string(), "release-prep".to_string()],
        );

        let mut error_suggestions = HashMap::new();
        error_suggestions.insert(
            "panic".to_string(),
            vec!["bug-predict".to_string(), "code-review".to_string()],
        );
        error_suggestions.insert(
            "assertion".to_string(),
            vec!["test-gen".to_string(), "bug-predict".to_string()],
        );
        error_suggestions.insert(
            "security".to_string(),
            vec!["security-audit".to_string()],
        );
        error_suggestions.insert(
            "timeout".to_string(),
            vec!["bug-predict".to_string()],
        );

        Self {
            keywords,
            extension_boosts,
            file_suggestions,
            error_suggestions,
        }
    }

    /// Merge user-configured keywords over the built-ins (per-workflow
    /// replacement, not per-keyword).
    pub fn override_keywords(&mut self, workflow: &str, rules: Vec<KeywordRule>) {
        self.keywords.insert(workflow.to_string(), rules);
    }
}
