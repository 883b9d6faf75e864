//! Static validation of generated Python source
//!
//! The validator parses the source once and runs every rule over the same
//! tree, collecting all violations rather than stopping at the first. It
//! holds no state between calls: the same source always produces the same
//! `ValidationResult`.

pub mod rules;

pub use rules::{is_file_io_call, Rule, PROHIBITED_MODULES};

use std::collections::HashSet;
use std::time::Instant;

use crate::analysis::SourceTree;
use crate::config::ValidatorConfig;
use crate::core_types::{ValidationResult, Violation, ViolationCategory};

#[derive(Debug, Clone)]
pub struct Validator {
    allow_list: HashSet<String>,
    max_source_bytes: usize,
    latency_budget_ms: u64,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&ValidatorConfig::default())
    }
}

impl Validator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            allow_list: config.allow_list().map(str::to_string).collect(),
            max_source_bytes: config.max_source_bytes,
            latency_budget_ms: config.latency_budget_ms,
        }
    }

    /// Validate raw source. Oversized or unparseable source produces a single
    /// violation and no rule runs.
    pub fn validate(&self, source: &str) -> ValidationResult {
        let started = Instant::now();

        if let Some(result) = self.check_size(source) {
            return result;
        }

        let mut result = match SourceTree::parse(source) {
            Ok(tree) => self.validate_tree(&tree),
            Err(e) => Self::syntax_failure(&e.message),
        };

        self.check_latency(started, &mut result);
        result
    }

    /// Parse once, validate, and hand the tree back for routing. The tree is
    /// `None` when the source never got past the size or syntax checks.
    pub fn validate_and_parse(&self, source: &str) -> (ValidationResult, Option<SourceTree>) {
        let started = Instant::now();

        if let Some(result) = self.check_size(source) {
            return (result, None);
        }

        match SourceTree::parse(source) {
            Ok(tree) => {
                let mut result = self.validate_tree(&tree);
                self.check_latency(started, &mut result);
                (result, Some(tree))
            }
            Err(e) => (Self::syntax_failure(&e.message), None),
        }
    }

    /// Run every rule over an already-parsed tree.
    pub fn validate_tree(&self, tree: &SourceTree) -> ValidationResult {
        let mut violations = Vec::new();
        for rule in Rule::ALL {
            violations.extend(rule.check_calls(&tree.calls));
            violations.extend(rule.check_imports(&tree.imports, &self.allow_list));
            violations.extend(rule.check_references(&tree.dunder_references));
        }
        ValidationResult::from_violations(violations, Vec::new())
    }

    pub fn is_allowed_import(&self, module: &str) -> bool {
        let base = module.split('.').next().unwrap_or_default();
        !PROHIBITED_MODULES.contains(&base) && self.allow_list.contains(base)
    }

    fn check_size(&self, source: &str) -> Option<ValidationResult> {
        if source.len() <= self.max_source_bytes {
            return None;
        }
        let violation = Violation {
            category: ViolationCategory::SourceTooLarge,
            name: None,
            message: format!(
                "Source too large: {} bytes exceeds the {} byte limit",
                source.len(),
                self.max_source_bytes
            ),
        };
        Some(ValidationResult::from_violations(vec![violation], Vec::new()))
    }

    fn syntax_failure(message: &str) -> ValidationResult {
        let violation = Violation {
            category: ViolationCategory::Syntax,
            name: None,
            message: format!("Syntax error: {}", message),
        };
        ValidationResult::from_violations(vec![violation], Vec::new())
    }

    fn check_latency(&self, started: Instant, result: &mut ValidationResult) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > self.latency_budget_ms {
            log::warn!(
                "Validation took {}ms, over the {}ms budget",
                elapsed_ms,
                self.latency_budget_ms
            );
            result.warnings.push(format!(
                "validation took {}ms (budget {}ms)",
                elapsed_ms, self.latency_budget_ms
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(result: &ValidationResult) -> Vec<ViolationCategory> {
        result.violations.iter().map(|v| v.category).collect()
    }

    #[test]
    fn test_clean_code_passes() {
        let validator = Validator::default();
        let result = validator.validate(
            "import math\nfrom collections import Counter\nprint(math.sqrt(16), Counter('aab').get('a'))\n",
        );
        assert!(result.is_valid, "unexpected errors: {:?}", result.errors);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_file_io_rejected() {
        let result = Validator::default().validate("with open('/etc/passwd') as f:\n    print(f.read())\n");
        assert!(!result.is_valid);
        assert!(result.has_category(ViolationCategory::FileIo));
        assert!(result
            .errors
            .contains(&"File I/O operation not allowed: open".to_string()));
    }

    #[test]
    fn test_os_command_rejected_with_import() {
        let result = Validator::default().validate("import os\nos.system('ls')\n");
        assert!(!result.is_valid);
        assert_eq!(
            categories(&result),
            vec![ViolationCategory::OsCommand, ViolationCategory::Import]
        );
        assert_eq!(
            result.errors,
            vec![
                "OS command execution not allowed: os.system".to_string(),
                "Unauthorized import detected: os".to_string(),
            ]
        );
    }

    #[test]
    fn test_network_rejected() {
        let result = Validator::default()
            .validate("import socket\ns = socket.socket()\ns.connect(('example.com', 80))\n");
        assert!(result.has_category(ViolationCategory::Network));
        assert!(result
            .errors
            .contains(&"Network operation not allowed: socket.socket".to_string()));
    }

    #[test]
    fn test_builtins_dict_import_rejected() {
        let result = Validator::default().validate("__builtins__.__dict__['__import__']('socket')\n");
        assert!(!result.is_valid);
        assert!(result.has_category(ViolationCategory::Import));
        assert_eq!(
            result.errors,
            vec![
                "Dynamic import or builtins access not allowed: __builtins__".to_string(),
                "Dynamic import or builtins access not allowed: __dict__".to_string(),
                "Dynamic import or builtins access not allowed: __import__".to_string(),
            ]
        );
    }

    #[test]
    fn test_introspection_routes_to_imports_rejected() {
        for source in [
            "globals()['__builtins__']['eval']('1')\n",
            "vars(__builtins__)['open']('x')\n",
            "getattr(__builtins__, 'exec')('print(1)')\n",
            "().__class__.__bases__[0].__subclasses__()\n",
            "f = print.__self__\nf.__dict__\n",
        ] {
            let result = Validator::default().validate(source);
            assert!(!result.is_valid, "accepted: {}", source);
            assert!(result.has_category(ViolationCategory::Import), "{}", source);
        }
    }

    #[test]
    fn test_ordinary_dunders_still_pass() {
        let source = "class Point:\n    def __init__(self, x):\n        self.x = x\n    def __repr__(self):\n        return f'Point({self.x})'\n\nif __name__ == '__main__':\n    print(repr(Point(1)), Point.__name__)\n";
        let result = Validator::default().validate(source);
        assert!(result.is_valid, "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_all_violations_aggregated() {
        let source = "import subprocess\nimport requests\nopen('x')\neval('1')\nrequests.get('http://x')\n";
        let result = Validator::default().validate(source);
        assert!(result.has_category(ViolationCategory::FileIo));
        assert!(result.has_category(ViolationCategory::OsCommand));
        assert!(result.has_category(ViolationCategory::Network));
        assert!(result.has_category(ViolationCategory::Import));
        assert_eq!(result.errors.len(), 5);
    }

    #[test]
    fn test_syntax_error_is_the_only_violation() {
        let result = Validator::default().validate("import os\ndef broken(:\n");
        assert!(!result.is_valid);
        assert_eq!(categories(&result), vec![ViolationCategory::Syntax]);
        assert!(result.errors[0].starts_with("Syntax error: "));
    }

    #[test]
    fn test_heavy_library_import_allowed() {
        let result = Validator::default().validate("import pandas as pd\nprint(pd.DataFrame({'a': [1]}))\n");
        assert!(result.is_valid, "unexpected errors: {:?}", result.errors);
    }

    #[test]
    fn test_unknown_import_rejected_until_allowed() {
        let source = "import sympy\nprint(sympy.sqrt(8))\n";
        assert!(!Validator::default().validate(source).is_valid);

        let config = ValidatorConfig {
            extra_allowed_imports: vec!["sympy".to_string()],
            ..ValidatorConfig::default()
        };
        assert!(Validator::new(&config).validate(source).is_valid);
    }

    #[test]
    fn test_oversized_source_not_parsed() {
        let config = ValidatorConfig {
            max_source_bytes: 16,
            ..ValidatorConfig::default()
        };
        let result = Validator::new(&config).validate("print('this is longer than sixteen bytes')");
        assert_eq!(categories(&result), vec![ViolationCategory::SourceTooLarge]);
    }

    #[test]
    fn test_validation_is_idempotent() {
        let validator = Validator::default();
        let source = "import os\nimport math\nos.popen('id')\nprint(math.pi)\n";
        assert_eq!(validator.validate(source), validator.validate(source));
    }

    #[test]
    fn test_validate_and_parse_returns_tree() {
        let validator = Validator::default();
        let (result, tree) = validator.validate_and_parse("print(sum(range(10)))");
        assert!(result.is_valid);
        assert_eq!(tree.unwrap().largest_range_literal, Some(10));

        let (result, tree) = validator.validate_and_parse("print(");
        assert!(!result.is_valid);
        assert!(tree.is_none());
    }
}
