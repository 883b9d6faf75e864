//! Deterministic routing of validated code to an execution tier.
//!
//! Checks run in a fixed order and the first one that fires decides:
//! heavy data-library import, file or dataset I/O, then loop nesting or a
//! large `range()` bound. Anything else runs on the lightweight tier.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::analysis::{Callee, SourceTree};
use crate::config::ClassifierConfig;
use crate::core_types::ExecutionTier;
use crate::validator::is_file_io_call;

/// Reader and writer entry points of the usual dataframe and array libraries.
const DATASET_IO_CALLS: &[&str] = &[
    "read_csv",
    "read_json",
    "read_parquet",
    "read_excel",
    "read_sql",
    "read_table",
    "read_feather",
    "to_csv",
    "to_json",
    "to_parquet",
    "to_excel",
    "to_sql",
    "to_feather",
    "scan_csv",
    "scan_parquet",
    "write_csv",
    "write_parquet",
    "loadtxt",
    "savetxt",
    "load",
    "save",
];

const FILE_MODULES: &[&str] = &["io", "pathlib"];

/// Why a tier was chosen. Logged for operators; routing only looks at the tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ClassificationReason {
    HeavyImport(String),
    FileIo(String),
    LoopDepth(usize),
    LargeInput(u64),
    Default,
}

impl fmt::Display for ClassificationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassificationReason::HeavyImport(module) => write!(f, "imports {}", module),
            ClassificationReason::FileIo(name) => write!(f, "performs file I/O via {}", name),
            ClassificationReason::LoopDepth(depth) => write!(f, "loops nested {} deep", depth),
            ClassificationReason::LargeInput(size) => write!(f, "iterates over {} items", size),
            ClassificationReason::Default => f.write_str("no heavy signals"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ExecutionTier,
    pub reason: ClassificationReason,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    heavy_libraries: HashSet<String>,
    max_loop_depth: usize,
    large_input_threshold: u64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl Classifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            heavy_libraries: config.heavy_libraries.iter().cloned().collect(),
            max_loop_depth: config.max_loop_depth,
            large_input_threshold: config.large_input_threshold,
        }
    }

    pub fn classify(&self, source: &str) -> ExecutionTier {
        self.explain(source).tier
    }

    /// Unparseable source is lightweight; validation rejects it before routing.
    pub fn explain(&self, source: &str) -> Classification {
        match SourceTree::parse(source) {
            Ok(tree) => self.classify_tree(&tree),
            Err(_) => Classification {
                tier: ExecutionTier::Lightweight,
                reason: ClassificationReason::Default,
            },
        }
    }

    pub fn classify_tree(&self, tree: &SourceTree) -> Classification {
        let reason = self
            .heavy_import(tree)
            .or_else(|| Self::file_io(tree))
            .or_else(|| self.complexity(tree));

        match reason {
            Some(reason) => Classification {
                tier: ExecutionTier::Heavy,
                reason,
            },
            None => Classification {
                tier: ExecutionTier::Lightweight,
                reason: ClassificationReason::Default,
            },
        }
    }

    fn heavy_import(&self, tree: &SourceTree) -> Option<ClassificationReason> {
        tree.imported_base_modules()
            .find(|module| self.heavy_libraries.contains(*module))
            .map(|module| ClassificationReason::HeavyImport(module.to_string()))
    }

    fn file_io(tree: &SourceTree) -> Option<ClassificationReason> {
        if let Some(module) = tree
            .imported_base_modules()
            .find(|module| FILE_MODULES.contains(module))
        {
            return Some(ClassificationReason::FileIo(module.to_string()));
        }

        tree.calls
            .iter()
            .find(|call| {
                let name = match &call.callee {
                    Callee::Name(name) => name,
                    Callee::Attribute { attr, .. } => attr,
                };
                is_file_io_call(call) || DATASET_IO_CALLS.contains(&name.as_str())
            })
            .map(|call| ClassificationReason::FileIo(call.display_name().to_string()))
    }

    fn complexity(&self, tree: &SourceTree) -> Option<ClassificationReason> {
        if tree.max_loop_depth >= self.max_loop_depth {
            return Some(ClassificationReason::LoopDepth(tree.max_loop_depth));
        }
        tree.largest_range_literal
            .filter(|size| *size >= self.large_input_threshold)
            .map(ClassificationReason::LargeInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heavy_import_routes_heavy() {
        let classifier = Classifier::default();
        let classification = classifier.explain("import pandas as pd\ndf = pd.DataFrame({'a': [1, 2]})\nprint(df)\n");
        assert_eq!(classification.tier, ExecutionTier::Heavy);
        assert_eq!(
            classification.reason,
            ClassificationReason::HeavyImport("pandas".to_string())
        );

        assert_eq!(
            classifier.classify("from polars.dataframe import DataFrame\n"),
            ExecutionTier::Heavy
        );
    }

    #[test]
    fn test_dataset_io_routes_heavy() {
        let classification = Classifier::default().explain("import numpy as np\ndata = np.loadtxt('values.txt')\n");
        assert_eq!(classification.tier, ExecutionTier::Heavy);
        assert_eq!(
            classification.reason,
            ClassificationReason::FileIo("np.loadtxt".to_string())
        );
    }

    #[test]
    fn test_nested_loops_route_heavy() {
        let source = "total = 0\nfor i in range(10):\n    for j in range(10):\n        for k in range(10):\n            total += i * j * k\nprint(total)\n";
        let classification = Classifier::default().explain(source);
        assert_eq!(classification.tier, ExecutionTier::Heavy);
        assert_eq!(classification.reason, ClassificationReason::LoopDepth(3));
    }

    #[test]
    fn test_large_range_routes_heavy() {
        let classification = Classifier::default().explain("print(sum(range(50000000)))");
        assert_eq!(
            classification.reason,
            ClassificationReason::LargeInput(50_000_000)
        );
    }

    #[test]
    fn test_simple_code_is_lightweight() {
        let classifier = Classifier::default();
        let source = "import math\nfor i in range(10):\n    for j in range(10):\n        print(math.factorial(i + j))\n";
        assert_eq!(classifier.classify(source), ExecutionTier::Lightweight);
        assert_eq!(classifier.explain(source).reason, ClassificationReason::Default);
    }

    #[test]
    fn test_heavy_import_takes_precedence() {
        let source = "import pandas\nwith open('data.csv') as f:\n    print(f.read())\n";
        assert_eq!(
            Classifier::default().explain(source).reason,
            ClassificationReason::HeavyImport("pandas".to_string())
        );
    }

    #[test]
    fn test_unparseable_source_is_lightweight() {
        assert_eq!(
            Classifier::default().classify("import pandas\ndef f(:"),
            ExecutionTier::Lightweight
        );
    }

    #[test]
    fn test_thresholds_follow_config() {
        let config = ClassifierConfig {
            max_loop_depth: 2,
            ..ClassifierConfig::default()
        };
        let source = "for i in range(3):\n    for j in range(3):\n        print(i, j)\n";
        assert_eq!(Classifier::new(&config).classify(source), ExecutionTier::Heavy);
        assert_eq!(Classifier::default().classify(source), ExecutionTier::Lightweight);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = Classifier::default();
        let source = "import dask\nprint(1)\n";
        assert_eq!(classifier.explain(source), classifier.explain(source));
    }
}
