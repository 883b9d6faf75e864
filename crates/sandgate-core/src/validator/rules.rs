//! The closed set of validation rules and the name tables they match against.

use std::collections::HashSet;

use crate::analysis::{CallSite, Callee, Import};
use crate::core_types::{Violation, ViolationCategory};

// ============================================================================
// RULE TABLES
// ============================================================================

const FILE_IO_BUILTINS: &[&str] = &["open", "file"];
const FILE_IO_METHODS: &[&str] = &[
    "open",
    "read",
    "write",
    "readlines",
    "writelines",
    "file",
    "read_text",
    "write_text",
    "read_bytes",
    "write_bytes",
];
const FILE_IO_MODULES: &[&str] = &["io", "pathlib", "shutil"];

const OS_COMMAND_BUILTINS: &[&str] = &[
    "system",
    "popen",
    "exec",
    "eval",
    "compile",
    "__import__",
    "execfile",
];
// No `compile` here: `re.compile` is ordinary code.
const OS_COMMAND_METHODS: &[&str] = &[
    "system", "popen", "exec", "eval", "__import__", "fork", "forkpty", "kill", "killpg",
    "execl", "execle", "execlp", "execlpe", "execv", "execve", "execvp", "execvpe", "spawnl",
    "spawnle", "spawnlp", "spawnlpe", "spawnv", "spawnve", "spawnvp", "spawnvpe",
];
const OS_COMMAND_MODULES: &[&str] = &["os", "subprocess", "commands", "pty"];

const NETWORK_BUILTINS: &[&str] = &["socket", "urlopen", "create_connection"];
const NETWORK_METHODS: &[&str] = &["socket", "urlopen", "create_connection"];
const NETWORK_MODULES: &[&str] = &[
    "socket", "urllib", "urllib2", "urllib3", "requests", "http", "httplib", "httplib2",
    "aiohttp", "httpx", "ftplib", "smtplib",
];

// Reached without an import statement, these hand back the import machinery
// or the builtins namespace.
const DYNAMIC_ACCESS_BUILTINS: &[&str] = &["globals", "vars"];
const DYNAMIC_ACCESS_MODULES: &[&str] = &["importlib", "builtins", "__builtins__"];
const DYNAMIC_ACCESS_DUNDERS: &[&str] = &[
    "__builtins__",
    "__import__",
    "__dict__",
    "__globals__",
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "__code__",
    "__closure__",
    "__getattribute__",
    "__loader__",
    "__spec__",
];

/// Modules that are never importable, whatever the allow-list says.
pub const PROHIBITED_MODULES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "urllib",
    "urllib2",
    "urllib3",
    "requests",
    "http",
    "httplib",
    "httplib2",
    "aiohttp",
    "httpx",
    "io",
    "pathlib",
    "shutil",
    "tempfile",
    "glob",
    "pickle",
    "shelve",
    "dbm",
    "sqlite3",
    "ctypes",
    "multiprocessing",
    "threading",
    "asyncio",
    "concurrent",
    "__builtin__",
    "builtins",
    "importlib",
    "pty",
    "commands",
];

/// Names and module roots that mark a call as touching the filesystem.
/// The classifier reuses these as its file-I/O signal.
pub fn is_file_io_call(call: &CallSite) -> bool {
    CallPattern::FILE_IO.matches(call)
}

// ============================================================================
// RULES
// ============================================================================

struct CallPattern {
    builtins: &'static [&'static str],
    methods: &'static [&'static str],
    modules: &'static [&'static str],
}

impl CallPattern {
    const FILE_IO: CallPattern = CallPattern {
        builtins: FILE_IO_BUILTINS,
        methods: FILE_IO_METHODS,
        modules: FILE_IO_MODULES,
    };
    const OS_COMMAND: CallPattern = CallPattern {
        builtins: OS_COMMAND_BUILTINS,
        methods: OS_COMMAND_METHODS,
        modules: OS_COMMAND_MODULES,
    };
    const NETWORK: CallPattern = CallPattern {
        builtins: NETWORK_BUILTINS,
        methods: NETWORK_METHODS,
        modules: NETWORK_MODULES,
    };
    const DYNAMIC_ACCESS: CallPattern = CallPattern {
        builtins: DYNAMIC_ACCESS_BUILTINS,
        methods: &[],
        modules: DYNAMIC_ACCESS_MODULES,
    };

    fn matches(&self, call: &CallSite) -> bool {
        match &call.callee {
            Callee::Name(name) => self.builtins.contains(&name.as_str()),
            Callee::Attribute { root, attr, .. } => {
                self.methods.contains(&attr.as_str())
                    || root
                        .as_deref()
                        .is_some_and(|root| self.modules.contains(&root))
            }
        }
    }
}

/// Every check the validator performs, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    FileIo,
    OsCommand,
    Network,
    ImportAllowList,
    /// Imports and builtins reached through introspection instead of an
    /// import statement.
    DynamicAccess,
}

impl Rule {
    pub const ALL: [Rule; 5] = [
        Rule::FileIo,
        Rule::OsCommand,
        Rule::Network,
        Rule::ImportAllowList,
        Rule::DynamicAccess,
    ];

    pub fn category(self) -> ViolationCategory {
        match self {
            Rule::FileIo => ViolationCategory::FileIo,
            Rule::OsCommand => ViolationCategory::OsCommand,
            Rule::Network => ViolationCategory::Network,
            Rule::ImportAllowList | Rule::DynamicAccess => ViolationCategory::Import,
        }
    }

    fn call_pattern(self) -> Option<&'static CallPattern> {
        match self {
            Rule::FileIo => Some(&CallPattern::FILE_IO),
            Rule::OsCommand => Some(&CallPattern::OS_COMMAND),
            Rule::Network => Some(&CallPattern::NETWORK),
            Rule::DynamicAccess => Some(&CallPattern::DYNAMIC_ACCESS),
            Rule::ImportAllowList => None,
        }
    }

    fn message_prefix(self) -> &'static str {
        match self {
            Rule::FileIo => "File I/O operation not allowed",
            Rule::OsCommand => "OS command execution not allowed",
            Rule::Network => "Network operation not allowed",
            Rule::ImportAllowList => "Unauthorized import detected",
            Rule::DynamicAccess => "Dynamic import or builtins access not allowed",
        }
    }

    fn violation(self, name: &str) -> Violation {
        Violation {
            category: self.category(),
            name: Some(name.to_string()),
            message: format!("{}: {}", self.message_prefix(), name),
        }
    }

    /// Checks every call site; each site yields at most one violation.
    pub fn check_calls(self, calls: &[CallSite]) -> Vec<Violation> {
        let Some(pattern) = self.call_pattern() else {
            return Vec::new();
        };
        calls
            .iter()
            .filter(|call| pattern.matches(call))
            .map(|call| self.violation(call.display_name()))
            .collect()
    }

    /// One violation per distinct dangerous dunder, in first-seen order.
    pub fn check_references(self, dunders: &[String]) -> Vec<Violation> {
        if self != Rule::DynamicAccess {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        dunders
            .iter()
            .filter(|name| DYNAMIC_ACCESS_DUNDERS.contains(&name.as_str()))
            .filter(|name| seen.insert(name.as_str()))
            .map(|name| self.violation(name))
            .collect()
    }

    pub fn check_imports(self, imports: &[Import], allow_list: &HashSet<String>) -> Vec<Violation> {
        if self != Rule::ImportAllowList {
            return Vec::new();
        }

        imports
            .iter()
            .filter_map(|import| {
                if import.relative {
                    let name = if import.module.is_empty() {
                        ".".to_string()
                    } else {
                        format!(".{}", import.module)
                    };
                    return Some(self.violation(&format!("{} (relative import)", name)));
                }

                let base = import.base_module();
                if PROHIBITED_MODULES.contains(&base) || !allow_list.contains(base) {
                    Some(self.violation(&import.module))
                } else {
                    None
                }
            })
            .collect()
    }
}
