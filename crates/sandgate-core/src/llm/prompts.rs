//! Prompt text for generation and correction, and extraction of the code
//! from a model reply.

use regex::Regex;

use crate::core_types::ValidationResult;

pub const SYSTEM_PROMPT: &str = "You write short, self-contained Python 3 programs that \
print their answer to standard output. You reply with code only.";

const SECURITY_CONSTRAINTS: &str = "Requirements:
- Write clean, efficient Python code
- Do not use file I/O operations
- Do not use OS commands or subprocess
- Do not use network operations
- Only use standard library modules from the allowlist, or numpy, scipy and pandas for data work";

pub fn generation_prompt(query: &str) -> String {
    format!(
        "Generate Python code to answer this query: {}\n\n{}\n\nReturn only the Python code, no explanations.",
        query, SECURITY_CONSTRAINTS
    )
}

pub fn correction_prompt(query: &str, failed_code: &str, validation: &ValidationResult) -> String {
    let errors = validation.errors.join("\n");
    format!(
        "The following code failed validation:\n\n```python\n{}\n```\n\n\
         Validation errors:\n{}\n\n\
         Original query: {}\n\n\
         Please generate corrected Python code that:\n\
         1. Addresses all validation errors\n\
         2. Still fulfills the original query\n\
         3. Follows all security constraints\n\n\
         {}\n\n\
         Return only the corrected Python code, no explanations.",
        failed_code, errors, query, SECURITY_CONSTRAINTS
    )
}

fn fenced_block(reply: &str) -> Option<String> {
    let re = Regex::new(r"(?s)```[ \t]*(?:python3?|py)?[ \t]*\r?\n(.*?)```").ok()?;
    let caps = re.captures(reply)?;
    Some(caps.get(1)?.as_str().trim().to_string())
}

/// The first fenced code block of a reply, or the whole reply when the
/// model did not fence its answer.
pub fn extract_code(reply: &str) -> String {
    fenced_block(reply).unwrap_or_else(|| reply.trim().to_string())
}
