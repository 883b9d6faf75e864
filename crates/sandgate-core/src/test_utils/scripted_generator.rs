// src/test_utils/scripted_generator.rs
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::core_types::ValidationResult;
use crate::errors::GeneratorError;
use crate::llm::CodeGenerator;

/// Returns canned programs in order, for `generate` and `correct` alike.
/// The last program repeats.
pub struct ScriptedGenerator {
    programs: Mutex<VecDeque<String>>,
    pub corrections: Mutex<Vec<Vec<String>>>,
    pub generations: Mutex<usize>,
}

impl ScriptedGenerator {
    pub fn new(programs: &[&str]) -> Self {
        Self {
            programs: Mutex::new(programs.iter().map(|p| p.to_string()).collect()),
            corrections: Mutex::new(Vec::new()),
            generations: Mutex::new(0),
        }
    }

    fn next(&self) -> Result<String, GeneratorError> {
        let mut programs = self.programs.lock().unwrap();
        let program = if programs.len() > 1 {
            programs.pop_front()
        } else {
            programs.front().cloned()
        };
        program.ok_or(GeneratorError::EmptyResponse)
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn generate(&self, _query: &str) -> Result<String, GeneratorError> {
        *self.generations.lock().unwrap() += 1;
        self.next()
    }

    async fn correct(
        &self,
        _query: &str,
        _failed_code: &str,
        validation: &ValidationResult,
    ) -> Result<String, GeneratorError> {
        self.corrections
            .lock()
            .unwrap()
            .push(validation.errors.clone());
        self.next()
    }
}
