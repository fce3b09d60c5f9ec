use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

const BUILTIN_ASSESSMENT: &str = include_str!("../assessment/numpy_basics.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assessment {
    pub title: String,
    pub duration_minutes: u32,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub title: String,
    pub description: String,
    pub initial_code: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

/// A hidden check run after the student's code. `code_to_run` sees every
/// definition the student's code made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub description: String,
    pub code_to_run: String,
    pub expected_output: String,
}

impl Assessment {
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_ASSESSMENT).context("built-in assessment is malformed")
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read assessment file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid assessment file {}", path.display()))
    }

    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path).await,
            None => Self::builtin(),
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        let assessment: Self = serde_json::from_str(raw)?;
        let mut seen = std::collections::HashSet::new();
        for question in &assessment.questions {
            if !seen.insert(question.id.as_str()) {
                bail!("duplicate question id: {}", question.id);
            }
        }
        Ok(assessment)
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }
}
