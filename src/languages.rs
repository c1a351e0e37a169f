//! Supported languages and their execution configuration

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// The fixed set of languages a submission may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Javascript,
    Typescript,
    Python,
    Java,
    Go,
    Rust,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 7] = [
        Language::Javascript,
        Language::Typescript,
        Language::Python,
        Language::Java,
        Language::Go,
        Language::Rust,
        Language::Cpp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Python => "python",
            Language::Java => "java",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Cpp => "cpp",
        }
    }

    /// Human-readable name
    pub fn display_name(self) -> &'static str {
        match self {
            Language::Javascript => "JavaScript",
            Language::Typescript => "TypeScript",
            Language::Python => "Python",
            Language::Java => "Java",
            Language::Go => "Go",
            Language::Rust => "Rust",
            Language::Cpp => "C++",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lang = match s.trim().to_lowercase().as_str() {
            "javascript" | "js" | "node" => Language::Javascript,
            "typescript" | "ts" => Language::Typescript,
            "python" | "py" | "python3" => Language::Python,
            "java" => Language::Java,
            "go" | "golang" => Language::Go,
            "rust" | "rs" => Language::Rust,
            "cpp" | "c++" | "cplusplus" => Language::Cpp,
            other => anyhow::bail!("Unsupported language: {}", other),
        };
        Ok(lang)
    }
}

/// How to build and run one language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Name of the source file (e.g., "main.py")
    pub source_file: String,
    /// Compile command (None if not needed)
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    /// Session deadline override
    pub deadline_secs: Option<u64>,
    /// Wall-clock limit for one test
    pub test_timeout_ms: u64,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    deadline_secs: Option<u64>,
    #[serde(default = "default_test_timeout_ms")]
    test_timeout_ms: u64,
}

fn default_test_timeout_ms() -> u64 {
    5000
}

const EMBEDDED_TABLE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// Global language configurations
static LANGUAGES: OnceLock<HashMap<Language, LanguageConfig>> = OnceLock::new();

/// Initialize language configurations from the embedded table
pub fn init_languages() -> anyhow::Result<()> {
    let languages = parse_table(EMBEDDED_TABLE)?;

    LANGUAGES
        .set(languages)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;

    Ok(())
}

fn parse_table(content: &str) -> anyhow::Result<HashMap<Language, LanguageConfig>> {
    let raw_configs: HashMap<String, RawLanguageConfig> =
        toml::from_str(content).context("Invalid language table")?;

    let mut languages = HashMap::new();
    for (name, raw) in raw_configs {
        let language: Language = name
            .parse()
            .with_context(|| format!("Unknown language section [{}]", name))?;
        if raw.run_command.trim().is_empty() {
            anyhow::bail!("Empty run_command for {}", name);
        }

        languages.insert(
            language,
            LanguageConfig {
                source_file: raw.source_file,
                compile_command: raw.compile_command.map(|cmd| into_command(&cmd)),
                run_command: into_command(&raw.run_command),
                deadline_secs: raw.deadline_secs,
                test_timeout_ms: raw.test_timeout_ms,
            },
        );
    }

    Ok(languages)
}

/// Get language configuration
pub fn get_language_config(language: Language) -> Option<LanguageConfig> {
    LANGUAGES.get()?.get(&language).cloned()
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
