use crate::receipt::{MatchRule, SummaryFilter};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub extraction: ExtractionSection,
}

fn default_db_path() -> String {
    "deliveries/deliveries.db".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Which structured-extraction service to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionBackend {
    /// Google Gemini `generateContent` with a response schema.
    Gemini,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    Remote,
    /// Local Ollama through its OpenAI-compatible API.
    Ollama,
}

#[derive(Debug, Deserialize)]
pub struct ExtractionSection {
    #[serde(default = "default_backend")]
    pub backend: ExtractionBackend,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_gemini")]
    pub gemini: EndpointConfig,
    #[serde(default = "default_remote")]
    pub remote: EndpointConfig,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointConfig,
    /// Extra line names to drop as summaries, matched exactly.
    #[serde(default)]
    pub summary_names: Vec<String>,
}

fn default_backend() -> ExtractionBackend {
    ExtractionBackend::Gemini
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_output_tokens() -> u32 {
    4096
}

impl Default for ExtractionSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_secs: default_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
            gemini: default_gemini(),
            remote: default_remote(),
            ollama: default_ollama(),
            summary_names: Vec::new(),
        }
    }
}

/// One service endpoint. The key itself is read from the environment
/// variable named by `api_key_env`, never from the file.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_gemini() -> EndpointConfig {
    EndpointConfig {
        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        model: "gemini-2.0-flash".to_string(),
        api_key_env: Some("GEMINI_API_KEY".to_string()),
    }
}

fn default_remote() -> EndpointConfig {
    EndpointConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
        api_key_env: Some("LLM_API_KEY".to_string()),
    }
}

fn default_ollama() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen2.5vl".to_string(),
        api_key_env: None,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_filter: default_log_filter(),
            extraction: ExtractionSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// The endpoint of the selected backend.
    pub fn endpoint(&self) -> &EndpointConfig {
        match self.extraction.backend {
            ExtractionBackend::Gemini => &self.extraction.gemini,
            ExtractionBackend::Remote => &self.extraction.remote,
            ExtractionBackend::Ollama => &self.extraction.ollama,
        }
    }

    pub fn summary_filter(&self) -> SummaryFilter {
        self.extraction
            .summary_names
            .iter()
            .fold(SummaryFilter::default(), |filter, name| {
                filter.with_rule(MatchRule::exact(name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.db_path, "deliveries/deliveries.db");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.extraction.backend, ExtractionBackend::Gemini);
        assert_eq!(cfg.extraction.timeout_secs, 60);
        assert_eq!(cfg.endpoint().model, "gemini-2.0-flash");
    }

    #[test]
    fn test_backend_override() {
        let cfg: Config = toml::from_str(
            r#"
            db_path = "/tmp/x.db"

            [extraction]
            backend = "ollama"
            timeout_secs = 5

            [extraction.ollama]
            base_url = "http://box:11434/v1"
            model = "llava"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.db_path, "/tmp/x.db");
        assert_eq!(cfg.extraction.backend, ExtractionBackend::Ollama);
        assert_eq!(cfg.extraction.timeout_secs, 5);
        assert_eq!(cfg.endpoint().base_url, "http://box:11434/v1");
        assert!(cfg.endpoint().api_key_env.is_none());
        // untouched sections keep their defaults
        assert_eq!(cfg.extraction.max_output_tokens, 4096);
        assert_eq!(
            cfg.extraction.gemini.api_key_env.as_deref(),
            Some("GEMINI_API_KEY")
        );
    }

    #[test]
    fn test_extra_summary_names() {
        let cfg: Config = toml::from_str(
            r#"
            [extraction]
            summary_names = ["Pantit", "Rahti"]
            "#,
        )
        .unwrap();
        let filter = cfg.summary_filter();
        assert!(filter.is_summary("PANTIT"));
        assert!(filter.is_summary(" rahti "));
        assert!(filter.is_summary("Yhteensä"));
        assert!(!filter.is_summary("Rahtikirja"));
        assert_eq!(filter.rules().len(), SummaryFilter::default().rules().len() + 2);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let cfg = Config::load_or_default("/nonexistent/receipt_reconcile.toml").unwrap();
        assert_eq!(cfg.extraction.backend, ExtractionBackend::Gemini);
    }
}
