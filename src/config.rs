use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::error::FillError;

pub const CONFIG_FILENAME: &str = "formfill.toml";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub fill: FillSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LlmSection {
    /// "ollama" or "api" (OpenAI-compatible endpoint).
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct FillSection {
    #[serde(default)]
    pub write_mode: Option<String>,
    #[serde(default)]
    pub exhaustion_policy: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Engine {
    Ollama,
    Api,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Overwrite,
    Append,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    Wrap,
    LeaveUnassigned,
}

/// Everything one fill pass needs, resolved from config file + CLI overrides.
/// Passed explicitly into each pass; never read from ambient process state,
/// so concurrent passes stay isolated.
#[derive(Clone, Debug)]
pub struct JobConfig {
    pub engine: Engine,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub write_mode: WriteMode,
    pub exhaustion_policy: ExhaustionPolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            engine: Engine::Ollama,
            model: "qwen2.5:14b".to_string(),
            api_key: None,
            base_url: None,
            timeout_secs: 120,
            write_mode: WriteMode::Overwrite,
            exhaustion_policy: ExhaustionPolicy::Wrap,
        }
    }
}

impl JobConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, FillError> {
        let mut out = Self::default();
        if let Some(engine) = cfg.llm.engine.as_deref() {
            out.engine = parse_engine(engine)?;
        }
        if let Some(model) = cfg.llm.model.as_deref() {
            let model = model.trim();
            if !model.is_empty() {
                out.model = model.to_string();
            }
        }
        out.api_key = cfg.llm.api_key.clone().filter(|s| !s.trim().is_empty());
        out.base_url = cfg.llm.base_url.clone().filter(|s| !s.trim().is_empty());
        if let Some(t) = cfg.llm.timeout_secs {
            out.timeout_secs = t.max(1);
        }
        if let Some(mode) = cfg.fill.write_mode.as_deref() {
            out.write_mode = parse_write_mode(mode)?;
        }
        if let Some(policy) = cfg.fill.exhaustion_policy.as_deref() {
            out.exhaustion_policy = parse_exhaustion_policy(policy)?;
        }
        Ok(out)
    }
}

pub fn parse_engine(s: &str) -> Result<Engine, FillError> {
    match s.trim() {
        "ollama" => Ok(Engine::Ollama),
        "api" => Ok(Engine::Api),
        other => Err(FillError::Config(format!(
            "unknown engine: {other} (expected ollama|api)"
        ))),
    }
}

pub fn parse_write_mode(s: &str) -> Result<WriteMode, FillError> {
    match s.trim() {
        "overwrite" => Ok(WriteMode::Overwrite),
        "append" => Ok(WriteMode::Append),
        other => Err(FillError::Config(format!(
            "unknown write_mode: {other} (expected overwrite|append)"
        ))),
    }
}

pub fn parse_exhaustion_policy(s: &str) -> Result<ExhaustionPolicy, FillError> {
    match s.trim() {
        "wrap" => Ok(ExhaustionPolicy::Wrap),
        "leave-unassigned" => Ok(ExhaustionPolicy::LeaveUnassigned),
        other => Err(FillError::Config(format!(
            "unknown exhaustion_policy: {other} (expected wrap|leave-unassigned)"
        ))),
    }
}

pub fn find_default_config(workdir: &Path) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, CONFIG_FILENAME, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, CONFIG_FILENAME, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, CONFIG_FILENAME, 8) {
                return Some(p);
            }
        }
    }
    None
}

pub fn find_file_upwards(start: &Path, filename: &str, max_depth: usize) -> Option<PathBuf> {
    let mut dir = Some(start.to_path_buf());
    for _ in 0..max_depth {
        let d = dir?;
        let cand = d.join(filename);
        if cand.is_file() {
            return Some(cand);
        }
        dir = d.parent().map(|p| p.to_path_buf());
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

const DEFAULT_CONFIG_TEXT: &str = r#"# formfill configuration

[llm]
# engine = "ollama"            # ollama | api
# model = "qwen2.5:14b"
# base_url = "http://localhost:11434"
# api_key = ""                 # required for engine = "api"
# timeout_secs = 120

[fill]
# write_mode = "overwrite"     # overwrite | append
# exhaustion_policy = "wrap"   # wrap | leave-unassigned
"#;

pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    let path = dir.join(CONFIG_FILENAME);
    if path.exists() && !force {
        anyhow::bail!("config already exists: {} (use --force)", path.display());
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    std::fs::write(&path, DEFAULT_CONFIG_TEXT)
        .with_context(|| format!("write config: {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_defaults_from_empty_config() {
        let cfg: AppConfig = toml::from_str("").expect("empty toml");
        let job = JobConfig::from_app_config(&cfg).expect("resolve");
        assert_eq!(job.engine, Engine::Ollama);
        assert_eq!(job.write_mode, WriteMode::Overwrite);
        assert_eq!(job.exhaustion_policy, ExhaustionPolicy::Wrap);
    }

    #[test]
    fn rejects_unknown_policy() {
        let cfg: AppConfig = toml::from_str(
            "[fill]\nexhaustion_policy = \"recycle\"\n",
        )
        .expect("toml");
        assert!(JobConfig::from_app_config(&cfg).is_err());
    }

    #[test]
    fn parses_api_section() {
        let cfg: AppConfig = toml::from_str(
            "[llm]\nengine = \"api\"\nmodel = \"gpt-4o-mini\"\napi_key = \"k\"\nbase_url = \"https://example/v1\"\n",
        )
        .expect("toml");
        let job = JobConfig::from_app_config(&cfg).expect("resolve");
        assert_eq!(job.engine, Engine::Api);
        assert_eq!(job.model, "gpt-4o-mini");
        assert_eq!(job.base_url.as_deref(), Some("https://example/v1"));
    }
}
