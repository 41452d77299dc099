//! Config Loader: reads `recipes/`, `prompts/`, `models/`, `hotwires/` plus
//! `plugin.toml`, validates, and atomically installs a new [`Registry`].
//!
//! Reload is triggered by the host (or a file watcher the host owns)
//! touching the `thrall.reload` sentinel file; in-flight pipelines keep the
//! `Arc<Registry>` they captured at entry, so a reload never changes the
//! config underneath a pipeline already running.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::types::{HotwireSet, ModelDescriptor, Prompt, Recipe, TrustTiers, SUPPORTED_MODEL_BACKENDS};

#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("io error: {0}")]
    IoError(String),
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("validation error in {field}: {message}")]
    ValidationError { field: String, message: String },
}

/// Everything the pipeline needs to run one envelope, frozen at load time.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// Recipes in lexical file-name order — the engine's tie-break rule.
    pub recipes: Vec<Recipe>,
    pub prompts: HashMap<String, Prompt>,
    pub models: HashMap<String, ModelDescriptor>,
    pub hotwires: HashMap<String, HotwireSet>,
    pub trust_tiers: TrustTiers,
}

impl Registry {
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }

    pub fn hotwire_set(&self, name: &str) -> Option<&HotwireSet> {
        self.hotwires.get(name)
    }
}

pub struct ConfigLoader {
    plugin_dir: PathBuf,
    current: arc_swap::ArcSwap<Registry>,
    reload_seen_mtime: std::sync::Mutex<Option<SystemTime>>,
}

impl ConfigLoader {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            current: arc_swap::ArcSwap::from_pointee(Registry::default()),
            reload_seen_mtime: std::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.current.load_full()
    }

    /// Loads all four directories, validates everything, and installs the
    /// result. On any validation failure the previous registry is kept.
    pub fn load(&self) -> Result<(), ConfigError> {
        let registry = load_registry(&self.plugin_dir)?;
        self.current.store(Arc::new(registry));
        if let Ok(mtime) = sentinel_mtime(&self.plugin_dir) {
            *self.reload_seen_mtime.lock().unwrap() = mtime;
        }
        Ok(())
    }

    /// Returns `true` (and reloads) if the `thrall.reload` sentinel's mtime
    /// changed since the last observed load.
    pub fn reload_if_touched(&self) -> Result<bool, ConfigError> {
        let mtime = sentinel_mtime(&self.plugin_dir)?;
        let mut seen = self.reload_seen_mtime.lock().unwrap();
        if mtime != *seen {
            drop(seen);
            self.load()?;
            return Ok(true);
        }
        Ok(false)
    }
}

fn sentinel_mtime(plugin_dir: &Path) -> Result<Option<SystemTime>, ConfigError> {
    let path = plugin_dir.join("thrall.reload");
    match std::fs::metadata(&path) {
        Ok(meta) => Ok(Some(
            meta.modified()
                .map_err(|e| ConfigError::IoError(e.to_string()))?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::IoError(e.to_string())),
    }
}

fn load_registry(plugin_dir: &Path) -> Result<Registry, ConfigError> {
    let trust_tiers = load_trust_tiers(plugin_dir)?;
    let hotwires = load_hotwires(plugin_dir)?;
    let models = load_models(plugin_dir)?;
    let prompts = load_prompts(plugin_dir)?;
    let recipes = load_recipes(plugin_dir, &prompts, &models, &hotwires)?;
    Ok(Registry {
        recipes,
        prompts,
        models,
        hotwires,
        trust_tiers,
    })
}

fn load_trust_tiers(plugin_dir: &Path) -> Result<TrustTiers, ConfigError> {
    let path = plugin_dir.join("plugin.toml");
    if !path.exists() {
        return Ok(TrustTiers::default());
    }
    let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;
    #[derive(serde::Deserialize, Default)]
    struct Wrapper {
        #[serde(default)]
        trust: TrustTiers,
    }
    let wrapper: Wrapper =
        toml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    for prefix in wrapper.trust.team.iter().chain(wrapper.trust.known.iter()) {
        validate_hex_prefix(prefix)?;
    }
    Ok(wrapper.trust)
}

fn validate_hex_prefix(prefix: &str) -> Result<(), ConfigError> {
    if prefix.len() != crate::node_id::PREFIX_LEN || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::ValidationError {
            field: "trust".into(),
            message: format!("'{prefix}' is not a 16-char lowercase hex prefix"),
        });
    }
    Ok(())
}

fn toml_dir_entries(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| ConfigError::IoError(e.to_string()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    entries.sort();
    Ok(entries)
}

fn load_hotwires(plugin_dir: &Path) -> Result<HashMap<String, HotwireSet>, ConfigError> {
    let mut out = HashMap::new();
    for path in toml_dir_entries(&plugin_dir.join("hotwires"))? {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let set: HotwireSet =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        for rule in &set.rules {
            regex::Regex::new(&rule.pattern).map_err(|e| ConfigError::ValidationError {
                field: format!("hotwires/{}", set.name),
                message: format!("invalid regex '{}': {e}", rule.pattern),
            })?;
        }
        out.insert(set.name.clone(), set);
    }
    Ok(out)
}

fn load_models(plugin_dir: &Path) -> Result<HashMap<String, ModelDescriptor>, ConfigError> {
    let mut out = HashMap::new();
    for path in toml_dir_entries(&plugin_dir.join("models"))? {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let model: ModelDescriptor =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        if !SUPPORTED_MODEL_BACKENDS.contains(&model.backend.as_str()) {
            return Err(ConfigError::ValidationError {
                field: format!("models/{}", model.name),
                message: format!("unsupported backend '{}'", model.backend),
            });
        }
        out.insert(model.name.clone(), model);
    }
    Ok(out)
}

fn load_prompts(plugin_dir: &Path) -> Result<HashMap<String, Prompt>, ConfigError> {
    let mut out = HashMap::new();
    for path in toml_dir_entries(&plugin_dir.join("prompts"))? {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let mut prompt: Prompt =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        validate_prompt_template(&prompt)?;
        prompt.hash = Prompt::compute_hash(&prompt.template_text);
        out.insert(prompt.name.clone(), prompt);
    }
    Ok(out)
}

const BODY_TEXT_PLACEHOLDER: &str = "{{envelope.body_text}}";
const OPT_OUT_MARKER: &str = "# thrall:no-body-text";

fn validate_prompt_template(prompt: &Prompt) -> Result<(), ConfigError> {
    if prompt.template_text.contains(BODY_TEXT_PLACEHOLDER)
        || prompt.template_text.contains(OPT_OUT_MARKER)
    {
        return Ok(());
    }
    Err(ConfigError::ValidationError {
        field: format!("prompts/{}", prompt.name),
        message: format!(
            "template is missing {BODY_TEXT_PLACEHOLDER} and has no explicit opt-out ({OPT_OUT_MARKER})"
        ),
    })
}

fn load_recipes(
    plugin_dir: &Path,
    prompts: &HashMap<String, Prompt>,
    models: &HashMap<String, ModelDescriptor>,
    hotwires: &HashMap<String, HotwireSet>,
) -> Result<Vec<Recipe>, ConfigError> {
    let mut out = Vec::new();
    for path in toml_dir_entries(&plugin_dir.join("recipes"))? {
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let recipe: Recipe =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        validate_recipe_refs(&recipe, prompts, models, hotwires)?;
        out.push(recipe);
    }
    Ok(out)
}

fn validate_recipe_refs(
    recipe: &Recipe,
    prompts: &HashMap<String, Prompt>,
    models: &HashMap<String, ModelDescriptor>,
    hotwires: &HashMap<String, HotwireSet>,
) -> Result<(), ConfigError> {
    match &recipe.evaluate {
        crate::types::Evaluate::Llm {
            prompt,
            model,
            fallback_action,
        } => {
            if !prompts.contains_key(prompt) {
                return Err(ConfigError::ValidationError {
                    field: format!("recipes/{}", recipe.name),
                    message: format!("unknown prompt '{prompt}'"),
                });
            }
            if !models.contains_key(model) {
                return Err(ConfigError::ValidationError {
                    field: format!("recipes/{}", recipe.name),
                    message: format!("unknown model '{model}'"),
                });
            }
            if !recipe.actions.contains_key(fallback_action) {
                return Err(ConfigError::ValidationError {
                    field: format!("recipes/{}", recipe.name),
                    message: format!("unknown fallback_action '{fallback_action}'"),
                });
            }
        }
        crate::types::Evaluate::Hotwire { ruleset } => {
            if !hotwires.contains_key(ruleset) {
                return Err(ConfigError::ValidationError {
                    field: format!("recipes/{}", recipe.name),
                    message: format!("unknown hotwire ruleset '{ruleset}'"),
                });
            }
        }
    }
    Ok(())
}
