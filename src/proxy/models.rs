// Model table and alias resolution
//
// Public names may carry a thinking suffix (-low / -high) and an image
// resolution suffix (-1k / -2k / -4k), in either order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::GatewayError;

/// Contents of `models.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelTable {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub alias_map: HashMap<String, String>,
}

pub fn default_models() -> Vec<String> {
    vec!["gemini-1.5-pro".to_string(), "gemini-1.5-flash".to_string()]
}

/// Read the table fresh from disk; edits to the file apply to the next request.
pub fn load_model_table(path: &Path) -> Result<ModelTable, GatewayError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| GatewayError::Config(format!("cannot read {:?}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| GatewayError::Config(format!("cannot parse {:?}: {}", path, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Low,
    High,
}

impl ThinkingLevel {
    pub fn budget(self) -> u32 {
        match self {
            ThinkingLevel::Low => 8192,
            ThinkingLevel::High => 32768,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ThinkingLevel::Low => "-low",
            ThinkingLevel::High => "-high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageResolution {
    OneK,
    TwoK,
    FourK,
}

impl ImageResolution {
    pub fn image_size(self) -> &'static str {
        match self {
            ImageResolution::OneK => "1K",
            ImageResolution::TwoK => "2K",
            ImageResolution::FourK => "4K",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ImageResolution::OneK => "-1k",
            ImageResolution::TwoK => "-2k",
            ImageResolution::FourK => "-4k",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: String,
    pub thinking: Option<ThinkingLevel>,
    pub resolution: Option<ImageResolution>,
}

fn strip_thinking(name: &str) -> Option<(&str, ThinkingLevel)> {
    [ThinkingLevel::Low, ThinkingLevel::High]
        .into_iter()
        .find_map(|level| name.strip_suffix(level.suffix()).map(|base| (base, level)))
}

fn strip_resolution(name: &str) -> Option<(&str, ImageResolution)> {
    [ImageResolution::OneK, ImageResolution::TwoK, ImageResolution::FourK]
        .into_iter()
        .find_map(|res| name.strip_suffix(res.suffix()).map(|base| (base, res)))
}

/// Split suffixes off `name`. The first suffix of each kind seen from the right wins.
fn parse_suffixes(name: &str) -> ResolvedModel {
    let mut base = name;
    let mut thinking = None;
    let mut resolution = None;

    loop {
        if thinking.is_none() {
            if let Some((rest, level)) = strip_thinking(base) {
                base = rest;
                thinking = Some(level);
                continue;
            }
        }
        if resolution.is_none() {
            if let Some((rest, res)) = strip_resolution(base) {
                base = rest;
                resolution = Some(res);
                continue;
            }
        }
        break;
    }

    ResolvedModel {
        model: base.to_string(),
        thinking,
        resolution,
    }
}

pub fn resolve_model(requested: &str, table: &ModelTable) -> ResolvedModel {
    match table.alias_map.get(requested) {
        Some(target) => parse_suffixes(target),
        None => {
            let mut resolved = parse_suffixes(requested);
            if let Some(target) = table.alias_map.get(&resolved.model) {
                resolved.model = target.clone();
            }
            resolved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ModelTable {
        ModelTable {
            models: vec!["gemini-3-pro".to_string()],
            alias_map: HashMap::from([
                ("gpt-4o".to_string(), "gemini-2.5-flash".to_string()),
                ("painter".to_string(), "gemini-3-pro-image-2k".to_string()),
                ("pro".to_string(), "gemini-3-pro-preview".to_string()),
            ]),
        }
    }

    #[test]
    fn test_suffixes_in_either_order() {
        let resolved = resolve_model("gemini-3-pro-high-4k", &ModelTable::default());
        assert_eq!(resolved.model, "gemini-3-pro");
        assert_eq!(resolved.thinking, Some(ThinkingLevel::High));
        assert_eq!(resolved.thinking.unwrap().budget(), 32768);
        assert_eq!(resolved.resolution, Some(ImageResolution::FourK));
        assert_eq!(resolved.resolution.unwrap().image_size(), "4K");

        let resolved = resolve_model("gemini-3-pro-4k-low", &ModelTable::default());
        assert_eq!(resolved.model, "gemini-3-pro");
        assert_eq!(resolved.thinking, Some(ThinkingLevel::Low));
        assert_eq!(resolved.resolution, Some(ImageResolution::FourK));
    }

    #[test]
    fn test_plain_name_passes_through() {
        let resolved = resolve_model("gemini-2.5-pro", &ModelTable::default());
        assert_eq!(resolved.model, "gemini-2.5-pro");
        assert_eq!(resolved.thinking, None);
        assert_eq!(resolved.resolution, None);
    }

    #[test]
    fn test_alias_target_suffixes_are_parsed() {
        let resolved = resolve_model("painter", &table());
        assert_eq!(resolved.model, "gemini-3-pro-image");
        assert_eq!(resolved.resolution, Some(ImageResolution::TwoK));

        let resolved = resolve_model("gpt-4o", &table());
        assert_eq!(resolved.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_alias_on_stripped_base() {
        let resolved = resolve_model("pro-high", &table());
        assert_eq!(resolved.model, "gemini-3-pro-preview");
        assert_eq!(resolved.thinking, Some(ThinkingLevel::High));
    }

    #[test]
    fn test_load_model_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        assert!(matches!(load_model_table(&path), Err(GatewayError::Config(_))));

        std::fs::write(&path, r#"{"models": ["a", "b"], "alias_map": {"x": "a"}}"#).unwrap();
        let table = load_model_table(&path).unwrap();
        assert_eq!(table.models, vec!["a", "b"]);
        assert_eq!(table.alias_map["x"], "a");
    }
}
