//! Vibe catalog: the ordered list of ambience profiles plus the rotation
//! parameters that travel with it in `vibes.toml`.

use serde::{Deserialize, Serialize};

use crate::protocol::VibeState;

/// Id used by the shipped sample catalog for entries nobody filled in yet.
pub const PLACEHOLDER_ID: &str = "REPLACE_ME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vibe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Vibe {
    /// Name followed by aliases, normalized, empty entries skipped.
    pub fn normalized_names(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .map(|n| normalize(n))
            .filter(|n| !n.is_empty())
    }

    pub fn state(&self) -> VibeState {
        VibeState {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationSettings {
    #[serde(default = "default_tracks_per_vibe")]
    pub tracks_per_vibe: u32,
    #[serde(default = "default_avoid_last")]
    pub avoid_last: usize,
    #[serde(default = "default_window_secs")]
    pub request_storm_window_secs: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            tracks_per_vibe: default_tracks_per_vibe(),
            avoid_last: default_avoid_last(),
            request_storm_window_secs: default_window_secs(),
        }
    }
}

fn default_tracks_per_vibe() -> u32 {
    15
}

fn default_avoid_last() -> usize {
    3
}

fn default_window_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibeCatalog {
    #[serde(default)]
    pub default_vibe: Option<String>,
    #[serde(default = "default_window_secs")]
    pub quiet_announce_secs: u64,
    #[serde(default)]
    pub rotation: RotationSettings,
    #[serde(default, rename = "vibe")]
    pub vibes: Vec<Vibe>,
}

impl Default for VibeCatalog {
    fn default() -> Self {
        Self {
            default_vibe: None,
            quiet_announce_secs: default_window_secs(),
            rotation: RotationSettings::default(),
            vibes: Vec::new(),
        }
    }
}

/// A fuzzy hit: the vibe plus the normalized name or alias that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyMatch<'a> {
    pub vibe: &'a Vibe,
    pub matched: String,
}

/// Lower-case, trim, and fold typographic apostrophes so "what’s" == "what's".
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

impl VibeCatalog {
    pub fn is_empty(&self) -> bool {
        self.vibes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Vibe> {
        self.vibes.iter().find(|v| v.id == id)
    }

    pub fn names(&self) -> Vec<&str> {
        self.vibes.iter().map(|v| v.name.as_str()).collect()
    }

    /// Exact match against names and aliases after normalization.
    pub fn find_by_name(&self, text: &str) -> Option<&Vibe> {
        let needle = normalize(text);
        if needle.is_empty() {
            return None;
        }
        self.vibes
            .iter()
            .find(|v| v.normalized_names().any(|n| n == needle))
    }

    /// Containment match in either direction: the text mentions a name, or a
    /// name contains the whole text.  First vibe in catalog order wins.
    pub fn find_fuzzy(&self, text: &str) -> Option<FuzzyMatch<'_>> {
        let needle = normalize(text);
        if needle.is_empty() {
            return None;
        }
        self.vibes.iter().find_map(|vibe| {
            vibe.normalized_names()
                .find(|name| needle.contains(name.as_str()) || name.contains(needle.as_str()))
                .map(|matched| FuzzyMatch { vibe, matched })
        })
    }

    /// Exact first, fuzzy second.
    pub fn resolve(&self, text: &str) -> Option<&Vibe> {
        self.find_by_name(text)
            .or_else(|| self.find_fuzzy(text).map(|m| m.vibe))
    }

    /// The configured default vibe, or the first one in the catalog.
    pub fn default_vibe(&self) -> Option<&Vibe> {
        self.default_vibe
            .as_deref()
            .and_then(|name| self.find_by_name(name).or_else(|| self.get(name)))
            .or_else(|| self.vibes.first())
    }

    pub fn placeholder_count(&self) -> usize {
        self.vibes.iter().filter(|v| v.id == PLACEHOLDER_ID).count()
    }
}

pub fn load_catalog_from_toml(path: &std::path::Path) -> anyhow::Result<VibeCatalog> {
    let content = std::fs::read_to_string(path)?;
    parse_catalog_from_toml_str(&content)
}

pub fn parse_catalog_from_toml_str(content: &str) -> anyhow::Result<VibeCatalog> {
    let catalog: VibeCatalog = toml::from_str(content)?;
    if catalog.vibes.is_empty() {
        anyhow::bail!("vibe catalog is empty; add [[vibe]] entries to vibes.toml");
    }
    Ok(catalog)
}
