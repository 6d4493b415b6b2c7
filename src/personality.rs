//! Personality catalogue loading.
//!
//! Personalities are loaded once at startup from a TOML catalogue. A built-in
//! profile (`"umebot"`) is always present so the conversation core can run
//! without any catalogue file. Changing the active personality rebuilds the
//! prompt template but never starts a new conversation.

use crate::error::{Result, UmebotError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// One personality profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    /// Stable key used by config messages and the settings snapshot.
    pub key: String,
    /// Human-readable name shown in the GUI.
    pub display_name: String,
    /// Name the robot uses for itself in the prompt footer.
    pub robot_name: String,
    /// System prompt establishing the character.
    pub system_prompt: String,
}

/// Built-in default profile, available even without a catalogue file.
pub const BUILTIN_KEY: &str = "umebot";

const BUILTIN_SYSTEM_PROMPT: &str = "\
Eres Umebot, un robot humanoide asistente amable y servicial.\n\
Responde en una a tres frases cortas y naturales, en el idioma del usuario.\n\
No uses emojis ni describas acciones fisicas en el texto.";

fn builtin() -> Personality {
    Personality {
        key: BUILTIN_KEY.to_owned(),
        display_name: "Umebot".to_owned(),
        robot_name: "Umebot".to_owned(),
        system_prompt: BUILTIN_SYSTEM_PROMPT.to_owned(),
    }
}

/// On-disk catalogue schema: `[[personalities]]` entries.
#[derive(Debug, Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    personalities: Vec<Personality>,
}

/// Load the catalogue from `path`, merged over the built-in profile.
///
/// A missing file degrades to the built-in profile alone with a warning; a
/// present-but-invalid file is a configuration error.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed, or if an entry
/// has an empty key.
pub fn load_catalogue(path: &Path) -> Result<BTreeMap<String, Personality>> {
    let mut catalogue = BTreeMap::new();
    let base = builtin();
    catalogue.insert(base.key.clone(), base);

    if !path.exists() {
        warn!(
            "personality catalogue {} not found, using built-in profile only",
            path.display()
        );
        return Ok(catalogue);
    }

    let raw = std::fs::read_to_string(path)?;
    let parsed: CatalogueFile = toml::from_str(&raw)
        .map_err(|e| UmebotError::Config(format!("invalid personality catalogue: {e}")))?;

    for personality in parsed.personalities {
        if personality.key.trim().is_empty() {
            return Err(UmebotError::Config(
                "personality catalogue entry has an empty key".to_owned(),
            ));
        }
        catalogue.insert(personality.key.clone(), personality);
    }

    info!(
        "loaded {} personalities from {}",
        catalogue.len(),
        path.display()
    );
    Ok(catalogue)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn builtin_always_present() {
        let catalogue = load_catalogue(Path::new("/nonexistent/personalities.toml")).unwrap();
        assert!(catalogue.contains_key(BUILTIN_KEY));
    }

    #[test]
    fn catalogue_file_merges_over_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("personalities.toml");
        std::fs::write(
            &path,
            r#"
            [[personalities]]
            key = "pirata"
            display_name = "Pirata"
            robot_name = "Capitan Ume"
            system_prompt = "Hablas como un pirata."
            "#,
        )
        .unwrap();

        let catalogue = load_catalogue(&path).unwrap();
        assert!(catalogue.contains_key(BUILTIN_KEY));
        assert_eq!(catalogue["pirata"].robot_name, "Capitan Ume");
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("personalities.toml");
        std::fs::write(
            &path,
            r#"
            [[personalities]]
            key = ""
            display_name = "X"
            robot_name = "X"
            system_prompt = "X"
            "#,
        )
        .unwrap();
        assert!(load_catalogue(&path).is_err());
    }
}
