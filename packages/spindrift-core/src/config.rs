//! YAML roster persistence.
//!
//! The roster is a single YAML document mapping endpoint names to their
//! configurations. Loading is strict: unknown fields warn, invalid fields
//! fail the whole load with a descriptive error so the process starts with
//! an empty roster rather than a half-applied one.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{SpindriftError, SpindriftResult};
use crate::state::PlayerConfiguration;

/// Loads the roster from `path`.
///
/// A missing file is an empty roster, not an error. Unknown fields inside
/// an entry produce warnings; any invalid value fails the entire load.
///
/// # Errors
///
/// [`SpindriftError::Configuration`] naming the entry and field at fault.
pub fn load_roster(path: &Path) -> SpindriftResult<BTreeMap<String, PlayerConfiguration>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("[Config] No roster at {}; starting empty", path.display());
            return Ok(BTreeMap::new());
        }
        Err(e) => {
            return Err(SpindriftError::Configuration(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    parse_roster(&text)
}

/// Parses a roster document.
///
/// # Errors
///
/// [`SpindriftError::Configuration`] on malformed YAML, a name/key mismatch,
/// or any field that fails validation.
pub fn parse_roster(text: &str) -> SpindriftResult<BTreeMap<String, PlayerConfiguration>> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    // First pass over loose values so unknown fields warn instead of failing.
    let loose: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(text)
        .map_err(|e| SpindriftError::Configuration(format!("roster is not a mapping: {e}")))?;

    let known_fields = [
        "name",
        "server",
        "device_id",
        "delay_ms",
        "volume",
        "autostart",
        "correction",
    ];

    let mut roster = BTreeMap::new();
    for (key, value) in loose {
        if let Some(mapping) = value.as_mapping() {
            for field in mapping.keys() {
                if let Some(field) = field.as_str() {
                    if !known_fields.contains(&field) {
                        log::warn!("[Config] {key}: unknown field `{field}` ignored");
                    }
                }
            }
        }

        let mut entry: PlayerConfiguration = serde_yaml::from_value(strip_unknown(value))
            .map_err(|e| SpindriftError::Configuration(format!("entry `{key}`: {e}")))?;
        // The mapping key is authoritative; a conflicting inline name is a
        // config bug worth failing on.
        if entry.name.is_empty() {
            entry.name = key.clone();
        } else if entry.name != key {
            return Err(SpindriftError::Configuration(format!(
                "entry `{key}` declares mismatched name `{}`",
                entry.name
            )));
        }
        entry
            .validate()
            .map_err(|e| SpindriftError::Configuration(format!("entry `{key}`: {e}")))?;
        roster.insert(key, entry);
    }
    Ok(roster)
}

/// Removes fields `PlayerConfiguration` does not declare, and defaults the
/// name from the mapping key, so strict deserialization can proceed.
fn strip_unknown(value: serde_yaml::Value) -> serde_yaml::Value {
    let serde_yaml::Value::Mapping(mapping) = value else {
        return value;
    };
    let known_fields = [
        "name",
        "server",
        "device_id",
        "delay_ms",
        "volume",
        "autostart",
        "correction",
    ];
    let mut cleaned = serde_yaml::Mapping::new();
    for (k, v) in mapping {
        if k.as_str().is_some_and(|k| known_fields.contains(&k)) {
            cleaned.insert(k, v);
        }
    }
    if !cleaned.contains_key(&serde_yaml::Value::from("name")) {
        cleaned.insert(serde_yaml::Value::from("name"), serde_yaml::Value::from(""));
    }
    serde_yaml::Value::Mapping(cleaned)
}

/// Saves the roster atomically (write to temp, rename over).
///
/// # Errors
///
/// [`SpindriftError::Configuration`] on serialization or I/O failure.
pub fn save_roster(
    path: &Path,
    roster: &BTreeMap<String, PlayerConfiguration>,
) -> SpindriftResult<()> {
    let text = serde_yaml::to_string(roster)
        .map_err(|e| SpindriftError::Configuration(format!("serialize roster: {e}")))?;

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, &text).map_err(|e| {
        SpindriftError::Configuration(format!("write {}: {e}", tmp.display()))
    })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        SpindriftError::Configuration(format!("rename {} -> {}: {e}", tmp.display(), path.display()))
    })?;
    log::debug!("[Config] Roster saved: {} entries", roster.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CorrectionMode;

    const ROSTER: &str = r#"
kitchen:
  name: kitchen
  server: "ma.local:8097"
  device_id: "hw:0,0"
  delay_ms: 40
  volume: 80
  autostart: true

bedroom:
  server: "ma.local:8097"
  correction: drop-insert
"#;

    #[test]
    fn parses_roster_with_defaults() {
        let roster = parse_roster(ROSTER).unwrap();
        assert_eq!(roster.len(), 2);

        let kitchen = &roster["kitchen"];
        assert_eq!(kitchen.delay_ms, 40);
        assert_eq!(kitchen.volume, 80);
        assert!(kitchen.autostart);

        let bedroom = &roster["bedroom"];
        assert_eq!(bedroom.name, "bedroom", "name defaults from the key");
        assert_eq!(bedroom.volume, 100);
        assert_eq!(bedroom.correction, CorrectionMode::DropInsert);
    }

    #[test]
    fn unknown_fields_warn_but_load() {
        let text = "kitchen:\n  server: s\n  shiny_new_option: 3\n";
        let roster = parse_roster(text).unwrap();
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn invalid_field_fails_whole_load() {
        let text = "kitchen:\n  server: s\n  volume: 300\n";
        let err = parse_roster(text).unwrap_err();
        assert!(matches!(err, SpindriftError::Configuration(_)));
        assert!(err.to_string().contains("kitchen"));
    }

    #[test]
    fn mismatched_inline_name_fails() {
        let text = "kitchen:\n  name: pantry\n  server: s\n";
        assert!(parse_roster(text).is_err());
    }

    #[test]
    fn empty_document_is_empty_roster() {
        assert!(parse_roster("").unwrap().is_empty());
        assert!(parse_roster("   \n").unwrap().is_empty());
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.yaml");

        let roster = parse_roster(ROSTER).unwrap();
        save_roster(&path, &roster).unwrap();
        let reloaded = load_roster(&path).unwrap();

        assert_eq!(roster.len(), reloaded.len());
        for (name, config) in &roster {
            let other = &reloaded[name];
            assert_eq!(config.server, other.server);
            assert_eq!(config.delay_ms, other.delay_ms);
            assert_eq!(config.volume, other.volume);
            assert_eq!(config.autostart, other.autostart);
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let roster = load_roster(&dir.path().join("absent.yaml")).unwrap();
        assert!(roster.is_empty());
    }
}
