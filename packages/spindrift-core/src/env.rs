//! Process-wide environment detection.
//!
//! Two inputs decide data paths and the default audio backend: the presence
//! of `/data/options.json` and a non-empty `SUPERVISOR_TOKEN`. Either marks
//! a supervised (add-on style) deployment. The detector runs once at startup
//! and its result is immutable for the process lifetime.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::player::backend::BackendKind;

/// Immutable environment facts, detected once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// True when running under a supervisor (add-on deployment).
    pub supervised: bool,
    /// Directory for persistent state (roster, caches).
    pub data_dir: PathBuf,
    /// Audio backend to default to when configuration names none.
    pub default_backend: BackendKind,
}

static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

/// Returns the process-wide environment, detecting it on first call.
pub fn environment() -> &'static Environment {
    ENVIRONMENT.get_or_init(|| {
        detect(
            Path::new("/data/options.json"),
            std::env::var("SUPERVISOR_TOKEN").ok().as_deref(),
        )
    })
}

/// Pure detection logic, separated for tests.
#[must_use]
pub fn detect(options_file: &Path, supervisor_token: Option<&str>) -> Environment {
    let supervised =
        options_file.exists() || supervisor_token.is_some_and(|t| !t.trim().is_empty());

    if supervised {
        Environment {
            supervised: true,
            data_dir: PathBuf::from("/data"),
            // Supervised images ship a PulseAudio socket for add-ons.
            default_backend: BackendKind::PulseAudio,
        }
    } else {
        let data_dir = std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".spindrift"));
        Environment {
            supervised: false,
            data_dir,
            default_backend: BackendKind::AlsaDirect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_defaults_to_alsa() {
        let dir = tempfile::tempdir().unwrap();
        let env = detect(&dir.path().join("absent.json"), None);
        assert!(!env.supervised);
        assert_eq!(env.default_backend, BackendKind::AlsaDirect);
    }

    #[test]
    fn options_file_marks_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let options = dir.path().join("options.json");
        std::fs::write(&options, "{}").unwrap();
        let env = detect(&options, None);
        assert!(env.supervised);
        assert_eq!(env.default_backend, BackendKind::PulseAudio);
        assert_eq!(env.data_dir, PathBuf::from("/data"));
    }

    #[test]
    fn supervisor_token_marks_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let env = detect(&dir.path().join("absent.json"), Some("abc123"));
        assert!(env.supervised);
    }

    #[test]
    fn empty_token_does_not_mark_supervised() {
        let dir = tempfile::tempdir().unwrap();
        let env = detect(&dir.path().join("absent.json"), Some("   "));
        assert!(!env.supervised);
    }
}
