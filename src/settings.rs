// =============================================================================
// Risk Settings — runtime-adjustable trading gates with atomic save
// =============================================================================
//
// The two gates the dashboard can flip at runtime: the minimum prediction
// confidence for auto trades and the auto-trading master switch.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. Every field carries `#[serde(default)]` so that adding new fields
// never breaks loading an older settings file. A mutation is persisted
// BEFORE the RPC acknowledgement is returned to the dashboard.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_min_confidence() -> f64 {
    0.6
}

/// Runtime-mutable risk settings, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    /// Minimum prediction confidence required before an auto trade is
    /// emitted. Range [0, 1].
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Master switch: when false no `command` frame is ever emitted
    /// automatically, regardless of prediction confidence.
    #[serde(default)]
    pub auto_trading_enabled: bool,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            auto_trading_enabled: false,
        }
    }
}

/// A partial update from the dashboard. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub auto_trading_enabled: Option<bool>,
}

impl RiskSettings {
    /// Load settings from a JSON file at `path`.
    ///
    /// A missing file is not an error condition worth aborting over; the
    /// caller falls back to defaults derived from the static config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;

        info!(
            path = %path.display(),
            min_confidence = settings.min_confidence,
            auto_trading_enabled = settings.auto_trading_enabled,
            "risk settings loaded"
        );

        Ok(settings)
    }

    /// Persist the current settings to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise risk settings")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "risk settings saved (atomic)");
        Ok(())
    }

    /// Apply a patch, validating each field. Returns the list of applied
    /// change descriptions, or an error string naming the first rejected
    /// field. The settings are unchanged when an error is returned.
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> std::result::Result<Vec<String>, String> {
        let mut staged = self.clone();
        let mut changes = Vec::new();

        if let Some(mc) = patch.min_confidence {
            if !(0.0..=1.0).contains(&mc) || !mc.is_finite() {
                return Err(format!("min_confidence out of range [0,1]: {mc}"));
            }
            if (staged.min_confidence - mc).abs() > f64::EPSILON {
                changes.push(format!("min_confidence: {} -> {}", staged.min_confidence, mc));
                staged.min_confidence = mc;
            }
        }

        if let Some(enabled) = patch.auto_trading_enabled {
            if staged.auto_trading_enabled != enabled {
                changes.push(format!(
                    "auto_trading_enabled: {} -> {}",
                    staged.auto_trading_enabled, enabled
                ));
                staged.auto_trading_enabled = enabled;
            }
        }

        *self = staged;
        Ok(changes)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let settings: RiskSettings = serde_json::from_str("{}").unwrap();
        assert!((settings.min_confidence - 0.6).abs() < f64::EPSILON);
        assert!(!settings.auto_trading_enabled);
    }

    #[test]
    fn patch_applies_and_reports_changes() {
        let mut settings = RiskSettings::default();
        let patch = SettingsPatch {
            min_confidence: Some(0.75),
            auto_trading_enabled: Some(true),
        };
        let changes = settings.apply_patch(&patch).unwrap();
        assert_eq!(changes.len(), 2);
        assert!((settings.min_confidence - 0.75).abs() < f64::EPSILON);
        assert!(settings.auto_trading_enabled);
    }

    #[test]
    fn patch_rejects_out_of_range_confidence() {
        let mut settings = RiskSettings::default();
        let patch = SettingsPatch {
            min_confidence: Some(1.5),
            auto_trading_enabled: Some(true),
        };
        let err = settings.apply_patch(&patch).unwrap_err();
        assert!(err.contains("min_confidence"));
        // Nothing was applied, including the valid field.
        assert!(!settings.auto_trading_enabled);
        assert!((settings.min_confidence - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn noop_patch_reports_no_changes() {
        let mut settings = RiskSettings::default();
        let patch = SettingsPatch {
            min_confidence: Some(settings.min_confidence),
            auto_trading_enabled: Some(settings.auto_trading_enabled),
        };
        let changes = settings.apply_patch(&patch).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = RiskSettings {
            min_confidence: 0.42,
            auto_trading_enabled: true,
        };
        settings.save(&path).unwrap();

        let loaded = RiskSettings::load(&path).unwrap();
        assert_eq!(settings, loaded);
        // No tmp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RiskSettings::load(dir.path().join("absent.json")).is_err());
    }
}
