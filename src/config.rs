//! Layered session configuration: defaults, an optional TOML file, and the
//! pieces the controller actually needs (budgets, flags, cancellation-owning
//! knobs) rather than anything forge- or agent-specific.

use crate::phase::{BudgetConfig, Phase, PhaseList};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// On-disk shape of the optional config file. Every field is optional so a
/// session can override only what it needs; unset fields fall back to
/// `Config::default()`'s built-ins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub project_dir: Option<PathBuf>,
    pub claude_cmd: Option<String>,
    pub verify_enabled: Option<bool>,
    pub plan_skip_enabled: Option<bool>,
    pub no_signal_limit: Option<u32>,
    pub default_branch: Option<String>,
    pub session_wide_budget_override: Option<u32>,
    pub per_phase_budget_overrides: Option<HashMap<String, u32>>,
    pub custom_phases: Option<Vec<String>>,
}

/// Fully resolved session configuration, after layering defaults under any
/// config file found on disk.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub claude_cmd: String,
    pub phase_list: PhaseList,
    pub budgets: BudgetConfig,
    pub plan_skip_enabled: bool,
    pub no_signal_limit: u32,
    pub default_branch: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            claude_cmd: "claude".to_string(),
            phase_list: PhaseList::default_phases(false),
            budgets: BudgetConfig::default(),
            plan_skip_enabled: true,
            no_signal_limit: 2,
            default_branch: "main".to_string(),
        }
    }
}

impl Config {
    /// Load `agentium.toml` from `project_dir` if present, layering it over
    /// built-in defaults; a missing file is not an error.
    pub fn load(project_dir: &Path) -> Result<Self, String> {
        let mut config = Config {
            project_dir: project_dir.to_path_buf(),
            ..Config::default()
        };

        let config_path = project_dir.join("agentium.toml");
        if !config_path.exists() {
            return Ok(config);
        }

        let contents = std::fs::read_to_string(&config_path)
            .map_err(|e| format!("failed to read {}: {e}", config_path.display()))?;
        let file: ConfigFile = toml::from_str(&contents)
            .map_err(|e| format!("failed to parse {}: {e}", config_path.display()))?;

        config.apply(file);
        Ok(config)
    }

    fn apply(&mut self, file: ConfigFile) {
        if let Some(dir) = file.project_dir {
            self.project_dir = dir;
        }
        if let Some(cmd) = file.claude_cmd {
            self.claude_cmd = cmd;
        }
        if let Some(verify) = file.verify_enabled {
            let mut phases = self.phase_list.phases.clone();
            phases.retain(|p| *p != Phase::Verify);
            if verify {
                phases.push(Phase::Verify);
            }
            self.phase_list = PhaseList::new(phases);
        }
        if let Some(custom) = file.custom_phases {
            let mut phases = self.phase_list.phases.clone();
            for name in custom {
                phases.push(Phase::parse(&name));
            }
            self.phase_list = PhaseList::new(phases);
        }
        if let Some(enabled) = file.plan_skip_enabled {
            self.plan_skip_enabled = enabled;
        }
        if let Some(limit) = file.no_signal_limit {
            self.no_signal_limit = limit;
        }
        if let Some(branch) = file.default_branch {
            self.default_branch = branch;
        }
        if let Some(session_wide) = file.session_wide_budget_override {
            self.budgets.session_wide_override = Some(session_wide);
        }
        if let Some(overrides) = file.per_phase_budget_overrides {
            for (name, budget) in overrides {
                self.budgets.per_phase_overrides.insert(Phase::parse(&name), budget);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_plan_implement_docs_only() {
        let config = Config::default();
        assert_eq!(
            config.phase_list.phases,
            vec![Phase::Plan, Phase::Implement, Phase::Docs]
        );
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.claude_cmd, "claude");
        assert!(config.plan_skip_enabled);
    }

    #[test]
    fn load_applies_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("agentium.toml"),
            r#"
            claude_cmd = "my-claude"
            verify_enabled = true
            no_signal_limit = 5
            plan_skip_enabled = false

            [per_phase_budget_overrides]
            IMPLEMENT = 8
            "#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.claude_cmd, "my-claude");
        assert!(config.phase_list.phases.contains(&Phase::Verify));
        assert_eq!(config.no_signal_limit, 5);
        assert!(!config.plan_skip_enabled);
        assert_eq!(config.budgets.budget_for(&Phase::Implement, false), 8);
    }

    #[test]
    fn load_with_malformed_toml_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agentium.toml"), "not valid = [[[").unwrap();
        assert!(Config::load(dir.path()).is_err());
    }
}
