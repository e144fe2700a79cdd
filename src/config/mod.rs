pub mod schema;

pub use schema::{
    AuditConfig, BackendConfig, BannerRegion, Config, ModelsConfig, ResolverConfig, SafetyConfig,
    SessionConfig, VerifierConfig, VisionConfig,
};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the config directory. `--config-dir` sets it for the process.
pub const CONFIG_DIR_ENV: &str = "VMPILOT_CONFIG_DIR";
const CONFIG_FILE: &str = "config.toml";

/// Directory holding `config.toml`.
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(shellexpand::tilde(dir.trim()).into_owned()));
        }
    }
    let dirs = ProjectDirs::from("", "", "vmpilot")
        .context("Could not determine a home directory for the config")?;
    Ok(dirs.config_dir().to_path_buf())
}

impl Config {
    /// Loads `config.toml`, falling back to defaults when it does not exist.
    pub async fn load_or_default() -> Result<Self> {
        Self::load_from_dir(&config_dir()?).await
    }

    pub async fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        let mut config = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => toml::from_str::<Config>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        config.config_path = path;
        config.validate()?;
        Ok(config)
    }

    /// Writes the config back to `config_path`, creating parent directories.
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        tokio::fs::write(&self.config_path, raw)
            .await
            .with_context(|| format!("Failed to write {}", self.config_path.display()))
    }

    /// Writes a default `config.toml` into `dir`. Refuses to overwrite unless `force`.
    pub async fn init(dir: &Path, force: bool) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !force && tokio::fs::try_exists(&path).await.unwrap_or(false) {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        let config = Config {
            config_path: path,
            ..Config::default()
        };
        config.save().await?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                bail!("{name} must be within [0, 1], got {v}");
            }
            Ok(())
        };
        unit("vision.min_confidence", self.vision.min_confidence)?;
        unit("vision.fuzzy_threshold", self.vision.fuzzy_threshold)?;
        unit("vision.dedupe_iou", self.vision.dedupe_iou)?;
        unit("verifier.min_change_ratio", self.verifier.min_change_ratio)?;
        unit("safety.name_similarity", self.safety.name_similarity)?;
        if !(0.0..=1.0).contains(&self.vision.proximity_margin_pct) {
            bail!("vision.proximity_margin_pct is a fraction, e.g. 0.15 for 15%");
        }

        // Two of three identifiers is the floor; deployments may demand all three.
        if !(2..=3).contains(&self.safety.min_matches) {
            bail!(
                "safety.min_matches must be 2 or 3, got {}",
                self.safety.min_matches
            );
        }
        let banner = &self.safety.banner_region;
        let pct = [banner.x_pct, banner.y_pct, banner.width_pct, banner.height_pct];
        if pct.iter().any(|p| !(0.0..=100.0).contains(p))
            || banner.width_pct <= 0.0
            || banner.height_pct <= 0.0
            || banner.x_pct + banner.width_pct > 100.0
            || banner.y_pct + banner.height_pct > 100.0
        {
            bail!("safety.banner_region must lie within the screen (percentages 0-100)");
        }

        if self.verifier.max_attempts == 0 {
            bail!("verifier.max_attempts must be at least 1");
        }
        if self.verifier.backoff_max_ms < self.verifier.backoff_ms {
            bail!("verifier.backoff_max_ms must not be below verifier.backoff_ms");
        }
        if self.session.capture_retention == 0 {
            bail!("session.capture_retention must be at least 1");
        }
        if self.session.action_timeout_ms == 0 {
            bail!("session.action_timeout_ms must be positive");
        }
        crate::backend::ConnectionKind::parse(&self.backend.kind)?;
        Ok(())
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.session.action_timeout_ms)
    }

    /// Audit directory with `~` and environment variables expanded.
    pub fn audit_dir(&self) -> Result<PathBuf> {
        let expanded = shellexpand::full(&self.audit.dir)
            .with_context(|| format!("Failed to expand audit.dir '{}'", self.audit.dir))?;
        Ok(PathBuf::from(expanded.into_owned()))
    }
}
