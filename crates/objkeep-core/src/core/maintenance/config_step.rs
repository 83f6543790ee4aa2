//! Keeps the local git config at the values the maintenance engine depends on.

use anyhow::Result;
use indexmap::IndexMap;
use objkeep_domain::Enlistment;
use tracing::{debug, error, info};

use super::step::{truncate_for_log, MaintenanceStep, StepContext, StepOptions};

const BLOCK_COMMANDS: u32 = 1 << 1;
const MISSING_OK: u32 = 1 << 2;
const FETCH_SKIP_REACHABILITY_AND_UPLOAD_PACK: u32 = 1 << 4;
const PREFETCH_DURING_FETCH: u32 = 1 << 7;

/// `core.gvfs` flags required by the on-demand protocol.
pub const SMART_PROTOCOL_CORE_FLAGS: u32 =
    BLOCK_COMMANDS | MISSING_OK | FETCH_SKIP_REACHABILITY_AND_UPLOAD_PACK | PREFETCH_DURING_FETCH;

const EXCLUDE_DECORATION_KEY: &str = "log.excludeDecoration";
const EXCLUDED_DECORATIONS: [&str; 1] = ["refs/prefetch/*"];

pub struct ConfigStep {
    options: StepOptions,
}

/// Local config as listed by `git config --list --local`. Keys are compared
/// case-insensitively, as git does for section and variable names.
#[derive(Debug, Default)]
pub struct LocalConfig {
    values: IndexMap<String, Vec<String>>,
}

impl LocalConfig {
    pub fn parse(listing: &str) -> Self {
        let mut values: IndexMap<String, Vec<String>> = IndexMap::new();
        for line in listing.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            values
                .entry(key.trim().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
        Self { values }
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    pub fn has_value(&self, key: &str, value: &str) -> bool {
        self.get_all(key).iter().any(|existing| existing == value)
    }
}

impl ConfigStep {
    #[must_use]
    pub fn new(options: StepOptions) -> Self {
        Self { options }
    }

    /// Settings the engine needs. With the smart protocol they overwrite local
    /// values; otherwise they are only filled in when absent.
    pub fn required_settings(enlistment: &Enlistment) -> IndexMap<&'static str, String> {
        let hooks_path = enlistment
            .dot_git()
            .join("hooks")
            .as_str()
            .replace('\\', "/");
        let mut settings: IndexMap<&'static str, String> = [
            ("am.keepcr", "true"),
            ("core.multiPackIndex", "true"),
            ("core.preloadIndex", "true"),
            ("core.untrackedCache", "true"),
            ("core.filemode", if cfg!(windows) { "false" } else { "true" }),
            ("core.bare", "false"),
            ("core.logallrefupdates", "true"),
            ("credential.useHttpPath", "true"),
            ("credential.validate", "false"),
            ("gc.auto", "0"),
            ("gui.gcwarning", "false"),
            ("index.threads", "true"),
            ("index.version", "4"),
            ("merge.stat", "false"),
            ("merge.renames", "false"),
            ("pack.useBitmaps", "false"),
            ("pack.useSparse", "true"),
            ("receive.autogc", "false"),
            ("reset.quiet", "true"),
            ("feature.manyFiles", "false"),
            ("feature.experimental", "false"),
            ("fetch.unpackLimit", "1"),
            ("fetch.writeCommitGraph", "false"),
        ]
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect();
        settings.insert("core.hookspath", hooks_path);

        if enlistment.uses_smart_protocol() {
            settings.insert("core.gvfs", SMART_PROTOCOL_CORE_FLAGS.to_string());
            settings.insert("core.useGvfsHelper", "true".to_string());
            settings.insert("http.version", "HTTP/1.1".to_string());
        }
        if cfg!(windows) {
            settings.insert("http.sslBackend", "schannel".to_string());
        }
        settings
    }

    /// Performance settings, written only when absent so user choices stick.
    pub fn optional_settings(enlistment: &Enlistment) -> IndexMap<&'static str, String> {
        let mut settings: IndexMap<&'static str, String> = [
            ("status.aheadbehind", "false"),
            ("core.autocrlf", "false"),
            ("core.safecrlf", "false"),
            ("core.repositoryFormatVersion", "1"),
            ("maintenance.gc.enabled", "false"),
            ("maintenance.prefetch.enabled", "true"),
            ("maintenance.prefetch.auto", "0"),
            ("maintenance.prefetch.schedule", "hourly"),
            ("maintenance.commit-graph.enabled", "true"),
            ("maintenance.commit-graph.auto", "0"),
            ("maintenance.commit-graph.schedule", "hourly"),
            ("maintenance.loose-objects.enabled", "true"),
            ("maintenance.loose-objects.auto", "0"),
            ("maintenance.loose-objects.schedule", "daily"),
            ("maintenance.incremental-repack.enabled", "true"),
            ("maintenance.incremental-repack.auto", "0"),
            ("maintenance.incremental-repack.schedule", "daily"),
        ]
        .into_iter()
        .map(|(key, value)| (key, value.to_string()))
        .collect();
        if enlistment.uses_smart_protocol() {
            settings.insert("status.submoduleSummary", "false".to_string());
        }
        settings
    }

    /// Writes missing (and, when `overwrite`, mismatched) keys. Returns false
    /// after the first failed write.
    fn apply(
        &self,
        ctx: &StepContext,
        existing: &LocalConfig,
        settings: &IndexMap<&'static str, String>,
        overwrite: bool,
    ) -> Result<bool> {
        for (&key, value) in settings {
            let needs_write =
                !existing.contains(key) || (overwrite && !existing.has_value(key, value));
            if !needs_write {
                continue;
            }
            info!(area = self.area(), key, value = %value, "setting config value");
            let result = ctx.run_git(["config", "--local", key, value.as_str()])?;
            if !result.success() {
                error!(
                    area = self.area(),
                    key,
                    stderr = %truncate_for_log(&result.stderr),
                    "failed to set config value"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn append_multi_values(&self, ctx: &StepContext, existing: &LocalConfig) -> Result<bool> {
        for value in EXCLUDED_DECORATIONS {
            if existing.has_value(EXCLUDE_DECORATION_KEY, value) {
                continue;
            }
            info!(area = self.area(), key = EXCLUDE_DECORATION_KEY, value, "adding config value");
            let result = ctx.run_git(["config", "--local", "--add", EXCLUDE_DECORATION_KEY, value])?;
            if !result.success() {
                error!(
                    area = self.area(),
                    key = EXCLUDE_DECORATION_KEY,
                    stderr = %truncate_for_log(&result.stderr),
                    "failed to add config value"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl MaintenanceStep for ConfigStep {
    fn area(&self) -> &'static str {
        "ConfigStep"
    }

    fn progress_message(&self) -> String {
        "Setting recommended config settings".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    fn perform(&self, ctx: &StepContext) -> Result<()> {
        let listing = ctx.run_git(["config", "--list", "--local"])?;
        if !listing.success() {
            error!(
                area = self.area(),
                stderr = %truncate_for_log(&listing.stderr),
                "failed to get all config entries"
            );
            return Ok(());
        }
        let existing = LocalConfig::parse(&listing.stdout);
        let enlistment = ctx.enlistment();

        let overwrite = enlistment.uses_smart_protocol();
        if !self.apply(ctx, &existing, &Self::required_settings(enlistment), overwrite)? {
            return Ok(());
        }
        if !self.apply(ctx, &existing, &Self::optional_settings(enlistment), false)? {
            return Ok(());
        }
        if self.append_multi_values(ctx, &existing)? {
            debug!(area = self.area(), "config is up to date");
        }
        Ok(())
    }
}
