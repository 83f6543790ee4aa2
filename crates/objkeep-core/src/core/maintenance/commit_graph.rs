use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::Utf8Path;
use tracing::{info, warn};

use super::step::{truncate_for_log, MaintenanceStep, StepContext, StepOptions};

const CHAIN_FILE: &str = "commit-graph-chain";
const CHAIN_LOCK_FILE: &str = "commit-graph-chain.lock";

/// Keeps the split commit-graph current, rebuilding the chain when git
/// reports a bad write or a failed verification.
pub struct CommitGraphStep {
    options: StepOptions,
}

impl CommitGraphStep {
    #[must_use]
    pub fn new(options: StepOptions) -> Self {
        Self { options }
    }

    fn write_args(objects_root: &Utf8Path) -> Vec<String> {
        vec![
            "commit-graph".to_string(),
            "write".to_string(),
            "--reachable".to_string(),
            "--split".to_string(),
            "--size-multiple=4".to_string(),
            "--object-dir".to_string(),
            objects_root.to_string(),
        ]
    }

    fn verify_args(objects_root: &Utf8Path) -> Vec<String> {
        vec![
            "commit-graph".to_string(),
            "verify".to_string(),
            "--shallow".to_string(),
            "--object-dir".to_string(),
            objects_root.to_string(),
        ]
    }

    fn rewrite(&self, ctx: &StepContext, reason: &str, stderr: &str) -> Result<()> {
        // a stopped step must leave the existing chain in place
        if ctx.is_stopping() {
            return Err(ctx.interrupt());
        }
        warn!(
            area = self.area(),
            reason,
            stderr = %truncate_for_log(stderr),
            "rewriting commit-graph chain"
        );
        let chain = ctx.enlistment().commit_graphs_dir().join(CHAIN_FILE);
        remove_if_present(&chain)?;
        ctx.run_git(Self::write_args(ctx.enlistment().objects_root()))?;
        Ok(())
    }
}

impl MaintenanceStep for CommitGraphStep {
    fn area(&self) -> &'static str {
        "CommitGraphStep"
    }

    fn progress_message(&self) -> String {
        "Updating commit-graph".to_string()
    }

    fn requires_store_lock(&self) -> bool {
        self.options.requires_store_lock
    }

    fn perform(&self, ctx: &StepContext) -> Result<()> {
        let objects_root = ctx.enlistment().objects_root();
        let graphs_dir = ctx.enlistment().commit_graphs_dir();
        remove_if_present(&graphs_dir.join(CHAIN_LOCK_FILE))?;

        let write = ctx.run_git(Self::write_args(objects_root))?;
        info!(
            area = self.area(),
            files = %list_graph_files(&graphs_dir),
            "commit-graph list after write"
        );
        if !write.success() {
            self.rewrite(ctx, "write failed", &write.stderr)?;
        }

        let verify = ctx.run_git(Self::verify_args(objects_root))?;
        if !verify.success() {
            self.rewrite(ctx, "verify failed", &verify.stderr)?;
        }
        Ok(())
    }
}

fn remove_if_present(path: &Utf8Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            Err(err).with_context(|| format!("failed to delete {path}"))
        }
        _ => Ok(()),
    }
}

/// `a;b;c;` listing of the graph directory for the log.
fn list_graph_files(dir: &Utf8Path) -> String {
    let Ok(entries) = dir.read_dir_utf8() else {
        return String::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.file_name().to_string()))
        .collect();
    names.sort();
    names.into_iter().map(|name| name + ";").collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::maintenance::step::{StepExecution, StepInterrupt, StepOutcome};
    use crate::core::maintenance::testing::{self, failed, ok, FakeEffects};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn healthy_graph_writes_then_verifies() -> Result<()> {
        let temp = tempdir()?;
        let effects = Arc::new(FakeEffects::default());
        let repo = testing::repo(temp.path(), &effects, |e| e)?;
        let graphs = repo.enlistment().commit_graphs_dir();
        fs::create_dir_all(&graphs)?;
        fs::write(graphs.join(CHAIN_LOCK_FILE), "")?;
        let objects = repo.enlistment().objects_root().to_string();

        let execution = StepExecution::new(repo, Box::new(CommitGraphStep::new(StepOptions::default())));
        assert_eq!(execution.execute()?, StepOutcome::Completed);
        assert_eq!(
            effects.git.command_lines(),
            vec![
                format!("commit-graph write --reachable --split --size-multiple=4 --object-dir {objects}"),
                format!("commit-graph verify --shallow --object-dir {objects}"),
            ]
        );
        assert!(!graphs.join(CHAIN_LOCK_FILE).exists());
        Ok(())
    }

    #[test]
    fn failed_verify_deletes_chain_and_rewrites() -> Result<()> {
        let temp = tempdir()?;
        let effects = Arc::new(FakeEffects::default());
        effects.git.respond_with(|args| {
            if args.get(1).is_some_and(|arg| arg == "verify") {
                failed("commit-graph has incorrect OID order")
            } else {
                ok("")
            }
        });
        let repo = testing::repo(temp.path(), &effects, |e| e)?;
        let graphs = repo.enlistment().commit_graphs_dir();
        fs::create_dir_all(&graphs)?;
        fs::write(graphs.join(CHAIN_FILE), "bad")?;

        let execution = StepExecution::new(repo, Box::new(CommitGraphStep::new(StepOptions::default())));
        execution.execute()?;

        let subcommands: Vec<String> = effects
            .git
            .commands()
            .into_iter()
            .map(|args| args[1].clone())
            .collect();
        assert_eq!(subcommands, ["write", "verify", "write"]);
        assert!(!graphs.join(CHAIN_FILE).exists());
        Ok(())
    }

    #[test]
    fn failed_write_is_retried_before_verify() -> Result<()> {
        let temp = tempdir()?;
        let effects = Arc::new(FakeEffects::default());
        let writes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = writes.clone();
        effects.git.respond_with(move |args| {
            if args.get(1).is_some_and(|arg| arg == "write")
                && counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0
            {
                failed("fatal: unable to write commit-graph")
            } else {
                ok("")
            }
        });
        let repo = testing::repo(temp.path(), &effects, |e| e)?;

        let execution = StepExecution::new(repo, Box::new(CommitGraphStep::new(StepOptions::default())));
        execution.execute()?;
        let subcommands: Vec<String> = effects
            .git
            .commands()
            .into_iter()
            .map(|args| args[1].clone())
            .collect();
        assert_eq!(subcommands, ["write", "write", "verify"]);
        Ok(())
    }

    #[test]
    fn stopped_step_keeps_chain_instead_of_rewriting() -> Result<()> {
        let temp = tempdir()?;
        let effects = Arc::new(FakeEffects::default());
        let repo = testing::repo(temp.path(), &effects, |e| e)?;
        let graphs = repo.enlistment().commit_graphs_dir();
        fs::create_dir_all(&graphs)?;
        fs::write(graphs.join(CHAIN_FILE), "chain")?;

        let step = CommitGraphStep::new(StepOptions::default());
        let execution = StepExecution::new(repo, Box::new(CommitGraphStep::new(StepOptions::default())));
        execution.context().stop();

        let err = step
            .rewrite(execution.context(), "verify failed", "bad graph")
            .unwrap_err();
        assert!(err.downcast_ref::<StepInterrupt>().is_some(), "{err:#}");
        assert_eq!(fs::read_to_string(graphs.join(CHAIN_FILE))?, "chain");
        assert!(effects.git.commands().is_empty());
        Ok(())
    }

    #[test]
    fn graph_listing_is_semicolon_separated() -> Result<()> {
        let temp = tempdir()?;
        let dir = Utf8Path::from_path(temp.path()).ok_or_else(|| anyhow::anyhow!("utf8"))?;
        fs::write(dir.join("graph-b.graph"), "")?;
        fs::write(dir.join("commit-graph-chain"), "")?;
        assert_eq!(list_graph_files(dir), "commit-graph-chain;graph-b.graph;");
        assert_eq!(list_graph_files(&dir.join("missing")), "");
        Ok(())
    }
}
