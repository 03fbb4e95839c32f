pub mod export;
pub mod import;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tcmsync::reconcile::ImportReport;
use tcmsync::{Config, Decision, MemoryGateway, load_store, save_store};

/// Settings shared by every command.
pub struct Context {
    pub config: Config,
    pub store_path: PathBuf,
    pub json: bool,
}

impl Context {
    pub fn load(config: Option<&Path>, store: Option<PathBuf>, json: bool) -> Result<Self> {
        let config = Config::load(config).context("Failed to load configuration")?;
        let store_path = store_path(store, &config)?;
        Ok(Self {
            config,
            store_path,
            json,
        })
    }

    pub fn open_store(&self) -> Result<MemoryGateway> {
        load_store(&self.store_path, &default_username())
            .with_context(|| format!("Failed to open TCMS store {}", self.store_path.display()))
    }

    pub fn save_store(&self, gateway: &MemoryGateway) -> Result<()> {
        save_store(gateway, &self.store_path)
            .with_context(|| format!("Failed to save TCMS store {}", self.store_path.display()))
    }
}

/// `--store`, then `tcms.store-path`, then the user data directory.
pub fn store_path(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    if let Some(path) = flag.or_else(|| config.tcms.store_path.clone()) {
        return Ok(path);
    }
    dirs::data_dir()
        .map(|d| d.join("tcmsync").join("store.json"))
        .context("No data directory available; pass --store")
}

/// Login name used when a fresh store is created.
pub fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "tcmsync".to_string())
}

/// One line per decision. Failures in a dry run are phrased as prospective.
pub fn describe(decision: &Decision, dry_run: bool) -> String {
    let target = decision
        .target
        .map(|t| format!(" -> {}", t))
        .unwrap_or_default();
    match &decision.action {
        tcmsync::Action::Failed(err) => format!(
            "{} {} '{}': {}",
            if dry_run { "will fail" } else { "failed" },
            decision.class,
            decision.key,
            err
        ),
        action => format!(
            "{:<11} {} '{}'{}",
            action.label(),
            decision.class,
            decision.key,
            target
        ),
    }
}

pub fn print_report(report: &ImportReport, json: bool) -> Result<()> {
    let dry_run = report.simulated;
    if json {
        let out = serde_json::json!({
            "dry-run": dry_run,
            "decisions": report.trace.decisions(),
            "abort": report.abort.as_ref().map(|e| e.to_string()),
            "attachments": report.attachments.iter().map(|a| serde_json::json!({
                "class": a.class,
                "target": a.target,
                "file": a.file,
                "error": a.error.as_ref().map(|e| e.to_string()),
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for decision in report.trace.decisions() {
        println!("{}", describe(decision, dry_run));
    }
    for entry in &report.attachments {
        match &entry.error {
            Some(err) => println!(
                "{} attachment '{}': {}",
                if dry_run { "will fail" } else { "failed" },
                entry.file,
                err
            ),
            None => println!("attached    {} {} '{}'", entry.class, entry.target, entry.file),
        }
    }
    if let Some(err) = &report.abort {
        println!("{}: {}", if dry_run { "would abort" } else { "aborted" }, err);
    }
    let s = &report.summary;
    println!(
        "{}{} matched, {} remapped, {} created, {} updated, {} skipped, {} substituted, {} failed",
        if dry_run { "(dry run) " } else { "" },
        s.matched,
        s.remapped,
        s.created,
        s.updated,
        s.skipped,
        s.substituted,
        s.failed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcmsync::{Action, NaturalKey, SourceId, SyncError, TargetId, TcmsClass};

    #[test]
    fn test_describe_phrases_dry_run_failures() {
        let failed = Decision::failed(
            TcmsClass::Version,
            NaturalKey::new(["1.0"]),
            Some(SourceId(102)),
            SyncError::MustExist {
                class: TcmsClass::Version,
                key: "1.0".to_string(),
            },
        );
        assert!(describe(&failed, true).starts_with("will fail Version '1.0'"));
        assert!(describe(&failed, false).starts_with("failed Version '1.0'"));

        let created = Decision::new(
            TcmsClass::Build,
            NaturalKey::new(["b1", "55"]),
            Some(SourceId(201)),
            Some(TargetId(-1)),
            Action::Created,
        );
        assert_eq!(describe(&created, true), "created     Build 'b1/55' -> -1");
    }

    #[test]
    fn test_store_path_precedence() {
        let mut config = Config::default();
        config.tcms.store_path = Some(PathBuf::from("/cfg/store.json"));
        assert_eq!(
            store_path(Some(PathBuf::from("/flag.json")), &config).unwrap(),
            PathBuf::from("/flag.json")
        );
        assert_eq!(
            store_path(None, &config).unwrap(),
            PathBuf::from("/cfg/store.json")
        );
    }
}
