//! Attachment transfer between containers, runner output and TCMS.

use regex::Regex;
use std::path::{Path, PathBuf};

use super::Engine;
use crate::apply::ApplyPort;
use crate::container::Container;
use crate::entity::{ObjectId, TargetId, TcmsClass};
use crate::error::{SyncError, SyncResult};
use crate::gateway::TcmsGateway;

/// One attachment file handled during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentEntry {
    pub class: TcmsClass,
    pub target: TargetId,
    /// Name the file has (or would have) in TCMS.
    pub file: String,
    pub error: Option<SyncError>,
}

impl<'a, P: ApplyPort> Engine<'a, P> {
    fn record_attachment(&mut self, entry: AttachmentEntry) -> SyncResult<()> {
        let abort = match &entry.error {
            Some(err) => {
                tracing::warn!(class = %entry.class, file = %entry.file, error = %err, "attachment failed");
                self.options.strict_attachments.then(|| err.clone())
            }
            None => None,
        };
        self.attachments.push(entry);
        abort.map_or(Ok(()), Err)
    }

    fn upload_file(&mut self, class: TcmsClass, target: TargetId, path: &Path, name: &str) -> SyncResult<()> {
        let error = if !class.supports_attachments() {
            Some(SyncError::AttachmentsNotSupported { class })
        } else {
            match std::fs::read(path) {
                Err(_) => Some(SyncError::AttachmentMissing {
                    path: path.display().to_string(),
                }),
                Ok(bytes) => self
                    .apply
                    .upload_attachment(class, target.0, name, &bytes)
                    .err()
                    .map(|e| SyncError::AttachmentTransfer {
                        file: name.to_string(),
                        message: e.to_string(),
                    }),
            }
        };
        self.record_attachment(AttachmentEntry {
            class,
            target,
            file: name.to_string(),
            error,
        })
    }

    /// Upload the files queued for created or updated objects.
    pub(super) fn flush_uploads(&mut self, container: &Container) -> SyncResult<()> {
        for pending in std::mem::take(&mut self.pending_uploads) {
            for file in &pending.files {
                let path = container.attachment_path(pending.class, pending.source, file);
                self.upload_file(pending.class, pending.target, &path, file)?;
            }
        }
        Ok(())
    }

    /// Upload a runner output file to the run, named after the execution.
    pub(super) fn upload_result_file(
        &mut self,
        run: TargetId,
        execution: TargetId,
        path: &Path,
    ) -> SyncResult<()> {
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = format!("testexecution_{}_{}", execution, base);
        self.upload_file(TcmsClass::TestRun, run, path, &name)
    }
}

/// Whether a file name matches any of the patterns.
pub fn matches_any(patterns: &[Regex], name: &str) -> bool {
    patterns.iter().any(|p| p.is_match(name))
}

/// Download the attachments of a TCMS object whose names match `patterns`
/// into `<dest_root>/attachments/<class dir>/<id>/`.
pub fn download_attachments(
    gateway: &dyn TcmsGateway,
    class: TcmsClass,
    id: ObjectId,
    patterns: &[Regex],
    dest_root: &Path,
) -> SyncResult<Vec<PathBuf>> {
    if !class.supports_attachments() {
        return Err(SyncError::AttachmentsNotSupported { class });
    }
    let dir = dest_root
        .join("attachments")
        .join(class.attachment_dir())
        .join(id.to_string());
    let mut written = Vec::new();
    for info in gateway.list_attachments(class, id)? {
        if !matches_any(patterns, &info.name) {
            continue;
        }
        let bytes = gateway
            .download_attachment(class, id, &info.name)
            .map_err(|e| SyncError::AttachmentTransfer {
                file: info.name.clone(),
                message: e.to_string(),
            })?;
        let path = dir.join(&info.name);
        std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(&path, bytes))
            .map_err(|e| SyncError::AttachmentTransfer {
                file: info.name.clone(),
                message: e.to_string(),
            })?;
        tracing::debug!(%class, id, file = %info.name, "attachment downloaded");
        written.push(path);
    }
    Ok(written)
}
