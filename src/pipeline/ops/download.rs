use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::pipeline::{Operation, OperationError, RunContext};

/// `download <path> <url>`: fetch a URL into the workspace.
pub struct Download;

#[async_trait]
impl Operation for Download {
    async fn execute(
        &mut self,
        ctx: &RunContext,
        _name: &str,
        args: &[String],
    ) -> Result<(), OperationError> {
        let [path, url, ..] = args else {
            return Err(OperationError::Usage("usage: download <path> <url>".into()));
        };
        let session = ctx.session();
        let target = workspace_target(ctx.workspace(), path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OperationError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }

        session.set_sub_status("Downloading...");
        tracing::info!(session = %session.id(), url = %url, path = %target.display(), "downloading");

        let mut response = reqwest::get(url.as_str()).await?.error_for_status()?;
        let total = response.content_length();
        let mut file = tokio::fs::File::create(&target)
            .await
            .map_err(|e| OperationError::io(format!("failed to create {}", target.display()), e))?;

        let mut loaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| OperationError::io(format!("failed to write {}", target.display()), e))?;
            loaded += chunk.len() as u64;
            session.set_sub_status(&progress(loaded, total));
        }
        file.flush()
            .await
            .map_err(|e| OperationError::io(format!("failed to write {}", target.display()), e))?;

        session.set_sub_status("");
        tracing::info!(session = %session.id(), bytes = loaded, "download complete");
        Ok(())
    }
}

/// Resolve a download target under `workspace`.
///
/// A leading `/` is taken relative to the workspace. `..` and drive prefixes
/// are refused, as is a path naming no file.
fn workspace_target(workspace: &Path, relpath: &str) -> Result<PathBuf, OperationError> {
    let mut target = workspace.to_path_buf();
    let mut named = false;
    for component in Path::new(relpath).components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                named = true;
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(OperationError::Usage(format!(
                    "download path must stay inside the workspace: {relpath}"
                )));
            }
        }
    }
    if !named {
        return Err(OperationError::Usage(format!(
            "download path names no file: {relpath:?}"
        )));
    }
    Ok(target)
}

fn progress(loaded: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("Downloading {} of {}", format_size(loaded), format_size(total)),
        None => format!("Downloading {}", format_size(loaded)),
    }
}

/// Human-readable byte count using binary units.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}
