use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::models::UploadedFile;
use crate::pipeline::Pipeline;
use crate::progress::LoadProgressReporter;

/// Read a local file as an upload named after its final path component.
pub fn read_upload(path: &Path) -> Result<UploadedFile> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("not a file path: {}", path.display()))?
        .to_string();
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(UploadedFile::new(filename, bytes))
}

/// Load a document into the cache (and archive) and print the counts.
pub async fn run_embed(
    config: &Config,
    namespace: &str,
    path: &Path,
    progress: &dyn LoadProgressReporter,
) -> Result<()> {
    let file = read_upload(path)?;
    let pipeline = Arc::new(Pipeline::from_config(config.clone())?);
    let doc = pipeline.load_document(namespace, &file, progress).await?;

    println!("embed {}", doc.stats.filename);
    println!("  cache dir: {}", doc.dir.path().display());
    println!("  chunks: {}", doc.stats.chunks);
    println!("  embedded: {}", doc.stats.embedded);
    println!("  cached: {}", doc.stats.cached);
    if config.archive.is_enabled() {
        let status = if doc.stats.archived { "ok" } else { "failed" };
        println!("  archived: {}", status);
    }

    doc.retriever.embedder().cache().close().await;
    Ok(())
}
