//! # Document ingestion
//!
//! Uploaded documents are written to the staging directory and handed to an
//! external ingestion tool, which chunks them, embeds the chunks and writes
//! the `embeddings` table. The tool is run as `<program> <args..> <path>`;
//! a non-zero exit is reported with its combined stdout and stderr.
//!
//! Staged file names are reduced to their final path component, so an upload
//! named `../../etc/passwd` is written as `passwd` inside the staging
//! directory.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{error, info};

use crate::config::IngestConfig;
use crate::error::{RagError, Result};

/// The final path component of an uploaded file name, if it has a usable one.
pub fn staged_file_name(name: &str) -> Option<String> {
    // Browsers on Windows may send backslash-separated paths.
    let last = name.rsplit(['/', '\\']).next()?.trim();
    match last {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct Ingestor {
    upload_dir: PathBuf,
    program: String,
    args: Vec<String>,
}

impl Ingestor {
    pub fn new(upload_dir: impl Into<PathBuf>, config: &IngestConfig) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Write `data` to the staging directory under the sanitized `file_name`.
    pub async fn stage(&self, file_name: &str, data: &[u8]) -> Result<PathBuf> {
        let name = staged_file_name(file_name)
            .ok_or_else(|| RagError::Protocol(format!("unusable file name {file_name:?}")))?;
        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let path = self.upload_dir.join(name);
        tokio::fs::write(&path, data).await?;
        info!("Saved upload to {}", path.display());
        Ok(path)
    }

    /// Run the ingestion tool on a staged file and return its combined output.
    pub async fn ingest(&self, path: &Path) -> Result<String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RagError::Ingest {
                output: format!("failed to run {}: {e}", self.program),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            error!(status = %output.status, "Ingestion tool output: {}", combined.trim());
            return Err(RagError::Ingest { output: combined });
        }

        info!("Ingested {}", path.display());
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> IngestConfig {
        IngestConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "ingest-tool".into()],
        }
    }

    #[test]
    fn file_names_lose_their_directories() {
        assert_eq!(staged_file_name("report.pdf").as_deref(), Some("report.pdf"));
        assert_eq!(staged_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(
            staged_file_name("C:\\Users\\me\\notes.pdf").as_deref(),
            Some("notes.pdf")
        );
        assert_eq!(staged_file_name("dir/"), None);
        assert_eq!(staged_file_name(".."), None);
        assert_eq!(staged_file_name(""), None);
    }

    #[tokio::test]
    async fn stages_inside_the_upload_dir() {
        let dir = tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path().join("uploads"), &sh("true"));
        let path = ingestor.stage("../escape.pdf", b"%PDF-1.4").await.unwrap();
        assert_eq!(path, dir.path().join("uploads").join("escape.pdf"));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-1.4");
    }

    #[tokio::test]
    async fn passes_the_staged_path_to_the_tool() {
        let dir = tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), &sh(r#"echo "got $1""#));
        let path = ingestor.stage("a.pdf", b"x").await.unwrap();
        let output = ingestor.ingest(&path).await.unwrap();
        assert_eq!(output.trim(), format!("got {}", path.display()));
    }

    #[tokio::test]
    async fn failure_carries_combined_output() {
        let dir = tempdir().unwrap();
        let ingestor = Ingestor::new(dir.path(), &sh("echo parsing; echo 'bad xref' >&2; exit 1"));
        let path = ingestor.stage("a.pdf", b"x").await.unwrap();
        match ingestor.ingest(&path).await {
            Err(RagError::Ingest { output }) => {
                assert!(output.contains("parsing"));
                assert!(output.contains("bad xref"));
            }
            other => panic!("expected an ingest failure, got {other:?}"),
        }
    }
}
