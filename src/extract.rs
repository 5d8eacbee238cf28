//! Archive extraction.
//!
//! ZIP archives extract natively with the `zip` crate; 7z and RAR go
//! through the 7z binary via the process runner. Archives are consumed:
//! the source file is deleted once its contents are on disk.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process::{find_7z, ProcessError, ProcessRunner};

/// Supported archive container families, dispatched by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    SevenZ,
    Rar,
}

impl ArchiveKind {
    /// Detect the archive kind from the file extension (case-insensitive).
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "zip" => Some(ArchiveKind::Zip),
            "7z" => Some(ArchiveKind::SevenZ),
            "rar" => Some(ArchiveKind::Rar),
            _ => None,
        }
    }
}

/// Whether a file name looks like an archive the pipeline can unpack.
pub fn is_archive_name(name: &str) -> bool {
    ArchiveKind::from_path(Path::new(name)).is_some()
}

/// Extraction errors
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("archive not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("extraction failed: {stderr}")]
    ToolFailure { stdout: String, stderr: String },

    #[error("extraction cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for ExtractError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => ExtractError::Cancelled,
            ProcessError::NonZero { stdout, stderr, .. } => {
                ExtractError::ToolFailure { stdout, stderr }
            }
            other => ExtractError::ToolFailure {
                stdout: String::new(),
                stderr: other.to_string(),
            },
        }
    }
}

/// Unpack `archive` into `dest`, creating `dest` if absent.
///
/// On success the source archive is deleted; the pipeline treats archives
/// as consumed once extracted.
pub async fn extract(
    archive: &Path,
    dest: &Path,
    runner: &dyn ProcessRunner,
    tools_dir: Option<&Path>,
    token: &CancellationToken,
) -> Result<(), ExtractError> {
    if !archive.exists() {
        return Err(ExtractError::NotFound(archive.to_path_buf()));
    }

    let kind = ArchiveKind::from_path(archive)
        .ok_or_else(|| ExtractError::UnsupportedFormat(archive.to_path_buf()))?;

    if token.is_cancelled() {
        return Err(ExtractError::Cancelled);
    }

    std::fs::create_dir_all(dest)?;

    debug!("Extracting {} to {}", archive.display(), dest.display());

    match kind {
        ArchiveKind::Zip => {
            let archive_path = archive.to_path_buf();
            let dest_path = dest.to_path_buf();
            tokio::task::spawn_blocking(move || extract_zip(&archive_path, &dest_path))
                .await
                .map_err(std::io::Error::other)??;
        }
        ArchiveKind::SevenZ | ArchiveKind::Rar => {
            let tool = find_7z(tools_dir).ok_or_else(|| ExtractError::ToolFailure {
                stdout: String::new(),
                stderr: "7z binary not found (install p7zip or set the tools directory)"
                    .to_string(),
            })?;
            let args = vec![
                "x".to_string(),
                archive.display().to_string(),
                format!("-o{}", dest.display()),
                "-y".to_string(),
            ];
            runner.run(&tool, &args, token).await?;
        }
    }

    std::fs::remove_file(archive)?;
    info!("Extracted {}", archive.display());
    Ok(())
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<(), ExtractError> {
    let file = File::open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(zip_failure)?;
    zip.extract(dest).map_err(zip_failure)?;
    Ok(())
}

fn zip_failure(err: zip::result::ZipError) -> ExtractError {
    ExtractError::ToolFailure {
        stdout: String::new(),
        stderr: err.to_string(),
    }
}

/// Resolve single-subfolder wrapping: if `dir` contains exactly one entry
/// and it is a directory, return that inner directory. Descends one level
/// per call.
pub fn descend_single_dir(dir: &Path) -> std::io::Result<PathBuf> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries[0].path());
    }
    Ok(dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_support::FakeRunner;
    use crate::process::ToolOutput;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_archive_kind_case_insensitive() {
        assert_eq!(
            ArchiveKind::from_path(Path::new("Game.ZIP")),
            Some(ArchiveKind::Zip)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("game.7z")),
            Some(ArchiveKind::SevenZ)
        );
        assert_eq!(
            ArchiveKind::from_path(Path::new("game.RaR")),
            Some(ArchiveKind::Rar)
        );
        assert_eq!(ArchiveKind::from_path(Path::new("game.sfc")), None);
    }

    #[tokio::test]
    async fn test_extract_zip_roundtrip() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("game.zip");
        write_zip(
            &archive,
            &[
                ("Game (U).sfc", b"rom-bytes".as_slice()),
                ("manual/readme.txt", b"hi".as_slice()),
            ],
        );

        let dest = temp.path().join("out");
        let runner = FakeRunner::ok();
        let token = CancellationToken::new();
        extract(&archive, &dest, &runner, None, &token)
            .await
            .unwrap();

        assert!(dest.join("Game (U).sfc").is_file());
        assert!(dest.join("manual/readme.txt").is_file());
        // Source archive is consumed.
        assert!(!archive.exists());
        // Native path never touches the runner.
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extract_missing_archive() {
        let temp = TempDir::new().unwrap();
        let runner = FakeRunner::ok();
        let token = CancellationToken::new();
        let err = extract(
            &temp.path().join("nope.zip"),
            &temp.path().join("out"),
            &runner,
            None,
            &token,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExtractError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_extract_unsupported_format() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("game.tar");
        std::fs::write(&file, b"not an archive").unwrap();

        let runner = FakeRunner::ok();
        let token = CancellationToken::new();
        let err = extract(&file, &temp.path().join("out"), &runner, None, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_extract_rar_uses_7z_binary() {
        let temp = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        std::fs::write(tools.path().join("7zz"), b"").unwrap();

        let archive = temp.path().join("game.rar");
        std::fs::write(&archive, b"rar-bytes").unwrap();
        let dest = temp.path().join("out");

        let runner = FakeRunner::new(|_, _| Ok(ToolOutput::default()));
        let token = CancellationToken::new();
        extract(&archive, &dest, &runner, Some(tools.path()), &token)
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.ends_with("7zz"));
        assert_eq!(calls[0].1[0], "x");
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_extract_tool_failure_carries_output() {
        let temp = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        std::fs::write(tools.path().join("7zz"), b"").unwrap();

        let archive = temp.path().join("game.7z");
        std::fs::write(&archive, b"7z-bytes").unwrap();

        let runner = FakeRunner::new(|program, _| {
            Err(ProcessError::NonZero {
                tool: program.display().to_string(),
                code: Some(2),
                stdout: "listing".to_string(),
                stderr: "corrupt header".to_string(),
            })
        });
        let token = CancellationToken::new();
        let err = extract(
            &archive,
            &temp.path().join("out"),
            &runner,
            Some(tools.path()),
            &token,
        )
        .await
        .unwrap_err();

        match err {
            ExtractError::ToolFailure { stdout, stderr } => {
                assert_eq!(stdout, "listing");
                assert_eq!(stderr, "corrupt header");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Failed extraction must not consume the archive.
        assert!(archive.exists());
    }

    #[test]
    fn test_descend_single_dir() {
        let temp = TempDir::new().unwrap();
        let wrapped = temp.path().join("wrapper");
        std::fs::create_dir_all(wrapped.join("inner")).unwrap();

        // Only entry is a directory: descend.
        assert_eq!(
            descend_single_dir(&wrapped).unwrap(),
            wrapped.join("inner")
        );

        // A sibling file stops the descent.
        std::fs::write(wrapped.join("file.txt"), b"x").unwrap();
        assert_eq!(descend_single_dir(&wrapped).unwrap(), wrapped);
    }
}
