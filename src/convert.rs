//! Post-download processing: nested extraction, platform-aware format
//! conversion and relocation into ROM storage.
//!
//! Disc-based platforms get their cue/bin/img/ecm/ccd sets converted to a
//! single CHD per disc; everything else passes through with file-name
//! normalization. The converter reports its current sub-step through the
//! injected reporter so a polling UI can display it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::extract::{self, descend_single_dir, is_archive_name, ExtractError};
use crate::job::{GameDescriptor, OperationReporter};
use crate::platforms;
use crate::process::{find_tool, ProcessError, ProcessRunner};

/// Depth guard for nested archive descent. Release dumps wrap payloads in
/// a folder or an inner archive, occasionally both; anything deeper than
/// this is a malformed or malicious archive.
const MAX_SCAN_DEPTH: usize = 8;

/// Files carried by release archives that are never payload.
const IGNORED_EXTENSIONS: &[&str] = &["nfo", "html", "htm"];

/// Trailing dotted extension groups, e.g. the `.img.ecm` in `Game.img.ecm`.
static TRAILING_EXTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:\.[A-Za-z0-9]{1,4})+$").unwrap());

/// `FILE "<name>"` entries inside a cue sheet.
static CUE_FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"FILE\s+"([^"]+)""#).unwrap());

/// Conversion errors
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("nested archives exceed maximum depth of {0}")]
    TooDeeplyNested(usize),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("{tool} failed: {stderr}")]
    Tool { tool: String, stderr: String },

    #[error("conversion cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for ConvertError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled => ConvertError::Cancelled,
            ProcessError::NonZero {
                tool,
                stdout,
                stderr,
                ..
            } => ConvertError::Tool {
                tool,
                stderr: if stderr.trim().is_empty() { stdout } else { stderr },
            },
            other => ConvertError::Tool {
                tool: "subprocess".to_string(),
                stderr: other.to_string(),
            },
        }
    }
}

/// Transforms one job's extracted payload into installed ROM files.
pub struct Converter<'a> {
    game: &'a GameDescriptor,
    rom_dir: PathBuf,
    tools_dir: Option<PathBuf>,
    rename_single_output: bool,
    runner: &'a dyn ProcessRunner,
    reporter: &'a dyn OperationReporter,
    token: &'a CancellationToken,
}

impl<'a> Converter<'a> {
    pub fn new(
        game: &'a GameDescriptor,
        config: &PipelineConfig,
        runner: &'a dyn ProcessRunner,
        reporter: &'a dyn OperationReporter,
        token: &'a CancellationToken,
    ) -> Self {
        Self {
            game,
            rom_dir: config.platform_rom_dir(&game.platform_id),
            tools_dir: config.tools_dir.clone(),
            rename_single_output: config.rename_single_output,
            runner,
            reporter,
            token,
        }
    }

    /// Process everything under `download_dir` and move the results into
    /// the platform's ROM storage. Returns the installed file names for
    /// the scraping stage.
    pub async fn relocate(&self, download_dir: &Path) -> Result<Vec<String>, ConvertError> {
        let (files_path, files) = self.scan_folder(download_dir).await?;

        let valid: Vec<String> = files.into_iter().filter(|f| !is_ignored(f)).collect();
        let output = files_path.join("output");
        std::fs::create_dir_all(&output)?;

        let mut candidates = if platforms::needs_disc_image(&self.game.platform_id) {
            self.convert_to_chd(&files_path, &output, &valid).await?
        } else {
            Vec::new()
        };
        if candidates.is_empty() {
            candidates = self.stage_passthrough(&files_path, &output, &valid)?;
        }

        self.check_cancelled()?;
        self.reporter.set_operation("Moving to ROM directory");
        self.move_output(&output)?;

        let unique: BTreeSet<String> = candidates.into_iter().collect();
        Ok(unique.into_iter().collect())
    }

    /// Walk into single-subfolder wrapping and nested archives until the
    /// real payload is found, bounded by the depth guard.
    async fn scan_folder(&self, start: &Path) -> Result<(PathBuf, Vec<String>), ConvertError> {
        let mut dir = start.to_path_buf();

        for _ in 0..MAX_SCAN_DEPTH {
            self.check_cancelled()?;
            dir = descend_single_dir(&dir)?;

            let names = list_file_names(&dir)?;
            let archives: Vec<String> = names
                .iter()
                .filter(|n| is_archive_name(n))
                .cloned()
                .collect();

            if archives.is_empty() {
                return Ok((dir, names));
            }

            // Some platforms run archives directly; leave them untouched.
            if !self.game.is_extractable {
                return Ok((dir, archives));
            }

            let tmp = dir.join("tmp");
            std::fs::create_dir_all(&tmp)?;
            self.reporter.set_operation("Extracting archive");
            extract::extract(
                &dir.join(&archives[0]),
                &tmp,
                self.runner,
                self.tools_dir.as_deref(),
                self.token,
            )
            .await?;
            dir = tmp;
        }

        Err(ConvertError::TooDeeplyNested(MAX_SCAN_DEPTH))
    }

    /// Disc-image branch: normalize sibling track files, then compress
    /// every cue/gdi sheet into a CHD. An empty result means the caller
    /// should fall back to generic passthrough.
    async fn convert_to_chd(
        &self,
        files_path: &Path,
        output: &Path,
        files: &[String],
    ) -> Result<Vec<String>, ConvertError> {
        let Some(chdman) = find_tool(self.tools_dir.as_deref(), "chdman") else {
            debug!("chdman not available, skipping disc conversion");
            return Ok(Vec::new());
        };

        for file in files.iter().filter(|f| has_ext(f, "ccd")) {
            let tool = self.require_tool("ccd2cue")?;
            let cue = files_path.join(format!("{}.cue", clean_stem(file)));
            let args = vec![
                files_path.join(file).display().to_string(),
                "-o".to_string(),
                cue.display().to_string(),
            ];
            self.run_tool(&tool, args, "Converting to CUE").await?;
        }

        for file in files.iter().filter(|f| has_ext(f, "ecm")) {
            let tool = self.require_tool("ecm2bin")?;
            let bin = files_path.join(format!("{}.bin", clean_stem(file)));
            let args = vec![
                files_path.join(file).display().to_string(),
                bin.display().to_string(),
            ];
            self.run_tool(&tool, args, "Converting to BIN").await?;
        }

        for file in files.iter().filter(|f| has_ext(f, "img")) {
            let bin = files_path.join(format!("{}.bin", clean_stem(file)));
            std::fs::copy(files_path.join(file), bin)?;
        }

        // Pick up both original cue sheets and ones produced above.
        let sheets: Vec<String> = list_file_names(files_path)?
            .into_iter()
            .filter(|f| has_ext(f, "cue") || has_ext(f, "gdi"))
            .collect();

        for sheet in sheets.iter().filter(|f| has_ext(f, "cue")) {
            rewrite_cue(&files_path.join(sheet))?;
        }

        let mut produced = Vec::new();
        for sheet in &sheets {
            let chd_name = format!("{}.chd", clean_stem(sheet));
            let args = vec![
                "createcd".to_string(),
                "-i".to_string(),
                files_path.join(sheet).display().to_string(),
                "-o".to_string(),
                output.join(&chd_name).display().to_string(),
                "-c".to_string(),
                "zlib".to_string(),
            ];
            self.run_tool(&chdman, args, "Converting to CHD").await?;
            if output.join(&chd_name).is_file() {
                info!("Converted {} to {}", sheet, chd_name);
                produced.push(chd_name);
            }
        }

        Ok(produced)
    }

    /// Generic branch: normalize each file's stem and stage it for the
    /// final move.
    fn stage_passthrough(
        &self,
        files_path: &Path,
        output: &Path,
        files: &[String],
    ) -> Result<Vec<String>, ConvertError> {
        // The disc fallback path can hand us names consumed by partial
        // conversion; only stage what is still on disk.
        let existing: Vec<&String> = files
            .iter()
            .filter(|f| files_path.join(f.as_str()).is_file())
            .collect();
        let single = existing.len() == 1;

        let mut staged = Vec::new();
        for file in existing {
            let mut stem = clean_stem(file);
            if single && self.rename_single_output && self.game.can_be_renamed {
                stem = Path::new(&self.game.name)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| self.game.name.clone());
            }
            let dest_name = match Path::new(file).extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{stem}.{ext}"),
                None => stem,
            };
            move_file(&files_path.join(file), &output.join(&dest_name))?;
            staged.push(dest_name);
        }
        Ok(staged)
    }

    /// Final move of staged files into the platform ROM directory. A
    /// failure mid-move removes what was already placed; partial installs
    /// must not persist.
    fn move_output(&self, output: &Path) -> Result<(), ConvertError> {
        let names = list_file_names(output)?;
        if names.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.rom_dir)?;
        let mut moved = Vec::new();
        for name in names {
            let dest = self.rom_dir.join(&name);
            if let Err(e) = move_file(&output.join(&name), &dest) {
                for placed in &moved {
                    let _ = std::fs::remove_file(placed);
                }
                return Err(e.into());
            }
            moved.push(dest);
        }
        Ok(())
    }

    async fn run_tool(
        &self,
        program: &Path,
        args: Vec<String>,
        operation: &str,
    ) -> Result<(), ConvertError> {
        self.check_cancelled()?;
        self.reporter.set_operation(operation);
        debug!("{}: {} {:?}", operation, program.display(), args);
        self.runner.run(program, &args, self.token).await?;
        Ok(())
    }

    fn require_tool(&self, name: &'static str) -> Result<PathBuf, ConvertError> {
        find_tool(self.tools_dir.as_deref(), name).ok_or(ConvertError::Tool {
            tool: name.to_string(),
            stderr: "tool not found".to_string(),
        })
    }

    fn check_cancelled(&self) -> Result<(), ConvertError> {
        if self.token.is_cancelled() {
            return Err(ConvertError::Cancelled);
        }
        Ok(())
    }
}

/// Strip every trailing dotted extension group from a file name, handling
/// chained extensions like `.img.ecm`.
pub(crate) fn clean_stem(name: &str) -> String {
    let stripped = TRAILING_EXTS_RE.replace(name, "");
    if stripped.is_empty() {
        name.to_string()
    } else {
        stripped.into_owned()
    }
}

fn has_ext(name: &str, ext: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn is_ignored(name: &str) -> bool {
    IGNORED_EXTENSIONS.iter().any(|ext| has_ext(name, ext))
}

fn list_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Point cue-sheet FILE entries at their renamed `.bin` siblings.
fn rewrite_cue(path: &Path) -> std::io::Result<()> {
    let text = std::fs::read_to_string(path)?;
    let dir = path.parent().unwrap_or(Path::new("."));

    let rewritten = CUE_FILE_RE.replace_all(&text, |caps: &regex::Captures<'_>| {
        let referenced = &caps[1];
        let renamed = format!("{}.bin", clean_stem(referenced));
        if renamed != referenced && dir.join(&renamed).is_file() {
            format!("FILE \"{renamed}\"")
        } else {
            caps[0].to_string()
        }
    });

    if rewritten != text {
        std::fs::write(path, rewritten.as_bytes())?;
    }
    Ok(())
}

/// Rename with copy+delete fallback for cross-filesystem moves (download
/// scratch and ROM storage often live on different mounts).
fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)?;
    std::fs::remove_file(src)
}
