//! Offline firmware container unpacker.
//!
//! Unpacking happens in two steps. [`plan`] inspects a container held in
//! memory and produces an [`UnpackPlan`]: header metadata, the files to
//! extract as slices of the input, and the anomalies that were skipped.
//! [`UnpackPlan::extract`] then writes the files below an output directory.
//! Nothing here touches a device.

mod image;
mod rkfw;

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::error::FormatError;

/// Result of unpacking one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Extraction finished but some entries were skipped or looked wrong.
    Warning(String),
    /// Nothing usable could be extracted.
    Fatal(String),
}

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("invalid signature")]
    UnknownMagic,
    #[error("cannot find embedded RKAF update.img")]
    MissingRkaf,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<&UnpackError> for Outcome {
    fn from(err: &UnpackError) -> Self {
        Outcome::Fatal(err.to_string())
    }
}

/// Container formats recognized by their leading magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `RKFW` firmware wrapping an optional `BOOT` blob and an `RKAF` archive.
    Firmware,
    /// `KRNL` kernel image.
    Kernel,
    /// `LOADER  ` second-stage loader image.
    Loader,
    /// `RSCE` resource image.
    Resource,
}

impl ContainerKind {
    pub fn detect(buf: &[u8]) -> Option<Self> {
        if buf.starts_with(b"RKFW") {
            Some(ContainerKind::Firmware)
        } else if buf.starts_with(b"KRNL") {
            Some(ContainerKind::Kernel)
        } else if buf.starts_with(b"LOADER  ") {
            Some(ContainerKind::Loader)
        } else if buf.starts_with(b"RSCE") {
            Some(ContainerKind::Resource)
        } else {
            None
        }
    }

    /// Output name used for single-payload images when none is given.
    pub fn default_output(self) -> Option<&'static str> {
        match self {
            ContainerKind::Kernel => Some("kernel.img"),
            ContainerKind::Loader => Some("loader.bin"),
            ContainerKind::Firmware | ContainerKind::Resource => None,
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Firmware => write!(f, "RKFW"),
            ContainerKind::Kernel => write!(f, "KRNL"),
            ContainerKind::Loader => write!(f, "LOADER"),
            ContainerKind::Resource => write!(f, "RSCE"),
        }
    }
}

/// One file to write, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile<'a> {
    pub path: String,
    pub data: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct UnpackPlan<'a> {
    pub kind: ContainerKind,
    /// Header fields in display order.
    pub metadata: Vec<(&'static str, String)>,
    pub files: Vec<PlannedFile<'a>>,
    pub warnings: Vec<String>,
}

impl<'a> UnpackPlan<'a> {
    fn new(kind: ContainerKind) -> Self {
        info!("{} signature detected", kind);
        Self {
            kind,
            metadata: Vec::new(),
            files: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn meta(&mut self, key: &'static str, value: String) {
        info!("{}: {}", key, value);
        self.metadata.push((key, value));
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    /// Queue `data` for `path`, refusing paths that would escape the
    /// output directory.
    fn add(&mut self, path: &str, data: &'a [u8]) {
        if !is_safe_path(path) {
            self.warn(format!("{}: unsafe path, skipping", path));
            return;
        }
        self.files.push(PlannedFile {
            path: path.to_string(),
            data,
        });
    }

    /// Name chosen by the caller for a single-image payload. Used as given:
    /// absolute paths and `..` are allowed, relative ones land below the
    /// output directory.
    fn add_output(&mut self, path: &str, data: &'a [u8]) {
        self.files.push(PlannedFile {
            path: path.to_string(),
            data,
        });
    }

    /// Warnings that left nothing to extract are fatal.
    pub fn outcome(&self) -> Outcome {
        if self.warnings.is_empty() {
            Outcome::Ok
        } else if self.files.is_empty() {
            Outcome::Fatal(format!("nothing extracted: {}", self.warnings.join("; ")))
        } else {
            Outcome::Warning(self.warnings.join("; "))
        }
    }

    /// Write every planned file below `dir`, creating directories implied
    /// by `/` in the paths. Returns the number of files written.
    pub fn extract(&self, dir: &Path) -> Result<usize, UnpackError> {
        for file in &self.files {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|source| UnpackError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&target, file.data).map_err(|source| UnpackError::Io {
                path: target.clone(),
                source,
            })?;
            info!("writing {} ({} bytes)", file.path, file.data.len());
        }
        Ok(self.files.len())
    }
}

/// Relative, non-empty, and free of `..` or root components.
pub fn is_safe_path(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// NUL-terminated string from a fixed-size field.
pub(crate) fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Bytes `[start, start + len)` of `buf`, if entirely present.
pub(crate) fn window(buf: &[u8], start: usize, len: usize) -> Option<&[u8]> {
    buf.get(start..start.checked_add(len)?)
}

/// Build the extraction plan for a container held in memory.
///
/// `output` names the payload of single-image containers (`KRNL`,
/// `LOADER`); other formats carry their own file names.
pub fn plan<'a>(buf: &'a [u8], output: Option<&str>) -> Result<UnpackPlan<'a>, UnpackError> {
    let kind = ContainerKind::detect(buf).ok_or(UnpackError::UnknownMagic)?;
    let output = output.or(kind.default_output()).unwrap_or_default();
    match kind {
        ContainerKind::Firmware => rkfw::plan_firmware(buf),
        ContainerKind::Kernel => image::plan_kernel(buf, output),
        ContainerKind::Loader => image::plan_loader(buf, output),
        ContainerKind::Resource => image::plan_resource(buf),
    }
}

/// Unpack the container at `input` into `out_dir`. Containers whose kind
/// is not in `accept` are rejected as having an invalid signature.
pub fn unpack_file(
    input: &Path,
    out_dir: &Path,
    output: Option<&str>,
    accept: &[ContainerKind],
) -> Outcome {
    info!("Try to unpack {}", input.display());
    let buf = match fs::read(input) {
        Ok(buf) => buf,
        Err(source) => {
            return Outcome::from(&UnpackError::Io {
                path: input.to_path_buf(),
                source,
            });
        }
    };
    if !ContainerKind::detect(&buf).is_some_and(|kind| accept.contains(&kind)) {
        return Outcome::from(&UnpackError::UnknownMagic);
    }

    let result = plan(&buf, output).and_then(|plan| {
        plan.extract(out_dir)?;
        Ok(plan.outcome())
    });
    match result {
        Ok(outcome) => outcome,
        Err(err) => Outcome::from(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(ContainerKind::detect(b"RKFW...."), Some(ContainerKind::Firmware));
        assert_eq!(ContainerKind::detect(b"LOADER  x"), Some(ContainerKind::Loader));
        assert_eq!(ContainerKind::detect(b"LOADER"), None);
        assert_eq!(ContainerKind::detect(b"MZ"), None);
    }

    #[test]
    fn test_unknown_magic_is_fatal() {
        let err = plan(b"NOPE-NOT-A-CONTAINER", None).unwrap_err();
        assert!(matches!(err, UnpackError::UnknownMagic));
        assert!(matches!(Outcome::from(&err), Outcome::Fatal(_)));
    }

    #[test]
    fn test_safe_paths() {
        assert!(is_safe_path("boot.img"));
        assert!(is_safe_path("Image/kernel.img"));
        assert!(!is_safe_path(""));
        assert!(!is_safe_path("/etc/passwd"));
        assert!(!is_safe_path("../escape"));
        assert!(!is_safe_path("Image/../../escape"));
    }

    #[test]
    fn test_extract_creates_directories() {
        let dir = std::env::temp_dir().join(format!(
            "rkflash-unpack-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        let mut plan = UnpackPlan::new(ContainerKind::Resource);
        plan.add("a/b/c.bin", b"hello");
        plan.add("top.bin", b"x");

        assert_eq!(plan.extract(&dir).unwrap(), 2);
        assert_eq!(fs::read(dir.join("a/b/c.bin")).unwrap(), b"hello");
        assert_eq!(fs::read(dir.join("top.bin")).unwrap(), b"x");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_warnings_without_files_are_fatal() {
        let mut plan = UnpackPlan::new(ContainerKind::Resource);
        plan.add("../escape.bin", b"x");
        assert!(matches!(plan.outcome(), Outcome::Fatal(_)));

        plan.add("kept.bin", b"y");
        assert!(matches!(plan.outcome(), Outcome::Warning(_)));
    }

    #[test]
    fn test_unpack_missing_file_is_fatal() {
        let outcome = unpack_file(
            Path::new("/nonexistent/rkflash/input.img"),
            &std::env::temp_dir(),
            None,
            &[ContainerKind::Firmware],
        );
        assert!(matches!(outcome, Outcome::Fatal(_)));
    }

    #[test]
    fn test_unpack_file_kernel() {
        let dir = std::env::temp_dir().join(format!(
            "rkflash-krnl-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        ));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("kernel.krnl");
        fs::write(&input, b"KRNL\x04\0\0\0body\0\0\0\0").unwrap();

        // A firmware-only request refuses the kernel image.
        let refused = unpack_file(&input, &dir, None, &[ContainerKind::Firmware]);
        assert!(matches!(refused, Outcome::Fatal(_)));

        let outcome = unpack_file(&input, &dir, Some("zImage"), &[ContainerKind::Kernel]);
        assert_eq!(outcome, Outcome::Ok);
        assert_eq!(fs::read(dir.join("zImage")).unwrap(), b"body");
        fs::remove_dir_all(&dir).unwrap();
    }
}
