//! Copy-on-write overlay images derived from a shared read-only base.
//!
//! Every guest gets its own qcow2 overlay so experiment writes never touch
//! the base image. Overlays live in the run's work directory and are
//! deleted when their host tears down.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::command_run::CommandRun;
use crate::errors::{Error, Result};

/// Subset of `qemu-img info --output=json` needed to judge a file.
#[derive(Debug, Deserialize)]
struct ImageInfo {
    format: String,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

/// One host's private copy-on-write disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayImage {
    path: Utf8PathBuf,
}

impl OverlayImage {
    /// Filesystem path of the overlay file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Creates and deletes per-host overlays of one base image.
///
/// The base path and destination directory are explicit constructor
/// arguments; nothing here reads process-global configuration.
#[derive(Debug, Clone)]
pub struct OverlayStore {
    base_image: Utf8PathBuf,
    directory: Utf8PathBuf,
}

impl OverlayStore {
    /// `base_image` must be a readable qcow2; `directory` receives the
    /// overlay files.
    pub fn new(base_image: impl Into<Utf8PathBuf>, directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_image: base_image.into(),
            directory: directory.into(),
        }
    }

    /// The configured base image.
    pub fn base_image(&self) -> &Utf8Path {
        &self.base_image
    }

    /// Destination path an overlay of this name would use.
    pub fn overlay_path(&self, overlay_name: &str) -> Utf8PathBuf {
        self.directory.join(format!("{overlay_name}.qcow2"))
    }

    /// Check that the base image exists and is readable. Run before any
    /// other resource is created so a bad image fails the run while it is
    /// still free to abort.
    pub fn verify_base(&self) -> Result<()> {
        if !self.base_image.exists() {
            return Err(Error::ImageCreation {
                path: self.base_image.clone(),
                reason: "base image not found".into(),
            });
        }
        if let Err(e) = std::fs::File::open(&self.base_image) {
            return Err(Error::ImageCreation {
                path: self.base_image.clone(),
                reason: format!("base image not readable: {e}"),
            });
        }
        Ok(())
    }

    /// Create an overlay for `overlay_name` (unique per host within a run).
    ///
    /// A pre-existing destination is replaced only when it provably is an
    /// orphaned overlay of the same base from a crashed earlier run;
    /// anything else fails rather than silently reusing unrelated data.
    pub fn create(&self, overlay_name: &str) -> Result<OverlayImage> {
        self.verify_base()?;

        let dest = self.overlay_path(overlay_name);
        if dest.exists() {
            match self.inspect(&dest) {
                Ok(info) if is_orphan_of(&info, &self.base_image) => {
                    warn!("replacing orphaned overlay {dest} from an earlier run");
                    std::fs::remove_file(&dest)?;
                }
                Ok(_) => {
                    return Err(Error::ImageCreation {
                        path: dest,
                        reason: "destination exists and is not an overlay of the configured base"
                            .into(),
                    });
                }
                Err(e) => {
                    return Err(Error::ImageCreation {
                        path: dest,
                        reason: format!("destination exists and could not be inspected: {e}"),
                    });
                }
            }
        }

        Command::new("qemu-img")
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(self.base_image.as_str())
            .arg(dest.as_str())
            .run()
            .map_err(|e| Error::ImageCreation {
                path: dest.clone(),
                reason: e.to_string(),
            })?;
        debug!("created overlay {dest} on {}", self.base_image);
        Ok(OverlayImage { path: dest })
    }

    fn inspect(&self, path: &Utf8Path) -> Result<ImageInfo> {
        Command::new("qemu-img")
            .args(["info", "--output=json"])
            .arg(path.as_str())
            .run_and_parse_json()
    }

    /// Remove the overlay file. A second destroy of the same overlay is a
    /// no-op, but it gets logged as an inconsistency.
    pub fn destroy(&self, overlay: &OverlayImage) -> Result<()> {
        match std::fs::remove_file(overlay.path()) {
            Ok(()) => {
                debug!("removed overlay {}", overlay.path());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("overlay {} was already gone", overlay.path());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Decide whether a pre-existing destination file may be replaced: it must
/// be a qcow2 whose backing file is exactly our base image.
fn is_orphan_of(info: &ImageInfo, base_image: &Utf8Path) -> bool {
    info.format == "qcow2" && info.backing_filename.as_deref() == Some(base_image.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(json: &str) -> ImageInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_overlay_path_naming() {
        let store = OverlayStore::new("/images/base.qcow2", "/tmp/run");
        assert_eq!(
            store.overlay_path("vk3fa2-h1"),
            Utf8PathBuf::from("/tmp/run/vk3fa2-h1.qcow2")
        );
    }

    #[test]
    fn test_orphan_same_base_is_adoptable() {
        let base = Utf8Path::new("/images/base.qcow2");
        let i = info(r#"{"format":"qcow2","backing-filename":"/images/base.qcow2"}"#);
        assert!(is_orphan_of(&i, base));
    }

    #[test]
    fn test_other_backing_file_is_refused() {
        let base = Utf8Path::new("/images/base.qcow2");
        let i = info(r#"{"format":"qcow2","backing-filename":"/images/other.qcow2"}"#);
        assert!(!is_orphan_of(&i, base));
    }

    #[test]
    fn test_non_overlay_is_refused() {
        let base = Utf8Path::new("/images/base.qcow2");
        let plain = info(r#"{"format":"qcow2"}"#);
        assert!(!is_orphan_of(&plain, base));
        let raw = info(r#"{"format":"raw"}"#);
        assert!(!is_orphan_of(&raw, base));
    }

    #[test]
    fn test_create_missing_base_fails() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let store = OverlayStore::new(dir_path.join("nonexistent.qcow2"), dir_path);
        let err = store.create("h1").unwrap_err();
        match err {
            Error::ImageCreation { reason, .. } => {
                assert!(reason.contains("base image not found"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_destroy_twice_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let path = dir_path.join("gone.qcow2");
        std::fs::write(&path, b"stub").unwrap();
        let store = OverlayStore::new(dir_path.join("base.qcow2"), dir_path);
        let overlay = OverlayImage { path };
        store.destroy(&overlay).unwrap();
        store.destroy(&overlay).unwrap();
    }
}
