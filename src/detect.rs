use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::codec::ArchiveCodec;

/// Decides from an entry script's text whether it is an injected wrapper.
pub trait Signature: Send + Sync {
    fn matches(&self, script: &str) -> bool;
}

/// Matches when any of the marker substrings occurs in the script.
pub struct MarkerSignature {
    markers: Vec<String>,
}

impl MarkerSignature {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }
}

impl Signature for MarkerSignature {
    fn matches(&self, script: &str) -> bool {
        self.markers.iter().any(|m| script.contains(m.as_str()))
    }
}

pub struct PatchDetector<'a> {
    codec: &'a dyn ArchiveCodec,
    entry_script: PathBuf,
    signature: Box<dyn Signature>,
}

impl<'a> PatchDetector<'a> {
    pub fn new(
        codec: &'a dyn ArchiveCodec,
        entry_script: PathBuf,
        signature: Box<dyn Signature>,
    ) -> Self {
        Self {
            codec,
            entry_script,
            signature,
        }
    }

    /// Whether `archive`'s entry script carries an injection marker.
    ///
    /// Any failure to extract or read the script counts as "not patched".
    pub async fn is_patched(&self, archive: &Path) -> bool {
        let scratch = match tempfile::Builder::new().prefix("adpatch-detect-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "could not create detection directory; assuming unpatched");
                return false;
            }
        };

        let patched = match self.codec.extract(archive, scratch.path()).await {
            Ok(()) => {
                let script = scratch.path().join(&self.entry_script);
                match fs::read(&script) {
                    Ok(bytes) => self.signature.matches(&String::from_utf8_lossy(&bytes)),
                    Err(e) => {
                        debug!(path = %script.display(), error = %e, "entry script unreadable; assuming unpatched");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %format!("{e:#}"), "could not inspect archive; assuming unpatched");
                false
            }
        };

        if let Err(e) = scratch.close() {
            warn!(error = %e, "failed to remove detection directory");
        }
        patched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asar;
    use crate::codec::NativeCodec;
    use crate::wrapper;

    fn archive_with(temp: &Path, files: &[(&str, &[u8])]) -> PathBuf {
        let src = temp.join("src");
        for (rel, content) in files {
            let full = src.join(rel);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        fs::create_dir_all(&src).unwrap();
        let archive = temp.join("app.asar");
        asar::pack(&src, &archive).unwrap();
        archive
    }

    fn detector(codec: &NativeCodec) -> PatchDetector<'_> {
        PatchDetector::new(
            codec,
            PathBuf::from("build").join("main.js"),
            Box::new(MarkerSignature::new(wrapper::default_markers())),
        )
    }

    #[tokio::test]
    async fn test_marker_means_patched() {
        let temp = tempfile::tempdir().unwrap();
        let archive = archive_with(
            temp.path(),
            &[("build/main.js", b"process.env.ADPATCH_INJECTED = \"1\";")],
        );
        assert!(detector(&NativeCodec).is_patched(&archive).await);
    }

    #[tokio::test]
    async fn test_plain_script_is_not_patched() {
        let temp = tempfile::tempdir().unwrap();
        let archive = archive_with(temp.path(), &[("build/main.js", b"require('./app');")]);
        assert!(!detector(&NativeCodec).is_patched(&archive).await);
    }

    #[tokio::test]
    async fn test_missing_entry_script_is_not_patched() {
        let temp = tempfile::tempdir().unwrap();
        let archive = archive_with(temp.path(), &[("index.js", b"ADPATCH_INJECTED")]);
        assert!(!detector(&NativeCodec).is_patched(&archive).await);
    }

    #[tokio::test]
    async fn test_unreadable_archive_is_not_patched() {
        let temp = tempfile::tempdir().unwrap();
        assert!(!detector(&NativeCodec)
            .is_patched(&temp.path().join("absent.asar"))
            .await);
    }

    #[test]
    fn test_empty_markers_never_match() {
        let signature = MarkerSignature::new(vec![String::new()]);
        assert!(!signature.matches("anything"));
    }
}
