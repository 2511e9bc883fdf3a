//! Staged extractions written by an out-of-band producer.
//!
//! A producer that already has a session's full context (for example the
//! session itself, at the end) can write `<type>/<identifier>.json` into
//! the staging directory, where `type:identifier` is the source id. The
//! batch run persists it instead of invoking the extraction capability,
//! then renames it to `<identifier>.json.spent` so it is never read again.
//!
//! Ids without a `type:` prefix stage at the top of the directory. Ids whose
//! parts could escape the directory are refused.

use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::models::Extraction;

const STAGED_EXT: &str = "json";
const SPENT_SUFFIX: &str = ".spent";

/// An extraction waiting in the staging directory.
#[derive(Debug)]
pub struct StagedExtraction {
    pub path: PathBuf,
    pub extraction: Extraction,
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Staging file for a source id.
    pub fn path_for(&self, source_id: &str) -> Result<PathBuf> {
        let file = match source_id.split_once(':') {
            Some((kind, identifier)) => {
                check_component(source_id, kind)?;
                check_component(source_id, identifier)?;
                Path::new(kind).join(format!("{}.{}", identifier, STAGED_EXT))
            }
            None => {
                check_component(source_id, source_id)?;
                PathBuf::from(format!("{}.{}", source_id, STAGED_EXT))
            }
        };
        Ok(self.dir.join(file))
    }

    /// Read the staged extraction for a source, if one exists.
    ///
    /// A file that exists but does not parse is an error rather than a miss,
    /// so a broken hand-off is not silently replaced by a fresh invocation.
    pub fn take(&self, source_id: &str) -> Result<Option<StagedExtraction>> {
        // nothing can have been staged under an id that has no staging path
        let Ok(path) = self.path_for(source_id) else {
            return Ok(None);
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let extraction: Extraction = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Staging(format!("{}: {}", path.display(), e))
        })?;

        Ok(Some(StagedExtraction { path, extraction }))
    }

    /// Write a staged extraction. Used by `garde store-extraction`.
    pub fn stage(&self, source_id: &str, extraction: &Extraction) -> Result<PathBuf> {
        let path = self.path_for(source_id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let partial = path.with_extension("json.partial");
        std::fs::write(&partial, serde_json::to_string_pretty(extraction)?)?;
        std::fs::rename(&partial, &path)?;
        Ok(path)
    }

    /// Retire a consumed file.
    pub fn mark_spent(&self, staged: &StagedExtraction) -> Result<PathBuf> {
        let mut spent = staged.path.clone().into_os_string();
        spent.push(SPENT_SUFFIX);
        let spent = PathBuf::from(spent);
        std::fs::rename(&staged.path, &spent)?;
        Ok(spent)
    }
}

/// One plain path component: no separators, no `..`, not absolute.
fn check_component(source_id: &str, part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == part
    );
    if !plain || part.contains(['/', '\\', '\0']) {
        return Err(PipelineError::Staging(format!(
            "source id {:?} cannot name a staging file",
            source_id
        )));
    }
    Ok(())
}
