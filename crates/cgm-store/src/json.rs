use std::fs;
use std::path::PathBuf;

use cgm_core::persist::{ArtifactNaming, prepare};
use cgm_core::{
    Artifact, BatchPersister, Diagnostic, PersistenceError, SharedSink, TimestampedRecord,
};

/// Writes each artifact as `<root>/<name>`.
///
/// The file holds a single JSON array followed by a newline. It is written to
/// a hidden temporary file first and renamed into place, so a reader never
/// sees a partial artifact. An existing artifact of the same name is replaced.
#[derive(Clone)]
pub struct JsonDirectoryPersister {
    root: PathBuf,
    naming: ArtifactNaming,
    sink: Option<SharedSink>,
}

impl JsonDirectoryPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            naming: ArtifactNaming::default(),
            sink: None,
        }
    }

    #[must_use]
    pub fn with_naming(mut self, naming: ArtifactNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Reports each stored file to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Path an artifact with `name` is written to.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl BatchPersister for JsonDirectoryPersister {
    fn persist<R: TimestampedRecord>(
        &self,
        batches: &[Vec<R>],
    ) -> Result<Artifact, PersistenceError> {
        let prepared = prepare(batches, &self.naming)?;
        let mut bytes = prepared.to_json()?;
        bytes.push(b'\n');

        fs::create_dir_all(&self.root).map_err(|source| PersistenceError::Io {
            path: self.root.clone(),
            source,
        })?;

        let target = self.artifact_path(&prepared.artifact.name);
        let staging = self.root.join(format!(".{}.tmp", prepared.artifact.name));
        fs::write(&staging, &bytes).map_err(|source| PersistenceError::Io {
            path: staging.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&staging, &target) {
            let _ = fs::remove_file(&staging);
            return Err(PersistenceError::Io {
                path: target,
                source,
            });
        }

        if let Some(sink) = &self.sink {
            sink.report(&Diagnostic::ArtifactStored {
                name: &prepared.artifact.name,
                location: &self.root.display(),
                bytes: bytes.len(),
            });
        }
        Ok(prepared.artifact)
    }
}
