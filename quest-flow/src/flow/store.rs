//! On-disk flow documents.
//!
//! A document is read in full, mutated in memory, and written back after every
//! successful per-node change. Writes go to a temp file in the same directory
//! which is then renamed over the target, so a crash never leaves a truncated
//! document behind. Each loaded document remembers the SHA-256 of the bytes it
//! was read from; saving over a file whose bytes have changed since fails with
//! [`StoreError::Modified`].

use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::flow::types::{FlowNode, StepNode};

/// SHA-256 of a document's bytes, hex encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentVersion(String);

impl DocumentVersion {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(digest.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

/// A flow loaded from disk
#[derive(Debug, Clone)]
pub struct FlowDocument {
    pub nodes: Vec<FlowNode>,
    version: Option<DocumentVersion>,
}

impl FlowDocument {
    /// Version of the bytes last read or written; `None` for a document that
    /// has never been on disk.
    pub fn version(&self) -> Option<&DocumentVersion> {
        self.version.as_ref()
    }

    pub fn steps(&self) -> impl Iterator<Item = &StepNode> {
        self.nodes.iter().filter_map(FlowNode::as_step)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps().map(|s| s.id.clone()).collect()
    }

    pub fn step(&self, id: &str) -> Option<&StepNode> {
        self.steps().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepNode> {
        self.nodes
            .iter_mut()
            .filter_map(FlowNode::as_step_mut)
            .find(|s| s.id == id)
    }
}

/// Load and save flow documents at one path
#[derive(Debug, Clone)]
pub struct FlowStore {
    path: PathBuf,
}

impl FlowStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<FlowDocument, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing(self.display()));
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.display(),
                    source,
                })
            }
        };

        let nodes: Vec<FlowNode> =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
                path: self.display(),
                source,
            })?;

        Ok(FlowDocument {
            nodes,
            version: Some(DocumentVersion::of(&bytes)),
        })
    }

    /// Write `nodes` as a new document, replacing whatever is at the path.
    /// Callers confirm the overwrite beforehand.
    pub fn create(&self, nodes: Vec<FlowNode>) -> Result<FlowDocument, StoreError> {
        let mut document = FlowDocument {
            nodes,
            version: None,
        };
        let bytes = self.render(&document)?;
        write_atomic(&self.path, &bytes)?;
        document.version = Some(DocumentVersion::of(&bytes));
        Ok(document)
    }

    /// Save `document` in place. Fails if the file changed on disk since the
    /// document was loaded or last saved.
    pub fn save(&self, document: &mut FlowDocument) -> Result<(), StoreError> {
        let on_disk = match std::fs::read(&self.path) {
            Ok(bytes) => Some(DocumentVersion::of(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.display(),
                    source,
                })
            }
        };

        if on_disk != document.version {
            return Err(StoreError::Modified {
                path: self.display(),
            });
        }

        let bytes = self.render(document)?;
        write_atomic(&self.path, &bytes)?;
        document.version = Some(DocumentVersion::of(&bytes));
        Ok(())
    }

    fn render(&self, document: &FlowDocument) -> Result<Vec<u8>, StoreError> {
        let mut bytes =
            serde_json::to_vec_pretty(&document.nodes).map_err(|source| StoreError::Parse {
                path: self.display(),
                source,
            })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |source: std::io::Error| StoreError::Io {
        path: path.display().to_string(),
        source,
    };

    std::fs::create_dir_all(&dir).map_err(io_err)?;
    let mut temp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    temp.write_all(bytes).map_err(io_err)?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
