//! Decoded request bodies and uploaded files.
//!
//! Temp files backing a body or an upload are owned by [`TempFiles`], which
//! removes them exactly once, either explicitly or on drop.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempPath;
use tracing::warn;

/// The body of a decoded request.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Body kept in memory, below the spill threshold.
    Memory(Bytes),
    /// Body spilled to a temp file.
    File { path: PathBuf, len: u64 },
}

impl RequestBody {
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Memory(bytes) => bytes.len() as u64,
            RequestBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, RequestBody::File { .. })
    }

    /// A reader over the body, empty when there is none.
    pub fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            RequestBody::Empty => Ok(Box::new(io::empty())),
            RequestBody::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            RequestBody::File { path, .. } => Ok(Box::new(File::open(path)?)),
        }
    }

    /// The body bytes starting at `offset`; an offset past the end yields nothing.
    pub fn bytes_from(&self, offset: u64) -> io::Result<Bytes> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Memory(bytes) => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
                Ok(bytes.slice(start..))
            }
            RequestBody::File { path, len } => {
                if offset >= *len {
                    return Ok(Bytes::new());
                }
                let mut file = File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = Vec::with_capacity(usize::try_from(len - offset).unwrap_or(0));
                file.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// A file part of a `multipart/form-data` body, stored in a temp file.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub(crate) field: String,
    pub(crate) file_name: String,
    pub(crate) content_type: Option<String>,
    pub(crate) path: PathBuf,
    pub(crate) size: u64,
}

impl UploadedFile {
    /// The form field name the file was sent under.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// The client-side file name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }
}

/// Owner of the temp files created while decoding one request.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<TempPath>,
}

impl TempFiles {
    pub(crate) fn push(&mut self, path: TempPath) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Deletes every file, logging the ones that could not be removed.
    pub fn delete(self) {
        for path in self.paths {
            let shown = path.to_path_buf();
            if let Err(e) = path.close() {
                warn!(cause = %e, path = %shown.display(), "failed to delete temp file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn memory_body_access() {
        let body = RequestBody::Memory(Bytes::from_static(b"hello world"));
        assert_eq!(body.len(), 11);
        assert_eq!(body.bytes_from(6).unwrap(), "world");
        assert!(body.bytes_from(100).unwrap().is_empty());

        let mut s = String::new();
        body.reader().unwrap().read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");
    }

    #[test]
    fn empty_body_reads_nothing() {
        let mut buf = Vec::new();
        RequestBody::Empty.reader().unwrap().read_to_end(&mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn file_body_and_deletion() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"spilled body").unwrap();
        let temp_path = file.into_temp_path();
        let path = temp_path.to_path_buf();

        let body = RequestBody::File { path: path.clone(), len: 12 };
        assert_eq!(body.bytes_from(8).unwrap(), "body");

        let mut files = TempFiles::default();
        files.push(temp_path);
        files.delete();
        assert!(!path.exists());
        assert!(body.reader().is_err());
    }
}
