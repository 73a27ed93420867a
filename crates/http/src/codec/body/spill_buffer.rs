use std::io::{self, Write};
use std::path::PathBuf;

use bytes::BytesMut;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use crate::protocol::RequestBody;

/// Accumulates a request body in memory until it passes `threshold` bytes,
/// then moves it to a temp file and appends there.
#[derive(Debug)]
pub struct SpillBuffer {
    memory: BytesMut,
    file: Option<NamedTempFile>,
    len: u64,
    threshold: usize,
    temp_dir: Option<PathBuf>,
}

impl SpillBuffer {
    pub fn new(threshold: usize, temp_dir: Option<PathBuf>, expected: u64) -> Self {
        let capacity = usize::try_from(expected).unwrap_or(threshold).min(threshold);
        Self { memory: BytesMut::with_capacity(capacity), file: None, len: 0, threshold, temp_dir }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    pub fn push(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk)?;
        } else if self.memory.len() + chunk.len() > self.threshold {
            let mut file = self.create_file()?;
            debug!(path = %file.path().display(), buffered = self.memory.len(), "spilling request body to disk");
            file.write_all(&self.memory)?;
            file.write_all(chunk)?;
            self.memory = BytesMut::new();
            self.file = Some(file);
        } else {
            self.memory.extend_from_slice(chunk);
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    /// Finishes the body. A spilled body comes with the guard owning its file.
    pub fn finish(self) -> io::Result<(RequestBody, Option<TempPath>)> {
        match self.file {
            Some(mut file) => {
                file.flush()?;
                let temp_path = file.into_temp_path();
                let body = RequestBody::File { path: temp_path.to_path_buf(), len: self.len };
                Ok((body, Some(temp_path)))
            }
            None if self.memory.is_empty() => Ok((RequestBody::Empty, None)),
            None => Ok((RequestBody::Memory(self.memory.freeze()), None)),
        }
    }

    fn create_file(&self) -> io::Result<NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("micro-poll-body-");
        match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_in_memory_under_threshold() {
        let mut buffer = SpillBuffer::new(8, None, 8);
        buffer.push(b"1234").unwrap();
        buffer.push(b"5678").unwrap();
        assert!(!buffer.is_spilled());

        let (body, guard) = buffer.finish().unwrap();
        assert!(guard.is_none());
        assert!(matches!(body, RequestBody::Memory(ref b) if b == "12345678"));
    }

    #[test]
    fn spills_past_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = SpillBuffer::new(4, Some(dir.path().to_path_buf()), 10);
        buffer.push(b"abc").unwrap();
        buffer.push(b"defg").unwrap();
        assert!(buffer.is_spilled());
        buffer.push(b"hij").unwrap();
        assert_eq!(buffer.len(), 10);

        let (body, guard) = buffer.finish().unwrap();
        let guard = guard.unwrap();
        assert!(guard.starts_with(dir.path()));
        assert_eq!(body.bytes_from(0).unwrap(), "abcdefghij");

        let path = guard.to_path_buf();
        guard.close().unwrap();
        assert!(!path.exists());
    }
}
