//! `multipart/form-data` splitting.
//!
//! The body is read as a stream through a small window: part data is copied
//! out as soon as it cannot belong to the next delimiter, so memory stays
//! bounded by the window whatever the body size. Text fields are added to the
//! parameter map, file parts are written to temp files.

use std::io::{self, Read, Write};
use std::path::Path;

use mime::Mime;
use tempfile::TempPath;

use crate::ensure;
use crate::protocol::{ParamMap, ParseError, UploadedFile};

const MAX_BOUNDARY_LEN: usize = 70;
const MAX_PART_HEAD: usize = 8 * 1024;
const READ_CHUNK: usize = 8 * 1024;

/// Extracts the boundary of a `multipart/form-data` content type, `None` for
/// any other content type.
pub fn parse_boundary(content_type: &str) -> Result<Option<String>, ParseError> {
    let Ok(parsed) = content_type.parse::<Mime>() else {
        return Ok(None);
    };
    if parsed.type_() != mime::MULTIPART || parsed.subtype() != mime::FORM_DATA {
        return Ok(None);
    }

    let boundary = parsed
        .get_param(mime::BOUNDARY)
        .map(|b| b.as_str())
        .ok_or_else(|| ParseError::invalid_body("multipart content type without boundary"))?;
    ensure!(
        !boundary.is_empty() && boundary.len() <= MAX_BOUNDARY_LEN,
        ParseError::invalid_body("invalid multipart boundary")
    );
    Ok(Some(boundary.to_string()))
}

/// The files of a split multipart body.
#[derive(Debug, Default)]
pub struct MultipartParts {
    pub uploads: Vec<UploadedFile>,
    /// Owners of the upload files, removing them when dropped.
    pub temp_paths: Vec<TempPath>,
}

/// Splits the multipart body read from `reader` on `boundary`.
///
/// Text fields go to `params`. On error any temp file already written is
/// removed when the partial result is dropped.
pub fn read_multipart<R: Read>(
    reader: R,
    boundary: &str,
    params: &mut ParamMap,
    temp_dir: Option<&Path>,
) -> Result<MultipartParts, ParseError> {
    let mut window = Window::new(reader, boundary);
    let mut parts = MultipartParts::default();

    // the preamble before the first delimiter is ignored
    window.copy_until_delimiter(&mut io::sink())?;
    loop {
        if window.take_prefix(b"--")? {
            return Ok(parts);
        }
        ensure!(window.take_prefix(b"\r\n")?, ParseError::invalid_body("expected CRLF after boundary"));

        let head = window.read_part_head()?;
        let (disposition, content_type) = parse_part_headers(&head)?;
        let (name, file_name) = parse_content_disposition(&disposition)?;

        match file_name {
            Some(file_name) => {
                let mut file = new_upload(temp_dir).map_err(ParseError::io)?;
                let size = window.copy_until_delimiter(&mut file)?;
                file.flush().map_err(ParseError::io)?;
                let temp_path = file.into_temp_path();
                parts.uploads.push(UploadedFile {
                    field: name,
                    file_name,
                    content_type,
                    path: temp_path.to_path_buf(),
                    size,
                });
                parts.temp_paths.push(temp_path);
            }
            None => {
                let mut value = Vec::new();
                window.copy_until_delimiter(&mut value)?;
                params.push(name, String::from_utf8_lossy(&value).into_owned());
            }
        }
    }
}

/// A read-ahead buffer over the body, searched for `CRLF--boundary`.
struct Window<R> {
    reader: R,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
}

impl<R: Read> Window<R> {
    fn new(reader: R, boundary: &str) -> Self {
        // a leading CRLF lets the first delimiter match like every other one
        Self { reader, delimiter: format!("\r\n--{boundary}").into_bytes(), buf: b"\r\n".to_vec() }
    }

    /// Reads more bytes, `false` at the end of the body.
    fn fill(&mut self) -> Result<bool, ParseError> {
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let n = loop {
            match self.reader.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(ParseError::io(e));
                }
            }
        };
        self.buf.truncate(start + n);
        Ok(n > 0)
    }

    fn need(&mut self, len: usize) -> Result<(), ParseError> {
        while self.buf.len() < len {
            ensure!(self.fill()?, ParseError::invalid_body("multipart body ended before closing boundary"));
        }
        Ok(())
    }

    /// Consumes `prefix` if the window starts with it.
    fn take_prefix(&mut self, prefix: &[u8]) -> Result<bool, ParseError> {
        self.need(prefix.len())?;
        if self.buf.starts_with(prefix) {
            self.buf.drain(..prefix.len());
            return Ok(true);
        }
        Ok(false)
    }

    /// Copies bytes to `sink` up to the next delimiter followed by CRLF or
    /// `--`, consuming the delimiter. Returns the number of bytes copied.
    fn copy_until_delimiter<W: Write>(&mut self, sink: &mut W) -> Result<u64, ParseError> {
        let mut copied = 0;
        loop {
            if let Some(at) = find(&self.buf, &self.delimiter) {
                let end = at + self.delimiter.len();
                self.need(end + 2)?;
                let suffix = &self.buf[end..end + 2];
                if suffix == b"\r\n" || suffix == b"--" {
                    sink.write_all(&self.buf[..at]).map_err(ParseError::io)?;
                    self.buf.drain(..end);
                    return Ok(copied + at as u64);
                }
                // the delimiter text is part of the data
                sink.write_all(&self.buf[..=at]).map_err(ParseError::io)?;
                self.buf.drain(..=at);
                copied += at as u64 + 1;
                continue;
            }

            // keep a tail that may be the start of a delimiter
            let keep = self.delimiter.len() - 1;
            if self.buf.len() > keep {
                let flush = self.buf.len() - keep;
                sink.write_all(&self.buf[..flush]).map_err(ParseError::io)?;
                self.buf.drain(..flush);
                copied += flush as u64;
            }
            ensure!(self.fill()?, ParseError::invalid_body("multipart body ended before closing boundary"));
        }
    }

    /// The header lines of a part, consuming the blank line after them.
    fn read_part_head(&mut self) -> Result<Vec<u8>, ParseError> {
        loop {
            if self.buf.starts_with(b"\r\n") {
                return Err(ParseError::invalid_body("part without content-disposition"));
            }
            if let Some(end) = find(&self.buf, b"\r\n\r\n") {
                let head = self.buf[..end + 2].to_vec();
                self.buf.drain(..end + 4);
                return Ok(head);
            }
            ensure!(self.buf.len() <= MAX_PART_HEAD, ParseError::invalid_body("part headers too large"));
            ensure!(self.fill()?, ParseError::invalid_body("unterminated part headers"));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The content-disposition and content-type of a part head.
fn parse_part_headers(head: &[u8]) -> Result<(String, Option<String>), ParseError> {
    let head = std::str::from_utf8(head).map_err(|_| ParseError::invalid_body("invalid UTF-8 in part header"))?;
    let mut disposition = None;
    let mut content_type = None;

    for line in head.split("\r\n").filter(|l| !l.is_empty()) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim().to_string());
            } else if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }
    }

    let disposition = disposition.ok_or_else(|| ParseError::invalid_body("part without content-disposition"))?;
    Ok((disposition, content_type))
}

/// Reads `name` and the optional `filename` of a `form-data` disposition.
fn parse_content_disposition(value: &str) -> Result<(String, Option<String>), ParseError> {
    let mut name = None;
    let mut file_name = None;

    for segment in value.split(';').map(str::trim) {
        let Some((key, raw)) = segment.split_once('=') else {
            continue;
        };
        let unquoted = unquote(raw);
        if key.trim().eq_ignore_ascii_case("name") {
            name = Some(unquoted);
        } else if key.trim().eq_ignore_ascii_case("filename") {
            // keep the base name only, clients may send full paths
            let base = unquoted.rsplit(['/', '\\']).next().unwrap_or_default().to_string();
            file_name = Some(base);
        }
    }

    let name = name.ok_or_else(|| ParseError::invalid_body("content-disposition without name"))?;
    Ok((name, file_name))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') { s[1..s.len() - 1].to_string() } else { s.to_string() }
}

fn new_upload(temp_dir: Option<&Path>) -> io::Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("micro-poll-upload-");
    match temp_dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "--XyZ\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\
        \r\n\
        50% off\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"C:\\\\tmp\\\\a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        file\r\ncontent\r\n\
        --XyZ--\r\n";

    /// Hands out at most `step` bytes per read, like a file read in small pieces.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(parse_boundary("multipart/form-data; boundary=\"XyZ\"").unwrap().as_deref(), Some("XyZ"));
        assert_eq!(parse_boundary("application/json").unwrap(), None);
        assert!(parse_boundary("multipart/form-data").is_err());
    }

    #[test]
    fn splits_fields_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = ParamMap::new();
        let parts = read_multipart(BODY.as_bytes(), "XyZ", &mut params, Some(dir.path())).unwrap();

        assert_eq!(params.get_str("title"), Some("50% off"));

        assert_eq!(parts.uploads.len(), 1);
        let upload = &parts.uploads[0];
        assert_eq!(upload.field(), "doc");
        assert_eq!(upload.file_name(), "a.txt");
        assert_eq!(upload.content_type(), Some("text/plain"));
        assert_eq!(upload.size(), 13);
        assert_eq!(std::fs::read(upload.path()).unwrap(), b"file\r\ncontent");
        assert!(upload.path().starts_with(dir.path()));
    }

    #[test]
    fn any_read_size_gives_same_parts() {
        for step in [1, 2, 3, 7, 13, 64] {
            let mut params = ParamMap::new();
            let reader = Trickle { data: BODY.as_bytes(), step };
            let parts = read_multipart(reader, "XyZ", &mut params, None).unwrap();

            assert_eq!(params.get_str("title"), Some("50% off"), "step {step}");
            assert_eq!(std::fs::read(parts.uploads[0].path()).unwrap(), b"file\r\ncontent", "step {step}");
        }
    }

    #[test]
    fn large_file_part_is_streamed() {
        let data = vec![b'x'; 3 * READ_CHUNK + 5];
        let mut body = b"--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x\"\r\n\r\n".to_vec();
        body.extend_from_slice(&data);
        body.extend_from_slice(b"\r\n--B--\r\n");

        let mut params = ParamMap::new();
        let parts = read_multipart(body.as_slice(), "B", &mut params, None).unwrap();
        assert_eq!(parts.uploads[0].size(), data.len() as u64);
        assert_eq!(std::fs::read(parts.uploads[0].path()).unwrap(), data);
    }

    #[test]
    fn delimiter_lookalike_stays_in_data() {
        let body = "--B\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx\r\n--Bogus\r\n--B--";
        let mut params = ParamMap::new();
        read_multipart(body.as_bytes(), "B", &mut params, None).unwrap();
        assert_eq!(params.get_str("a"), Some("x\r\n--Bogus"));
    }

    #[test]
    fn missing_closing_boundary_fails() {
        let mut params = ParamMap::new();
        let body = "--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue";
        assert!(read_multipart(body.as_bytes(), "XyZ", &mut params, None).is_err());
    }

    #[test]
    fn failed_split_removes_written_files() {
        let dir = tempfile::tempdir().unwrap();
        let body = "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x\"\r\n\r\ndata\r\n--B\r\nbroken";
        let mut params = ParamMap::new();
        assert!(read_multipart(body.as_bytes(), "B", &mut params, Some(dir.path())).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
