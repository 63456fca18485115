//! `multipart/form-data` body decoding.

use memchr::memmem;

/// One decoded part. `name` comes from `Content-Disposition`; parts without
/// a name are discarded by the iterator.
#[derive(Debug)]
pub struct Part<'a> {
    pub name: &'a str,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub data: &'a [u8],
}

/// Extract the boundary token from a `multipart/form-data` content type.
pub fn boundary_of(content_type: &str) -> Option<&str> {
    let idx = content_type.find("boundary=")?;
    let raw = content_type[idx + "boundary=".len()..].trim();
    let raw = raw.split(';').next().unwrap_or("").trim();
    let raw = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')).unwrap_or(raw);
    if raw.is_empty() { None } else { Some(raw) }
}

/// Iterator over the parts of a multipart body.
pub struct Multipart<'a> {
    body: &'a [u8],
    marker: Vec<u8>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self { body, marker }
    }

    fn next_part(&mut self) -> Option<Part<'a>> {
        loop {
            if self.body.is_empty() {
                return None;
            }

            let mut start = memmem::find(self.body, &self.marker)?;
            start += self.marker.len();

            // `--` after the boundary marks the end of the stream.
            if self.body[start..].starts_with(b"--") {
                self.body = &[];
                return None;
            }
            if self.body[start..].starts_with(b"\r\n") {
                start += 2;
            }

            let header_end = memmem::find(&self.body[start..], b"\r\n\r\n")?;
            let header_slice = &self.body[start..start + header_end];
            let data_start = start + header_end + 4;

            let data_end = data_start + memmem::find(&self.body[data_start..], &self.marker)?;
            // The part data ends before the CRLF that precedes the boundary.
            let trimmed_end = if data_end >= data_start + 2
                && &self.body[data_end - 2..data_end] == b"\r\n"
            {
                data_end - 2
            } else {
                data_end
            };
            let data = &self.body[data_start..trimmed_end];
            self.body = &self.body[data_end..];

            let mut name = None;
            let mut filename = None;
            let mut content_type = None;
            if let Ok(headers) = std::str::from_utf8(header_slice) {
                for line in headers.split("\r\n") {
                    let lower = line.to_ascii_lowercase();
                    if lower.starts_with("content-disposition:") {
                        name = attr_value(line, "name");
                        filename = attr_value(line, "filename");
                    } else if lower.starts_with("content-type:") {
                        content_type = Some(line["content-type:".len()..].trim());
                    }
                }
            }

            // Unnamed parts are skipped rather than surfaced.
            match name {
                Some(name) => {
                    return Some(Part { name, filename, content_type, data });
                }
                None => continue,
            }
        }
    }
}

/// Pull `attr="value"` out of a Content-Disposition line.
fn attr_value<'a>(line: &'a str, attr: &str) -> Option<&'a str> {
    let needle = format!("{attr}=\"");
    let lower = line.to_ascii_lowercase();
    let mut from = 0;
    while let Some(rel) = lower[from..].find(&needle) {
        let at = from + rel;
        // Guard against `filename=` matching a `name=` probe.
        let boundary_ok = at == 0
            || matches!(lower.as_bytes()[at - 1], b' ' | b';' | b'\t');
        if boundary_ok {
            let val_start = at + needle.len();
            let rest = &line[val_start..];
            return rest.find('"').map(|end| &rest[..end]);
        }
        from = at + needle.len();
    }
    None
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Part<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_part()
    }
}
