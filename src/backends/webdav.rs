//! WebDAV
//!
//! `webdav://` and `webdavs://` travel as `http://` and `https://` and share
//! their session pool. Listings come from `PROPFIND` with `Depth: 1`;
//! namespace changes use `MKCOL`, `DELETE` and `MOVE`. Uploads always `PUT`.

use crate::backends::http::{http_target, obtain_session, HttpSession, HttpStream, Upload};
use crate::config::HttpConfig;
use crate::error::{Errno, RelayError, Result};
use crate::url::Url;
use crate::vfs::{DirCursor, Filesystem, OpenMode, VFile, VStream, Vfs};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, trace};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/></D:prop></D:propfind>"#;

/// One `<response>` of a multistatus document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Decoded path of the resource, without a trailing slash
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

impl DavEntry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

/// Inner text of every element whose local name is `local`, ignoring the
/// namespace prefix. Self-closing elements yield an empty string.
fn elements<'a>(xml: &'a str, local: &str) -> Vec<&'a str> {
    let mut found = Vec::new();
    let mut rest = xml;
    let mut offset = 0;
    while let Some(lt) = rest.find('<') {
        let tag_start = offset + lt + 1;
        let tail = &xml[tag_start..];
        let name_len = tail
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(tail.len());
        let name = &tail[..name_len];
        let Some(gt) = tail.find('>') else {
            break;
        };
        let after = tag_start + gt + 1;
        let local_name = name.rsplit(':').next().unwrap_or(name);

        if !name.is_empty() && !name.starts_with(['/', '?', '!']) && local_name.eq_ignore_ascii_case(local) {
            if tail[..gt].ends_with('/') {
                found.push("");
            } else {
                let close = format!("</{}>", name);
                if let Some(end) = xml[after..].find(&close) {
                    found.push(&xml[after..after + end]);
                }
            }
        }
        offset = after;
        rest = &xml[after..];
    }
    found
}

/// Parse a `207 Multi-Status` body
pub fn parse_multistatus(xml: &str) -> Vec<DavEntry> {
    elements(xml, "response")
        .into_iter()
        .filter_map(|response| {
            let href = elements(response, "href").into_iter().next()?.trim();
            let path = href_path(href);
            let is_dir = !elements(response, "collection").is_empty();
            let size = elements(response, "getcontentlength")
                .into_iter()
                .next()
                .and_then(|text| text.trim().parse().ok())
                .unwrap_or(0);
            Some(DavEntry { path, is_dir, size })
        })
        .collect()
}

fn href_path(href: &str) -> String {
    let path = match href.find("://") {
        Some(at) => {
            let after = &href[at + 3..];
            after.find('/').map(|slash| &after[slash..]).unwrap_or("/")
        }
        None => href,
    };
    let decoded = urlencoding::decode(path)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| path.to_string());
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct WebDavFilesystem {
    config: HttpConfig,
}

impl WebDavFilesystem {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl Filesystem for WebDavFilesystem {
    fn name(&self) -> &str {
        "webdav"
    }

    fn handles(&self, url: &Url) -> bool {
        matches!(url.scheme(), "webdav" | "webdavs")
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let session = obtain_session(vfs, url, &self.config)?;
        Ok(Box::new(WebDavFile::new(url.clone(), session)))
    }
}

pub struct WebDavFile {
    url: Url,
    session: Arc<HttpSession>,
    props: Option<Option<DavEntry>>,
    children: DirCursor<DavEntry>,
}

impl WebDavFile {
    pub fn new(url: Url, session: Arc<HttpSession>) -> Self {
        Self {
            url,
            session,
            props: None,
            children: DirCursor::new(),
        }
    }

    fn propfind(&self, depth: u8) -> Result<Vec<DavEntry>> {
        let method = Method::from_bytes(b"PROPFIND").map_err(|e| RelayError::Other(e.to_string()))?;
        let builder = self
            .session
            .request(method, &self.url)?
            .header("Depth", depth.to_string())
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let response = self.session.send(builder, &self.url)?;
        let body = response.text()?;
        let entries = parse_multistatus(&body);
        trace!(url = %self.url, depth, entries = entries.len(), "propfind");
        Ok(entries)
    }

    fn props(&mut self) -> Option<DavEntry> {
        if let Some(props) = &self.props {
            return props.clone();
        }
        let props = match self.propfind(0) {
            Ok(entries) => entries.into_iter().next(),
            Err(err) => {
                debug!(url = %self.url, error = %err, "propfind failed");
                None
            }
        };
        self.props = Some(props.clone());
        props
    }

    fn simple(&mut self, method: &[u8], destination: Option<String>) -> Result<()> {
        let method = Method::from_bytes(method).map_err(|e| RelayError::Other(e.to_string()))?;
        let mut builder = self.session.request(method, &self.url)?;
        if let Some(destination) = destination {
            builder = builder.header("Destination", destination).header("Overwrite", "F");
        }
        self.session.send(builder, &self.url)?;
        self.props = None;
        Ok(())
    }

    fn own_path(&self) -> String {
        href_path(self.url.path())
    }
}

impl VFile for WebDavFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        self.props().is_some()
    }

    fn is_directory(&mut self) -> bool {
        self.props().map(|p| p.is_dir).unwrap_or(false)
    }

    fn size(&mut self) -> u64 {
        self.props().map(|p| p.size).unwrap_or(0)
    }

    fn mkdir(&mut self) -> Result<()> {
        self.simple(b"MKCOL", None)
    }

    fn remove(&mut self) -> Result<()> {
        self.simple(b"DELETE", None)
    }

    fn rename(&mut self, dest: &str) -> Result<()> {
        let target = match Url::parse(dest) {
            Ok(url) if !url.scheme().is_empty() => url,
            _ if dest.starts_with('/') => self.url.with_path(dest),
            _ => self.url.parent().join(dest),
        };
        self.simple(b"MOVE", Some(http_target(&target)))?;
        self.url = target;
        Ok(())
    }

    fn rewind_directory(&mut self) -> Result<()> {
        if !self.is_directory() {
            return Err(RelayError::errno(Errno::ENOTDIR, self.url.to_string()));
        }
        let own = self.own_path();
        let children = self
            .propfind(1)?
            .into_iter()
            .filter(|entry| entry.path != own)
            .collect();
        self.children.reset(children);
        Ok(())
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        if !self.children.is_loaded() {
            self.rewind_directory().ok()?;
        }
        let entry = self.children.next_entry()?.clone();
        let name = urlencoding::encode(entry.name()).into_owned();
        let mut child = WebDavFile::new(self.url.join(&name), self.session.clone());
        child.props = Some(Some(entry));
        Some(Box::new(child))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        let mut stream = HttpStream::new(self.url.clone(), self.session.clone()).with_upload(Upload::Put);
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/games/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>http://host/dav/games/Elite%20II.d64</d:href>
    <d:propstat><d:prop><d:resourcetype/><d:getcontentlength>174848</d:getcontentlength></d:prop></d:propstat>
  </d:response>
  <D:response xmlns:D="DAV:">
    <D:href>/dav/games/sub/</D:href>
    <D:propstat><D:prop><D:resourcetype><D:collection/></D:resourcetype></D:prop></D:propstat>
  </D:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let entries = parse_multistatus(LISTING);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "/dav/games");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].path, "/dav/games/Elite II.d64");
        assert_eq!(entries[1].name(), "Elite II.d64");
        assert_eq!(entries[1].size, 174_848);
        assert!(!entries[1].is_dir);
        assert!(entries[2].is_dir);
        assert_eq!(entries[2].name(), "sub");
    }

    #[test]
    fn test_href_path() {
        assert_eq!(href_path("/"), "/");
        assert_eq!(href_path("https://h:8443/a/b/"), "/a/b");
        assert_eq!(href_path("/x%2By"), "/x+y");
    }
}
