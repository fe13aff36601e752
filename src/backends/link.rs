//! `.url` link files
//!
//! A link's content names another resource, either as a bare URL or as an
//! `[InternetShortcut]` section with a `URL=` line. Opening a link opens
//! its target; a link that cannot be read is served as a plain file so it
//! can still be written.

use crate::error::{RelayError, Result};
use crate::url::Url;
use crate::vfs::{by_extension, read_all, Filesystem, OpenMode, VFile, Vfs};
use tracing::{debug, trace};

pub const LINK_EXTENSIONS: &[&str] = &[".url"];

/// Links pointing at links are followed this many times
const MAX_HOPS: usize = 8;

/// Target named by the content of a link file
pub fn parse_link(content: &str) -> Option<String> {
    let content = content.trim_start_matches('\u{feff}');
    let shortcut = content.lines().map(str::trim).find_map(|line| {
        let (key, value) = line.split_once('=')?;
        key.trim().eq_ignore_ascii_case("url").then(|| value.trim().to_string())
    });
    shortcut
        .or_else(|| {
            content
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with('[') && !line.starts_with(';'))
                .map(str::to_string)
        })
        .filter(|target| !target.is_empty())
}

#[derive(Default)]
pub struct LinkFilesystem;

impl LinkFilesystem {
    pub fn new() -> Self {
        Self
    }

    fn read_target(vfs: &Vfs, url: &Url) -> Result<Option<Url>> {
        let mut link = vfs.get_direct_file(url)?;
        if !link.exists() || link.is_directory() {
            return Ok(None);
        }
        let mut stream = link.source_stream(OpenMode::IN)?;
        let content = read_all(stream.as_mut())?;
        let Some(target) = parse_link(&String::from_utf8_lossy(&content)) else {
            return Ok(None);
        };
        Url::parse(&target).map(Some)
    }
}

impl Filesystem for LinkFilesystem {
    fn name(&self) -> &str {
        "link"
    }

    fn handles(&self, url: &Url) -> bool {
        url.is_hierarchical() && by_extension(LINK_EXTENSIONS, url.basename())
    }

    fn by_extension(&self) -> bool {
        true
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let mut current = url.clone();
        for _ in 0..MAX_HOPS {
            let target = match Self::read_target(vfs, &current) {
                Ok(Some(target)) => target,
                Ok(None) => return vfs.get_direct_file(&current),
                Err(err) => {
                    debug!(link = %current, error = %err, "link unreadable");
                    return vfs.get_direct_file(&current);
                }
            };
            trace!(link = %current, target = %target, "following link");
            if !self.handles(&target) {
                return vfs.get_file_url(&target);
            }
            current = target;
        }
        Err(RelayError::PathError(format!("too many link hops from {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link() {
        assert_eq!(parse_link("http://host/file.d64\n").as_deref(), Some("http://host/file.d64"));
        let shortcut = "[InternetShortcut]\r\nURL=https://example.com/a.prg\r\nIconIndex=0\r\n";
        assert_eq!(parse_link(shortcut).as_deref(), Some("https://example.com/a.prg"));
        assert_eq!(parse_link("\n\n  \n"), None);
        assert_eq!(parse_link("[InternetShortcut]\n"), None);
    }

    #[test]
    fn test_handles_only_links() {
        let fs = LinkFilesystem::new();
        assert!(fs.handles(&Url::parse("/tmp/Games.URL").unwrap()));
        assert!(!fs.handles(&Url::parse("/tmp/games.d64").unwrap()));
        assert!(!fs.handles(&Url::parse("digest:/tmp/a.url#algo=sha256").unwrap()));
    }
}
