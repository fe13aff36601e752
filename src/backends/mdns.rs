//! DNS-SD service browsing
//!
//! `mdns://` lists discovered service types, `mdns://_smb` lists the
//! instances of one type and `mdns://_smb/<instance>` reads a text report.
//! Instances of file-sharing types resolve to their backend instead, so
//! `mdns://_nfs/nas/export/file` opens `nfs://<address>:<port>/export/file`.
//!
//! Discovery belongs to a [`ServiceBrowser`]. [`MdnsSdBrowser`] browses the
//! local network over multicast DNS; hosts may supply their own.

use crate::error::{Errno, RelayError, Result};
use crate::url::{compare_filename, Url};
use crate::vfs::{BufferStream, DirCursor, Filesystem, OpenMode, VFile, VStream, Vfs};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, trace};

#[cfg(feature = "mdns")]
pub use self::sd::MdnsSdBrowser;

/// One advertised service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInstance {
    pub instance_name: String,
    /// Type without protocol, e.g. `_smb`
    pub service_type: String,
    /// `_tcp` or `_udp`
    pub proto: String,
    pub hostname: String,
    pub port: u16,
    pub addresses: Vec<String>,
    pub txt: Vec<(String, String)>,
}

impl ServiceInstance {
    /// Scheme of the backend serving this service type
    pub fn backend_scheme(&self) -> Option<&'static str> {
        let base = self.service_type.split('.').next().unwrap_or("");
        match base {
            "_nfs" => Some("nfs"),
            "_smb" => Some("smb"),
            "_sftp" | "_sftp-ssh" | "_ssh" => Some("sftp"),
            _ => None,
        }
    }

    /// Backend root URL, when the type is a file-sharing one and an address is known
    pub fn backend_url(&self) -> Option<String> {
        let scheme = self.backend_scheme()?;
        let host = self
            .addresses
            .first()
            .cloned()
            .or_else(|| (!self.hostname.is_empty()).then(|| self.hostname.clone()))?;
        let host = if host.contains(':') { format!("[{}]", host) } else { host };
        if self.port == 0 {
            Some(format!("{}://{}/", scheme, host))
        } else {
            Some(format!("{}://{}:{}/", scheme, host, self.port))
        }
    }

    /// Multi-line description served as the instance's content
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Service Details: {}", self.instance_name);
        let _ = writeln!(out, "==========================================");
        let _ = writeln!(out);
        let _ = writeln!(out, "Instance Name: {}", self.instance_name);
        let _ = writeln!(out, "Service Type:  {}.{}", self.service_type, self.proto);
        let _ = writeln!(out, "Hostname:      {}", self.hostname);
        let _ = writeln!(out, "Port:          {}", self.port);
        if !self.addresses.is_empty() {
            let _ = writeln!(out, "\nIP Addresses:");
            for addr in &self.addresses {
                let _ = writeln!(out, "  {}", addr);
            }
        }
        if !self.txt.is_empty() {
            let _ = writeln!(out, "\nTXT Records:");
            for (key, value) in &self.txt {
                let _ = writeln!(out, "  {} = {}", key, value);
            }
        }
        if let Some(url) = self.backend_url() {
            let _ = writeln!(out, "\nURL: {}", url);
        }
        out
    }
}

/// Discovery backend
pub trait ServiceBrowser: Send + Sync {
    /// Advertised service types, e.g. `_http`, `_smb`
    fn service_types(&self) -> Result<Vec<String>>;

    /// Instances of one type
    fn instances(&self, service_type: &str) -> Result<Vec<ServiceInstance>>;
}

pub struct MdnsFilesystem {
    browser: Arc<dyn ServiceBrowser>,
}

impl MdnsFilesystem {
    pub fn new(browser: Arc<dyn ServiceBrowser>) -> Self {
        Self { browser }
    }

    fn find_instance(&self, service_type: &str, name: &str) -> Result<Option<ServiceInstance>> {
        Ok(self
            .browser
            .instances(service_type)?
            .into_iter()
            .find(|instance| compare_filename(&instance.instance_name, name)))
    }
}

impl Filesystem for MdnsFilesystem {
    fn name(&self) -> &str {
        "mdns"
    }

    fn handles(&self, url: &Url) -> bool {
        url.scheme() == "mdns"
    }

    fn get_file(&self, vfs: &Vfs, url: &Url) -> Result<Box<dyn VFile>> {
        let segments: Vec<String> = url
            .decoded_path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let service_type = url.host().to_string();

        if let (false, Some(name)) = (service_type.is_empty(), segments.first()) {
            if let Some(instance) = self.find_instance(&service_type, name)? {
                if let Some(root) = instance.backend_url() {
                    let rest = segments[1..].join("/");
                    let target = Url::parse(&root)?.with_path(&format!("/{}", rest));
                    debug!(instance = %instance.instance_name, target = %target, "service resolved");
                    return vfs.get_file_url(&target);
                }
            }
        }
        Ok(Box::new(MdnsFile::new(url.clone(), self.browser.clone())))
    }
}

#[derive(Debug, Clone)]
enum Level {
    Root,
    Type(String),
    Instance(String, String),
}

pub struct MdnsFile {
    url: Url,
    browser: Arc<dyn ServiceBrowser>,
    level: Level,
    children: DirCursor<String>,
}

impl MdnsFile {
    pub fn new(url: Url, browser: Arc<dyn ServiceBrowser>) -> Self {
        let name = url.decoded_path().trim_matches('/').to_string();
        let level = match (url.host(), name.is_empty()) {
            ("", _) => Level::Root,
            (service_type, true) => Level::Type(service_type.to_string()),
            (service_type, false) => Level::Instance(service_type.to_string(), name),
        };
        Self {
            url,
            browser,
            level,
            children: DirCursor::new(),
        }
    }

    fn instance(&self) -> Option<ServiceInstance> {
        let Level::Instance(service_type, name) = &self.level else {
            return None;
        };
        self.browser
            .instances(service_type)
            .ok()?
            .into_iter()
            .find(|instance| compare_filename(&instance.instance_name, name))
    }
}

impl VFile for MdnsFile {
    fn url(&self) -> &Url {
        &self.url
    }

    fn exists(&mut self) -> bool {
        match &self.level {
            Level::Root => true,
            Level::Type(service_type) => self
                .browser
                .service_types()
                .map(|types| types.iter().any(|t| t.eq_ignore_ascii_case(service_type)))
                .unwrap_or(false),
            Level::Instance(..) => self.instance().is_some(),
        }
    }

    fn is_directory(&mut self) -> bool {
        !matches!(self.level, Level::Instance(..))
    }

    fn size(&mut self) -> u64 {
        self.instance().map(|i| i.report().len() as u64).unwrap_or(0)
    }

    fn rewind_directory(&mut self) -> Result<()> {
        let mut names = match &self.level {
            Level::Root => self.browser.service_types()?,
            Level::Type(service_type) => self
                .browser
                .instances(service_type)?
                .into_iter()
                .map(|instance| instance.instance_name)
                .collect(),
            Level::Instance(..) => return Err(RelayError::errno(Errno::ENOTDIR, self.url.to_string())),
        };
        names.sort();
        names.dedup();
        trace!(url = %self.url, entries = names.len(), "service listing");
        self.children.reset(names);
        Ok(())
    }

    fn next_in_dir(&mut self) -> Option<Box<dyn VFile>> {
        if !self.children.is_loaded() {
            self.rewind_directory().ok()?;
        }
        let name = self.children.next_entry()?.clone();
        let url = match &self.level {
            Level::Root => Url::parse(&format!("mdns://{}/", name)).ok()?,
            _ => self.url.join(&urlencoding::encode(&name)),
        };
        Some(Box::new(MdnsFile::new(url, self.browser.clone())))
    }

    fn source_stream(&mut self, mode: OpenMode) -> Result<Box<dyn VStream>> {
        if mode.is_write() {
            return Err(RelayError::errno(Errno::EROFS, self.url.to_string()));
        }
        let instance = self
            .instance()
            .ok_or_else(|| RelayError::errno(Errno::ENOENT, self.url.to_string()))?;
        let mut stream = BufferStream::new(self.url.clone(), instance.report().into_bytes());
        stream.open(mode)?;
        Ok(Box::new(stream))
    }
}

/// `_http._tcp.local.` -> (`_http`, `_tcp`)
pub fn split_service_type(type_domain: &str) -> Option<(String, String)> {
    let mut labels = type_domain.trim_end_matches('.').split('.');
    let service = labels.next().filter(|l| l.starts_with('_'))?;
    let proto = labels.next().filter(|l| *l == "_tcp" || *l == "_udp")?;
    Some((service.to_string(), proto.to_string()))
}

/// Instance label of a full service name: `Office Printer._ipp._tcp.local.` -> `Office Printer`
pub fn instance_label(fullname: &str, type_domain: &str) -> String {
    let type_domain = type_domain.trim_end_matches('.');
    let fullname = fullname.trim_end_matches('.');
    fullname
        .strip_suffix(type_domain)
        .map(|label| label.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(feature = "mdns")]
mod sd {
    use super::*;
    use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use tracing::warn;

    /// DNS-SD meta-query listing every advertised service type
    const META_QUERY: &str = "_services._dns-sd._udp.local.";

    /// Browses the local link through an `mdns-sd` daemon
    ///
    /// The daemon starts on first use. Each query collects answers for the
    /// configured window and stops its browse.
    pub struct MdnsSdBrowser {
        daemon: Mutex<Option<ServiceDaemon>>,
        window: Duration,
    }

    impl MdnsSdBrowser {
        pub fn new(window: Duration) -> Self {
            Self {
                daemon: Mutex::new(None),
                window,
            }
        }

        fn daemon(&self) -> Result<ServiceDaemon> {
            let mut slot = self.daemon.lock();
            if let Some(daemon) = slot.as_ref() {
                return Ok(daemon.clone());
            }
            let daemon = ServiceDaemon::new()
                .map_err(|err| RelayError::ConnectionFailed(format!("mdns daemon: {}", err)))?;
            debug!("mdns daemon started");
            *slot = Some(daemon.clone());
            Ok(daemon)
        }

        fn browse(&self, type_domain: &str, mut on_event: impl FnMut(ServiceEvent)) -> Result<()> {
            let daemon = self.daemon()?;
            let events = daemon
                .browse(type_domain)
                .map_err(|err| RelayError::errno(Errno::EINVAL, format!("{}: {}", type_domain, err)))?;
            let deadline = Instant::now() + self.window;
            while let Some(left) = deadline.checked_duration_since(Instant::now()) {
                match events.recv_timeout(left) {
                    Ok(event) => on_event(event),
                    Err(_) => break,
                }
            }
            if let Err(err) = daemon.stop_browse(type_domain) {
                warn!(type_domain, error = %err, "stop browse failed");
            }
            Ok(())
        }
    }

    impl Drop for MdnsSdBrowser {
        fn drop(&mut self) {
            if let Some(daemon) = self.daemon.lock().take() {
                let _ = daemon.shutdown();
            }
        }
    }

    impl From<&ServiceInfo> for ServiceInstance {
        fn from(info: &ServiceInfo) -> Self {
            let (service_type, proto) = split_service_type(info.get_type()).unwrap_or_default();
            let mut addresses: Vec<String> = info.get_addresses().iter().map(|a| a.to_string()).collect();
            addresses.sort();
            ServiceInstance {
                instance_name: instance_label(info.get_fullname(), info.get_type()),
                service_type,
                proto,
                hostname: info.get_hostname().trim_end_matches('.').to_string(),
                port: info.get_port(),
                addresses,
                txt: info
                    .get_properties()
                    .iter()
                    .map(|p| (p.key().to_string(), p.val_str().to_string()))
                    .collect(),
            }
        }
    }

    impl ServiceBrowser for MdnsSdBrowser {
        fn service_types(&self) -> Result<Vec<String>> {
            let mut types = Vec::new();
            self.browse(META_QUERY, |event| {
                if let ServiceEvent::ServiceFound(_, fullname) = event {
                    if let Some((service, _)) = split_service_type(&fullname) {
                        types.push(service);
                    }
                }
            })?;
            types.sort();
            types.dedup();
            trace!(count = types.len(), "service types");
            Ok(types)
        }

        fn instances(&self, service_type: &str) -> Result<Vec<ServiceInstance>> {
            let type_domain = format!("{}._tcp.local.", service_type.trim_end_matches('.'));
            let mut found: Vec<ServiceInstance> = Vec::new();
            self.browse(&type_domain, |event| {
                if let ServiceEvent::ServiceResolved(info) = event {
                    let instance = ServiceInstance::from(&info);
                    if !found.iter().any(|i| i.instance_name == instance.instance_name) {
                        found.push(instance);
                    }
                }
            })?;
            Ok(found)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_instance_from_resolved_info() {
            let properties = [("path", "/export")];
            let info = ServiceInfo::new("_nfs._tcp.local.", "nas", "nas.local.", "10.0.0.5", 2049, &properties[..])
                .unwrap();
            let instance = ServiceInstance::from(&info);
            assert_eq!(instance.instance_name, "nas");
            assert_eq!((instance.service_type.as_str(), instance.proto.as_str()), ("_nfs", "_tcp"));
            assert_eq!(instance.hostname, "nas.local");
            assert_eq!(instance.addresses, vec!["10.0.0.5"]);
            assert_eq!(instance.txt, vec![("path".to_string(), "/export".to_string())]);
            assert_eq!(instance.backend_url().as_deref(), Some("nfs://10.0.0.5:2049/"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer() -> ServiceInstance {
        ServiceInstance {
            instance_name: "Office Printer".into(),
            service_type: "_ipp".into(),
            proto: "_tcp".into(),
            hostname: "printer.local".into(),
            port: 631,
            addresses: vec!["192.168.1.20".into()],
            txt: vec![("rp".into(), "ipp/print".into())],
        }
    }

    #[test]
    fn test_backend_url() {
        let mut nas = ServiceInstance {
            instance_name: "nas".into(),
            service_type: "_smb".into(),
            proto: "_tcp".into(),
            hostname: "nas.local".into(),
            port: 445,
            addresses: vec!["10.0.0.5".into()],
            ..Default::default()
        };
        assert_eq!(nas.backend_url().as_deref(), Some("smb://10.0.0.5:445/"));
        nas.service_type = "_ssh".into();
        nas.addresses.clear();
        assert_eq!(nas.backend_url().as_deref(), Some("sftp://nas.local:445/"));
        assert!(printer().backend_url().is_none());
    }

    #[test]
    fn test_service_names() {
        assert_eq!(
            split_service_type("_http._tcp.local."),
            Some(("_http".to_string(), "_tcp".to_string()))
        );
        assert_eq!(split_service_type("_services._dns-sd._udp.local."), None);
        assert_eq!(instance_label("Office Printer._ipp._tcp.local.", "_ipp._tcp.local."), "Office Printer");
        assert_eq!(instance_label("odd-name", "_ipp._tcp.local."), "odd-name");
    }

    #[test]
    fn test_report() {
        let report = printer().report();
        assert!(report.starts_with("Service Details: Office Printer\n"));
        assert!(report.contains("Service Type:  _ipp._tcp\n"));
        assert!(report.contains("  192.168.1.20\n"));
        assert!(report.contains("  rp = ipp/print\n"));
        assert!(!report.contains("URL:"));
    }
}
