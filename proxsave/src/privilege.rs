//! Unprivileged-container detection and failure classification.
//!
//! Inside a user-namespaced container, hardware introspection tools fail in
//! predictable ways. Those failures are reported as `skipped` with a stable
//! reason instead of `failed`.

use crate::process::HostFs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Result of container detection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub unprivileged: bool,
    /// What led to the verdict, for logging
    pub evidence: String,
}

/// Decides whether the process runs in an unprivileged container.
pub trait ContainerDetector: Send + Sync {
    fn detect(&self) -> ContainerInfo;
}

/// Detector reading `/proc/self/{uid,gid}_map` and container marker files.
pub struct ProcDetector {
    fs: Arc<dyn HostFs>,
    uid_map: PathBuf,
    gid_map: PathBuf,
    markers: Vec<PathBuf>,
}

impl ProcDetector {
    pub fn new(fs: Arc<dyn HostFs>) -> Self {
        Self {
            fs,
            uid_map: PathBuf::from("/proc/self/uid_map"),
            gid_map: PathBuf::from("/proc/self/gid_map"),
            markers: vec![
                PathBuf::from("/run/systemd/container"),
                PathBuf::from("/run/.containerenv"),
                PathBuf::from("/.dockerenv"),
            ],
        }
    }

    /// Read maps and markers from alternative locations.
    pub fn with_paths(fs: Arc<dyn HostFs>, uid_map: &Path, gid_map: &Path, markers: Vec<PathBuf>) -> Self {
        Self {
            fs,
            uid_map: uid_map.to_path_buf(),
            gid_map: gid_map.to_path_buf(),
            markers,
        }
    }
}

impl ContainerDetector for ProcDetector {
    fn detect(&self) -> ContainerInfo {
        let uid = self.fs.read_to_string(&self.uid_map).ok();
        let gid = self.fs.read_to_string(&self.gid_map).ok();

        if let Some(host) = uid.as_deref().and_then(root_mapping) {
            if host != 0 {
                return ContainerInfo {
                    unprivileged: true,
                    evidence: format!("uid 0 maps to host uid {}", host),
                };
            }
        }
        if let Some(host) = gid.as_deref().and_then(root_mapping) {
            if host != 0 {
                return ContainerInfo {
                    unprivileged: true,
                    evidence: format!("gid 0 maps to host gid {}", host),
                };
            }
        }

        let marker = self.markers.iter().find(|m| self.fs.exists(m));
        match marker {
            // Without readable maps a container marker is the only signal left
            Some(marker) if uid.is_none() && gid.is_none() => {
                let flavor = self
                    .fs
                    .read_to_string(marker)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                ContainerInfo {
                    unprivileged: true,
                    evidence: format!("container marker {} ({})", marker.display(), flavor),
                }
            }
            _ => ContainerInfo::default(),
        }
    }
}

/// Host id that in-namespace id 0 maps to, from a `uid_map`/`gid_map` body.
pub fn root_mapping(map: &str) -> Option<u64> {
    map.lines().find_map(|line| {
        let mut fields = line.split_whitespace().map(|f| f.parse::<u64>());
        let inside = fields.next()?.ok()?;
        let outside = fields.next()?.ok()?;
        let count = fields.next()?.ok()?;
        (inside == 0 && count > 0).then_some(outside)
    })
}

/// Detector with a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticDetector(pub ContainerInfo);

impl StaticDetector {
    pub fn unprivileged() -> Self {
        Self(ContainerInfo {
            unprivileged: true,
            evidence: "static".to_string(),
        })
    }

    pub fn privileged() -> Self {
        Self(ContainerInfo::default())
    }
}

impl ContainerDetector for StaticDetector {
    fn detect(&self) -> ContainerInfo {
        self.0.clone()
    }
}

/// Commands whose failures may be expected in unprivileged containers.
pub const DOWNGRADE_ALLOWLIST: &[&str] = &["dmidecode", "blkid", "sensors", "smartctl"];

const PRIVILEGE_SIGNATURES: &[&str] = &["permission denied", "operation not permitted", "/dev/mem"];

/// Stable reason for an expected unprivileged-mode failure, if it is one.
pub fn classify(command: &str, exit_code: i32, output: &str) -> Option<&'static str> {
    let lowered = output.to_lowercase();
    let privileged_failure = PRIVILEGE_SIGNATURES.iter().any(|s| lowered.contains(s));

    match command {
        "dmidecode" if privileged_failure => Some("DMI tables not accessible"),
        "blkid" if exit_code == 2 && output.trim().is_empty() => {
            Some("No block devices visible to blkid")
        }
        "blkid" if privileged_failure => Some("Block device probing not permitted"),
        "sensors" if privileged_failure || lowered.contains("no sensors found") => {
            Some("Hardware sensors not exposed")
        }
        "smartctl" if privileged_failure => Some("SMART data not accessible"),
        _ => None,
    }
}

/// Memoized detector plus the classification rules.
pub struct Classifier {
    detector: Arc<dyn ContainerDetector>,
    info: OnceLock<ContainerInfo>,
}

impl Classifier {
    pub fn new(detector: Arc<dyn ContainerDetector>) -> Self {
        Self {
            detector,
            info: OnceLock::new(),
        }
    }

    /// Detection result; computed on first use.
    pub fn container(&self) -> &ContainerInfo {
        self.info.get_or_init(|| {
            let info = self.detector.detect();
            if info.unprivileged {
                tracing::info!("Unprivileged container detected: {}", info.evidence);
            }
            info
        })
    }

    /// Reason to report a failure as skipped, when one applies.
    pub fn downgrade(&self, command: &str, exit_code: i32, output: &str) -> Option<&'static str> {
        if !DOWNGRADE_ALLOWLIST.contains(&command) || !self.container().unprivileged {
            return None;
        }
        classify(command, exit_code, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MapFs {
        files: HashMap<PathBuf, String>,
    }

    impl HostFs for MapFs {
        fn exists(&self, path: &Path) -> bool {
            self.files.contains_key(path)
        }
        fn is_dir(&self, _path: &Path) -> bool {
            false
        }
        fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
        }
    }

    fn detector(files: &[(&str, &str)]) -> ProcDetector {
        let fs = MapFs {
            files: files
                .iter()
                .map(|(p, c)| (PathBuf::from(p), c.to_string()))
                .collect(),
        };
        ProcDetector::with_paths(
            Arc::new(fs),
            Path::new("/uid_map"),
            Path::new("/gid_map"),
            vec![PathBuf::from("/marker")],
        )
    }

    #[test]
    fn test_root_mapping() {
        assert_eq!(root_mapping("         0          0 4294967295\n"), Some(0));
        assert_eq!(root_mapping("0 100000 65536\n"), Some(100000));
        assert_eq!(root_mapping("1000 1000 1\n"), None);
        assert_eq!(root_mapping(""), None);
    }

    #[test]
    fn test_shifted_uid_map_is_unprivileged() {
        let d = detector(&[("/uid_map", "0 100000 65536"), ("/gid_map", "0 0 4294967295")]);
        assert!(d.detect().unprivileged);
    }

    #[test]
    fn test_shifted_gid_map_is_unprivileged() {
        let d = detector(&[("/uid_map", "0 0 4294967295"), ("/gid_map", "0 100000 65536")]);
        assert!(d.detect().unprivileged);
    }

    #[test]
    fn test_identity_map_is_privileged() {
        let d = detector(&[
            ("/uid_map", "0 0 4294967295"),
            ("/gid_map", "0 0 4294967295"),
            ("/marker", "lxc"),
        ]);
        assert!(!d.detect().unprivileged);
    }

    #[test]
    fn test_marker_without_maps_is_unprivileged() {
        let d = detector(&[("/marker", "lxc\n")]);
        let info = d.detect();
        assert!(info.unprivileged);
        assert!(info.evidence.contains("lxc"));
    }

    #[test]
    fn test_classify_signatures() {
        assert_eq!(
            classify("dmidecode", 1, "/dev/mem: Operation not permitted"),
            Some("DMI tables not accessible")
        );
        assert_eq!(classify("blkid", 2, ""), Some("No block devices visible to blkid"));
        assert_eq!(classify("blkid", 2, "/dev/sda1: UUID=..."), None);
        assert_eq!(
            classify("sensors", 1, "No sensors found!\nMake sure you loaded all the kernel drivers"),
            Some("Hardware sensors not exposed")
        );
        assert_eq!(
            classify("smartctl", 2, "Smartctl open device: /dev/sda failed: Permission denied"),
            Some("SMART data not accessible")
        );
        assert_eq!(classify("lspci", 1, "Permission denied"), None);
        assert_eq!(classify("dmidecode", 1, "segfault"), None);
    }

    struct CountingDetector(AtomicUsize);

    impl ContainerDetector for CountingDetector {
        fn detect(&self) -> ContainerInfo {
            self.0.fetch_add(1, Ordering::SeqCst);
            ContainerInfo {
                unprivileged: true,
                evidence: "test".to_string(),
            }
        }
    }

    #[test]
    fn test_detection_is_memoized() {
        let counting = Arc::new(CountingDetector(AtomicUsize::new(0)));
        let classifier = Classifier::new(counting.clone());
        for _ in 0..3 {
            assert!(classifier.downgrade("dmidecode", 1, "Permission denied").is_some());
        }
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_privileged_host_never_downgrades() {
        let classifier = Classifier::new(Arc::new(StaticDetector::privileged()));
        assert_eq!(classifier.downgrade("dmidecode", 1, "/dev/mem: Permission denied"), None);
    }
}
