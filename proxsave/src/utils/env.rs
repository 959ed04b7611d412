//! Process environment helpers.

/// Directories that Proxmox tooling lives in but that non-login shells often
/// leave off `PATH`.
pub const SBIN_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// Variables forwarded to PBS client tooling.
pub const PBS_PASSTHROUGH: &[&str] = &["PBS_REPOSITORY", "PBS_PASSWORD", "PBS_FINGERPRINT"];

/// Extend a `PATH` value with [`SBIN_DIRS`], dropping duplicate entries.
///
/// Existing order is kept; missing sbin directories are appended.
pub fn extend_path(current: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in current.split(':').chain(SBIN_DIRS.iter().copied()) {
        if part.is_empty() || parts.contains(&part) {
            continue;
        }
        parts.push(part);
    }
    parts.join(":")
}

/// Apply [`extend_path`] to the current process.
///
/// Must run before any worker threads are spawned.
pub fn apply_path_extension() {
    let current = std::env::var("PATH").unwrap_or_default();
    let extended = extend_path(&current);
    if extended != current {
        std::env::set_var("PATH", &extended);
        tracing::debug!("PATH extended to {}", extended);
    }
}

/// Collect the PBS credentials present in the process environment.
pub fn pbs_passthrough() -> Vec<(String, String)> {
    PBS_PASSTHROUGH
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v))
        })
        .collect()
}
