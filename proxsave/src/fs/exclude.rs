//! Glob-based exclusion matching.
//!
//! Patterns use shell glob syntax: `*` and `?` never cross a `/`, `**` spans
//! any number of path segments, and `[...]` classes accept `!` for negation.
//! A path is tried in four forms (as given, basename, relative to `/` with the
//! system-root prefix removed, relative to the staging root) and the first
//! pattern, in configured order, that matches any form wins.

use regex::Regex;
use std::path::{Path, PathBuf};

/// Roots used to derive the relative candidate forms of a path.
#[derive(Debug, Clone, Default)]
pub struct MatchRoots {
    pub staging_root: Option<PathBuf>,
    pub system_root: Option<PathBuf>,
}

impl MatchRoots {
    pub fn new(staging_root: Option<&Path>, system_root: Option<&Path>) -> Self {
        Self {
            staging_root: staging_root.map(Path::to_path_buf),
            system_root: system_root.map(Path::to_path_buf),
        }
    }
}

/// Translate a glob into an anchored regular expression.
///
/// Returns `None` for malformed bracket expressions.
pub fn glob_to_regex(pattern: &str) -> Option<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        // `**/` also matches zero segments
                        out.push_str("(?:.*/)?");
                        i += 3;
                    } else {
                        out.push_str(".*");
                        i += 2;
                    }
                    continue;
                }
                out.push_str("[^/]*");
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let (class, next) = translate_class(&chars, i)?;
                out.push_str(&class);
                i = next;
                continue;
            }
            c => {
                let mut buf = [0u8; 4];
                out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
        i += 1;
    }

    out.push('$');
    Some(out)
}

/// Translate the bracket expression starting at `start`; returns the regex
/// class and the index just past the closing `]`.
fn translate_class(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut i = start + 1;
    let mut class = String::from("[");

    if matches!(chars.get(i), Some('!') | Some('^')) {
        class.push('^');
        i += 1;
    }
    // A leading `]` is a literal member
    if chars.get(i) == Some(&']') {
        class.push_str("\\]");
        i += 1;
    }

    let mut members = 0usize;
    while i < chars.len() {
        match chars[i] {
            ']' => {
                if members == 0 && !class.ends_with("\\]") {
                    return None;
                }
                class.push(']');
                return Some((class, i + 1));
            }
            '[' | '\\' | '&' | '~' => {
                class.push('\\');
                class.push(chars[i]);
            }
            c => class.push(c),
        }
        members += 1;
        i += 1;
    }

    None
}

/// Check that a pattern is usable as an exclusion glob.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern.trim().is_empty() {
        return Err("empty exclude pattern".to_string());
    }
    let expr = glob_to_regex(pattern)
        .ok_or_else(|| format!("malformed bracket expression in '{}'", pattern))?;
    Regex::new(&expr).map_err(|e| format!("invalid exclude pattern '{}': {}", pattern, e))?;
    Ok(())
}

/// A compiled, ordered list of exclusion patterns.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<(String, Regex)>,
}

impl ExcludeSet {
    /// Compile patterns; malformed ones are dropped and never match.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| {
                let p = p.as_ref();
                let re = glob_to_regex(p).and_then(|expr| Regex::new(&expr).ok())?;
                Some((p.to_string(), re))
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Return the first pattern that excludes `path`, if any.
    pub fn matching_pattern(&self, path: &Path, roots: &MatchRoots) -> Option<&str> {
        if self.patterns.is_empty() {
            return None;
        }
        let forms = candidate_forms(path, roots);
        self.patterns
            .iter()
            .find(|(_, re)| forms.iter().any(|f| re.is_match(f)))
            .map(|(p, _)| p.as_str())
    }
}

/// Decide whether `path` is excluded by `patterns`.
///
/// Returns the matching pattern when excluded.
pub fn match_path<S: AsRef<str>>(
    path: &Path,
    patterns: &[S],
    staging_root: Option<&Path>,
    system_root: Option<&Path>,
) -> Option<String> {
    let set = ExcludeSet::compile(patterns);
    set.matching_pattern(path, &MatchRoots::new(staging_root, system_root))
        .map(str::to_string)
}

fn candidate_forms(path: &Path, roots: &MatchRoots) -> Vec<String> {
    let mut forms = Vec::with_capacity(4);
    forms.push(path.to_string_lossy().into_owned());

    if let Some(name) = path.file_name() {
        forms.push(name.to_string_lossy().into_owned());
    }

    let system_relative = match &roots.system_root {
        Some(root) if root.as_os_str().len() > 1 => path.strip_prefix(root).unwrap_or(path),
        _ => path,
    };
    let system_relative = system_relative
        .to_string_lossy()
        .trim_start_matches('/')
        .to_string();
    if !system_relative.is_empty() {
        forms.push(system_relative);
    }

    if let Some(staging) = &roots.staging_root {
        if let Ok(rel) = path.strip_prefix(staging) {
            let rel = rel.to_string_lossy().into_owned();
            if !rel.is_empty() {
                forms.push(rel);
            }
        }
    }

    forms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_translation() {
        assert_eq!(glob_to_regex("*.cfg").unwrap(), "^[^/]*\\.cfg$");
        assert_eq!(glob_to_regex("a?c").unwrap(), "^a[^/]c$");
        assert_eq!(glob_to_regex("etc/**").unwrap(), "^etc/.*$");
        assert_eq!(glob_to_regex("[!ab]x").unwrap(), "^[^ab]x$");
    }

    #[test]
    fn test_malformed_bracket_never_matches() {
        assert!(glob_to_regex("[abc").is_none());
        assert!(validate_pattern("[abc").is_err());
        assert!(match_path(Path::new("/etc/a"), &["[abc"], None, None).is_none());
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(validate_pattern("  ").is_err());
        assert!(validate_pattern("*.log").is_ok());
    }

    #[test]
    fn test_star_does_not_cross_separator() {
        let patterns = ["etc/*.conf"];
        assert!(match_path(Path::new("/etc/a.conf"), &patterns, None, None).is_some());
        assert!(match_path(Path::new("/etc/sub/a.conf"), &patterns, None, None).is_none());
    }

    #[test]
    fn test_double_star_spans_segments() {
        let patterns = ["var/**/*.log"];
        assert!(match_path(Path::new("/var/log/a/b/c.log"), &patterns, None, None).is_some());
        assert!(match_path(Path::new("/var/c.log"), &patterns, None, None).is_some());
        assert!(match_path(Path::new("/etc/c.log"), &patterns, None, None).is_none());
    }

    #[test]
    fn test_basename_form() {
        let hit = match_path(Path::new("/etc/proxmox-backup/user.cfg"), &["user.cfg"], None, None);
        assert_eq!(hit.as_deref(), Some("user.cfg"));
    }

    #[test]
    fn test_system_root_is_stripped() {
        let root = Path::new("/srv/fakeroot");
        let path = Path::new("/srv/fakeroot/etc/pve/storage.cfg");
        let hit = match_path(path, &["etc/pve/storage.cfg"], None, Some(root));
        assert!(hit.is_some());
    }

    #[test]
    fn test_pattern_order_wins() {
        let hit = match_path(Path::new("/etc/pve/user.cfg"), &["*.cfg", "user.cfg"], None, None);
        assert_eq!(hit.as_deref(), Some("*.cfg"));
    }

    #[test]
    fn test_exclusion_symmetry_source_and_destination() {
        let staging = Path::new("/tmp/proxsave-host-20250101T000000");
        let sources = [
            "/etc/pve/user.cfg",
            "/etc/proxmox-backup/datastore.cfg",
            "/etc/network/interfaces.d/vmbr0",
            "/var/lib/pve-cluster/config.db",
        ];
        let patterns = [
            "user.cfg",
            "etc/proxmox-backup/*.cfg",
            "etc/network/**",
            "**/config.db",
            "vmbr?",
        ];

        for src in sources {
            let source = Path::new(src);
            let dest = staging.join(src.trim_start_matches('/'));
            for pattern in patterns {
                let on_source = match_path(source, &[pattern], Some(staging), None).is_some();
                let on_dest = match_path(&dest, &[pattern], Some(staging), None).is_some();
                if on_source {
                    assert!(on_dest, "{} matched {} but not its destination", pattern, src);
                }
            }
        }
    }
}
