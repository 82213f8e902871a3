//! Path translation between the local project and the remote interpreter
//!
//! Mappings are `(local_prefix, remote_prefix)` pairs over normalized
//! forward-slash paths; the longest matching prefix wins in both
//! directions. Mappings load from explicit config, an editor launch
//! configuration, or a compose file's volume mounts, with a synthesized
//! default so an active session always has at least one mapping.

use std::path::{Path, PathBuf};

use crate::common::config::PathMappingEntry;
use crate::common::Config;
use crate::dbgp::codec::decode_file_uri;

/// Default remote document root for containerized PHP interpreters
const DEFAULT_REMOTE_ROOT: &str = "/var/www/html";

/// Remote mount prefixes that are never project code
const SYSTEM_MOUNT_PREFIXES: &[&str] = &["/var/run", "/etc", "/sys", "/proc", "/dev", "/tmp"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub local: String,
    pub remote: String,
}

/// Bidirectional longest-prefix path translator
#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Sorted descending by remote prefix length at load time
    mappings: Vec<PathMapping>,
    project_root: PathBuf,
}

impl PathMapper {
    /// Load mappings by precedence: explicit config, launch.json,
    /// compose volumes, then the synthesized default
    pub fn load(config: &Config) -> Self {
        let project_root = config.project_root();

        let mut mappings = explicit_mappings(&config.path_mappings, &project_root);
        if mappings.is_empty() {
            mappings = launch_json_mappings(&project_root);
        }
        if mappings.is_empty() {
            mappings = compose_mappings(&project_root);
        }
        if mappings.is_empty() {
            mappings = vec![PathMapping {
                local: normalize(&project_root.to_string_lossy()),
                remote: DEFAULT_REMOTE_ROOT.to_string(),
            }];
            tracing::info!(
                remote = DEFAULT_REMOTE_ROOT,
                "no path mappings found, using default"
            );
        }

        mappings.retain(|m| !m.local.is_empty() && !m.remote.is_empty());
        mappings.sort_by(|a, b| b.remote.len().cmp(&a.remote.len()));
        for mapping in &mappings {
            tracing::debug!(local = %mapping.local, remote = %mapping.remote, "path mapping");
        }

        Self {
            mappings,
            project_root,
        }
    }

    /// Build a mapper from explicit pairs (used by tests)
    pub fn from_pairs(pairs: &[(&str, &str)], project_root: &Path) -> Self {
        let mut mappings: Vec<PathMapping> = pairs
            .iter()
            .map(|(local, remote)| PathMapping {
                local: normalize(local),
                remote: normalize(remote),
            })
            .collect();
        mappings.sort_by(|a, b| b.remote.len().cmp(&a.remote.len()));
        Self {
            mappings,
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    /// Translate a remote path or file URI to a local path
    pub fn to_local(&self, path: &str) -> String {
        let decoded = decode_file_uri(path);
        let normalized = normalize(&decoded);

        for mapping in &self.mappings {
            if let Some(suffix) = strip_path_prefix(&normalized, &mapping.remote) {
                return join_suffix(&mapping.local, suffix);
            }
        }
        normalized
    }

    /// Translate a local path (absolute or project-relative) to a remote path
    pub fn to_remote(&self, path: &str) -> String {
        let absolute = if is_absolute(path) {
            normalize(path)
        } else {
            normalize(&self.project_root.join(path).to_string_lossy())
        };

        let best = self
            .mappings
            .iter()
            .filter_map(|m| strip_path_prefix(&absolute, &m.local).map(|suffix| (m, suffix)))
            .max_by_key(|(m, _)| m.local.len());

        match best {
            Some((mapping, suffix)) => join_suffix(&mapping.remote, suffix),
            None => path.to_string(),
        }
    }

    /// Remote path as a file URI for breakpoint registration
    pub fn remote_uri(&self, local_path: &str) -> String {
        format!("file://{}", self.to_remote(local_path))
    }
}

fn explicit_mappings(entries: &[PathMappingEntry], project_root: &Path) -> Vec<PathMapping> {
    entries
        .iter()
        .map(|entry| PathMapping {
            local: resolve_local(&entry.local, project_root),
            remote: normalize(&entry.remote),
        })
        .collect()
}

/// Parse `.vscode/launch.json` for a PHP debug entry's `pathMappings`
///
/// Launch configurations routinely carry comments and trailing commas,
/// so the content is scrubbed before JSON parsing.
fn launch_json_mappings(project_root: &Path) -> Vec<PathMapping> {
    let path = project_root.join(".vscode").join("launch.json");
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&strip_jsonc(&content)) else {
        tracing::warn!(path = %path.display(), "unparseable launch.json, skipping");
        return Vec::new();
    };

    let configurations = value
        .get("configurations")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();

    for config in configurations {
        if config.get("type").and_then(|t| t.as_str()) != Some("php") {
            continue;
        }
        let Some(path_mappings) = config.get("pathMappings").and_then(|p| p.as_object()) else {
            continue;
        };
        let mappings: Vec<PathMapping> = path_mappings
            .iter()
            .filter_map(|(remote, local)| {
                let local = local.as_str()?;
                let local = local.replace("${workspaceFolder}", &project_root.to_string_lossy());
                Some(PathMapping {
                    local: resolve_local(&local, project_root),
                    remote: normalize(remote),
                })
            })
            .collect();
        if !mappings.is_empty() {
            tracing::info!(count = mappings.len(), "path mappings from launch.json");
            return mappings;
        }
    }
    Vec::new()
}

/// Parse a compose file's service `volumes:` bind mounts
fn compose_mappings(project_root: &Path) -> Vec<PathMapping> {
    let candidates = [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ];
    let Some(content) = candidates
        .iter()
        .find_map(|name| std::fs::read_to_string(project_root.join(name)).ok())
    else {
        return Vec::new();
    };
    let Ok(doc) = serde_yaml::from_str::<serde_yaml::Value>(&content) else {
        tracing::warn!("unparseable compose file, skipping");
        return Vec::new();
    };

    let mut mappings = Vec::new();
    let services = doc
        .get("services")
        .and_then(|s| s.as_mapping())
        .cloned()
        .unwrap_or_default();

    for (_, service) in services {
        let Some(volumes) = service.get("volumes").and_then(|v| v.as_sequence()) else {
            continue;
        };
        for volume in volumes {
            let Some(spec) = volume.as_str() else { continue };
            let mut parts = spec.splitn(3, ':');
            let (Some(local), Some(remote)) = (parts.next(), parts.next()) else {
                continue;
            };
            // Named volumes have a bare identifier on the left side
            if !local.starts_with('.') && !local.starts_with('/') {
                continue;
            }
            if SYSTEM_MOUNT_PREFIXES.iter().any(|p| remote.starts_with(p)) {
                continue;
            }
            mappings.push(PathMapping {
                local: resolve_local(local, project_root),
                remote: normalize(remote),
            });
        }
    }

    if !mappings.is_empty() {
        tracing::info!(count = mappings.len(), "path mappings from compose volumes");
    }
    mappings
}

/// Strip `//` and `/* */` comments plus trailing commas from JSON-with-comments
fn strip_jsonc(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == '/' && chars.get(i + 1) == Some(&'/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(chars.len());
        } else {
            out.push(c);
            i += 1;
        }
    }

    // Trailing commas before a closing bracket
    let mut cleaned = String::with_capacity(out.len());
    let chars: Vec<char> = out.chars().collect();
    for (idx, &c) in chars.iter().enumerate() {
        if c == ',' {
            let next = chars[idx + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        cleaned.push(c);
    }
    cleaned
}

fn resolve_local(path: &str, project_root: &Path) -> String {
    if is_absolute(path) {
        normalize(path)
    } else {
        normalize(&project_root.join(path).to_string_lossy())
    }
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
        || path.starts_with('\\')
        || path.chars().nth(1) == Some(':')
}

/// Normalize to forward slashes, collapse `.`/`..`, strip a trailing
/// separator (but never the root)
pub fn normalize(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().map_or(false, |p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Suffix of `path` after `prefix`, only at a path-component boundary
fn strip_path_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    if path == prefix {
        return Some("");
    }
    let rest = path.strip_prefix(prefix)?;
    if prefix.ends_with('/') || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn join_suffix(base: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return base.to_string();
    }
    let suffix = suffix.trim_start_matches('/');
    if base.ends_with('/') {
        format!("{base}{suffix}")
    } else {
        format!("{base}/{suffix}")
    }
}
