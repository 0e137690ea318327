//! Dependency resolution.
//!
//! [`resolve`] walks the declared dependencies of a package depth-first,
//! asking each configured [`DependencySource`] for candidates, and returns
//! a topologically ordered, duplicate-free list. Build-only dependencies are
//! visited first so they precede everything that needs them; transitive
//! requirements precede their dependents.
//!
//! Resolution never fetches anything. Sources only describe what is already
//! present (a local store, tools on `PATH`, or in-memory metadata).

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use hearth_schema::{Dependency, PackageName, PackageSpec, Phase};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// A dependency that could not be satisfied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unresolved dependency '{name}': {reason}")]
pub struct UnresolvedDependency {
    /// Dependency name.
    pub name: PackageName,
    /// Why it could not be resolved.
    pub reason: String,
}

/// One installed candidate for a dependency, as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Version, when the source can tell.
    pub version: Option<semver::Version>,
    /// Install prefix (`bin/`, `lib/`, `include/` live below it).
    pub prefix: Option<PathBuf>,
    /// Directory holding the dependency's executables.
    pub bin_dir: Option<PathBuf>,
    /// Further dependencies this candidate needs.
    pub requires: Vec<Dependency>,
    /// Set when the candidate's metadata could not be read; such a
    /// candidate is never selected.
    pub defect: Option<String>,
}

/// Somewhere dependencies can be found.
pub trait DependencySource: fmt::Debug + Send + Sync {
    /// Short label used in diagnostics.
    fn label(&self) -> &str;

    /// All candidates for `dep`'s name. Filtering by version happens in the
    /// resolver.
    fn candidates(&self, dep: &Dependency) -> Vec<Candidate>;
}

/// A dependency after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDependency {
    /// Dependency name.
    pub name: PackageName,
    /// Resolved version, if known.
    pub version: Option<semver::Version>,
    /// Effective phase. A dependency needed in both phases is `Runtime`.
    pub phase: Phase,
    /// Install prefix, if the source provides one.
    pub prefix: Option<PathBuf>,
    /// Directory holding the dependency's executables.
    pub bin_dir: Option<PathBuf>,
    /// Label of the source that satisfied it.
    pub source: String,
}

impl fmt::Display for ResolvedDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(v) = &self.version {
            write!(f, " {v}")?;
        }
        write!(f, " ({}, {})", self.phase, self.source)
    }
}

/// Resolve every dependency of `spec` against `sources`, tried in order.
///
/// # Errors
///
/// Returns [`UnresolvedDependency`] if a dependency has no satisfying
/// candidate in any source, if two requirements on the same name conflict,
/// or if the dependency graph contains a cycle.
pub fn resolve(
    spec: &PackageSpec,
    sources: &[&dyn DependencySource],
) -> Result<Vec<ResolvedDependency>, UnresolvedDependency> {
    let mut roots: Vec<&Dependency> = spec.dependencies().iter().collect();
    // Stable: keeps declaration order inside each phase.
    roots.sort_by_key(|d| d.phase);

    let mut walk = Walk {
        sources,
        order: Vec::new(),
        index: HashMap::new(),
        requires: Vec::new(),
        visiting: Vec::new(),
    };
    for dep in roots {
        walk.visit(dep, dep.phase)?;
    }

    debug!(package = %spec.name(), count = walk.order.len(), "resolved dependencies");
    Ok(walk.order)
}

struct Walk<'a> {
    sources: &'a [&'a dyn DependencySource],
    order: Vec<ResolvedDependency>,
    index: HashMap<PackageName, usize>,
    /// Requirements of `order[i]`, kept for phase promotion.
    requires: Vec<Vec<Dependency>>,
    visiting: Vec<PackageName>,
}

impl Walk<'_> {
    fn visit(&mut self, dep: &Dependency, phase: Phase) -> Result<(), UnresolvedDependency> {
        if let Some(&i) = self.index.get(&dep.name) {
            let existing = &self.order[i];
            if !dep.accepts(existing.version.as_ref()) {
                return Err(UnresolvedDependency {
                    name: dep.name.clone(),
                    reason: format!(
                        "already resolved to {} which does not satisfy '{dep}'",
                        existing
                            .version
                            .as_ref()
                            .map_or_else(|| "an unversioned tool".to_string(), ToString::to_string)
                    ),
                });
            }
            if phase == Phase::Runtime {
                self.promote(i);
            }
            return Ok(());
        }

        if let Some(pos) = self.visiting.iter().position(|n| *n == dep.name) {
            let mut cycle: Vec<&str> = self.visiting[pos..].iter().map(|n| n.as_str()).collect();
            cycle.push(dep.name.as_str());
            return Err(UnresolvedDependency {
                name: dep.name.clone(),
                reason: format!("dependency cycle: {}", cycle.join(" -> ")),
            });
        }

        let (candidate, source) = self.locate(dep)?;
        trace!(dependency = %dep.name, %source, "located");

        self.visiting.push(dep.name.clone());
        for req in &candidate.requires {
            // Whatever a build tool needs is itself only needed to build.
            let inherited = if phase == Phase::BuildOnly {
                Phase::BuildOnly
            } else {
                req.phase
            };
            self.visit(req, inherited)?;
        }
        self.visiting.pop();

        self.index.insert(dep.name.clone(), self.order.len());
        self.requires.push(candidate.requires);
        self.order.push(ResolvedDependency {
            name: dep.name.clone(),
            version: candidate.version,
            phase,
            prefix: candidate.prefix,
            bin_dir: candidate.bin_dir,
            source,
        });
        Ok(())
    }

    /// Mark `order[i]` as a runtime dependency, along with everything it
    /// needs at runtime.
    fn promote(&mut self, i: usize) {
        if self.order[i].phase == Phase::Runtime {
            return;
        }
        self.order[i].phase = Phase::Runtime;
        let needed: Vec<usize> = self.requires[i]
            .iter()
            .filter(|r| r.phase == Phase::Runtime)
            .filter_map(|r| self.index.get(&r.name).copied())
            .collect();
        for j in needed {
            self.promote(j);
        }
    }

    fn locate(&self, dep: &Dependency) -> Result<(Candidate, String), UnresolvedDependency> {
        let mut rejected: Vec<String> = Vec::new();

        for source in self.sources {
            let candidates = source.candidates(dep);
            let best = candidates
                .iter()
                .filter(|c| c.defect.is_none() && dep.accepts(c.version.as_ref()))
                .max_by(|a, b| a.version.cmp(&b.version));

            if let Some(best) = best {
                return Ok((best.clone(), source.label().to_string()));
            }
            for c in &candidates {
                let version = c
                    .version
                    .as_ref()
                    .map_or_else(|| "unknown version".to_string(), ToString::to_string);
                rejected.push(match &c.defect {
                    Some(defect) => format!("{version} in {}: {defect}", source.label()),
                    None => format!("{version} in {}", source.label()),
                });
            }
        }

        let reason = if rejected.is_empty() {
            let labels: Vec<&str> = self.sources.iter().map(|s| s.label()).collect();
            format!("not found in any source ({})", labels.join(", "))
        } else {
            format!("no candidate satisfies '{dep}' (found {})", rejected.join(", "))
        };
        Err(UnresolvedDependency {
            name: dep.name.clone(),
            reason,
        })
    }
}

/// Parse a version leniently: `3` → `3.0.0`, `v2.12` → `2.12.0`.
pub fn parse_lenient(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(raw) {
        return Some(v);
    }
    let (core, rest) = match raw.find(['-', '+']) {
        Some(i) => raw.split_at(i),
        None => (raw, ""),
    };
    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    semver::Version::parse(&format!("{padded}{rest}")).ok()
}

/// Dependencies installed in a local store laid out as
/// `<root>/<name>/<version>/`.
///
/// A version directory may contain a `deps.toml` with
/// `runtime = ["zlib", ...]` listing what that version needs.
#[derive(Debug, Clone)]
pub struct StoreSource {
    root: PathBuf,
    label: String,
}

#[derive(Debug, Default, Deserialize)]
struct StoreDeps {
    #[serde(default)]
    runtime: Vec<String>,
}

impl StoreSource {
    /// A store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let label = format!("store {}", root.display());
        Self { root, label }
    }

    /// Runtime requirements listed in `version_dir/deps.toml`. A missing
    /// file means no requirements; an unreadable or malformed one is an
    /// error.
    fn read_requires(version_dir: &Path) -> Result<Vec<Dependency>, String> {
        let path = version_dir.join("deps.toml");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(format!("cannot read {}: {e}", path.display())),
        };
        let parsed: StoreDeps = toml::from_str(&content)
            .map_err(|e| format!("malformed {}: {}", path.display(), e.message()))?;
        parsed
            .runtime
            .iter()
            .map(|d| {
                Dependency::parse(d, Phase::Runtime)
                    .map_err(|e| format!("bad entry in {}: {e}", path.display()))
            })
            .collect()
    }
}

impl DependencySource for StoreSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn candidates(&self, dep: &Dependency) -> Vec<Candidate> {
        let Ok(entries) = std::fs::read_dir(self.root.join(dep.name.as_str())) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(version) = path.file_name().and_then(|n| n.to_str()).and_then(parse_lenient)
            else {
                continue;
            };
            let bin = path.join("bin");
            let (requires, defect) = match Self::read_requires(&path) {
                Ok(requires) => (requires, None),
                Err(defect) => {
                    warn!(%defect, "skipping store entry");
                    (Vec::new(), Some(defect))
                }
            };
            out.push(Candidate {
                version: Some(version),
                bin_dir: bin.is_dir().then_some(bin),
                requires,
                defect,
                prefix: Some(path),
            });
        }
        out
    }
}

/// Tools already available on `PATH`.
///
/// When a dependency carries a version requirement the tool is asked for
/// `--version` and the first version-looking token is used.
#[derive(Debug, Clone, Default)]
pub struct PathSource;

impl PathSource {
    fn query_version(tool: &Path) -> Option<semver::Version> {
        let output = Command::new(tool)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        extract_version(&text).or_else(|| extract_version(&String::from_utf8_lossy(&output.stderr)))
    }
}

impl DependencySource for PathSource {
    fn label(&self) -> &str {
        "PATH"
    }

    fn candidates(&self, dep: &Dependency) -> Vec<Candidate> {
        let Ok(tool) = which::which(dep.name.as_str()) else {
            return Vec::new();
        };
        let version = if dep.requirement.is_some() {
            Self::query_version(&tool)
        } else {
            None
        };
        vec![Candidate {
            version,
            prefix: None,
            bin_dir: tool.parent().map(Path::to_path_buf),
            requires: Vec::new(),
            defect: None,
        }]
    }
}

/// First token in `text` that parses as a version.
fn extract_version(text: &str) -> Option<semver::Version> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit() || c == 'v'))
        .find_map(parse_lenient)
}

/// In-memory dependency metadata.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: HashMap<PackageName, Vec<Candidate>>,
}

impl MemorySource {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate `name` at `version` requiring `requires`
    /// (runtime declarations, `name` or `name@req`; malformed ones are
    /// skipped).
    pub fn with(mut self, name: &str, version: Option<&str>, requires: &[&str]) -> Self {
        let requires = requires
            .iter()
            .filter_map(|r| Dependency::parse(r, Phase::Runtime).ok())
            .collect();
        self.entries
            .entry(PackageName::new(name))
            .or_default()
            .push(Candidate {
                version: version.and_then(parse_lenient),
                prefix: None,
                bin_dir: None,
                requires,
                defect: None,
            });
        self
    }
}

impl DependencySource for MemorySource {
    fn label(&self) -> &str {
        "memory"
    }

    fn candidates(&self, dep: &Dependency) -> Vec<Candidate> {
        self.entries.get(&dep.name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn spec_with(build: &[&str], runtime: &[&str]) -> PackageSpec {
        let list = |items: &[&str]| {
            items
                .iter()
                .map(|i| format!("\"{i}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let content = format!(
            "[package]\nname = \"demo\"\n[source]\nurl = \"https://example.com/demo.git\"\n\
             [dependencies]\nbuild = [{}]\nruntime = [{}]\n",
            list(build),
            list(runtime)
        );
        PackageSpec::parse(&content).unwrap()
    }

    fn names(resolved: &[ResolvedDependency]) -> Vec<&str> {
        resolved.iter().map(|r| r.name.as_str()).collect()
    }

    fn position(resolved: &[ResolvedDependency], name: &str) -> usize {
        resolved.iter().position(|r| r.name == name).unwrap()
    }

    #[test]
    fn test_build_only_before_runtime() {
        let source = MemorySource::new()
            .with("toolA", Some("1.0.0"), &[])
            .with("libB", Some("2.0.0"), &[]);
        let spec = spec_with(&["toolA"], &["libB"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(names(&resolved), vec!["toola", "libb"]);
        assert_eq!(resolved[0].phase, Phase::BuildOnly);
        assert_eq!(resolved[1].phase, Phase::Runtime);
    }

    #[test]
    fn test_build_deps_first_even_if_declared_later() {
        let source = MemorySource::new()
            .with("curl", None, &[])
            .with("cmake", None, &[]);
        let spec = PackageSpec::parse(
            "[package]\nname = \"demo\"\n[source]\nurl = \"https://example.com/demo.git\"\n\
             [dependencies]\nruntime = [\"curl\"]\nbuild = [\"cmake\"]\n",
        )
        .unwrap();

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(names(&resolved), vec!["cmake", "curl"]);
    }

    #[test]
    fn test_transitive_before_dependent() {
        let source = MemorySource::new()
            .with("curl", Some("8.0.0"), &["openssl@3", "zlib"])
            .with("openssl", Some("3.2.0"), &["zlib"])
            .with("zlib", Some("1.3.0"), &[]);
        let spec = spec_with(&[], &["curl"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert!(position(&resolved, "zlib") < position(&resolved, "openssl"));
        assert!(position(&resolved, "openssl") < position(&resolved, "curl"));
    }

    #[test]
    fn test_no_duplicates() {
        let source = MemorySource::new()
            .with("a", None, &["c"])
            .with("b", None, &["c"])
            .with("c", None, &[]);
        let spec = spec_with(&["a", "c"], &["b", "a"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        let unique: HashSet<&str> = names(&resolved).into_iter().collect();
        assert_eq!(unique.len(), resolved.len());
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn test_dependency_in_both_phases_is_runtime() {
        let source = MemorySource::new().with("pcre2", None, &[]);
        let spec = spec_with(&["pcre2"], &["pcre2"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].phase, Phase::Runtime);
    }

    #[test]
    fn test_runtime_promotion_reaches_transitive_deps() {
        let source = MemorySource::new()
            .with("curl", None, &["openssl"])
            .with("openssl", None, &["zlib"])
            .with("zlib", None, &[]);
        let spec = spec_with(&["curl"], &["curl"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(names(&resolved), vec!["zlib", "openssl", "curl"]);
        assert!(resolved.iter().all(|r| r.phase == Phase::Runtime));
    }

    #[test]
    fn test_tool_requirements_stay_build_only() {
        let source = MemorySource::new()
            .with("conan", Some("2.9.0"), &["python"])
            .with("python", Some("3.12.0"), &[]);
        let spec = spec_with(&["conan@2"], &[]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(names(&resolved), vec!["python", "conan"]);
        assert!(resolved.iter().all(|r| r.phase == Phase::BuildOnly));
    }

    #[test]
    fn test_missing_dependency() {
        let source = MemorySource::new();
        let spec = spec_with(&[], &["libB"]);

        let err = resolve(&spec, &[&source]).unwrap_err();
        assert_eq!(err.name, "libb");
        assert!(err.reason.contains("not found"));
    }

    #[test]
    fn test_version_mismatch() {
        let source = MemorySource::new().with("openssl", Some("1.1.1"), &[]);
        let spec = spec_with(&[], &["openssl@3"]);

        let err = resolve(&spec, &[&source]).unwrap_err();
        assert!(err.reason.contains("no candidate satisfies"));
        assert!(err.reason.contains("1.1.1"));
    }

    #[test]
    fn test_highest_satisfying_version_wins() {
        let source = MemorySource::new()
            .with("openssl", Some("3.0.0"), &[])
            .with("openssl", Some("3.2.1"), &[])
            .with("openssl", Some("4.0.0"), &[]);
        let spec = spec_with(&[], &["openssl@3"]);

        let resolved = resolve(&spec, &[&source]).unwrap();
        assert_eq!(resolved[0].version, Some(semver::Version::new(3, 2, 1)));
    }

    #[test]
    fn test_later_source_used_as_fallback() {
        let first = MemorySource::new().with("cmake", Some("3.10.0"), &[]);
        let second = MemorySource::new().with("cmake", Some("4.1.0"), &[]);
        let spec = spec_with(&["cmake@>=3.20"], &[]);

        let resolved = resolve(&spec, &[&first, &second]).unwrap();
        assert_eq!(resolved[0].version, Some(semver::Version::new(4, 1, 0)));
    }

    #[test]
    fn test_cycle_detection() {
        let source = MemorySource::new()
            .with("a", None, &["b"])
            .with("b", None, &["a"]);
        let spec = spec_with(&[], &["a"]);

        let err = resolve(&spec, &[&source]).unwrap_err();
        assert!(err.reason.contains("dependency cycle: a -> b -> a"));
    }

    #[test]
    fn test_conflicting_requirements() {
        let source = MemorySource::new()
            .with("curl", None, &["openssl@1"])
            .with("openssl", Some("1.1.1"), &[]);
        let spec = spec_with(&[], &["curl", "openssl@3"]);

        let err = resolve(&spec, &[&source]).unwrap_err();
        assert_eq!(err.name, "openssl");
        assert!(err.reason.contains("already resolved"));
    }

    #[test]
    fn test_store_source() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("openssl/3.2.1/lib")).unwrap();
        std::fs::create_dir_all(root.path().join("openssl/1.1.1")).unwrap();
        std::fs::create_dir_all(root.path().join("zlib/1.3/bin")).unwrap();
        std::fs::write(
            root.path().join("openssl/3.2.1/deps.toml"),
            "runtime = [\"zlib\"]\n",
        )
        .unwrap();

        let store = StoreSource::new(root.path());
        let spec = spec_with(&[], &["openssl@3"]);
        let resolved = resolve(&spec, &[&store]).unwrap();

        assert_eq!(names(&resolved), vec!["zlib", "openssl"]);
        assert_eq!(resolved[0].version, Some(semver::Version::new(1, 3, 0)));
        assert_eq!(resolved[0].bin_dir, Some(root.path().join("zlib/1.3/bin")));
        assert_eq!(resolved[1].prefix, Some(root.path().join("openssl/3.2.1")));
    }

    #[test]
    fn test_store_entry_with_malformed_deps_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("openssl/3.2.1")).unwrap();
        std::fs::create_dir_all(root.path().join("openssl/3.0.0")).unwrap();
        std::fs::write(root.path().join("openssl/3.2.1/deps.toml"), "runtime = [zlib\n").unwrap();

        let store = StoreSource::new(root.path());
        let spec = spec_with(&[], &["openssl@3"]);
        let resolved = resolve(&spec, &[&store]).unwrap();

        assert_eq!(names(&resolved), vec!["openssl"]);
        assert_eq!(resolved[0].version, Some(semver::Version::new(3, 0, 0)));
    }

    #[test]
    fn test_store_bad_deps_entry_reported() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("openssl/3.2.1")).unwrap();
        std::fs::write(
            root.path().join("openssl/3.2.1/deps.toml"),
            "runtime = [\"@3\"]\n",
        )
        .unwrap();

        let store = StoreSource::new(root.path());
        let spec = spec_with(&[], &["openssl"]);
        let err = resolve(&spec, &[&store]).unwrap_err();

        assert_eq!(err.name, "openssl");
        assert!(err.reason.contains("3.2.1"));
        assert!(err.reason.contains("bad entry"));
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(parse_lenient("3"), Some(semver::Version::new(3, 0, 0)));
        assert_eq!(parse_lenient("v2.12"), Some(semver::Version::new(2, 12, 0)));
        assert_eq!(parse_lenient("1.13.2"), Some(semver::Version::new(1, 13, 2)));
        assert!(parse_lenient("1.2.3-beta.1").is_some());
        assert_eq!(parse_lenient("main"), None);
        assert_eq!(parse_lenient("1..2"), None);
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(
            extract_version("cmake version 4.1.0\n\nCMake suite maintained"),
            Some(semver::Version::new(4, 1, 0))
        );
        assert_eq!(
            extract_version("Conan version 2.9.1"),
            Some(semver::Version::new(2, 9, 1))
        );
        assert_eq!(extract_version("1.13.2"), Some(semver::Version::new(1, 13, 2)));
        assert_eq!(extract_version("no version here"), None);
    }
}
