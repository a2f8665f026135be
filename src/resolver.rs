//! Locating an installed package inside the dependency tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::Result;
use crate::purl::Purl;

/// Maps a purl to the directory its package is installed in, if any.
pub trait PackageResolver: Send + Sync {
    fn resolve(&self, root: &Path, purl: &Purl) -> Result<Option<PathBuf>>;
}

/// Resolves `pkg:npm` purls inside `node_modules`, including nested installs.
#[derive(Debug, Clone, Default)]
pub struct NodeModulesResolver;

#[derive(Deserialize)]
struct PackageJson {
    name: Option<String>,
    version: Option<String>,
}

impl NodeModulesResolver {
    fn matches(dir: &Path, name: &str, version: Option<&str>) -> bool {
        let manifest = dir.join("package.json");
        let Ok(text) = std::fs::read_to_string(&manifest) else {
            return false;
        };
        let Ok(pkg) = serde_json::from_str::<PackageJson>(&text) else {
            trace!(path = %manifest.display(), "unreadable package.json");
            return false;
        };
        let name_ok = pkg.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name));
        let version_ok = match version {
            Some(v) => pkg.version.as_deref() == Some(v),
            None => true,
        };
        name_ok && version_ok
    }

    /// Child directories of `dir`. Symlinked directories count, reported under their link path.
    fn child_dirs(dir: &Path) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
    }

    /// The `node_modules` directories one install level below `modules`: inside
    /// each package, each package of a scope, and each `.pnpm` store entry.
    fn nested_modules(modules: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for child in Self::child_dirs(modules) {
            let name = child
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let packages: Vec<PathBuf> = if name.starts_with('@') || name == ".pnpm" {
                Self::child_dirs(&child).collect()
            } else if name.starts_with('.') {
                continue;
            } else {
                vec![child]
            };
            out.extend(
                packages
                    .into_iter()
                    .map(|p| p.join("node_modules"))
                    .filter(|p| p.is_dir()),
            );
        }
        out
    }
}

impl PackageResolver for NodeModulesResolver {
    fn resolve(&self, root: &Path, purl: &Purl) -> Result<Option<PathBuf>> {
        if purl.ty != "npm" {
            return Ok(None);
        }
        let name = purl.package_name();
        let version = purl.version.as_deref();
        let top = root.join("node_modules");
        if !top.is_dir() {
            return Ok(None);
        }

        // Breadth-first over install levels, so the shallowest install wins.
        let mut queue = VecDeque::from([top]);
        let mut seen = HashSet::new();
        while let Some(modules) = queue.pop_front() {
            let key = modules.canonicalize().unwrap_or_else(|_| modules.clone());
            if !seen.insert(key) {
                continue;
            }
            let candidate = modules.join(&name);
            if Self::matches(&candidate, &name, version) {
                debug!(%purl, path = %candidate.display(), "resolved package");
                return Ok(Some(candidate));
            }
            queue.extend(Self::nested_modules(&modules));
        }
        Ok(None)
    }
}

/// Resolves purls from an explicit table. Paths are relative to the root unless absolute.
#[derive(Debug, Clone, Default)]
pub struct FixedResolver {
    paths: HashMap<String, PathBuf>,
}

impl FixedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, purl: &str, path: impl Into<PathBuf>) -> Self {
        let key = crate::purl::normalize(purl).unwrap_or_else(|_| purl.to_string());
        self.paths.insert(key, path.into());
        self
    }
}

impl PackageResolver for FixedResolver {
    fn resolve(&self, root: &Path, purl: &Purl) -> Result<Option<PathBuf>> {
        Ok(self
            .paths
            .get(&purl.to_string())
            .map(|p| root.join(p))
            .filter(|p| p.is_dir()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(root: &Path, rel: &str, name: &str, version: &str) {
        let dir = root.join(rel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("package.json"),
            format!(r#"{{"name":"{}","version":"{}"}}"#, name, version),
        )
        .unwrap();
    }

    #[test]
    fn test_resolves_top_level_package() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "node_modules/on-headers", "on-headers", "1.0.2");
        let purl = Purl::parse("pkg:npm/on-headers@1.0.2").unwrap();
        let found = NodeModulesResolver.resolve(dir.path(), &purl).unwrap();
        assert_eq!(found, Some(dir.path().join("node_modules/on-headers")));
    }

    #[test]
    fn test_version_mismatch_falls_back_to_nested() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "node_modules/debug", "debug", "4.0.0");
        install(dir.path(), "node_modules/express", "express", "4.18.0");
        install(dir.path(), "node_modules/express/node_modules/debug", "debug", "2.6.9");

        let purl = Purl::parse("pkg:npm/debug@2.6.9").unwrap();
        let found = NodeModulesResolver.resolve(dir.path(), &purl).unwrap();
        assert_eq!(
            found,
            Some(dir.path().join("node_modules/express/node_modules/debug"))
        );

        let absent = Purl::parse("pkg:npm/debug@1.0.0").unwrap();
        assert_eq!(NodeModulesResolver.resolve(dir.path(), &absent).unwrap(), None);
    }

    #[test]
    fn test_scoped_package() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "node_modules/@babel/core", "@babel/core", "7.0.0");
        let purl = Purl::parse("pkg:npm/%40babel/core@7.0.0").unwrap();
        assert!(NodeModulesResolver.resolve(dir.path(), &purl).unwrap().is_some());
    }

    #[test]
    fn test_pnpm_store_layout() {
        let dir = tempfile::tempdir().unwrap();
        install(
            dir.path(),
            "node_modules/.pnpm/qs@6.5.2/node_modules/qs",
            "qs",
            "6.5.2",
        );
        let purl = Purl::parse("pkg:npm/qs@6.5.2").unwrap();
        assert_eq!(
            NodeModulesResolver.resolve(dir.path(), &purl).unwrap(),
            Some(dir.path().join("node_modules/.pnpm/qs@6.5.2/node_modules/qs"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_package_is_resolved() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "packages/shared", "shared", "0.1.0");
        install(dir.path(), "packages/shared/node_modules/ms", "ms", "2.0.0");
        std::fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("packages/shared"),
            dir.path().join("node_modules/shared"),
        )
        .unwrap();

        let shared = Purl::parse("pkg:npm/shared@0.1.0").unwrap();
        assert_eq!(
            NodeModulesResolver.resolve(dir.path(), &shared).unwrap(),
            Some(dir.path().join("node_modules/shared"))
        );
        let ms = Purl::parse("pkg:npm/ms@2.0.0").unwrap();
        assert_eq!(
            NodeModulesResolver.resolve(dir.path(), &ms).unwrap(),
            Some(dir.path().join("node_modules/shared/node_modules/ms"))
        );
    }

    #[test]
    fn test_package_sources_are_not_searched() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "node_modules/express", "express", "4.18.0");
        install(
            dir.path(),
            "node_modules/express/test/fixtures/node_modules/debug",
            "debug",
            "2.6.9",
        );
        let purl = Purl::parse("pkg:npm/debug@2.6.9").unwrap();
        assert_eq!(NodeModulesResolver.resolve(dir.path(), &purl).unwrap(), None);
    }

    #[test]
    fn test_non_npm_is_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let purl = Purl::parse("pkg:pypi/requests@2.0.0").unwrap();
        assert_eq!(NodeModulesResolver.resolve(dir.path(), &purl).unwrap(), None);
    }

    #[test]
    fn test_fixed_resolver_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/a")).unwrap();
        let resolver = FixedResolver::new()
            .with("pkg:npm/a@1.0.0", "vendor/a")
            .with("pkg:npm/b@1.0.0", "vendor/b");
        let a = Purl::parse("pkg:npm/a@1.0.0").unwrap();
        let b = Purl::parse("pkg:npm/b@1.0.0").unwrap();
        assert_eq!(resolver.resolve(dir.path(), &a).unwrap(), Some(dir.path().join("vendor/a")));
        assert_eq!(resolver.resolve(dir.path(), &b).unwrap(), None);
    }
}
