// Pacmesh - Cooperative LAN package cache daemon, redirecting misses to clustermates found over multicast
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Old-style package names carry no architecture component, so the same
    /// name means different bytes on different architectures.
    static ref OLDSKOOL: Regex = Regex::new(r".*-[0-9.]+\.pkg\.tar\.gz$").unwrap();
}

/// Read-only view over the ordered list of local package cache roots.
///
/// The caches themselves are populated by the package manager; this side
/// only ever resolves and reads.
pub struct PackageStore {
    cachedirs: Vec<PathBuf>,
}

impl PackageStore {
    pub fn new(cachedirs: Vec<PathBuf>) -> Self {
        Self { cachedirs }
    }

    /// Locate `pkgfile` in the cache roots, first match wins.
    ///
    /// Only plain file names resolve. Anything that could step outside a
    /// cache root (separators, dot components, symlinks escaping the root)
    /// is treated as absent, and an unreadable directory is skipped rather
    /// than aborting the scan.
    pub fn find_package(&self, pkgfile: &str) -> Option<PathBuf> {
        if !plain_file_name(pkgfile) {
            return None;
        }

        for dir in &self.cachedirs {
            let path = dir.join(pkgfile);

            match path.metadata() {
                Ok(meta) if meta.is_file() => (),
                _ => continue,
            }

            if contained_in(&path, dir) {
                return Some(path);
            }
        }

        None
    }

    /// There are certain things we don't want to ever share. These include
    /// databases, which are mutable per-host metadata, and old-style package
    /// names without an architecture. You may ask "why not use different
    /// ports per architecture?" If we did this, you'd get no benefit when it
    /// comes to arch=any packages, which is the whole idea of them.
    pub fn is_allowed(pkgfile: &str) -> bool {
        if pkgfile.ends_with(".db") || pkgfile.ends_with(".db.tar.gz") {
            return false;
        }

        !OLDSKOOL.is_match(pkgfile)
    }
}

fn plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\\')
}

/// A hit must still live under its root once symlinks are resolved.
fn contained_in(path: &Path, root: &Path) -> bool {
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(resolved), Ok(root)) => resolved.starts_with(root),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn first_root_in_order_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        fs::write(a.path().join("foo-1.0-1-x86_64.pkg.tar.xz"), b"from a").unwrap();
        fs::write(b.path().join("foo-1.0-1-x86_64.pkg.tar.xz"), b"from b").unwrap();

        let store = PackageStore::new(vec![a.path().into(), b.path().into()]);

        let hit = store.find_package("foo-1.0-1-x86_64.pkg.tar.xz").unwrap();

        assert_eq!(fs::read(hit).unwrap(), b"from a");
    }

    #[test]
    fn later_roots_are_scanned_on_miss() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        fs::write(b.path().join("foo-1.0-1-x86_64.pkg.tar.xz"), b"from b").unwrap();

        let store = PackageStore::new(vec![a.path().into(), b.path().into()]);

        assert!(store.find_package("foo-1.0-1-x86_64.pkg.tar.xz").is_some());
        assert!(store.find_package("missing-1.0-1-x86_64.pkg.tar.xz").is_none());
    }

    #[test]
    fn directories_are_not_hits() {
        let dir = tempfile::tempdir().unwrap();

        fs::create_dir(dir.path().join("foo-1.0-1-x86_64.pkg.tar.xz")).unwrap();

        let store = PackageStore::new(vec![dir.path().into()]);

        assert!(store.find_package("foo-1.0-1-x86_64.pkg.tar.xz").is_none());
    }

    #[test]
    fn path_escapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let store = PackageStore::new(vec![dir.path().into()]);

        assert!(store.find_package("").is_none());
        assert!(store.find_package(".").is_none());
        assert!(store.find_package("..").is_none());
        assert!(store.find_package("../etc/passwd").is_none());
        assert!(store.find_package("a/b.pkg.tar.xz").is_none());
        assert!(store.find_package("a\\b.pkg.tar.xz").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_escaping_the_root_are_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();

        fs::write(outside.path().join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret"),
            dir.path().join("evil-1.0-1-x86_64.pkg.tar.xz"),
        )
        .unwrap();

        let store = PackageStore::new(vec![dir.path().into()]);

        assert!(store.find_package("evil-1.0-1-x86_64.pkg.tar.xz").is_none());
    }

    #[test]
    fn share_policy() {
        assert!(!PackageStore::is_allowed("core.db"));
        assert!(!PackageStore::is_allowed("core.db.tar.gz"));
        assert!(!PackageStore::is_allowed("oldpkg-1.0.pkg.tar.gz"));

        assert!(PackageStore::is_allowed("bar-2-1-x86_64.pkg.tar.gz"));
        assert!(PackageStore::is_allowed("foo-1.0-1-x86_64.pkg.tar.xz"));
        assert!(PackageStore::is_allowed("tzdata-2021a-1-any.pkg.tar.zst"));
    }
}
