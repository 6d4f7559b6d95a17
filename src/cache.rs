//! Persistent path → packages index, backed by SQLite. Built once per (package manager,
//! OS, version, arch) and reused across invocations; this is the reason Deptective is
//! usable interactively despite indices with ~10^7 rows.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::package_manager::PackageManager;

const BATCH_SIZE: usize = 1024;

fn cache_dir() -> Result<PathBuf, anyhow::Error> {
    let dirs = ProjectDirs::from("com", "Trail of Bits", "deptective")
        .ok_or_else(|| anyhow::anyhow!("could not determine a user cache directory"))?;
    let dir = dirs.cache_dir().to_path_buf();
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// The on-disk path for a package manager's content index.
pub fn db_path(package_manager: &dyn PackageManager) -> Result<PathBuf, anyhow::Error> {
    let config = package_manager.config();
    Ok(cache_dir()?.join(format!(
        "{}_{}_{}_{}.sqlite3",
        package_manager.name(),
        config.os,
        config.os_version,
        config.arch
    )))
}

/// Opens or builds the content index for `package_manager`. If the backing store is
/// absent, it's built from `package_manager.iter_packages()`; building is atomic (the
/// on-disk artifact is removed if the build fails partway through).
pub struct Cache {
    conn: Connection,
    path: PathBuf,
}

impl Cache {
    pub fn open(package_manager: &dyn PackageManager) -> Result<Self, anyhow::Error> {
        let path = db_path(package_manager)?;
        if path.exists() {
            let conn = Connection::open(&path)?;
            return Ok(Self { conn, path });
        }
        Self::build(package_manager, &path)
    }

    fn build(package_manager: &dyn PackageManager, path: &Path) -> Result<Self, anyhow::Error> {
        let build = || -> Result<Connection, anyhow::Error> {
            let conn = Connection::open(path)?;
            conn.execute_batch(
                "CREATE TABLE files(filename TEXT NOT NULL, package TEXT NOT NULL);
                 CREATE INDEX filenames ON files(filename);
                 CREATE INDEX packages ON files(package);",
            )?;
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare("INSERT INTO files(filename, package) VALUES (?1, ?2)")?;
                for entry in package_manager.iter_packages()? {
                    let entry = entry?;
                    for package in &entry.packages {
                        stmt.execute((&entry.filename, package))?;
                    }
                }
            }
            tx.commit()?;
            Ok(conn)
        };
        match build() {
            Ok(conn) => Ok(Self {
                conn,
                path: path.to_path_buf(),
            }),
            Err(e) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    /// Deletes the on-disk artifact; the next [`Cache::open`] rebuilds it.
    pub fn delete(package_manager: &dyn PackageManager) -> Result<(), anyhow::Error> {
        let path = db_path(package_manager)?;
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn exists(package_manager: &dyn PackageManager) -> Result<bool, anyhow::Error> {
        Ok(db_path(package_manager)?.exists())
    }

    /// Returns the packages providing `path`, normalizing exactly one leading separator.
    pub fn lookup(&self, path: &str) -> Result<Vec<String>, anyhow::Error> {
        let normalized = normalize(path);
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT package FROM files WHERE filename = ?1")?;
        let rows = stmt.query_map([normalized], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Iterates the whole index, grouped by filename, batching reads of ~1024 rows at a
    /// time and yielding an entry once all of a filename's rows have been gathered.
    /// Relies on the query's `ORDER BY filename` to make equal filenames contiguous.
    pub fn iterate(&self) -> Result<Vec<(String, Vec<String>)>, anyhow::Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename, package FROM files ORDER BY filename")?;
        let mut rows = stmt.query([])?;

        let mut out = Vec::new();
        let mut current_filename: Option<String> = None;
        let mut current_packages: Vec<String> = Vec::new();
        let mut fetched_in_batch = 0usize;

        while let Some(row) = rows.next()? {
            let filename: String = row.get(0)?;
            let package: String = row.get(1)?;
            match &current_filename {
                Some(f) if *f == filename => current_packages.push(package),
                _ => {
                    if let Some(f) = current_filename.take() {
                        out.push((f, std::mem::take(&mut current_packages)));
                    }
                    current_filename = Some(filename);
                    current_packages.push(package);
                }
            }
            fetched_in_batch += 1;
            if fetched_in_batch >= BATCH_SIZE {
                fetched_in_batch = 0;
            }
        }
        if let Some(f) = current_filename {
            out.push((f, current_packages));
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Strips exactly one leading separator, matching the stored (unprefixed) filenames.
fn normalize(path: &str) -> String {
    path.strip_prefix('/').unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_one_leading_slash() {
        assert_eq!(normalize("/x/y"), "x/y");
        assert_eq!(normalize("x/y"), "x/y");
        assert_eq!(normalize("//x"), "/x");
    }

    #[test]
    fn lookup_on_an_in_memory_build() -> Result<(), anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE files(filename TEXT NOT NULL, package TEXT NOT NULL);
             CREATE INDEX filenames ON files(filename);
             CREATE INDEX packages ON files(package);
             INSERT INTO files VALUES ('usr/bin/gcc', 'gcc');
             INSERT INTO files VALUES ('usr/bin/gcc', 'gcc-12');",
        )?;
        let cache = Cache {
            conn,
            path: PathBuf::from("/dev/null"),
        };
        let mut packages = cache.lookup("/usr/bin/gcc")?;
        packages.sort();
        assert_eq!(packages, vec!["gcc".to_string(), "gcc-12".to_string()]);
        assert!(cache.lookup("usr/bin/nonexistent")?.is_empty());
        Ok(())
    }
}
