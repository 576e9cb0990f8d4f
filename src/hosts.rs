//! Hosts-file synchronizer
//!
//! Maps every tunnel's local hostname to loopback in the system hosts file so
//! tunnels are reachable by name, and removes those entries on cleanup.
//! Failures abort startup but are only logged at cleanup time; the supervisor
//! decides which applies.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum HostsError {
    #[error("Failed to read hosts file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write hosts file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

const LOOPBACK: &str = "127.0.0.1";

pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    /// The platform hosts file.
    pub fn system() -> Self {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts");
        #[cfg(not(windows))]
        let path = PathBuf::from("/etc/hosts");
        Self { path }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ensure every hostname resolves to loopback. Idempotent: hostnames
    /// already mapped anywhere in the file are left alone.
    pub fn add_loopback_aliases<'a, I>(&self, hostnames: I) -> Result<(), HostsError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut contents = self.read()?;
        let mut changed = false;

        for hostname in hostnames {
            if contents.lines().any(|line| line_maps(line, hostname)) {
                debug!("{hostname} already present in {}", self.path.display());
                continue;
            }
            if !contents.is_empty() && !contents.ends_with('\n') {
                contents.push('\n');
            }
            contents.push_str(&format!("{LOOPBACK}\t{hostname}\n"));
            changed = true;
            debug!("Added {LOOPBACK} {hostname} to {}", self.path.display());
        }

        if changed {
            self.write(&contents)?;
        }
        Ok(())
    }

    /// Remove every mapping of the given hostnames. Lines that map other
    /// names as well keep those names; lines left empty are dropped.
    pub fn remove_loopback_aliases<'a, I>(&self, hostnames: I) -> Result<(), HostsError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let names: Vec<&str> = hostnames.into_iter().collect();
        let contents = self.read()?;
        let mut out = String::with_capacity(contents.len());
        let mut changed = false;

        for line in contents.lines() {
            match strip_names(line, &names) {
                Some(kept) => {
                    if kept != line {
                        changed = true;
                    }
                    if !kept.is_empty() {
                        out.push_str(&kept);
                        out.push('\n');
                    }
                }
                None => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }

        if changed {
            self.write(&out)?;
        }
        Ok(())
    }

    fn read(&self) -> Result<String, HostsError> {
        std::fs::read_to_string(&self.path).map_err(|source| HostsError::Read {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the hosts file atomically: write a sibling temp file, carry
    /// over the original permissions, then rename it into place. A failure
    /// partway through leaves the original untouched.
    fn write(&self, contents: &str) -> Result<(), HostsError> {
        let write_err = |source: std::io::Error| HostsError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(contents.as_bytes()).map_err(write_err)?;
        // The temp file is created mode 0600; the hosts file must stay
        // world-readable.
        if let Ok(meta) = std::fs::metadata(&self.path) {
            tmp.as_file().set_permissions(meta.permissions()).map_err(write_err)?;
        }
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// True if `line` is an active entry mapping `hostname`.
fn line_maps(line: &str, hostname: &str) -> bool {
    let line = line.split('#').next().unwrap_or("");
    let mut fields = line.split_whitespace();
    let Some(_address) = fields.next() else {
        return false;
    };
    fields.any(|name| name.eq_ignore_ascii_case(hostname))
}

/// Remove `names` from an entry line. Returns the rewritten line (possibly
/// empty when no hostnames remain), or `None` for comment/blank lines that
/// must be preserved verbatim.
fn strip_names(line: &str, names: &[&str]) -> Option<String> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }

    let (entry, comment) = match line.find('#') {
        Some(pos) => (&line[..pos], Some(&line[pos..])),
        None => (line, None),
    };

    let mut fields = entry.split_whitespace();
    let address = fields.next()?;
    let kept: Vec<&str> = fields
        .filter(|name| !names.iter().any(|n| name.eq_ignore_ascii_case(n)))
        .collect();

    if kept.is_empty() {
        return Some(String::new());
    }

    let mut rebuilt = format!("{address}\t{}", kept.join(" "));
    if let Some(comment) = comment {
        rebuilt.push(' ');
        rebuilt.push_str(comment);
    }
    Some(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn hosts_with(contents: &str) -> (tempfile::NamedTempFile, HostsFile) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        let hosts = HostsFile::at(file.path());
        (file, hosts)
    }

    #[test]
    fn adds_missing_aliases() {
        let (_file, hosts) = hosts_with("127.0.0.1\tlocalhost\n");
        hosts
            .add_loopback_aliases(["db.local", "web.local"])
            .unwrap();

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert!(contents.contains("127.0.0.1\tdb.local"));
        assert!(contents.contains("127.0.0.1\tweb.local"));
        assert!(contents.starts_with("127.0.0.1\tlocalhost\n"));
    }

    #[test]
    fn add_is_idempotent() {
        let (_file, hosts) = hosts_with("127.0.0.1 localhost db.local\n");
        hosts.add_loopback_aliases(["db.local"]).unwrap();

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert_eq!(contents.matches("db.local").count(), 1);
    }

    #[test]
    fn removes_only_requested_names() {
        let (_file, hosts) = hosts_with(
            "127.0.0.1\tlocalhost\n\
             127.0.0.1\tdb.local\n\
             127.0.0.1\tweb.local keep.local\n",
        );
        hosts
            .remove_loopback_aliases(["db.local", "web.local"])
            .unwrap();

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert!(!contents.contains("db.local"));
        assert!(!contents.contains("web.local"));
        assert!(contents.contains("localhost"));
        assert!(contents.contains("keep.local"));
    }

    #[test]
    fn comments_survive_a_remove() {
        let (_file, hosts) = hosts_with("# managed below\n127.0.0.1\tdb.local\n");
        hosts.remove_loopback_aliases(["db.local"]).unwrap();

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert!(contents.contains("# managed below"));
        assert!(!contents.contains("db.local"));
    }

    #[test]
    fn add_then_remove_round_trips() {
        let original = "127.0.0.1\tlocalhost\n";
        let (_file, hosts) = hosts_with(original);
        hosts.add_loopback_aliases(["db.local"]).unwrap();
        hosts.remove_loopback_aliases(["db.local"]).unwrap();

        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert_eq!(contents, original);
    }

    #[cfg(unix)]
    #[test]
    fn rewrite_keeps_the_file_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let (_file, hosts) = hosts_with("127.0.0.1\tlocalhost\n");
        std::fs::set_permissions(hosts.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        hosts.add_loopback_aliases(["db.local"]).unwrap();

        let meta = std::fs::metadata(hosts.path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
        let contents = std::fs::read_to_string(hosts.path()).unwrap();
        assert!(contents.contains("db.local"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let hosts = HostsFile::at("/nonexistent/hosts");
        let err = hosts.add_loopback_aliases(["db.local"]).unwrap_err();
        assert!(matches!(err, HostsError::Read { .. }));
    }
}
