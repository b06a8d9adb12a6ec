// File-based peer discovery: a plain-text list of `ip:port` lines, one per
// known peer, guarded by an advisory lock. A real deployment would use a
// shared filesystem or a small coordination service; tests and the `submerge`
// binary both point this at a path on local disk.
//
// Process-wide exclusivity is enough for every caller in this codebase (one
// `Hub` per process), so the lock is a plain in-process mutex rather than a
// cross-process file lock.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::PeerId;
use submerge_base::Result;

static DISCOVERY_LOCK: Mutex<()> = Mutex::new(());

pub struct DiscoveryFile {
    path: PathBuf,
    guard: Option<MutexGuard<'static, ()>>,
}

impl DiscoveryFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiscoveryFile { path: path.into(), guard: None }
    }

    /// Acquires the advisory lock. Must precede `get_peers`, `announce`,
    /// `remove`, and `leave`; released by `unlock`.
    pub fn lock(&mut self) -> Result<()> {
        self.guard = Some(DISCOVERY_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.guard = None;
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_lines(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut body = lines.join("\n");
        if !lines.is_empty() {
            body.push('\n');
        }
        let mut f = fs::File::create(&self.path)?;
        f.write_all(body.as_bytes())?;
        Ok(())
    }

    pub fn get_peers(&self) -> Result<Vec<PeerId>> {
        Ok(self.read_lines()?.into_iter().filter_map(|l| l.parse::<PeerId>().ok()).collect())
    }

    /// Idempotent: no-op if `me` is already listed.
    pub fn announce(&self, me: PeerId) -> Result<()> {
        let mut lines = self.read_lines()?;
        let text = me.to_string();
        if !lines.contains(&text) {
            lines.push(text);
            self.write_lines(&lines)?;
        }
        Ok(())
    }

    pub fn remove(&self, peer: PeerId) -> Result<()> {
        let text = peer.to_string();
        let lines: Vec<String> = self.read_lines()?.into_iter().filter(|l| l != &text).collect();
        self.write_lines(&lines)
    }

    pub fn leave(&self, me: PeerId) -> Result<()> {
        self.remove(me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_announce_is_idempotent_and_remove_works() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = DiscoveryFile::new(dir.path().join("peers.txt"));
        d.lock().unwrap();
        let a: PeerId = "127.0.0.1:1111".parse().unwrap();
        let b: PeerId = "127.0.0.1:2222".parse().unwrap();
        d.announce(a).unwrap();
        d.announce(a).unwrap();
        d.announce(b).unwrap();
        assert_eq!(d.get_peers().unwrap().len(), 2);
        d.remove(a).unwrap();
        assert_eq!(d.get_peers().unwrap(), vec![b]);
        d.unlock();
    }
}
