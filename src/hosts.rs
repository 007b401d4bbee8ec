use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use rand::{thread_rng, Rng};
use tokio::sync::Notify;

use crate::authority::{Authority, NetworkAddress};
use crate::error::{Error, NetResult};
use crate::settings::Settings;

/// Bounded set of known peer addresses with FIFO eviction, a blacklist
/// filter and persistence to a one-authority-per-line cache file.
pub struct HostPool {
    capacity: usize,
    path: PathBuf,
    blacklist: HashSet<Authority>,
    entries: Mutex<VecDeque<NetworkAddress>>,
    added: Notify,
}

impl HostPool {
    pub fn new(settings: &Settings) -> Self {
        HostPool {
            capacity: settings.host_pool_capacity,
            path: settings.hosts_file.clone(),
            blacklist: settings.blacklists.iter().copied().collect(),
            entries: Mutex::new(VecDeque::new()),
            added: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, authority: &Authority) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.authority == *authority)
    }

    /// Blacklisted authorities are rejected; a duplicate refreshes nothing
    /// and succeeds; inserting into a full pool evicts the oldest entry.
    pub fn insert(&self, address: NetworkAddress) -> NetResult<()> {
        if self.capacity == 0 {
            return Err(Error::OperationFailed);
        }
        if self.blacklist.contains(&address.authority) {
            return Err(Error::AddressBlocked);
        }

        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|entry| entry.authority == address.authority) {
            return Ok(());
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(address);
        drop(entries);

        self.added.notify_waiters();
        Ok(())
    }

    pub fn remove(&self, authority: &Authority) -> NetResult<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter().position(|entry| entry.authority == *authority) {
            Some(index) => {
                entries.remove(index);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Picks a random entry whose authority is neither excluded (currently
    /// connected) nor blacklisted.
    pub fn fetch(&self, exclude: &[Authority]) -> NetResult<NetworkAddress> {
        let entries = self.entries.lock().unwrap();
        let candidates: Vec<&NetworkAddress> = entries
            .iter()
            .filter(|entry| !exclude.contains(&entry.authority))
            .filter(|entry| !self.blacklist.contains(&entry.authority))
            .collect();
        if candidates.is_empty() {
            return Err(Error::NotFound);
        }
        let pick = thread_rng().gen_range(0..candidates.len());
        Ok(candidates[pick].clone())
    }

    /// Resolves when an entry has been inserted since this call began.
    pub async fn wait_added(&self) {
        self.added.notified().await
    }

    /// A missing or unreadable cache file is an empty pool; individually
    /// malformed lines are skipped with a warning.
    pub fn load(&self) -> NetResult<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                log::warn!("cannot open hosts file {}: {}", self.path.display(), err);
                return Ok(());
            }
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<Authority>() {
                Ok(authority) => {
                    let _ = self.insert(NetworkAddress::from_authority(authority));
                }
                Err(_) => log::warn!("skipping malformed hosts file entry '{line}'"),
            }
        }
        log::debug!("loaded {} hosts from {}", self.len(), self.path.display());
        Ok(())
    }

    /// Write-temp-then-rename, so a crash never leaves a half-written file.
    pub fn store(&self) -> NetResult<()> {
        let mut contents = String::new();
        {
            let entries = self.entries.lock().unwrap();
            for entry in entries.iter() {
                contents.push_str(&entry.authority.to_string());
                contents.push('\n');
            }
        }

        let temp = self.path.with_extension("new");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &self.path)?;
        Ok(())
    }
}
