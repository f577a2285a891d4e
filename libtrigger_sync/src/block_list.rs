use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::constants::BLOCK_LIST_HISTORY_LENGTH;
use super::error::BlockListError;

/// The on-disk form of the block list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BlockListFile {
    #[serde(default)]
    blocked: Vec<u32>,
    #[serde(default)]
    blocked_history: Vec<Vec<u32>>,
}

/// ChannelBlockList is the persistent set of channel numbers that must never trigger,
/// whatever an "all channels" request asks for.
///
/// The set and the last few versions of it are stored as JSON in a backing file, which
/// is rewritten after every call that can change them.
#[derive(Debug)]
pub struct ChannelBlockList {
    path: PathBuf,
    blocked: BTreeSet<u32>,
    history: Vec<BTreeSet<u32>>,
}

impl ChannelBlockList {
    /// Load the block list from `path`. A missing or unreadable file gives an empty list.
    pub fn new(path: &Path) -> Self {
        let mut list = Self {
            path: path.to_path_buf(),
            blocked: BTreeSet::new(),
            history: Vec::new(),
        };
        match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<BlockListFile>(&json) {
                Ok(file) => {
                    list.blocked = file.blocked.into_iter().collect();
                    list.history = file
                        .blocked_history
                        .into_iter()
                        .map(|h| h.into_iter().collect())
                        .collect();
                }
                Err(e) => log::warn!("Ignoring corrupt block list {}: {e}", path.display()),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => log::warn!("Could not read block list {}: {e}", path.display()),
        }
        list
    }

    /// Sorted blocked channel numbers
    pub fn blocked(&self) -> Vec<u32> {
        self.blocked.iter().copied().collect()
    }

    pub fn is_blocked(&self, number: u32) -> bool {
        self.blocked.contains(&number)
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    pub fn history_depth(&self) -> usize {
        self.history.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block every number in `numbers`. Returns whether the set changed.
    pub fn block(&mut self, numbers: &[u32]) -> Result<bool, BlockListError> {
        let mut next = self.blocked.clone();
        next.extend(numbers.iter().copied());
        self.replace(next)
    }

    /// Unblock every number in `numbers`. Returns whether the set changed.
    pub fn unblock(&mut self, numbers: &[u32]) -> Result<bool, BlockListError> {
        let mut next = self.blocked.clone();
        for n in numbers {
            next.remove(n);
        }
        self.replace(next)
    }

    pub fn toggle(&mut self, number: u32) -> Result<bool, BlockListError> {
        if self.is_blocked(number) {
            self.unblock(&[number])
        } else {
            self.block(&[number])
        }
    }

    pub fn clear(&mut self) -> Result<bool, BlockListError> {
        self.replace(BTreeSet::new())
    }

    /// Go back to the previous set (or the empty set when there is no history)
    pub fn undo(&mut self) -> Result<(), BlockListError> {
        self.blocked = self.history.pop().unwrap_or_default();
        self.write()
    }

    fn replace(&mut self, next: BTreeSet<u32>) -> Result<bool, BlockListError> {
        let changed = next != self.blocked;
        if changed {
            let previous = std::mem::replace(&mut self.blocked, next);
            self.history.push(previous);
            if self.history.len() > BLOCK_LIST_HISTORY_LENGTH {
                let excess = self.history.len() - BLOCK_LIST_HISTORY_LENGTH;
                self.history.drain(..excess);
            }
        }
        self.write()?;
        Ok(changed)
    }

    fn write(&self) -> Result<(), BlockListError> {
        let contents = BlockListFile {
            blocked: self.blocked(),
            blocked_history: self
                .history
                .iter()
                .map(|h| h.iter().copied().collect())
                .collect(),
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(&self.path)?;
        serde_json::to_writer(&mut file, &contents)?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked_channels.json");
        (dir, path)
    }

    #[test]
    fn test_round_trip_through_file() {
        let (_dir, path) = scratch();
        let mut list = ChannelBlockList::new(&path);
        assert!(list.is_empty());
        assert!(list.block(&[6, 4, 2]).unwrap());

        let mut reread = ChannelBlockList::new(&path);
        assert_eq!(reread.blocked(), vec![2, 4, 6]);
        reread.undo().unwrap();
        assert!(reread.is_empty());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        assert!(contents.contains("\"blocked\":[]"));
    }

    #[test]
    fn test_set_algebra_and_undo() {
        let (_dir, path) = scratch();
        let mut list = ChannelBlockList::new(&path);
        assert!(list.block(&[6, 4, 2]).unwrap());
        assert!(list.block(&[8, 6, 4, 2, 4, 6, 8]).unwrap());
        assert_eq!(list.blocked(), vec![2, 4, 6, 8]);
        assert!(list.toggle(3).unwrap());
        assert_eq!(list.blocked(), vec![2, 3, 4, 6, 8]);
        assert!(list.toggle(3).unwrap());
        assert_eq!(list.blocked(), vec![2, 4, 6, 8]);
        assert!(list.unblock(&[4]).unwrap());
        assert_eq!(list.blocked(), vec![2, 6, 8]);
        assert!(!list.unblock(&[4]).unwrap());
        list.undo().unwrap();
        assert_eq!(list.blocked(), vec![2, 4, 6, 8]);
        assert!(list.clear().unwrap());
        assert!(!list.clear().unwrap());
        assert!(list.is_empty());
    }

    #[test]
    fn test_history_is_capped() {
        let (_dir, path) = scratch();
        let mut list = ChannelBlockList::new(&path);
        for n in 0..25 {
            list.block(&[n]).unwrap();
        }
        assert_eq!(list.history_depth(), BLOCK_LIST_HISTORY_LENGTH);
        for _ in 0..BLOCK_LIST_HISTORY_LENGTH {
            list.undo().unwrap();
        }
        assert_eq!(list.len(), 15);
        list.undo().unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let (_dir, path) = scratch();
        std::fs::write(&path, "{ not json").unwrap();
        let mut list = ChannelBlockList::new(&path);
        assert!(list.is_empty());
        assert!(list.block(&[1]).unwrap());
        assert_eq!(ChannelBlockList::new(&path).blocked(), vec![1]);
    }
}
