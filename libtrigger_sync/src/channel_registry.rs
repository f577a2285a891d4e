use fxhash::FxHashMap;
use std::collections::BTreeSet;

use super::block_list::ChannelBlockList;
use super::constants::{ERROR_PREFIX, SIGNAL_PREFIX};

/// What a channel is, judging by its name prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Signal(u32),
    Error(u32),
    Other(String),
}

/// ChannelRegistry resolves channel name, index, and number for the current channel list.
///
/// The list comes from the server's CHANNELNAMES message and is replaced wholesale; an
/// index is only meaningful against the list it came from.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    names: Vec<String>,
    prefixes: BTreeSet<String>,
    signal_numbers: FxHashMap<u32, usize>,
}

/// Split a name like "chan12" into ("chan", Some(12))
fn split_name(name: &str) -> (&str, Option<u32>) {
    let prefix = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = name[prefix.len()..].parse().ok();
    (prefix, number)
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh channel list. Returns false if it is identical to the current one.
    pub fn replace(&mut self, names: Vec<String>) -> bool {
        if names == self.names {
            return false;
        }
        self.prefixes.clear();
        self.signal_numbers.clear();
        for (index, name) in names.iter().enumerate() {
            let (prefix, number) = split_name(name);
            self.prefixes.insert(prefix.to_string());
            if prefix == SIGNAL_PREFIX {
                if let Some(n) = number {
                    self.signal_numbers.insert(n, index);
                }
            }
        }
        self.names = names;
        true
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn prefixes(&self) -> &BTreeSet<String> {
        &self.prefixes
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|s| s.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn kind(&self, index: usize) -> Option<ChannelKind> {
        let name = self.name(index)?;
        Some(match split_name(name) {
            (SIGNAL_PREFIX, Some(n)) => ChannelKind::Signal(n),
            (ERROR_PREFIX, Some(n)) => ChannelKind::Error(n),
            (prefix, _) => ChannelKind::Other(prefix.to_string()),
        })
    }

    /// Channel number of a signal channel; None for error and other channels
    pub fn number(&self, index: usize) -> Option<u32> {
        match self.kind(index)? {
            ChannelKind::Signal(n) => Some(n),
            _ => None,
        }
    }

    pub fn index_for_number(&self, number: u32) -> Option<usize> {
        self.signal_numbers.get(&number).copied()
    }

    pub fn all_indices(&self) -> Vec<usize> {
        (0..self.names.len()).collect()
    }

    pub fn signal_indices(&self) -> Vec<usize> {
        self.all_indices()
            .into_iter()
            .filter(|i| self.number(*i).is_some())
            .collect()
    }

    /// Signal channel indices whose numbers are not on the block list, sorted
    pub fn unblocked_signal_indices(&self, blocked: &ChannelBlockList) -> Vec<usize> {
        let indices: Vec<usize> = self
            .signal_indices()
            .into_iter()
            .filter(|i| {
                self.number(*i)
                    .map(|n| !blocked.is_blocked(n))
                    .unwrap_or(false)
            })
            .collect();
        let n_signal = self.signal_numbers.len();
        if indices.len() < n_signal {
            log::info!(
                "{}/{} signal channels enabled, {} blocked",
                indices.len(),
                n_signal,
                n_signal - indices.len()
            );
        }
        indices
    }

    /// Parse a channel specification into a selection of indices.
    ///
    /// A specification is a list of `prefix:n,n,n` entries separated by newlines, tabs,
    /// or semicolons. Spaces are ignored, as are unknown prefixes and channels.
    pub fn parse_selection(&self, spec: &str) -> Vec<usize> {
        let cleaned: String = spec
            .chars()
            .filter(|c| *c != ' ')
            .map(|c| if c == '\t' || c == ';' { '\n' } else { c })
            .collect();
        let mut selection = Vec::new();
        for line in cleaned.lines() {
            let (prefix, numbers) = match line.split_once(':') {
                Some(parts) => parts,
                None => continue,
            };
            if !self.prefixes.contains(prefix) {
                log::warn!("Channel prefix {prefix} is not one of {:?}", self.prefixes);
                continue;
            }
            for number in numbers.split(',').filter(|n| !n.is_empty()) {
                let name = format!("{prefix}{number}");
                match self.index_of(&name) {
                    Some(index) => selection.push(index),
                    None => log::warn!("Channel '{name}' is not known"),
                }
            }
        }
        selection
    }

    /// Render every unblocked channel with `prefix` as a specification line
    pub fn spec_for_prefix(&self, prefix: &str, blocked: &ChannelBlockList) -> String {
        let numbers: Vec<String> = self
            .names
            .iter()
            .filter_map(|name| match split_name(name) {
                (p, Some(n)) if p == prefix => Some(n),
                _ => None,
            })
            .filter(|n| prefix != SIGNAL_PREFIX || !blocked.is_blocked(*n))
            .map(|n| n.to_string())
            .collect();
        format!("{prefix}:{}", numbers.join(","))
    }
}
