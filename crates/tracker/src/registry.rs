use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use thiserror::Error;

use crate::group::{lock, normalize_process_name, Group, GroupIntervals};
use crate::record_file::{GroupRecord, Record};

/// Errors surfaced to the group-editing surface
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("group name can't be empty")]
    EmptyName,

    #[error("group name {0:?} already exists")]
    NameConflict(String),

    #[error("group {0:?} not found")]
    NotFound(String),

    #[error("process list does not fit in {0} characters")]
    TooManyProcesses(usize),

    #[error("process {process:?} is already tracked by group {group:?}")]
    ProcessClaimed { process: String, group: String },
}

struct RegistryState {
    groups: BTreeMap<String, Group>,
    selected: Option<String>,
}

/// All groups of the application, keyed by name.
///
/// Structural changes and process-name lookups are serialized by one registry
/// lock. Interval data lives behind each group's own [`GroupIntervals`] locks;
/// callers resolve a group here, release the registry lock, then work on the
/// returned handle. The registry lock is never held while draining a group.
pub struct Registry {
    state: Mutex<RegistryState>,
    empty_group: Group,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                groups: BTreeMap::new(),
                selected: None,
            }),
            empty_group: Group::new(""),
        }
    }

    /// Rebuilds the registry from persisted state
    pub fn from_record(record: Record) -> Self {
        let registry = Self::new();
        {
            let mut state = lock(&registry.state);
            for group in record.groups {
                if state.groups.contains_key(&group.name) {
                    warn!("Duplicate group {:?} in record, keeping the last one", group.name);
                }
                let name = group.name.clone();
                state.groups.insert(
                    name,
                    Group::with_history(group.name, group.process_names, group.merged),
                );
            }
            let selected = record
                .selected
                .filter(|name| state.groups.contains_key(name));
            state.selected = selected;
        }
        registry
    }

    /// Captures every group for persistence, draining pending intervals first
    pub fn to_record(&self) -> Record {
        let (entries, selected) = {
            let state = lock(&self.state);
            let entries: Vec<_> = state
                .groups
                .values()
                .map(|g| {
                    (
                        g.name().to_string(),
                        g.process_names().clone(),
                        g.intervals().clone(),
                    )
                })
                .collect();
            (entries, state.selected.clone())
        };

        let groups = entries
            .into_iter()
            .map(|(name, process_names, intervals)| GroupRecord {
                name,
                process_names,
                merged: intervals.snapshot(),
            })
            .collect();

        Record { groups, selected }
    }

    /// Names of all groups, sorted
    pub fn group_names(&self) -> Vec<String> {
        lock(&self.state).groups.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interval handle of the named group
    pub fn lookup(&self, name: &str) -> Option<Arc<GroupIntervals>> {
        lock(&self.state)
            .groups
            .get(name)
            .map(|g| g.intervals().clone())
    }

    /// Resolves an executable name to the group tracking it.
    ///
    /// Matching is case-insensitive. Groups are scanned in name order, so a name
    /// claimed by several groups (possible only in old records) resolves to the
    /// first one.
    pub fn lookup_by_process(&self, process_name: &str) -> Option<(String, Arc<GroupIntervals>)> {
        let normalized = normalize_process_name(process_name);
        if normalized.is_empty() {
            return None;
        }
        lock(&self.state)
            .groups
            .values()
            .find(|g| g.claims(&normalized))
            .map(|g| (g.name().to_string(), g.intervals().clone()))
    }

    /// Creates an empty group
    pub fn create_group(&self, name: &str) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut state = lock(&self.state);
        if state.groups.contains_key(name) {
            return Err(RegistryError::NameConflict(name.to_string()));
        }
        state.groups.insert(name.to_string(), Group::new(name));
        info!("Created group {:?}", name);
        Ok(())
    }

    /// Creates a group under the first free generated name and returns it
    pub fn create_new_group(&self) -> String {
        let mut id = 0u32;
        loop {
            let name = format!("NEW GROUP {:02}", id);
            if self.create_group(&name).is_ok() {
                return name;
            }
            id += 1;
        }
    }

    /// Deletes a group.
    ///
    /// Returns the name of the following group, else the preceding one, else
    /// `None` when no group remains. A deleted selection moves to that group.
    pub fn delete_group(&self, name: &str) -> Result<Option<String>, RegistryError> {
        let mut state = lock(&self.state);
        if state.groups.remove(name).is_none() {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        let neighbour = state
            .groups
            .range::<str, _>((Excluded(name), Unbounded))
            .next()
            .or_else(|| {
                state
                    .groups
                    .range::<str, _>((Unbounded, Excluded(name)))
                    .next_back()
            })
            .map(|(key, _)| key.clone());

        if state.selected.as_deref() == Some(name) {
            state.selected = neighbour.clone();
        }
        info!("Deleted group {:?}", name);
        Ok(neighbour)
    }

    /// Renames a group, keeping its processes and history
    pub fn rename_group(&self, name: &str, new_name: &str) -> Result<(), RegistryError> {
        if new_name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut state = lock(&self.state);
        if state.groups.contains_key(new_name) {
            return Err(RegistryError::NameConflict(new_name.to_string()));
        }
        let mut group = state
            .groups
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        group.set_name(new_name.to_string());
        state.groups.insert(new_name.to_string(), group);
        if state.selected.as_deref() == Some(name) {
            state.selected = Some(new_name.to_string());
        }
        info!("Renamed group {:?} to {:?}", name, new_name);
        Ok(())
    }

    /// Replaces the executables of a group from a `;` separated list.
    ///
    /// Names are trimmed, lower-cased and deduplicated. The list must fit in
    /// `maximum_length` UTF-16 units once joined for display; when it doesn't,
    /// the names accepted so far are kept and `TooManyProcesses` is returned.
    /// A name already tracked by another group rejects the whole list.
    pub fn set_process_list(
        &self,
        name: &str,
        processes: &str,
        maximum_length: usize,
    ) -> Result<(), RegistryError> {
        let tokens: Vec<String> = processes
            .split(';')
            .map(normalize_process_name)
            .filter(|token| !token.is_empty())
            .collect();

        let mut state = lock(&self.state);
        if !state.groups.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }

        for token in &tokens {
            if let Some(owner) = state
                .groups
                .values()
                .find(|g| g.name() != name && g.claims(token))
            {
                return Err(RegistryError::ProcessClaimed {
                    process: token.clone(),
                    group: owner.name().to_string(),
                });
            }
        }

        let group = state
            .groups
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let process_names = group.process_names_mut();
        process_names.clear();

        let mut string_size = 0;
        for token in tokens {
            string_size += token.encode_utf16().count();
            if string_size + process_names.len() * 2 >= maximum_length {
                return Err(RegistryError::TooManyProcesses(maximum_length));
            }
            process_names.insert(token);
        }

        debug!("Group {:?} now tracks {:?}", name, process_names);
        Ok(())
    }

    /// Process names of a group joined for editing
    pub fn processes_string(&self, name: &str) -> Result<String, RegistryError> {
        lock(&self.state)
            .groups
            .get(name)
            .map(Group::processes_string)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Process names of a group
    pub fn process_names(&self, name: &str) -> Result<BTreeSet<String>, RegistryError> {
        lock(&self.state)
            .groups
            .get(name)
            .map(|g| g.process_names().clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Changes the selected group; `None` selects nothing
    pub fn select(&self, name: Option<&str>) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        match name {
            Some(name) if !state.groups.contains_key(name) => {
                Err(RegistryError::NotFound(name.to_string()))
            }
            Some(name) => {
                state.selected = Some(name.to_string());
                Ok(())
            }
            None => {
                state.selected = None;
                Ok(())
            }
        }
    }

    pub fn selected(&self) -> Option<String> {
        lock(&self.state).selected.clone()
    }

    pub fn is_selected(&self, name: &str) -> bool {
        lock(&self.state).selected.as_deref() == Some(name)
    }

    /// Name and intervals of the selected group, or the empty sentinel group
    pub fn selected_intervals(&self) -> (String, Arc<GroupIntervals>) {
        let state = lock(&self.state);
        state
            .selected
            .as_ref()
            .and_then(|name| state.groups.get(name))
            .map(|g| (g.name().to_string(), g.intervals().clone()))
            .unwrap_or_else(|| {
                (
                    self.empty_group.name().to_string(),
                    self.empty_group.intervals().clone(),
                )
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
