//! Name completion for shells.
//!
//! [`suggest`] reports failures like any other operation. Shell completion
//! goes through [`complete`], which turns a failure into an empty list so a
//! broken backend never breaks the user's shell.

use crate::error::Result;
use crate::lifecycle::MachineManager;

/// What kind of name to complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionTarget {
    /// Machine names from the backend.
    Machines,
    /// Connection names from the registry.
    Connections,
}

/// Names of `target` starting with `prefix` (case-sensitive), sorted.
pub fn suggest(
    manager: &MachineManager,
    target: CompletionTarget,
    prefix: &str,
) -> Result<Vec<String>> {
    let names: Vec<String> = match target {
        CompletionTarget::Machines => manager.list()?.into_iter().map(|m| m.name).collect(),
        CompletionTarget::Connections => manager
            .registry()
            .list()?
            .into_iter()
            .map(|d| d.name)
            .collect(),
    };
    Ok(filter_prefix(names, prefix))
}

/// Like [`suggest`], but never fails.
pub fn complete(
    manager: &MachineManager,
    target: CompletionTarget,
    prefix: &str,
) -> Vec<String> {
    or_empty(suggest(manager, target, prefix))
}

/// Swallow a completion failure into an empty suggestion set.
pub fn or_empty(result: Result<Vec<String>>) -> Vec<String> {
    result.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "completion unavailable");
        Vec::new()
    })
}

fn filter_prefix(names: impl IntoIterator<Item = String>, prefix: &str) -> Vec<String> {
    let mut matches: Vec<String> = names
        .into_iter()
        .filter(|name| name.starts_with(prefix))
        .collect();
    matches.sort();
    matches.dedup();
    matches
}
