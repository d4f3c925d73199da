//! Routing decisions and response merging.
//!
//! The table is resolved once when `initialize` completes, from the
//! capability snapshots every backend returned, and re-resolved whenever a
//! backend dies. Resolution order for a routable method:
//!
//! 1. first configured backend whose `use*` flag is set and which supports
//!    the feature;
//! 2. the primary, if it supports the feature;
//! 3. first configured backend supporting the feature;
//! 4. nobody: the caller falls back to the primary, whose "method not found"
//!    answer is relayed verbatim.
//!
//! `workspace/executeCommand` resolves per command name against
//! `executeCommandProvider.commands`, lazily at the first use of each
//! command.

use crate::backend::Backend;
use crate::capabilities;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// The primary backend is always the first configured one.
pub const PRIMARY: usize = 0;

/// Resolved routing decisions.
#[derive(Debug, Default)]
pub struct RoutingTable {
    targets: HashMap<&'static str, usize>,
    commands: HashMap<String, usize>,
    code_action_backends: Vec<usize>,
}

impl RoutingTable {
    /// Resolve all single-target methods and the codeAction set against the
    /// current capability snapshots. Dead or uninitialized backends are
    /// skipped.
    pub fn resolve(backends: &[Backend]) -> Self {
        let mut targets = HashMap::new();
        for &method in capabilities::SINGLE_TARGET_METHODS {
            if let Some(target) = resolve_target(backends, method) {
                debug!(method, target, "route resolved");
                targets.insert(method, target);
            }
        }

        let code_action_backends: Vec<usize> = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| eligible(b) && b.supports(capabilities::CODE_ACTION))
            .map(|(index, _)| index)
            .collect();

        Self {
            targets,
            commands: HashMap::new(),
            code_action_backends,
        }
    }

    /// Target backend for a single-target routable method, if any supports
    /// it.
    pub fn target_for(&self, method: &str) -> Option<usize> {
        self.targets.get(method).copied()
    }

    /// Backends participating in a codeAction broadcast, in configured order.
    pub fn code_action_backends(&self) -> &[usize] {
        &self.code_action_backends
    }

    /// Target backend for an executeCommand command, resolved on first use
    /// and cached.
    pub fn command_target(&mut self, backends: &[Backend], command: &str) -> Option<usize> {
        if let Some(&target) = self.commands.get(command) {
            return Some(target);
        }
        let target = resolve_command_target(backends, command)?;
        debug!(command, target, "command route resolved");
        self.commands.insert(command.to_string(), target);
        Some(target)
    }
}

fn eligible(backend: &Backend) -> bool {
    backend.alive && backend.initialized()
}

fn resolve_target(backends: &[Backend], method: &str) -> Option<usize> {
    if let Some(index) = backends.iter().position(|b| {
        eligible(b)
            && capabilities::preference_flag(&b.config, method) == Some(true)
            && b.supports(method)
    }) {
        return Some(index);
    }
    if backends
        .first()
        .is_some_and(|b| eligible(b) && b.supports(method))
    {
        return Some(PRIMARY);
    }
    backends
        .iter()
        .position(|b| eligible(b) && b.supports(method))
}

fn resolve_command_target(backends: &[Backend], command: &str) -> Option<usize> {
    if let Some(index) = backends
        .iter()
        .position(|b| eligible(b) && b.config.use_execute_command && b.supports_command(command))
    {
        return Some(index);
    }
    if backends
        .first()
        .is_some_and(|b| eligible(b) && b.supports_command(command))
    {
        return Some(PRIMARY);
    }
    backends
        .iter()
        .position(|b| eligible(b) && b.supports_command(command))
}

/// Build the client-facing `initialize` result.
///
/// The primary's result is the base. For every routable feature resolved to
/// a non-primary backend, that backend's provider field replaces (or
/// removes) the primary's. `executeCommandProvider.commands` becomes the
/// order-preserving deduplicated union across all backends, primary first.
/// `serverInfo` and every other field stay the primary's.
pub fn synthesize_initialize_result(backends: &[Backend], table: &RoutingTable) -> Value {
    let mut result = backends
        .first()
        .and_then(|b| b.init_result().cloned())
        .unwrap_or_else(|| json!({ "capabilities": {} }));

    let command_union = merged_command_union(backends);
    let primary_execute_provider = backends
        .first()
        .and_then(|b| b.capabilities())
        .and_then(|caps| caps.get("executeCommandProvider"))
        .cloned();
    let any_execute_provider = backends.iter().any(|b| {
        eligible(b)
            && b.capabilities()
                .and_then(|caps| caps.get("executeCommandProvider"))
                .is_some_and(|v| !v.is_null())
    });

    let moved: Vec<(&'static str, Option<Value>)> = capabilities::SINGLE_TARGET_METHODS
        .iter()
        .filter_map(|&method| {
            let field = capabilities::provider_field(method)?;
            let target = table.target_for(method)?;
            if target == PRIMARY {
                return None;
            }
            let provider = backends[target]
                .capabilities()
                .and_then(|caps| caps.get(field))
                .cloned();
            Some((field, provider))
        })
        .collect();

    if let Some(caps) = capabilities_object(&mut result) {
        for (field, provider) in moved {
            match provider {
                Some(value) => {
                    caps.insert(field.to_string(), value);
                }
                None => {
                    caps.remove(field);
                }
            }
        }

        if any_execute_provider {
            let mut provider = match primary_execute_provider {
                Some(Value::Object(map)) => Value::Object(map),
                _ => json!({}),
            };
            if let Some(map) = provider.as_object_mut() {
                map.insert("commands".to_string(), json!(command_union));
            }
            caps.insert("executeCommandProvider".to_string(), provider);
        }
    }

    result
}

/// Ordered, deduplicated union of all advertised command names, primary
/// first.
fn merged_command_union(backends: &[Backend]) -> Vec<String> {
    let mut union: Vec<String> = Vec::new();
    for backend in backends.iter().filter(|b| eligible(b)) {
        if let Some(caps) = backend.capabilities() {
            for command in capabilities::advertised_commands(caps) {
                if !union.contains(&command) {
                    union.push(command);
                }
            }
        }
    }
    union
}

/// `result.capabilities` as a mutable object, coercing non-objects along the
/// way.
fn capabilities_object(result: &mut Value) -> Option<&mut Map<String, Value>> {
    if !result.is_object() {
        *result = json!({});
    }
    let root = result.as_object_mut()?;
    let caps = root
        .entry("capabilities".to_string())
        .or_insert_with(|| json!({}));
    if !caps.is_object() {
        *caps = json!({});
    }
    caps.as_object_mut()
}

/// Concatenate per-backend codeAction results in configured order. Slots
/// holding `null` or an error contribute nothing.
pub fn merge_code_actions(slots: &[Option<Value>]) -> Value {
    let mut merged = Vec::new();
    for slot in slots.iter().flatten() {
        if let Value::Array(items) = slot {
            merged.extend(items.iter().cloned());
        }
    }
    Value::Array(merged)
}
