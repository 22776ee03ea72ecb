//! Variable projections with lazily expanded children.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EngineVariable;
use crate::errors::ContextError;

/// A variable or a member of an expanded variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDetails {
    /// Reference used to expand the variable.
    pub id: u32,
    /// Display name; top-level variables carry a `$` prefix.
    pub name: String,
    /// Value rendered the way the console would show it.
    pub value: String,
    /// .NET type name, when known.
    pub type_name: Option<String>,
    /// Whether the variable has children.
    pub is_expandable: bool,
}

/// A named group of variables such as a scope or a stack frame's locals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableContainerDetails {
    /// Reference used to list the container's variables.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Number of variables in the container.
    pub len: usize,
}

enum StoreEntry {
    Container {
        children: Vec<u32>,
    },
    Variable {
        details: VariableDetails,
        raw: Value,
        children: Option<Vec<u32>>,
    },
}

/// Id-addressed storage for containers and variables of one debugger stop.
///
/// Ids start at 1. Children of a variable are created on first request and
/// reused afterwards.
#[derive(Default)]
pub(crate) struct VariableStore {
    entries: Vec<StoreEntry>,
}

impl VariableStore {
    pub(crate) fn add_container(
        &mut self,
        name: impl Into<String>,
        variables: &[EngineVariable],
    ) -> VariableContainerDetails {
        let id = self.next_id();
        let details = VariableContainerDetails {
            id,
            name: name.into(),
            len: variables.len(),
        };
        self.entries.push(StoreEntry::Container {
            children: Vec::new(),
        });
        let children: Vec<u32> = variables
            .iter()
            .map(|variable| {
                self.add_variable(
                    format!("${}", variable.name),
                    variable.value.clone(),
                    variable.type_name.clone(),
                )
            })
            .collect();
        if let Some(StoreEntry::Container { children: slot }) = self.entry_mut(id)
        {
            *slot = children;
        }
        details
    }

    /// Lists a container's variables or a variable's children.
    pub(crate) fn children(&mut self, id: u32) -> Result<Vec<VariableDetails>, ContextError> {
        let child_ids = match self.entry_mut(id) {
            None => return Err(ContextError::UnknownContainer { id }),
            Some(StoreEntry::Container { children }) => children.clone(),
            Some(StoreEntry::Variable {
                children: Some(children),
                ..
            }) => children.clone(),
            Some(StoreEntry::Variable { raw, details, .. }) => {
                if !details.is_expandable {
                    return Ok(Vec::new());
                }
                let members = expand(raw);
                let ids: Vec<u32> = members
                    .into_iter()
                    .map(|(name, value)| {
                        let type_name = infer_type_name(&value);
                        self.add_variable(name, value, type_name)
                    })
                    .collect();
                if let Some(StoreEntry::Variable { children, .. }) = self.entry_mut(id) {
                    *children = Some(ids.clone());
                }
                ids
            }
        };
        Ok(child_ids
            .into_iter()
            .filter_map(|child| self.details(child))
            .collect())
    }

    pub(crate) fn container_len(&self, id: u32) -> usize {
        match index(id).and_then(|position| self.entries.get(position)) {
            Some(StoreEntry::Container { children }) => children.len(),
            _ => 0,
        }
    }

    fn add_variable(&mut self, name: String, raw: Value, type_name: Option<String>) -> u32 {
        let id = self.next_id();
        let is_expandable = match &raw {
            Value::Array(items) => !items.is_empty(),
            Value::Object(members) => !members.is_empty(),
            _ => false,
        };
        let details = VariableDetails {
            id,
            name,
            value: format_value(&raw, type_name.as_deref()),
            type_name,
            is_expandable,
        };
        self.entries.push(StoreEntry::Variable {
            details,
            raw,
            children: None,
        });
        id
    }

    fn details(&self, id: u32) -> Option<VariableDetails> {
        match self.entries.get(index(id)?)? {
            StoreEntry::Variable { details, .. } => Some(details.clone()),
            StoreEntry::Container { .. } => None,
        }
    }

    fn entry_mut(&mut self, id: u32) -> Option<&mut StoreEntry> {
        self.entries.get_mut(index(id)?)
    }

    fn next_id(&self) -> u32 {
        u32::try_from(self.entries.len() + 1).unwrap_or(u32::MAX)
    }
}

fn index(id: u32) -> Option<usize> {
    usize::try_from(id).ok()?.checked_sub(1)
}

fn expand(raw: &Value) -> Vec<(String, Value)> {
    match raw {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(position, item)| (format!("[{position}]"), item.clone()))
            .collect(),
        Value::Object(members) => members
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Renders a value the way the console shows it.
pub(crate) fn format_value(value: &Value, type_name: Option<&str>) -> String {
    match value {
        Value::Null => String::from("$null"),
        Value::Bool(true) => String::from("$true"),
        Value::Bool(false) => String::from("$false"),
        Value::Number(number) => number.to_string(),
        Value::String(text) => format!("\"{text}\""),
        Value::Array(items) => format!(
            "[{}: {}]",
            type_name.map_or("Array", short_type_name),
            items.len()
        ),
        Value::Object(_) => format!(
            "[{}]",
            type_name.map_or("PSCustomObject", short_type_name)
        ),
    }
}

fn short_type_name(full: &str) -> &str {
    full.rsplit('.').next().unwrap_or(full)
}

fn infer_type_name(value: &Value) -> Option<String> {
    let name = match value {
        Value::Null => return None,
        Value::Bool(_) => "System.Boolean",
        Value::Number(number) if number.as_i64().is_some_and(|n| i32::try_from(n).is_ok()) => {
            "System.Int32"
        }
        Value::Number(number) if number.is_i64() || number.is_u64() => "System.Int64",
        Value::Number(_) => "System.Double",
        Value::String(_) => "System.String",
        Value::Array(_) => "System.Object[]",
        Value::Object(_) => "System.Management.Automation.PSCustomObject",
    };
    Some(String::from(name))
}
