//! Name → handle lookup for named TM objects.

use crate::config::MAX_NAME_LEN;
use crate::error::{ObjectKind, TmError, TmResult};
use std::collections::HashMap;

/// Names are unique per object kind within one table.
#[derive(Debug, Default)]
pub struct NameTable {
    entries: HashMap<(ObjectKind, String), u64>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject names that are empty, too long, or already taken.
    pub fn check(&self, kind: ObjectKind, name: &str) -> TmResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(TmError::invalid_param(
                "name",
                format!("must be 1..={MAX_NAME_LEN} bytes, got {}", name.len()),
            ));
        }
        if self.entries.contains_key(&(kind, name.to_owned())) {
            return Err(TmError::NameTaken {
                kind,
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    pub fn add(&mut self, kind: ObjectKind, name: &str, handle: u64) -> TmResult<()> {
        self.check(kind, name)?;
        self.entries.insert((kind, name.to_owned()), handle);
        Ok(())
    }

    pub fn lookup(&self, kind: ObjectKind, name: &str) -> Option<u64> {
        self.entries.get(&(kind, name.to_owned())).copied()
    }

    pub fn remove(&mut self, kind: ObjectKind, name: &str) -> Option<u64> {
        self.entries.remove(&(kind, name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
