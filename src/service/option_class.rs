use std::collections::HashSet;

use serde::Serialize;

use crate::error::{LvmdError, Result};

/// Named bundle of extra `lvcreate` arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LvcreateOptionClass {
    pub name: String,
    pub options: Vec<String>,
}

#[derive(Debug, Default)]
pub struct LvcreateOptionClassManager {
    classes: Vec<LvcreateOptionClass>,
}

impl LvcreateOptionClassManager {
    pub fn new(classes: Vec<LvcreateOptionClass>) -> Self {
        Self { classes }
    }

    pub fn validate(classes: &[LvcreateOptionClass]) -> Result<()> {
        let mut seen = HashSet::new();
        for oc in classes {
            if oc.name.is_empty() {
                return Err(LvmdError::Config("lvcreate option class name is empty".into()));
            }
            if !seen.insert(oc.name.as_str()) {
                return Err(LvmdError::Config(format!(
                    "duplicate lvcreate option class '{}'",
                    oc.name
                )));
            }
        }
        Ok(())
    }

    /// `None` or an empty name means "no extra options".
    pub fn resolve(&self, name: Option<&str>) -> Result<Option<&LvcreateOptionClass>> {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        self.classes
            .iter()
            .find(|oc| oc.name == name)
            .map(Some)
            .ok_or_else(|| LvmdError::NotFound(format!("lvcreate option class '{name}'")))
    }
}
