use serde::Serialize;

/// A physical or logical device grouping one or more entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// `(domain, id)` pairs identifying the device across restarts
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
}

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            identifiers: Vec::new(),
            name: name.into(),
            manufacturer: None,
            model: None,
            sw_version: None,
        }
    }

    /// Stable key for the device, built from its first identifier.
    pub fn id(&self) -> String {
        match self.identifiers.first() {
            Some((domain, id)) => format!("{}_{}", domain, id),
            None => self.name.clone(),
        }
    }
}
