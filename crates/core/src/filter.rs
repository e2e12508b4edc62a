//! Value filter: the predicate the store actor and its state-read calls
//! evaluate a value against.

use std::collections::HashSet;

use crate::value::Value;

/// `{includeDevices, skipRegisters, skipCategories, skipNull, onlyOnce}`.
/// An empty filter (`Filter::default()`) matches everything.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub include_devices: HashSet<String>,
    pub skip_registers: HashSet<(String, String)>,
    pub skip_categories: HashSet<(String, String)>,
    pub skip_null: bool,
    pub only_once: bool,
}

impl Filter {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn for_device(device_name: impl Into<String>) -> Self {
        let mut f = Self::default();
        f.include_devices.insert(device_name.into());
        f
    }

    pub fn only_once(mut self) -> Self {
        self.only_once = true;
        self
    }

    pub fn skip_null(mut self) -> Self {
        self.skip_null = true;
        self
    }

    /// Evaluate the filter against a value: include-devices first (empty
    /// set means all), then skip-registers, then skip-categories, then
    /// null policy.
    pub fn matches(&self, value: &Value) -> bool {
        let device = value.device_name();

        if !self.include_devices.is_empty() && !self.include_devices.contains(device) {
            return false;
        }

        let register = value.register();
        if self
            .skip_registers
            .contains(&(device.to_string(), register.name().to_string()))
        {
            return false;
        }
        if self
            .skip_categories
            .contains(&(device.to_string(), register.category().to_string()))
        {
            return false;
        }

        if self.skip_null && value.payload().is_null() {
            return false;
        }

        true
    }
}
