//! Per-device registry of active registers and the config-driven register
//! filter.

use std::collections::HashSet;
use std::sync::RwLock;

use tokio::sync::watch;

use crate::value::{sort_registers, Register};

/// Config shape for the include/skip register+category filter (§4.2).
#[derive(Debug, Clone, Default)]
pub struct RegisterFilterConfig {
    pub include_registers: HashSet<String>,
    pub skip_registers: HashSet<String>,
    pub include_categories: HashSet<String>,
    pub skip_categories: HashSet<String>,
    pub default_include: bool,
}

impl RegisterFilterConfig {
    /// Accept a register iff, in order: include-by-name, skip-by-name,
    /// include-by-category, skip-by-category, else `default_include`.
    pub fn accepts(&self, register: &Register) -> bool {
        if self.include_registers.contains(register.name()) {
            return true;
        }
        if self.skip_registers.contains(register.name()) {
            return false;
        }
        if self.include_categories.contains(register.category()) {
            return true;
        }
        if self.skip_categories.contains(register.category()) {
            return false;
        }
        self.default_include
    }
}

/// Per-device registry of active registers, queryable by filter. Registers
/// are keyed by name within a device: a changed register is a new
/// instance, replacing the old one under the same key.
pub struct RegisterDb {
    registers: RwLock<Vec<Register>>,
    changes: watch::Sender<u64>,
}

impl Default for RegisterDb {
    fn default() -> Self {
        Self {
            registers: RwLock::new(Vec::new()),
            changes: watch::channel(0).0,
        }
    }
}

impl RegisterDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, register: Register) {
        let mut regs = self.registers.write().expect("register_db lock poisoned");
        let changed = match regs.iter_mut().find(|r| r.name() == register.name()) {
            Some(existing) => {
                let changed = *existing != register;
                *existing = register;
                changed
            }
            None => {
                regs.push(register);
                true
            }
        };
        drop(regs);
        if changed {
            self.changes.send_modify(|v| *v += 1);
        }
    }

    /// Subscribes to the catalog's change counter: it ticks once per
    /// [`RegisterDb::add`] call that actually adds or replaces a register.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn add_all(&self, registers: impl IntoIterator<Item = Register>) {
        for r in registers {
            self.add(r);
        }
    }

    /// All registers, sorted stably by `(type-rank, sort, name)`.
    pub fn all(&self) -> Vec<Register> {
        let mut regs = self.registers.read().expect("register_db lock poisoned").clone();
        sort_registers(&mut regs);
        regs
    }

    /// Registers accepted by the given filter, sorted stably.
    pub fn filtered(&self, filter: &RegisterFilterConfig) -> Vec<Register> {
        self.all().into_iter().filter(|r| filter.accepts(r)).collect()
    }

    pub fn get(&self, name: &str) -> Option<Register> {
        self.registers
            .read()
            .expect("register_db lock poisoned")
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.registers.read().expect("register_db lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::RegisterType;

    fn reg(category: &str, name: &str) -> Register {
        Register::new(category, name, "d", RegisterType::Number, "", 0, false, 0, 1.0, false)
    }

    #[test]
    fn include_wins_over_skip() {
        let mut f = RegisterFilterConfig {
            default_include: false,
            ..Default::default()
        };
        f.include_registers.insert("a".to_string());
        f.skip_registers.insert("a".to_string());
        assert!(f.accepts(&reg("cat", "a")));
    }

    #[test]
    fn skip_register_wins_over_category_include() {
        let mut f = RegisterFilterConfig {
            default_include: false,
            ..Default::default()
        };
        f.skip_registers.insert("a".to_string());
        f.include_categories.insert("cat".to_string());
        assert!(!f.accepts(&reg("cat", "a")));
    }

    #[test]
    fn category_skip_applies_when_not_otherwise_named() {
        let mut f = RegisterFilterConfig {
            default_include: true,
            ..Default::default()
        };
        f.skip_categories.insert("cat".to_string());
        assert!(!f.accepts(&reg("cat", "a")));
    }

    #[test]
    fn default_include_applies_when_unmatched() {
        let f = RegisterFilterConfig {
            default_include: true,
            ..Default::default()
        };
        assert!(f.accepts(&reg("cat", "a")));

        let f2 = RegisterFilterConfig {
            default_include: false,
            ..Default::default()
        };
        assert!(!f2.accepts(&reg("cat", "a")));
    }

    #[test]
    fn register_db_add_replaces_same_name() {
        let db = RegisterDb::new();
        db.add(reg("cat", "a"));
        db.add(Register::new("cat2", "a", "d2", RegisterType::Number, "", 0, false, 0, 1.0, false));
        assert_eq!(db.len(), 1);
        assert_eq!(db.get("a").unwrap().category(), "cat2");
    }

    #[test]
    fn register_db_all_is_sorted() {
        let db = RegisterDb::new();
        db.add(reg("cat", "b"));
        db.add(reg("cat", "a"));
        let names: Vec<String> = db.all().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn register_db_filtered_applies_config() {
        let db = RegisterDb::new();
        db.add(reg("cat", "a"));
        db.add(reg("cat", "b"));
        let mut f = RegisterFilterConfig {
            default_include: false,
            ..Default::default()
        };
        f.include_registers.insert("a".to_string());
        let filtered = db.filtered(&f);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name(), "a");
    }
}
