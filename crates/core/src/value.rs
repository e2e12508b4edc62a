//! Register catalog and tagged value types: the data model producers and
//! the store exchange.

use std::collections::BTreeMap;

/// The three value kinds a register can carry, ordered `text < number <
/// enum` for the stable sort used when presenting a device's catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterType {
    Text,
    Number,
    Enum,
}

/// Immutable, shared description of one addressable point a device can
/// expose. Two registers are equal iff every field — including the enum
/// map contents — is equal (I4: changing any field requires a new
/// instance, never a mutation).
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    category: String,
    name: String,
    description: String,
    register_type: RegisterType,
    /// Empty unless `register_type == Enum`.
    enum_map: BTreeMap<i64, String>,
    unit: String,
    sort: i32,
    writable: bool,
    address: u16,
    factor: f64,
    signed: bool,
    /// Display-only rounding hint carried from the original victron register
    /// tables; does not affect wire-format precision (values remain full
    /// `f64` on the wire).
    round_decimals: Option<u8>,
}

impl Register {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        category: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        register_type: RegisterType,
        unit: impl Into<String>,
        sort: i32,
        writable: bool,
        address: u16,
        factor: f64,
        signed: bool,
    ) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            description: description.into(),
            register_type,
            enum_map: BTreeMap::new(),
            unit: unit.into(),
            sort,
            writable,
            address,
            factor,
            signed,
            round_decimals: None,
        }
    }

    pub fn with_enum_map(mut self, enum_map: BTreeMap<i64, String>) -> Self {
        self.enum_map = enum_map;
        self
    }

    pub fn with_round_decimals(mut self, round_decimals: u8) -> Self {
        self.round_decimals = Some(round_decimals);
        self
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn register_type(&self) -> RegisterType {
        self.register_type
    }

    pub fn enum_map(&self) -> &BTreeMap<i64, String> {
        &self.enum_map
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn sort(&self) -> i32 {
        self.sort
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn signed(&self) -> bool {
        self.signed
    }

    pub fn round_decimals(&self) -> Option<u8> {
        self.round_decimals
    }

    fn type_rank(&self) -> u8 {
        match self.register_type {
            RegisterType::Text => 0,
            RegisterType::Number => 1,
            RegisterType::Enum => 2,
        }
    }

    /// Sort key used by [`sort_registers`]: `(type-rank, sort, name)`.
    fn sort_key(&self) -> (u8, i32, &str) {
        (self.type_rank(), self.sort, self.name.as_str())
    }

    /// Convert a raw device-side integer reading into the register's
    /// display value: `raw * factor` (§6.3). Callers are expected to have
    /// already sign-extended `raw` per `signed()` when decoding off the
    /// wire; this only applies the scale factor.
    pub fn scale(&self, raw: i64) -> f64 {
        raw as f64 * self.factor
    }
}

/// Stable sort by `(type-rank, sort, name)`.
pub fn sort_registers(registers: &mut [Register]) {
    registers.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

/// The payload carried by a [`Value`]. `Null` is a sentinel meaning "remove
/// this (device, register) from the store" — it never appears in store
/// state (I2).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Already scaled by the register's `factor`; unit is carried on the
    /// register.
    Numeric(f64),
    Text(String),
    /// `label` must equal `register.enum_map()[&idx]` at construction time.
    Enum { idx: i64, label: String },
    Null,
}

impl Payload {
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

/// An immutable, tagged reading for one register on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    device_name: String,
    register: Register,
    payload: Payload,
}

impl Value {
    pub fn new(device_name: impl Into<String>, register: Register, payload: Payload) -> Self {
        Self {
            device_name: device_name.into(),
            register,
            payload,
        }
    }

    pub fn numeric(device_name: impl Into<String>, register: Register, raw: i64) -> Self {
        let value = register.scale(raw);
        Self::new(device_name, register, Payload::Numeric(value))
    }

    pub fn numeric_value(device_name: impl Into<String>, register: Register, value: f64) -> Self {
        Self::new(device_name, register, Payload::Numeric(value))
    }

    pub fn text(device_name: impl Into<String>, register: Register, value: impl Into<String>) -> Self {
        Self::new(device_name, register, Payload::Text(value.into()))
    }

    /// Builds an enum value, looking the label up in the register's
    /// `enum_map`. Panics if `idx` is not present — enum registers are
    /// expected to be constructed with a complete map.
    pub fn enum_value(device_name: impl Into<String>, register: Register, idx: i64) -> Self {
        let label = register
            .enum_map()
            .get(&idx)
            .unwrap_or_else(|| panic!("enum index {idx} not in register {}'s enum map", register.name()))
            .clone();
        Self::new(device_name, register, Payload::Enum { idx, label })
    }

    pub fn null(device_name: impl Into<String>, register: Register) -> Self {
        Self::new(device_name, register, Payload::Null)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn register(&self) -> &Register {
        &self.register
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Component-wise equality over device, register, and payload — the
    /// change-detection predicate the store actor uses (I1).
    pub fn equals(&self, other: &Value) -> bool {
        self == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number_register() -> Register {
        Register::new("battery", "Voltage", "Battery voltage", RegisterType::Number, "V", 0, false, 0xED8D, 0.01, false)
    }

    fn enum_register() -> Register {
        let mut m = BTreeMap::new();
        m.insert(0, "Unavailable".to_string());
        m.insert(1, "Available".to_string());
        Register::new("system", "Availability", "Availability", RegisterType::Enum, "", 0, false, 0, 1.0, false)
            .with_enum_map(m)
    }

    #[test]
    fn numeric_scales_by_factor() {
        let v = Value::numeric("dev1", number_register(), 1230);
        assert_eq!(v.payload(), &Payload::Numeric(12.3));
    }

    #[test]
    fn signed_register_interprets_negative_raw() {
        let reg = Register::new("battery", "Current", "Current", RegisterType::Number, "A", 0, false, 0xED8F, 0.1, true);
        let v = Value::numeric("dev1", reg, -50);
        assert_eq!(v.payload(), &Payload::Numeric(-5.0));
    }

    #[test]
    fn enum_value_looks_up_label() {
        let v = Value::enum_value("dev1", enum_register(), 1);
        assert_eq!(
            v.payload(),
            &Payload::Enum {
                idx: 1,
                label: "Available".to_string()
            }
        );
    }

    #[test]
    #[should_panic]
    fn enum_value_panics_on_unknown_index() {
        Value::enum_value("dev1", enum_register(), 99);
    }

    #[test]
    fn equality_is_component_wise() {
        let a = Value::numeric("dev1", number_register(), 1230);
        let b = Value::numeric("dev1", number_register(), 1230);
        let c = Value::numeric("dev1", number_register(), 1240);
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn different_device_not_equal() {
        let a = Value::numeric("dev1", number_register(), 1230);
        let b = Value::numeric("dev2", number_register(), 1230);
        assert!(!a.equals(&b));
    }

    #[test]
    fn null_payload_reports_is_null() {
        let v = Value::null("dev1", number_register());
        assert!(v.payload().is_null());
        assert!(!Value::numeric("dev1", number_register(), 1).payload().is_null());
    }

    #[test]
    fn register_equality_requires_enum_map_match() {
        let mut m1 = BTreeMap::new();
        m1.insert(0, "a".to_string());
        let mut m2 = BTreeMap::new();
        m2.insert(0, "b".to_string());

        let r1 = Register::new("c", "n", "d", RegisterType::Enum, "", 0, false, 0, 1.0, false).with_enum_map(m1);
        let r2 = Register::new("c", "n", "d", RegisterType::Enum, "", 0, false, 0, 1.0, false).with_enum_map(m2);
        assert_ne!(r1, r2);
    }

    #[test]
    fn sort_registers_orders_by_type_then_sort_then_name() {
        let text = Register::new("c", "b_text", "d", RegisterType::Text, "", 5, false, 0, 1.0, false);
        let number_a = Register::new("c", "a_num", "d", RegisterType::Number, "", 1, false, 0, 1.0, false);
        let number_b = Register::new("c", "b_num", "d", RegisterType::Number, "", 1, false, 0, 1.0, false);
        let enum_r = Register::new("c", "z_enum", "d", RegisterType::Enum, "", 0, false, 0, 1.0, false);

        let mut regs = vec![enum_r.clone(), number_b.clone(), text.clone(), number_a.clone()];
        sort_registers(&mut regs);

        let names: Vec<&str> = regs.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["b_text", "a_num", "b_num", "z_enum"]);
    }
}
