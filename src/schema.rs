//! The closed set of enumerated schema columns (§3, §9 "Enumerated schema
//! columns"): a fixed struct with typed optional fields, written into by
//! column name via [`SchemaColumns::set_by_name`]. Unknown column names in
//! mappings are ignored with a debug log — the one tolerated "dynamic"
//! column write, per §9.

use serde::{Deserialize, Serialize};

/// Pre-formatted schema column values. Each is the exact string the
/// enricher computed (integer or `decimals(multiplier)`-precision
/// formatting, per §4.5) rather than a raw number, since the formatting
/// rule is part of the contract downstream consumers rely on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaColumns {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passenger_seat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_battery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dallas_temperature_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dallas_temperature_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dallas_temperature_3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dallas_temperature_4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_temperature_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_temperature_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_temperature_3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_temperature_4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_humidity_1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_humidity_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_humidity_3: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ble_humidity_4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub green_driving_value: Option<String>,
}

/// Fixed column order used by the CSV sink (LOGS mode), matching the
/// original's `async_save_to_csv.py::COLUMNS` ordering.
pub const CSV_COLUMN_ORDER: &[&str] = &[
    "passenger_seat",
    "main_battery",
    "battery_voltage",
    "fuel",
    "dallas_temperature_1",
    "dallas_temperature_2",
    "dallas_temperature_3",
    "dallas_temperature_4",
    "ble_humidity_1",
    "ble_humidity_2",
    "ble_humidity_3",
    "ble_humidity_4",
    "ble_temperature_1",
    "ble_temperature_2",
    "ble_temperature_3",
    "ble_temperature_4",
    "green_driving_value",
    "dynamic_io",
    "is_valid",
];

impl SchemaColumns {
    /// Writes `value` into the named column if it is one of the enumerated
    /// schema columns, returning whether the name was recognized. Unknown
    /// names are the caller's cue to log at DEBUG and ignore (§9).
    pub fn set_by_name(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "passenger_seat" => &mut self.passenger_seat,
            "main_battery" => &mut self.main_battery,
            "battery_voltage" => &mut self.battery_voltage,
            "fuel" => &mut self.fuel,
            "dallas_temperature_1" => &mut self.dallas_temperature_1,
            "dallas_temperature_2" => &mut self.dallas_temperature_2,
            "dallas_temperature_3" => &mut self.dallas_temperature_3,
            "dallas_temperature_4" => &mut self.dallas_temperature_4,
            "ble_temperature_1" => &mut self.ble_temperature_1,
            "ble_temperature_2" => &mut self.ble_temperature_2,
            "ble_temperature_3" => &mut self.ble_temperature_3,
            "ble_temperature_4" => &mut self.ble_temperature_4,
            "ble_humidity_1" => &mut self.ble_humidity_1,
            "ble_humidity_2" => &mut self.ble_humidity_2,
            "ble_humidity_3" => &mut self.ble_humidity_3,
            "ble_humidity_4" => &mut self.ble_humidity_4,
            "green_driving_value" => &mut self.green_driving_value,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        match name {
            "passenger_seat" => self.passenger_seat.as_deref(),
            "main_battery" => self.main_battery.as_deref(),
            "battery_voltage" => self.battery_voltage.as_deref(),
            "fuel" => self.fuel.as_deref(),
            "dallas_temperature_1" => self.dallas_temperature_1.as_deref(),
            "dallas_temperature_2" => self.dallas_temperature_2.as_deref(),
            "dallas_temperature_3" => self.dallas_temperature_3.as_deref(),
            "dallas_temperature_4" => self.dallas_temperature_4.as_deref(),
            "ble_temperature_1" => self.ble_temperature_1.as_deref(),
            "ble_temperature_2" => self.ble_temperature_2.as_deref(),
            "ble_temperature_3" => self.ble_temperature_3.as_deref(),
            "ble_temperature_4" => self.ble_temperature_4.as_deref(),
            "ble_humidity_1" => self.ble_humidity_1.as_deref(),
            "ble_humidity_2" => self.ble_humidity_2.as_deref(),
            "ble_humidity_3" => self.ble_humidity_3.as_deref(),
            "ble_humidity_4" => self.ble_humidity_4.as_deref(),
            "green_driving_value" => self.green_driving_value.as_deref(),
            _ => None,
        }
    }

    pub fn any_set(&self) -> bool {
        CSV_COLUMN_ORDER
            .iter()
            .filter(|c| **c != "dynamic_io" && **c != "is_valid")
            .any(|c| self.get_by_name(c).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_by_name_rejects_unknown_columns() {
        let mut cols = SchemaColumns::default();
        assert!(!cols.set_by_name("not_a_column", "1".into()));
        assert!(cols.set_by_name("main_battery", "12.5".into()));
        assert_eq!(cols.main_battery.as_deref(), Some("12.5"));
    }

    #[test]
    fn any_set_false_on_default() {
        assert!(!SchemaColumns::default().any_set());
    }
}
