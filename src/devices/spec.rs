//! Device property lists shared by the command line and `device_add`.

use serde_json::{Map, Value};

/// A `-device` definition: driver plus ordered properties.
///
/// The same spec renders as a command-line argument
/// (`virtio-blk-pci,drive=drive_a,id=blk_a`) and as `device_add`
/// arguments, so cold-plugged and hot-plugged devices stay identical.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    driver: String,
    props: Vec<(&'static str, Value)>,
}

impl DeviceSpec {
    /// Start a spec for `driver`.
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            props: Vec::new(),
        }
    }

    /// Append a property.
    pub fn prop(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.props.push((key, value.into()));
        self
    }

    /// Append a property when `value` is set.
    pub fn opt_prop<V: Into<Value>>(self, key: &'static str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.prop(key, v),
            None => self,
        }
    }

    /// Driver name.
    pub fn driver(&self) -> &str {
        &self.driver
    }

    /// Property value by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Render as a `-device` argument.
    pub fn to_arg(&self) -> String {
        let mut arg = self.driver.clone();
        for (key, value) in &self.props {
            arg.push(',');
            arg.push_str(key);
            arg.push('=');
            match value {
                Value::String(s) => arg.push_str(s),
                Value::Bool(true) => arg.push_str("on"),
                Value::Bool(false) => arg.push_str("off"),
                other => arg.push_str(&other.to_string()),
            }
        }
        arg
    }

    /// Render as `device_add` arguments.
    pub fn to_qmp(&self) -> Value {
        let mut map = Map::new();
        map.insert("driver".into(), Value::String(self.driver.clone()));
        for (key, value) in &self.props {
            map.insert((*key).to_string(), value.clone());
        }
        Value::Object(map)
    }
}
