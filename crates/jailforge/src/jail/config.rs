//! `jail.conf` generation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Value of a jail parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean parameter: `name;` or `noname;`.
    Flag(bool),
    /// Numeric value.
    Number(i64),
    /// Single string value.
    Text(String),
    /// Comma separated list, e.g. several addresses.
    List(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Parameters of one jail, rendered as a `jail.conf` block.
///
/// Parameters keep their insertion order; setting an existing parameter
/// replaces its value in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailConfig {
    name: String,
    params: Vec<(String, ParamValue)>,
}

impl JailConfig {
    /// An empty block for jail `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// The usual parameters for a jail rooted at `path`.
    #[must_use]
    pub fn with_defaults(name: impl Into<String>, path: &str) -> Self {
        let name = name.into();
        let mut config = Self::new(name.clone());
        config
            .set("path", path)
            .set("host.hostname", name)
            .set("mount.devfs", true)
            .set("exec.clean", true)
            .set("exec.start", "/bin/sh /etc/rc")
            .set("exec.stop", "/bin/sh /etc/rc.shutdown");
        config
    }

    /// Jail name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set a parameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    /// Current value of a parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove a parameter.
    pub fn remove(&mut self, key: &str) -> Option<ParamValue> {
        let index = self.params.iter().position(|(k, _)| k == key)?;
        Some(self.params.remove(index).1)
    }

    /// Parameters in order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for JailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {{", self.name)?;
        for (key, value) in &self.params {
            match value {
                ParamValue::Flag(true) => writeln!(f, "    {key};")?,
                ParamValue::Flag(false) => writeln!(f, "    {};", negate(key))?,
                ParamValue::Number(n) => writeln!(f, "    {key} = {n};")?,
                ParamValue::Text(text) => writeln!(f, "    {key} = {};", quote(text))?,
                ParamValue::List(items) => {
                    let items: Vec<String> = items.iter().map(|i| quote(i)).collect();
                    writeln!(f, "    {key} = {};", items.join(", "))?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

/// `allow.mount` → `allow.nomount`.
fn negate(key: &str) -> String {
    match key.rsplit_once('.') {
        Some((prefix, last)) => format!("{prefix}.no{last}"),
        None => format!("no{key}"),
    }
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
