//! First-boot configuration: opaque user data and the Ignition renderer.
//!
//! Only Ignition spec 3.3.0 is produced. Inputs in any 3.x version are
//! accepted, since each 3.x spec is a subset of the next.

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};

pub const IGNITION_VERSION: &str = "3.3.0";

/// Unvalidated first-boot configuration for a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserData {
    /// No configuration at all; additions are dropped.
    Empty,
    /// Ignition JSON.
    Ignition(String),
    /// Anything else, passed through untouched.
    Other(String),
}

impl UserData {
    pub fn empty_ignition() -> Self {
        UserData::Ignition(format!(r#"{{"ignition":{{"version":"{}"}}}}"#, IGNITION_VERSION))
    }

    /// Guess the kind: blank is empty, JSON is Ignition, the rest is opaque.
    pub fn from_raw(data: &str) -> Self {
        if data.trim().is_empty() {
            UserData::Empty
        } else if serde_json::from_str::<Value>(data).is_ok() {
            UserData::Ignition(data.to_string())
        } else {
            UserData::Other(data.to_string())
        }
    }

    fn data(&self) -> &str {
        match self {
            UserData::Empty => "",
            UserData::Ignition(d) | UserData::Other(d) => d,
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.data().contains(needle)
    }

    /// Replace every occurrence of `old` with `new`.
    pub fn subst(&self, old: &str, new: &str) -> Self {
        match self {
            UserData::Empty => UserData::Empty,
            UserData::Ignition(d) => UserData::Ignition(d.replace(old, new)),
            UserData::Other(d) => UserData::Other(d.replace(old, new)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitState {
    #[default]
    NoState,
    Enable,
    Mask,
}

/// Turns user data into a mutable, serializable config.
pub trait Renderer: Send + Sync {
    fn render(&self, userdata: &UserData, platform: &str) -> Result<Box<dyn RenderedConfig>>;
}

/// A rendered config that the orchestration layer decorates before boot.
pub trait RenderedConfig: fmt::Display + Send + Sync {
    fn is_ignition(&self) -> bool;

    fn add_systemd_unit(&mut self, name: &str, contents: &str, state: UnitState);

    fn add_systemd_dropin(&mut self, service: &str, name: &str, contents: &str);

    fn add_file(&mut self, path: &str, contents: &str, mode: u32);

    fn add_authorized_keys(&mut self, user: &str, keys: &[String]);

    /// Merge a remote config into this one at boot.
    fn add_config_source(&mut self, source: &str);

    /// Log in automatically as `core` on virtual and serial consoles.
    fn add_autologin(&mut self) {
        self.add_systemd_dropin(
            "getty@.service",
            "10-autologin.conf",
            &autologin_dropin("--noclear"),
        );
        self.add_systemd_dropin(
            "serial-getty@.service",
            "10-autologin.conf",
            &autologin_dropin("--keep-baud 115200,38400,9600"),
        );
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_string())
            .with_context(|| format!("writing config {}", path.display()))
    }
}

fn autologin_dropin(args: &str) -> String {
    format!(
        "[Service]\nExecStart=\nExecStart=-/sbin/agetty --autologin core -o '-p -f core' {} %I $TERM\n",
        args
    )
}

/// Ignition contents are embedded as data URLs.
pub fn data_url(contents: &[u8]) -> String {
    format!(
        "data:;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(contents)
    )
}

#[derive(Debug, Default, Clone)]
pub struct IgnitionRenderer;

impl Renderer for IgnitionRenderer {
    fn render(&self, userdata: &UserData, platform: &str) -> Result<Box<dyn RenderedConfig>> {
        debug!(platform = %platform, "rendering user data");
        match userdata {
            UserData::Ignition(data) => Ok(Box::new(IgnitionConfig::parse(data)?)),
            UserData::Empty => Ok(Box::new(OpaqueConfig(String::new()))),
            UserData::Other(data) => Ok(Box::new(OpaqueConfig(data.clone()))),
        }
    }
}

/// An Ignition 3.3.0 document.
#[derive(Debug, Clone)]
pub struct IgnitionConfig {
    root: Map<String, Value>,
}

impl IgnitionConfig {
    pub fn new() -> Self {
        let mut root = Map::new();
        root.insert("ignition".into(), json!({ "version": IGNITION_VERSION }));
        Self { root }
    }

    pub fn parse(data: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(data).context("parsing Ignition config")?;
        let Value::Object(mut root) = value else {
            bail!("Ignition config is not a JSON object");
        };
        let version = root
            .get("ignition")
            .and_then(|i| i.get("version"))
            .and_then(Value::as_str)
            .context("Ignition config has no version")?;
        if !version.starts_with("3.") {
            bail!("unsupported Ignition version {}", version);
        }
        if let Some(Value::Object(ign)) = root.get_mut("ignition") {
            ign.insert("version".into(), Value::String(IGNITION_VERSION.into()));
        }
        Ok(Self { root })
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    fn object(&mut self, path: &[&str]) -> &mut Map<String, Value> {
        let mut cur = &mut self.root;
        for key in path {
            let entry = cur.entry(key.to_string()).or_insert(Value::Null);
            cur = ensure_object(entry);
        }
        cur
    }

    fn list(&mut self, path: &[&str], field: &str) -> &mut Vec<Value> {
        let entry = self
            .object(path)
            .entry(field.to_string())
            .or_insert(Value::Null);
        ensure_array(entry)
    }
}

impl Default for IgnitionConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_object(v: &mut Value) -> &mut Map<String, Value> {
    if !v.is_object() {
        *v = Value::Object(Map::new());
    }
    match v {
        Value::Object(m) => m,
        _ => unreachable!("value was just made an object"),
    }
}

fn ensure_array(v: &mut Value) -> &mut Vec<Value> {
    if !v.is_array() {
        *v = Value::Array(Vec::new());
    }
    match v {
        Value::Array(a) => a,
        _ => unreachable!("value was just made an array"),
    }
}

/// The object in `list` whose `key` equals `value`, created if missing.
fn keyed<'a>(list: &'a mut Vec<Value>, key: &str, value: &str) -> &'a mut Map<String, Value> {
    let idx = match list
        .iter()
        .position(|v| v.get(key).and_then(Value::as_str) == Some(value))
    {
        Some(i) => i,
        None => {
            let mut m = Map::new();
            m.insert(key.to_string(), Value::String(value.to_string()));
            list.push(Value::Object(m));
            list.len() - 1
        }
    };
    ensure_object(&mut list[idx])
}

impl fmt::Display for IgnitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(&self.root).map_err(|_| fmt::Error)?;
        f.write_str(&s)
    }
}

impl RenderedConfig for IgnitionConfig {
    fn is_ignition(&self) -> bool {
        true
    }

    fn add_systemd_unit(&mut self, name: &str, contents: &str, state: UnitState) {
        let unit = keyed(self.list(&["systemd"], "units"), "name", name);
        unit.insert("contents".into(), Value::String(contents.into()));
        unit.insert("enabled".into(), Value::Bool(state == UnitState::Enable));
        unit.insert("mask".into(), Value::Bool(state == UnitState::Mask));
    }

    fn add_systemd_dropin(&mut self, service: &str, name: &str, contents: &str) {
        let unit = keyed(self.list(&["systemd"], "units"), "name", service);
        let dropins = ensure_array(unit.entry("dropins").or_insert(Value::Null));
        let dropin = keyed(dropins, "name", name);
        dropin.insert("contents".into(), Value::String(contents.into()));
    }

    fn add_file(&mut self, path: &str, contents: &str, mode: u32) {
        let file = keyed(self.list(&["storage"], "files"), "path", path);
        file.insert(
            "contents".into(),
            json!({ "source": data_url(contents.as_bytes()) }),
        );
        file.insert("mode".into(), json!(mode));
    }

    fn add_authorized_keys(&mut self, user: &str, keys: &[String]) {
        let entry = keyed(self.list(&["passwd"], "users"), "name", user);
        let list = ensure_array(entry.entry("sshAuthorizedKeys").or_insert(Value::Null));
        for key in keys {
            if !list.iter().any(|k| k.as_str() == Some(key.as_str())) {
                list.push(Value::String(key.clone()));
            }
        }
    }

    fn add_config_source(&mut self, source: &str) {
        self.list(&["ignition", "config"], "merge")
            .push(json!({ "source": source }));
    }
}

/// A config this crate cannot edit. Additions are dropped with a warning.
#[derive(Debug, Clone)]
pub struct OpaqueConfig(String);

impl fmt::Display for OpaqueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl RenderedConfig for OpaqueConfig {
    fn is_ignition(&self) -> bool {
        false
    }

    fn add_systemd_unit(&mut self, name: &str, _contents: &str, _state: UnitState) {
        warn!(unit = %name, "cannot add systemd unit to non-Ignition config");
    }

    fn add_systemd_dropin(&mut self, service: &str, name: &str, _contents: &str) {
        warn!(unit = %service, dropin = %name, "cannot add dropin to non-Ignition config");
    }

    fn add_file(&mut self, path: &str, _contents: &str, _mode: u32) {
        warn!(path = %path, "cannot add file to non-Ignition config");
    }

    fn add_authorized_keys(&mut self, user: &str, _keys: &[String]) {
        warn!(user = %user, "cannot add SSH keys to non-Ignition config");
    }

    fn add_config_source(&mut self, source: &str) {
        warn!(source = %source, "cannot add config source to non-Ignition config");
    }
}
