// Copyright 2026 Piloader Contributors
// SPDX-License-Identifier: MIT

//! Typed view over the daemon configuration file.
//!
//! The file is INI with the sections `DEFAULT`, `MQTT`, `PLCSERVER` and
//! `XMLRPC`. Older installations carry the `PLCSERVER` settings under the
//! legacy name `PLCSLAVE`; those are migrated on load and the migrated
//! file is persisted once.
//!
//! The INI parser itself is an opaque key/value provider; everything
//! typed (defaults, ranges, the update validation table, the per
//! subsystem restart predicates) lives here.

use crate::error::ConfigError;
use ini::Ini;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;

/// Default daemon configuration file.
pub const DEFAULT_CONFFILE: &str = "/etc/revpipyload/revpipyload.conf";

/// What a detected driver reset or file change does to the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetDriverAction {
    /// Do not touch the running program.
    None,
    /// Restart the program when the hardware configuration file changed.
    OnFileChange,
    /// Restart the program when the driver reset event fired.
    OnResetEvent,
}

impl ResetDriverAction {
    fn from_int(value: i64) -> Self {
        match value {
            0 => Self::None,
            1 => Self::OnFileChange,
            _ => Self::OnResetEvent,
        }
    }

    pub fn as_int(self) -> u8 {
        match self {
            Self::None => 0,
            Self::OnFileChange => 1,
            Self::OnResetEvent => 2,
        }
    }
}

/// `[DEFAULT]` program settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramSettings {
    pub autoreload: bool,
    pub autoreloaddelay: u32,
    pub autostart: bool,
    pub plcworkdir: String,
    pub plcprogram: String,
    pub plcprogram_stop_timeout: u32,
    pub plcprogram_watchdog: u32,
    pub plcarguments: String,
    pub plcworkdir_set_uid: bool,
    pub plcuid: u32,
    pub plcgid: u32,
    pub pythonversion: u8,
    pub replace_ios: String,
    pub reset_driver_action: ResetDriverAction,
    pub rtlevel: u8,
    pub zeroonerror: bool,
    pub zeroonexit: bool,
}

impl Default for ProgramSettings {
    fn default() -> Self {
        Self {
            autoreload: true,
            autoreloaddelay: 5,
            autostart: false,
            plcworkdir: ".".into(),
            plcprogram: "none.py".into(),
            plcprogram_stop_timeout: 5,
            plcprogram_watchdog: 0,
            plcarguments: String::new(),
            plcworkdir_set_uid: false,
            plcuid: 65534,
            plcgid: 65534,
            pythonversion: 3,
            replace_ios: String::new(),
            reset_driver_action: ResetDriverAction::OnResetEvent,
            rtlevel: 0,
            zeroonerror: true,
            zeroonexit: true,
        }
    }
}

/// `[MQTT]` publisher settings. The publisher itself is an external
/// component; the daemon only parses, persists and hands these on.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub enabled: bool,
    pub basetopic: String,
    pub sendinterval: u32,
    pub broker_address: String,
    pub port: u16,
    pub tls_set: bool,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub send_on_event: bool,
    pub write_outputs: bool,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            basetopic: String::new(),
            sendinterval: 30,
            broker_address: "localhost".into(),
            port: 1883,
            tls_set: false,
            username: String::new(),
            password: String::new(),
            client_id: String::new(),
            send_on_event: false,
            write_outputs: false,
        }
    }
}

/// `[PLCSERVER]` binary protocol server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PlcServerSettings {
    pub enabled: bool,
    pub aclfile: String,
    /// Normalized bind address: empty string means all interfaces.
    pub bindip: String,
    pub port: u16,
    pub watchdog: bool,
}

impl Default for PlcServerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            aclfile: String::new(),
            bindip: "127.0.0.1".into(),
            port: 55234,
            watchdog: true,
        }
    }
}

/// `[XMLRPC]` control surface settings.
#[derive(Debug, Clone, PartialEq)]
pub struct XmlRpcSettings {
    pub enabled: bool,
    pub aclfile: String,
    pub bindip: String,
    pub port: u16,
}

impl Default for XmlRpcSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            aclfile: String::new(),
            bindip: "127.0.0.1".into(),
            port: 55123,
        }
    }
}

/// Complete typed configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub program: ProgramSettings,
    pub mqtt: MqttSettings,
    pub plcserver: PlcServerSettings,
    pub xmlrpc: XmlRpcSettings,
}

impl Settings {
    /// Load the configuration file. Missing or unparseable files are an
    /// error; the daemon refuses to come up without a configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let ini =
            Ini::load_from_file(path.as_ref()).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self::from_ini(&ini))
    }

    /// Build settings from a parsed INI document, applying defaults.
    pub fn from_ini(ini: &Ini) -> Self {
        let get = |section: &str, key: &str| -> Option<&str> {
            ini.section(Some(section)).and_then(|p| p.get(key))
        };

        let p = ProgramSettings {
            autoreload: get_bool(get("DEFAULT", "autoreload"), true),
            autoreloaddelay: get_int(get("DEFAULT", "autoreloaddelay"), 5) as u32,
            autostart: get_bool(get("DEFAULT", "autostart"), false),
            plcworkdir: get("DEFAULT", "plcworkdir").unwrap_or(".").to_string(),
            plcprogram: get("DEFAULT", "plcprogram").unwrap_or("none.py").to_string(),
            plcprogram_stop_timeout: get_int(get("DEFAULT", "plcprogram_stop_timeout"), 5) as u32,
            plcprogram_watchdog: get_int(get("DEFAULT", "plcprogram_watchdog"), 0) as u32,
            plcarguments: get("DEFAULT", "plcarguments").unwrap_or("").to_string(),
            plcworkdir_set_uid: get_bool(get("DEFAULT", "plcworkdir_set_uid"), false),
            plcuid: get_int(get("DEFAULT", "plcuid"), 65534) as u32,
            plcgid: get_int(get("DEFAULT", "plcgid"), 65534) as u32,
            pythonversion: get_int(get("DEFAULT", "pythonversion"), 3) as u8,
            replace_ios: get("DEFAULT", "replace_ios").unwrap_or("").to_string(),
            reset_driver_action: ResetDriverAction::from_int(get_int(
                get("DEFAULT", "reset_driver_action"),
                2,
            )),
            rtlevel: get_int(get("DEFAULT", "rtlevel"), 0) as u8,
            zeroonerror: get_bool(get("DEFAULT", "zeroonerror"), true),
            zeroonexit: get_bool(get("DEFAULT", "zeroonexit"), true),
        };

        let mqtt = MqttSettings {
            enabled: get_bool(get("MQTT", "mqtt"), false),
            basetopic: get("MQTT", "basetopic").unwrap_or("").to_string(),
            sendinterval: get_int(get("MQTT", "sendinterval"), 30) as u32,
            broker_address: get("MQTT", "broker_address").unwrap_or("localhost").to_string(),
            port: get_int(get("MQTT", "port"), 1883) as u16,
            tls_set: get_bool(get("MQTT", "tls_set"), false),
            username: get("MQTT", "username").unwrap_or("").to_string(),
            password: get("MQTT", "password").unwrap_or("").to_string(),
            client_id: get("MQTT", "client_id").unwrap_or("").to_string(),
            send_on_event: get_bool(get("MQTT", "send_on_event"), false),
            write_outputs: get_bool(get("MQTT", "write_outputs"), false),
        };

        let plcserver = PlcServerSettings {
            enabled: get_bool(get("PLCSERVER", "plcserver"), false),
            aclfile: get("PLCSERVER", "aclfile").unwrap_or("").to_string(),
            bindip: normalize_bindip(get("PLCSERVER", "bindip")),
            port: get_int(get("PLCSERVER", "port"), 55234) as u16,
            watchdog: get_bool(get("PLCSERVER", "watchdog"), true),
        };

        let xmlrpc = XmlRpcSettings {
            enabled: get_bool(get("XMLRPC", "xmlrpc"), false),
            aclfile: get("XMLRPC", "aclfile").unwrap_or("").to_string(),
            bindip: normalize_bindip(get("XMLRPC", "bindip")),
            port: get_int(get("XMLRPC", "port"), 55123) as u16,
        };

        Self { program: p, mqtt, plcserver, xmlrpc }
    }

    /// Fields whose change forces a program restart. Hot-applied knobs
    /// (autoreload, delays, watchdog timeout, zero flags) are excluded.
    pub fn program_fields_changed(&self, new: &Settings) -> bool {
        let a = &self.program;
        let b = &new.program;
        a.plcworkdir != b.plcworkdir
            || a.plcprogram != b.plcprogram
            || a.plcarguments != b.plcarguments
            || a.plcuid != b.plcuid
            || a.plcgid != b.plcgid
            || a.pythonversion != b.pythonversion
            || a.rtlevel != b.rtlevel
    }

    /// Fields whose change forces a PLC server restart. ACL content and
    /// the watchdog flag are hot-applied.
    pub fn plcserver_fields_changed(&self, new: &Settings) -> bool {
        let a = &self.plcserver;
        let b = &new.plcserver;
        a.enabled != b.enabled || a.bindip != b.bindip || a.port != b.port
    }

    /// Fields whose change forces an RPC surface restart.
    pub fn xmlrpc_fields_changed(&self, new: &Settings) -> bool {
        let a = &self.xmlrpc;
        let b = &new.xmlrpc;
        a.enabled != b.enabled || a.bindip != b.bindip || a.port != b.port
    }

    pub fn mqtt_fields_changed(&self, new: &Settings) -> bool {
        self.mqtt != new.mqtt || self.program.replace_ios != new.program.replace_ios
    }
}

/// Migrate a legacy `PLCSLAVE` section to `PLCSERVER` and persist once.
///
/// Returns true when the file was rewritten.
pub fn migrate_legacy_sections(path: impl AsRef<Path>) -> Result<bool, ConfigError> {
    let path = path.as_ref();
    let mut ini = Ini::load_from_file(path).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let Some(legacy) = ini.section(Some("PLCSLAVE")).cloned() else {
        return Ok(false);
    };

    for (old_name, new_name) in [
        ("plcslave", "plcserver"),
        ("aclfile", "aclfile"),
        ("bindip", "bindip"),
        ("port", "port"),
        ("watchdog", "watchdog"),
    ] {
        if let Some(value) = legacy.get(old_name) {
            // Values already present under the new name win
            if ini
                .section(Some("PLCSERVER"))
                .and_then(|p| p.get(new_name))
                .is_none()
            {
                ini.with_section(Some("PLCSERVER")).set(new_name, value);
            }
        }
    }
    ini.delete(Some("PLCSLAVE"));
    ini.write_to_file(path)?;
    Ok(true)
}

/// One entry of the update validation table: flat wire key, target
/// section, target key, accepted value pattern.
struct UpdateRule {
    wire_key: &'static str,
    section: &'static str,
    key: &'static str,
    pattern: &'static str,
}

const UPDATE_RULES: &[UpdateRule] = &[
    UpdateRule { wire_key: "autoreload", section: "DEFAULT", key: "autoreload", pattern: "[01]" },
    UpdateRule { wire_key: "autoreloaddelay", section: "DEFAULT", key: "autoreloaddelay", pattern: "[0-9]+" },
    UpdateRule { wire_key: "autostart", section: "DEFAULT", key: "autostart", pattern: "[01]" },
    UpdateRule { wire_key: "plcprogram", section: "DEFAULT", key: "plcprogram", pattern: ".+" },
    UpdateRule { wire_key: "plcprogram_stop_timeout", section: "DEFAULT", key: "plcprogram_stop_timeout", pattern: "[0-9]+" },
    UpdateRule { wire_key: "plcprogram_watchdog", section: "DEFAULT", key: "plcprogram_watchdog", pattern: "[0-9]+" },
    UpdateRule { wire_key: "plcarguments", section: "DEFAULT", key: "plcarguments", pattern: ".*" },
    UpdateRule { wire_key: "plcworkdir_set_uid", section: "DEFAULT", key: "plcworkdir_set_uid", pattern: "[01]" },
    UpdateRule { wire_key: "pythonversion", section: "DEFAULT", key: "pythonversion", pattern: "[23]" },
    UpdateRule { wire_key: "replace_ios", section: "DEFAULT", key: "replace_ios", pattern: ".*" },
    UpdateRule { wire_key: "reset_driver_action", section: "DEFAULT", key: "reset_driver_action", pattern: "[0-2]" },
    UpdateRule { wire_key: "rtlevel", section: "DEFAULT", key: "rtlevel", pattern: "[0-1]" },
    UpdateRule { wire_key: "zeroonerror", section: "DEFAULT", key: "zeroonerror", pattern: "[01]" },
    UpdateRule { wire_key: "zeroonexit", section: "DEFAULT", key: "zeroonexit", pattern: "[01]" },
    UpdateRule { wire_key: "mqtt", section: "MQTT", key: "mqtt", pattern: "[01]" },
    UpdateRule { wire_key: "mqttbasetopic", section: "MQTT", key: "basetopic", pattern: ".*" },
    UpdateRule { wire_key: "mqttsendinterval", section: "MQTT", key: "sendinterval", pattern: "[0-9]+" },
    UpdateRule { wire_key: "mqttbroker_address", section: "MQTT", key: "broker_address", pattern: ".+" },
    UpdateRule { wire_key: "mqttport", section: "MQTT", key: "port", pattern: "[0-9]+" },
    UpdateRule { wire_key: "mqtttls_set", section: "MQTT", key: "tls_set", pattern: "[01]" },
    UpdateRule { wire_key: "mqttusername", section: "MQTT", key: "username", pattern: ".*" },
    UpdateRule { wire_key: "mqttpassword", section: "MQTT", key: "password", pattern: ".*" },
    UpdateRule { wire_key: "mqttclient_id", section: "MQTT", key: "client_id", pattern: ".*" },
    UpdateRule { wire_key: "mqttsend_on_event", section: "MQTT", key: "send_on_event", pattern: "[01]" },
    UpdateRule { wire_key: "mqttwrite_outputs", section: "MQTT", key: "write_outputs", pattern: "[01]" },
    UpdateRule { wire_key: "plcserver", section: "PLCSERVER", key: "plcserver", pattern: "[01]" },
    UpdateRule { wire_key: "plcserverport", section: "PLCSERVER", key: "port", pattern: "[0-9]{1,5}" },
    UpdateRule { wire_key: "plcserverwatchdog", section: "PLCSERVER", key: "watchdog", pattern: "[01]" },
    UpdateRule { wire_key: "xmlrpc", section: "XMLRPC", key: "xmlrpc", pattern: "[01]" },
];

/// Legacy wire names still sent by old control clients.
const WIRE_RENAMES: &[(&str, &str)] = &[
    ("plcslave", "plcserver"),
    ("plcslaveacl", "plcserveracl"),
    ("plcslavebindip", "plcserverbindip"),
    ("plcslaveport", "plcserverport"),
    ("plcslavewatchdog", "plcserverwatchdog"),
];

/// Result of a validated configuration update.
pub struct AppliedUpdate {
    /// New PLC server ACL string, when the update carried one.
    pub plcserver_acl: Option<String>,
    /// New RPC ACL string, when the update carried one.
    pub xmlrpc_acl: Option<String>,
}

/// Validate a flat key/value update against the rule table and merge it
/// into the configuration file.
///
/// ACL strings are validated against the given manager patterns but not
/// written to the file; they are returned so the caller can hand them to
/// the ACL managers and their own files. The update is all-or-nothing:
/// the first invalid value rejects the whole request and the file stays
/// untouched.
pub fn update_file(
    path: impl AsRef<Path>,
    updates: &BTreeMap<String, String>,
    plcserver_acl_pattern: &str,
    xmlrpc_acl_pattern: &str,
) -> Result<AppliedUpdate, ConfigError> {
    let path = path.as_ref();
    let mut ini = Ini::load_from_file(path).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Normalize legacy wire names first
    let mut updates: BTreeMap<String, String> = updates.clone();
    for (old, new) in WIRE_RENAMES {
        if let Some(value) = updates.remove(*old) {
            updates.insert((*new).to_string(), value);
        }
    }

    let acl_of = |key: &str, pattern: &str| -> Result<Option<String>, ConfigError> {
        match updates.get(key) {
            Some(value) if full_match(pattern, value) => Ok(Some(value.clone())),
            Some(value) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Ok(None),
        }
    };
    let plcserver_acl = acl_of("plcserveracl", plcserver_acl_pattern)?;
    let xmlrpc_acl = acl_of("xmlrpcacl", xmlrpc_acl_pattern)?;

    for rule in UPDATE_RULES {
        let Some(value) = updates.get(rule.wire_key) else {
            continue;
        };
        if !full_match(rule.pattern, value) {
            return Err(ConfigError::InvalidValue {
                key: rule.wire_key.to_string(),
                value: value.clone(),
            });
        }
        ini.with_section(Some(rule.section)).set(rule.key, value);
    }

    ini.write_to_file(path)?;
    Ok(AppliedUpdate { plcserver_acl, xmlrpc_acl })
}

/// Anchored match of the whole string, like a regex "fullmatch".
pub fn full_match(pattern: &str, value: &str) -> bool {
    Regex::new(&format!("^(?:{pattern})$"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn normalize_bindip(value: Option<&str>) -> String {
    match value {
        Some("*") => String::new(),
        Some("") | None => "127.0.0.1".into(),
        Some(ip) => ip.to_string(),
    }
}

fn get_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if ["1", "true", "yes", "on"].contains(&v.as_str()) => true,
        Some(v) if ["0", "false", "no", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}

fn get_int(value: Option<&str>, default: i64) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_conf(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn defaults_apply_on_empty_file() {
        let file = write_conf("[DEFAULT]\n");
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.program.autoreload);
        assert_eq!(settings.program.autoreloaddelay, 5);
        assert_eq!(settings.program.plcprogram, "none.py");
        assert_eq!(settings.program.plcuid, 65534);
        assert_eq!(settings.plcserver.port, 55234);
        assert_eq!(settings.plcserver.bindip, "127.0.0.1");
        assert!(settings.plcserver.watchdog);
        assert_eq!(settings.xmlrpc.port, 55123);
        assert!(!settings.mqtt.enabled);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Settings::load("/nonexistent/revpipyload.conf").is_err());
    }

    #[test]
    fn bindip_star_means_all_interfaces() {
        let file = write_conf("[PLCSERVER]\nplcserver = 1\nbindip = *\nport = 12345\n");
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.plcserver.enabled);
        assert_eq!(settings.plcserver.bindip, "");
        assert_eq!(settings.plcserver.port, 12345);
    }

    #[test]
    fn legacy_plcslave_section_is_migrated_once() {
        let file = write_conf(
            "[DEFAULT]\nautostart = 1\n\n[PLCSLAVE]\nplcslave = 1\nbindip = *\nport = 55235\nwatchdog = 0\n",
        );

        assert!(migrate_legacy_sections(file.path()).unwrap());
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.plcserver.enabled);
        assert_eq!(settings.plcserver.bindip, "");
        assert_eq!(settings.plcserver.port, 55235);
        assert!(!settings.plcserver.watchdog);

        // Second call finds nothing to do
        assert!(!migrate_legacy_sections(file.path()).unwrap());
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(!raw.contains("PLCSLAVE"));
    }

    #[test]
    fn restart_predicates_split_hot_and_cold_fields() {
        let base = Settings::default();

        let mut hot = base.clone();
        hot.program.autoreload = false;
        hot.program.autoreloaddelay = 99;
        hot.program.plcprogram_watchdog = 10;
        hot.program.zeroonexit = false;
        assert!(!base.program_fields_changed(&hot));

        let mut cold = base.clone();
        cold.program.plcprogram = "main.py".into();
        assert!(base.program_fields_changed(&cold));

        let mut acl_only = base.clone();
        acl_only.plcserver.aclfile = "/etc/other.acl".into();
        acl_only.plcserver.watchdog = false;
        assert!(!base.plcserver_fields_changed(&acl_only));

        let mut rebind = base.clone();
        rebind.plcserver.port = 7;
        assert!(base.plcserver_fields_changed(&rebind));
    }

    #[test]
    fn update_validates_and_merges() {
        let file = write_conf("[DEFAULT]\nautostart = 0\n");
        let mut updates = BTreeMap::new();
        updates.insert("autostart".to_string(), "1".to_string());
        updates.insert("pythonversion".to_string(), "2".to_string());
        updates.insert("mqttport".to_string(), "8883".to_string());

        update_file(file.path(), &updates, "", "").unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.program.autostart);
        assert_eq!(settings.program.pythonversion, 2);
        assert_eq!(settings.mqtt.port, 8883);
    }

    #[test]
    fn update_rejects_bad_values_wholesale() {
        let file = write_conf("[DEFAULT]\nautostart = 0\n");
        let mut updates = BTreeMap::new();
        updates.insert("autostart".to_string(), "1".to_string());
        updates.insert("pythonversion".to_string(), "4".to_string());

        assert!(update_file(file.path(), &updates, "", "").is_err());
        let settings = Settings::load(file.path()).unwrap();
        assert!(!settings.program.autostart);
    }

    #[test]
    fn update_translates_legacy_wire_names() {
        let file = write_conf("[DEFAULT]\n");
        let mut updates = BTreeMap::new();
        updates.insert("plcslave".to_string(), "1".to_string());
        updates.insert("plcslaveport".to_string(), "55300".to_string());

        update_file(file.path(), &updates, "", "").unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert!(settings.plcserver.enabled);
        assert_eq!(settings.plcserver.port, 55300);
    }

    #[test]
    fn update_returns_acl_strings_without_persisting_them() {
        let file = write_conf("[DEFAULT]\n");
        let mut updates = BTreeMap::new();
        let acl_pattern = r"(([\d\*]{1,3}\.){3}[\d\*]{1,3},[0-1] ?)*";
        updates.insert("plcslaveacl".to_string(), "127.0.0.1,1".to_string());

        let applied = update_file(file.path(), &updates, acl_pattern, acl_pattern).unwrap();
        assert_eq!(applied.plcserver_acl.as_deref(), Some("127.0.0.1,1"));
        assert!(applied.xmlrpc_acl.is_none());
        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(!raw.contains("127.0.0.1,1"));

        updates.insert("plcslaveacl".to_string(), "127.0.0.1,7".to_string());
        assert!(update_file(file.path(), &updates, acl_pattern, acl_pattern).is_err());
    }
}
