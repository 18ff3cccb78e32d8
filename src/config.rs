//! Server settings, read from disk via `load`/`load_utf8`. This crate's
//! Cargo features (`toml_config`/`json_config`/`yaml_config`) select which
//! `serde`-driven format the extension on the path picks.

use crate::access::Access;
use indexmap::IndexMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Settings for one running server. Every field is optional in the
/// struct and defaulted by its accessor.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(
    any(feature = "toml_config", feature = "json_config", feature = "yaml_config"),
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct EngineConfig {
    /// `host:port` for the plain-TCP listener.
    pub bind: Option<String>,
    /// `host:port` for the telnet listener.
    /// `None` disables telnet entirely.
    pub telnet: Option<String>,
    /// Per-interface access caps, keyed by the interface name used in
    /// `bind`/`telnet` (e.g. `"tcp"`, `"telnet"`).
    pub access_caps: Option<IndexMap<String, String>>,
    /// Username to credential-secret map for transports that challenge for
    /// authentication. Credential storage itself is external; this is just
    /// where the map is loaded from.
    pub credentials: Option<IndexMap<String, String>>,
    /// Colon-separated module search roots, `CONFIGPATH`/`MODULEPATH`-style.
    pub module_path: Option<String>,
    /// Modules to load before the listeners start accepting connections.
    pub preload: Option<Vec<String>>,
    /// Modules to load once the first session completes its handshake.
    pub postload: Option<Vec<String>>,
}

impl EngineConfig {
    /// Loads a configuration from `path`, format chosen by extension
    /// (`.toml`/`.json`/`.yaml`/`.yml`) among whichever format features are
    /// compiled in.
    pub fn load(path: &Path) -> io::Result<EngineConfig> {
        let data = fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::parse(&data, ext)
    }

    /// Loads a configuration using `path` as a UTF-8 path string.
    pub fn load_utf8(path: &str) -> io::Result<EngineConfig> {
        EngineConfig::load(Path::new(path))
    }

    fn parse(data: &str, ext: &str) -> io::Result<EngineConfig> {
        match ext {
            #[cfg(feature = "json_config")]
            "json" => serde_json::from_str(data).map_err(invalid_input),
            #[cfg(feature = "yaml_config")]
            "yaml" | "yml" => serde_yaml::from_str(data).map_err(invalid_input),
            #[cfg(feature = "toml_config")]
            _ => toml::from_str(data).map_err(invalid_input),
            #[cfg(not(feature = "toml_config"))]
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "no configuration format feature enabled")),
        }
    }

    /// The plain-TCP bind address. Defaults to all interfaces on
    /// port 7000.
    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or("0.0.0.0:7000")
    }

    /// The telnet bind address, if the telnet listener is enabled.
    pub fn telnet(&self) -> Option<&str> {
        self.telnet.as_deref()
    }

    /// The access cap for `interface`, defaulting to `Full` when
    /// unconfigured.
    pub fn access_cap(&self, interface: &str) -> Access {
        self.access_caps
            .as_ref()
            .and_then(|caps| caps.get(interface))
            .and_then(|name| Access::parse(name))
            .unwrap_or(Access::Full)
    }

    /// The credential secret registered for `username`, if any.
    pub fn credential(&self, username: &str) -> Option<&str> {
        self.credentials.as_ref().and_then(|creds| creds.get(username)).map(|s| s.as_str())
    }

    /// The configured module search roots, split on `:`. Empty when unset.
    pub fn module_path(&self) -> Vec<&str> {
        self.module_path.as_deref().map(|p| p.split(':').filter(|s| !s.is_empty()).collect()).unwrap_or_default()
    }

    /// Modules to load before listeners start accepting connections.
    pub fn preload(&self) -> &[String] {
        self.preload.as_deref().unwrap_or(&[])
    }

    /// Modules to load once the first session completes its handshake.
    pub fn postload(&self) -> &[String] {
        self.postload.as_deref().unwrap_or(&[])
    }
}

#[cfg(any(feature = "toml_config", feature = "json_config", feature = "yaml_config"))]
fn invalid_input(err: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.bind(), "0.0.0.0:7000");
        assert_eq!(cfg.telnet(), None);
        assert_eq!(cfg.access_cap("tcp"), Access::Full);
        assert_eq!(cfg.credential("alice"), None);
        assert!(cfg.module_path().is_empty());
        assert!(cfg.preload().is_empty());
    }

    #[cfg(feature = "toml_config")]
    #[test]
    fn parses_toml() {
        let data = r#"
            bind = "127.0.0.1:7000"
            telnet = "127.0.0.1:2323"
            preload = ["inventory"]

            [access_caps]
            tcp = "Controller"

            [credentials]
            alice = "secret"
        "#;
        let cfg: EngineConfig = toml::from_str(data).unwrap();
        assert_eq!(cfg.bind(), "127.0.0.1:7000");
        assert_eq!(cfg.telnet(), Some("127.0.0.1:2323"));
        assert_eq!(cfg.access_cap("tcp"), Access::Controller);
        assert_eq!(cfg.credential("alice"), Some("secret"));
        assert_eq!(cfg.preload(), &["inventory".to_string()]);
    }
}
