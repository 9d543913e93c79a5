use coffer::net::wire;
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DEFAULT_DUMPDIR: &str = "/var/crash";

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    pub bind_address: Ipv4Addr,
    pub port: u16,
    pub dumpdir: PathBuf,
    pub handler_script: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    /// TOML file describing the logging back-end; stderr when absent.
    pub config: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: Server,
    pub logging: Logging,
}

impl Default for Server {
    fn default() -> Server {
        Server {
            bind_address: Ipv4Addr::UNSPECIFIED,
            port: wire::PORT,
            dumpdir: PathBuf::from(DEFAULT_DUMPDIR),
            handler_script: None,
            pidfile: None,
        }
    }
}

impl DaemonConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<DaemonConfig, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();

        assert_eq!(config.server.bind_address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.server.port, wire::PORT);
        assert_eq!(config.server.dumpdir, PathBuf::from("/var/crash"));
        assert!(config.server.handler_script.is_none());
        assert!(config.logging.config.is_none());
    }

    #[test]
    fn test_partial_toml_fills_in_defaults() {
        let config: DaemonConfig = serdeconv::from_toml_str(
            r#"
[server]
bind_address = "192.0.2.10"
dumpdir = "/srv/crash"
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind_address, "192.0.2.10".parse::<Ipv4Addr>().unwrap());
        assert_eq!(config.server.dumpdir, PathBuf::from("/srv/crash"));
        assert_eq!(config.server.port, wire::PORT);
    }
}
