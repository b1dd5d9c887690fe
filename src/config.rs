//! Controller configuration, read from a TOML file. Every key is optional.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::mac::{Dpid, MacAddr};

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    /// Hypervisors known before their first ARP, by MAC.
    pub hypervisors: BTreeMap<MacAddr, Dpid>,
    pub orchestrator: OrchestratorConfig,
    pub migration: MigrationConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub openflow_listen: SocketAddr,
    pub api_listen: SocketAddr,
    /// Source address of the controller's own ARP probes.
    pub controller_mac: MacAddr,
    pub lldp_interval_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            openflow_listen: SocketAddr::from(([0, 0, 0, 0], 6633)),
            api_listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            controller_mac: MacAddr([2, 2, 2, 2, 2, 2]),
            lldp_interval_secs: 5,
        }
    }
}

impl ControllerConfig {
    pub fn lldp_interval(&self) -> Duration {
        Duration::from_secs(self.lldp_interval_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    /// Time given to the switches to answer a stats request.
    pub stats_wait_ms: u64,
    pub cycle_interval_ms: u64,
    pub window_capacity: usize,
    pub rsd_threshold_percent: f64,
    /// Probed before the first cycle until that many hypervisors are known.
    pub hypervisor_ips: Vec<Ipv4Addr>,
    pub discovery_interval_ms: u64,
    /// Left out of the cost model, together with the hypervisors they run on.
    pub excluded_hosts: Vec<MacAddr>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            enabled: true,
            stats_wait_ms: 1000,
            cycle_interval_ms: 4000,
            window_capacity: 3,
            rsd_threshold_percent: 5.0,
            hypervisor_ips: vec![],
            discovery_interval_ms: 2000,
            excluded_hosts: vec![],
        }
    }
}

impl OrchestratorConfig {
    pub fn stats_wait(&self) -> Duration {
        Duration::from_millis(self.stats_wait_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Log migrations instead of running them.
    pub dry_run: bool,
    /// libvirt connection URI, `{host}` is replaced by the hypervisor's host name.
    pub uri_template: String,
    pub hypervisor_hosts: BTreeMap<Dpid, String>,
    /// libvirt domain of each VM. VMs missing here cannot be migrated.
    pub vm_names: BTreeMap<MacAddr, String>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            dry_run: false,
            uri_template: "qemu+ssh://{host}/system".to_string(),
            hypervisor_hosts: BTreeMap::new(),
            vm_names: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        raw.parse()
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.controller.openflow_listen.port(), 6633);
        assert_eq!(config.orchestrator.window_capacity, 3);
        assert_eq!(config.orchestrator.cycle_interval(), Duration::from_secs(4));
    }

    #[test]
    fn full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[controller]
api_listen = "0.0.0.0:9000"
controller_mac = "02:00:00:00:00:01"

[hypervisors]
"90:b1:1c:87:72:c5" = "0000000000000004"

[orchestrator]
stats_wait_ms = 500
hypervisor_ips = ["10.0.0.1", "10.0.0.2"]
excluded_hosts = ["52:54:00:00:00:09"]

[migration]
dry_run = true
[migration.hypervisor_hosts]
"0000000000000004" = "node4"
[migration.vm_names]
"52:54:00:00:00:01" = "web"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.controller.api_listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.controller.openflow_listen.port(), 6633);
        assert_eq!(config.controller.controller_mac, MacAddr([2, 0, 0, 0, 0, 1]));
        assert_eq!(
            config.hypervisors,
            btreemap! { "90:b1:1c:87:72:c5".parse().unwrap() => Dpid(4) }
        );
        assert_eq!(config.orchestrator.stats_wait(), Duration::from_millis(500));
        assert_eq!(config.orchestrator.hypervisor_ips.len(), 2);
        assert_eq!(config.orchestrator.rsd_threshold_percent, 5.0);
        assert!(config.migration.dry_run);
        assert_eq!(config.migration.hypervisor_hosts.get(&Dpid(4)).unwrap(), "node4");
        assert_eq!(config.migration.uri_template, "qemu+ssh://{host}/system");
    }

    #[test]
    fn errors() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/sdnmgmt.toml")),
            Err(ConfigError::Read { .. })
        ));
        assert!(matches!(
            "[hypervisors]\n\"zz\" = \"1\"".parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }
}
