use crate::{Error, Result};

/// One entry of the static `relay` list in the server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticRelayConfig {
    pub server: String,
    pub port: u16,
    pub mount: String,
    pub local_mount: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub send_icy_metadata: bool,
    pub on_demand: bool,
    pub enable: bool,
}

/// The subset of the server's global configuration the relay subsystem
/// consumes. Constructed by whatever parses the real configuration file;
/// that parser is out of scope here (`Config` is an external collaborator).
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub master_server: Option<String>,
    pub master_server_port: Option<u16>,
    pub master_ssl_port: Option<u16>,
    pub master_username: Option<String>,
    pub master_password: Option<String>,
    pub master_update_interval: u64,
    pub master_relay_auth: bool,
    pub master_redirect_port: Option<u16>,
    pub on_demand: bool,
    pub relays: Vec<StaticRelayConfig>,
    pub hostname: String,
}

impl RelayConfig {
    /// Validate the fields this subsystem depends on.
    pub fn validate(&self) -> Result<()> {
        if self.master_server.is_some() && self.master_server_port.is_none() && self.master_ssl_port.is_none() {
            return Err(Error::config(
                "master_server configured without master_server_port or master_ssl_port",
            ));
        }

        for relay in &self.relays {
            if !relay.local_mount.starts_with('/') {
                return Err(Error::config(format!(
                    "relay local_mount must start with '/': {}",
                    relay.local_mount
                )));
            }
        }

        Ok(())
    }

    /// True if this node should advertise itself as a slave to the master
    /// (i.e. accepts redirected overflow traffic from it).
    pub fn is_slave_of_master(&self) -> bool {
        self.master_redirect_port.is_some() && self.master_server.is_some()
    }

    /// The master's `(server, master_server_port)` seeded into the slave
    /// registry on startup and refreshed at every poll, per spec.md §4.5 —
    /// only when this node is itself a slave of that master.
    pub fn master_as_slave_host(&self) -> Option<(String, u16)> {
        if !self.is_slave_of_master() {
            return None;
        }
        let server = self.master_server.clone()?;
        let port = self.master_server_port?;
        Some((server, port))
    }

    /// Whether the master fetch should use HTTPS.
    pub fn master_uses_ssl(&self) -> bool {
        self.master_ssl_port.is_some()
    }

    pub fn master_port(&self) -> Option<u16> {
        self.master_ssl_port.or(self.master_server_port)
    }
}
