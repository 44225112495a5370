//! `SlaveRegistry` (spec.md §4.5): the peer-host table used for overflow
//! redirects, keyed by `(server, port)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::IteratorRandom;
use tokio::sync::RwLock;
use url::Url;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlaveKey {
    pub server: String,
    pub port: u16,
}

pub struct SlaveRegistry {
    hosts: RwLock<HashMap<SlaveKey, u32>>,
    slave_count: AtomicU64,
}

impl Default for SlaveRegistry {
    fn default() -> Self {
        SlaveRegistry { hosts: RwLock::new(HashMap::new()), slave_count: AtomicU64::new(0) }
    }
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create `(server, port)`; increments its listener count.
    /// Bumps the global slave count only when the entry is new.
    pub async fn add(&self, server: &str, port: u16) {
        let key = SlaveKey { server: server.to_string(), port };
        let mut hosts = self.hosts.write().await;
        match hosts.get_mut(&key) {
            Some(count) => *count += 1,
            None => {
                hosts.insert(key, 1);
                self.slave_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Parse an `ice-redirect: server:port` header value and decrement
    /// that entry's listener count, removing it once it reaches zero.
    pub async fn remove_for_header(&self, header_value: &str) -> Result<()> {
        let (server, port) = parse_redirect_header(header_value)?;
        self.remove(&server, port).await;
        Ok(())
    }

    pub async fn remove(&self, server: &str, port: u16) {
        let key = SlaveKey { server: server.to_string(), port };
        let mut hosts = self.hosts.write().await;
        if let Some(count) = hosts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                hosts.remove(&key);
                self.slave_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Uniformly pick one registered host, or `None` if the table is empty.
    pub async fn pick_random(&self) -> Option<SlaveKey> {
        let hosts = self.hosts.read().await;
        hosts.keys().cloned().choose(&mut rand::rng())
    }

    pub async fn slave_count(&self) -> u64 {
        self.slave_count.load(Ordering::SeqCst)
    }

    pub async fn count_for(&self, server: &str, port: u16) -> Option<u32> {
        let hosts = self.hosts.read().await;
        hosts.get(&SlaveKey { server: server.to_string(), port }).copied()
    }
}

fn parse_redirect_header(value: &str) -> Result<(String, u16)> {
    let (server, port) = value
        .rsplit_once(':')
        .ok_or_else(|| Error::header_parse(format!("malformed ice-redirect header: {value}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::header_parse(format!("malformed ice-redirect port: {value}")))?;
    Ok((server.to_string(), port))
}

/// Build the `302` redirect response location for a listener being sent
/// to `(server, port)` for `mountpoint` (spec.md §6). Built through `Url`
/// rather than raw formatting so a malformed host or mountpoint is caught
/// here instead of producing a broken `Location` header downstream.
pub fn redirect_location(server: &str, port: u16, mountpoint: &str) -> Result<String> {
    let mut url = Url::parse(&format!("http://{server}:{port}"))
        .map_err(|e| Error::header_parse(format!("invalid slave host {server}:{port}: {e}")))?;
    url.set_path(mountpoint);
    Ok(url.to_string())
}
