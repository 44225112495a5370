//! `MasterPoller` (spec.md §4.4): periodically fetches the master's
//! streamlist and turns it into a desired `master_relays` list.

use std::sync::Arc;

use log::{debug, warn};

use crate::config::RelayConfig;
use crate::http::HttpFetcher;
use crate::record::{DesiredRelay, PartitionTag};
use crate::Result;

const STREAMLIST_PATH: &str = "/admin/streamlist.txt";

/// Scratch state the poller keeps between ticks: the trailing partial
/// line from the previous chunk, per spec.md §3 `MasterConnDetails`.
#[derive(Default)]
pub struct PollerState {
    partial_line: String,
}

impl PollerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Split `chunk` into complete lines, prepending any partial line left
/// over from a previous call. Only `\n`-terminated lines (with optional
/// preceding `\r`) are consumed; a trailing unterminated fragment is kept
/// in `state` for the next chunk (spec.md §4.4 "Partial-line handling").
pub fn feed_chunk(state: &mut PollerState, chunk: &str) -> Vec<String> {
    let mut combined = std::mem::take(&mut state.partial_line);
    combined.push_str(chunk);

    let ends_with_newline = combined.ends_with('\n');
    let mut lines: Vec<&str> = combined.split('\n').collect();
    let trailing = if ends_with_newline { "" } else { lines.pop().unwrap_or("") };

    let complete: Vec<String> = lines
        .into_iter()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect();

    state.partial_line = trailing.to_string();
    complete
}

/// Parse a full streamlist body (all chunks already reassembled) into
/// non-empty mount lines. A final line with no trailing `\n` is dropped,
/// matching spec.md §4.4: only explicitly `\n`-terminated lines count.
pub fn parse_streamlist_body(body: &str) -> Vec<String> {
    let mut state = PollerState::new();
    feed_chunk(&mut state, body)
}

/// Turn parsed mount lines into the desired `master_relays` list
/// (spec.md §4.4).
pub fn build_desired_relays(config: &RelayConfig, mounts: &[String]) -> Vec<DesiredRelay> {
    let Some(master_server) = config.master_server.clone() else {
        return Vec::new();
    };
    let Some(master_port) = config.master_port() else {
        return Vec::new();
    };

    mounts
        .iter()
        .map(|mount| DesiredRelay {
            local_mount: mount.clone(),
            upstream_host: master_server.clone(),
            upstream_port: master_port,
            upstream_mount: mount.clone(),
            username: if config.master_relay_auth { config.master_username.clone() } else { None },
            password: if config.master_relay_auth { config.master_password.clone() } else { None },
            send_icy_metadata: true,
            on_demand: config.on_demand,
            enabled: true,
            partition: PartitionTag::MasterAdvertised,
        })
        .collect()
}

/// Run one fetch-and-parse cycle against the master. Returns the desired
/// relay list on an HTTP 200; returns `Ok(None)` (no apply) on any other
/// status, matching spec.md §4.4's "any other status discards the whole
/// fetch" rule. Transport failures propagate as `Err` for the caller to
/// log and likewise discard.
pub async fn poll_once(
    config: &RelayConfig,
    fetcher: &Arc<dyn HttpFetcher>,
) -> Result<Option<Vec<DesiredRelay>>> {
    let Some(master_server) = config.master_server.clone() else {
        return Ok(None);
    };
    let Some(master_port) = config.master_port() else {
        return Ok(None);
    };
    let use_tls = config.master_uses_ssl();
    let auth = match (&config.master_username, &config.master_password) {
        (Some(u), Some(p)) => Some((u.clone(), p.clone())),
        _ => None,
    };

    let response = fetcher.fetch(&master_server, master_port, STREAMLIST_PATH, use_tls, auth).await?;

    if response.status_code != 200 || response.reason != "OK" {
        warn!(
            "master streamlist fetch returned {} {}, discarding",
            response.status_code, response.reason
        );
        return Ok(None);
    }

    let body = String::from_utf8_lossy(&response.body);
    let mounts = parse_streamlist_body(&body);
    debug!("master streamlist: {} mount(s)", mounts.len());
    Ok(Some(build_desired_relays(config, &mounts)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_chunk_single_full_chunk() {
        let mut state = PollerState::new();
        let lines = feed_chunk(&mut state, "/m1\r\n/m2\n");
        assert_eq!(lines, vec!["/m1".to_string(), "/m2".to_string()]);
        assert!(state.partial_line.is_empty());
    }

    #[test]
    fn test_feed_chunk_split_mid_line() {
        let mut state = PollerState::new();
        let first = feed_chunk(&mut state, "/m1\r\n/m");
        assert_eq!(first, vec!["/m1".to_string()]);
        assert_eq!(state.partial_line, "/m");

        let second = feed_chunk(&mut state, "2\n/m3\n");
        assert_eq!(second, vec!["/m2".to_string(), "/m3".to_string()]);
        assert!(state.partial_line.is_empty());
    }

    #[test]
    fn test_split_chunk_matches_single_chunk_delivery() {
        let whole = "/m1\r\n/m2\n";

        let mut one_shot_state = PollerState::new();
        let one_shot = feed_chunk(&mut one_shot_state, whole);

        let mut split_state = PollerState::new();
        let mut split = feed_chunk(&mut split_state, "/m1\r\n/");
        split.extend(feed_chunk(&mut split_state, "m2\n"));

        assert_eq!(one_shot, split);
    }

    #[test]
    fn test_blank_lines_ignored() {
        let mut state = PollerState::new();
        let lines = feed_chunk(&mut state, "/m1\n\n/m2\n");
        assert_eq!(lines, vec!["/m1".to_string(), "/m2".to_string()]);
    }

    #[test]
    fn test_build_desired_relays_applies_auth_only_when_configured() {
        let config = RelayConfig {
            master_server: Some("m".into()),
            master_server_port: Some(8000),
            master_relay_auth: false,
            master_username: Some("u".into()),
            master_password: Some("p".into()),
            on_demand: true,
            ..Default::default()
        };
        let relays = build_desired_relays(&config, &["/a".to_string()]);
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].username, None);
        assert!(relays[0].on_demand);
        assert_eq!(relays[0].partition, PartitionTag::MasterAdvertised);
    }

    #[test]
    fn test_build_desired_relays_carries_auth_when_configured() {
        let config = RelayConfig {
            master_server: Some("m".into()),
            master_server_port: Some(8000),
            master_relay_auth: true,
            master_username: Some("u".into()),
            master_password: Some("p".into()),
            ..Default::default()
        };
        let relays = build_desired_relays(&config, &["/a".to_string()]);
        assert_eq!(relays[0].username, Some("u".to_string()));
    }
}
