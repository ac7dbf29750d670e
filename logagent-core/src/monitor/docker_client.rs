//! Docker Engine API implementation of [`ContainerRuntimeClient`]. Talks to
//! the daemon over plain HTTP (`DOCKER_HOST=tcp://...`) the same way
//! `RemoteIndexSink` talks to its endpoint — a pooled `reqwest::Client`,
//! no retry-on-transport-error beyond what the monitor's own loop already
//! does by reconnecting from `since_ns`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::error::{AgentError, Result};

use super::container_monitor::{ContainerInfo, ContainerLogLine, ContainerRuntimeClient};

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
    #[serde(rename = "Labels", default)]
    labels: HashMap<String, String>,
}

/// Talks to a single Docker daemon's HTTP API. `line_counters` gives each
/// container a cumulative line number across calls, since the Engine API
/// itself has no notion of one; `Cursor::Container::line_number` needs a
/// monotonic value for `PositionStore` regression detection to work.
#[derive(Debug)]
pub struct DockerEngineClient {
    base_url: String,
    client: reqwest::Client,
    line_counters: DashMap<String, AtomicU64>,
}

impl DockerEngineClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        DockerEngineClient { base_url: base_url.into(), client: reqwest::Client::new(), line_counters: DashMap::new() }
    }

    fn next_line_number(&self, container_id: &str) -> u64 {
        self.line_counters.entry(container_id.to_string()).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ContainerRuntimeClient for DockerEngineClient {
    async fn list_containers(&self, label_selectors: &[String]) -> Result<Vec<ContainerInfo>> {
        let mut url = format!("{}/containers/json", self.base_url);
        if !label_selectors.is_empty() {
            let filters = serde_json::json!({ "label": label_selectors });
            let encoded = serde_json::to_string(&filters).map_err(AgentError::Serialization)?;
            url.push_str("?filters=");
            url.push_str(&urlencode(&encoded));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentError::Source { source_id: "docker".into(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(AgentError::Source { source_id: "docker".into(), message: format!("list_containers: {}", resp.status()) });
        }
        let raw: Vec<RawContainer> = resp
            .json()
            .await
            .map_err(|e| AgentError::Source { source_id: "docker".into(), message: e.to_string() })?;

        Ok(raw
            .into_iter()
            .map(|c| ContainerInfo {
                name: c.names.first().map(|n| n.trim_start_matches('/').to_string()).unwrap_or_else(|| c.id.clone()),
                id: c.id,
                labels: c.labels,
            })
            .collect())
    }

    async fn stream_since(&self, container_id: &str, since_ns: i64, window: Duration) -> Result<Vec<ContainerLogLine>> {
        let since_secs = since_ns as f64 / 1_000_000_000.0;
        let url = format!(
            "{}/containers/{container_id}/logs?stdout=true&stderr=true&timestamps=true&since={since_secs:.9}",
            self.base_url
        );

        let resp = tokio::time::timeout(window, self.client.get(&url).send())
            .await
            .map_err(|_| AgentError::SinkTransient { sink: "docker".into(), message: "log stream timed out".into() })?
            .map_err(|e| AgentError::Source { source_id: container_id.to_string(), message: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(AgentError::Source { source_id: container_id.to_string(), message: format!("stream_since: {}", resp.status()) });
        }
        let body = resp.bytes().await.map_err(|e| AgentError::Source { source_id: container_id.to_string(), message: e.to_string() })?;

        let mut lines = Vec::new();
        for (timestamp_ns, text) in demux_docker_frames(&body) {
            if timestamp_ns <= since_ns {
                continue;
            }
            lines.push(ContainerLogLine { line_number: self.next_line_number(container_id), timestamp_ns, payload: text.into_bytes() });
        }
        Ok(lines)
    }
}

fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

/// Splits a Docker multiplexed log stream (8-byte frame header: 1 stream
/// type byte, 3 reserved, 4 big-endian payload length) into
/// `(timestamp_ns, text)` pairs, reading the RFC3339Nano prefix each line
/// carries under `timestamps=true`.
fn demux_docker_frames(body: &[u8]) -> Vec<(i64, String)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor + 8 <= body.len() {
        let size = u32::from_be_bytes([body[cursor + 4], body[cursor + 5], body[cursor + 6], body[cursor + 7]]) as usize;
        let payload_start = cursor + 8;
        let payload_end = (payload_start + size).min(body.len());
        if payload_start >= body.len() {
            break;
        }
        let frame = &body[payload_start..payload_end];
        out.extend(parse_timestamped_lines(frame));
        cursor = payload_end;
    }
    if out.is_empty() && !body.is_empty() {
        // Non-multiplexed stream (e.g. TTY-attached container): treat the
        // whole body as plain timestamped lines.
        out.extend(parse_timestamped_lines(body));
    }
    out
}

fn parse_timestamped_lines(frame: &[u8]) -> Vec<(i64, String)> {
    let text = String::from_utf8_lossy(frame);
    text.lines()
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let (ts_part, rest) = line.split_once(' ')?;
            let ts = chrono::DateTime::parse_from_rfc3339(ts_part).ok()?;
            Some((ts.timestamp_nanos_opt().unwrap_or(0), rest.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_prefixed_lines() {
        let frame = b"2024-01-01T00:00:00.000000001Z hello\n2024-01-01T00:00:00.000000002Z world\n";
        let parsed = parse_timestamped_lines(frame);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].1, "hello");
        assert!(parsed[1].0 > parsed[0].0);
    }

    #[test]
    fn demuxes_a_single_multiplexed_frame() {
        let line = b"2024-01-01T00:00:00.000000001Z hi\n";
        let mut body = vec![1u8, 0, 0, 0];
        body.extend_from_slice(&(line.len() as u32).to_be_bytes());
        body.extend_from_slice(line);
        let parsed = demux_docker_frames(&body);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1, "hi");
    }
}
