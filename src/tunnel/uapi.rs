//! The engine's text configuration protocol: `key=value` lines terminated by
//! an empty line, answered with `errno=<n>`.

use crate::conf::{Key, PeerStats, TunnelConfig};
use crate::ipc::transport::BoxedStream;
use anyhow::{Context, ensure};
use std::collections::HashMap;
use std::fmt::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// A full replacement of the device configuration. Endpoints must already
/// be resolved to addresses.
pub fn set_request(config: &TunnelConfig) -> String {
    let mut request = String::from("set=1\n");
    let _ = writeln!(request, "private_key={}", config.interface.private_key.to_hex());
    if let Some(port) = config.interface.listen_port {
        let _ = writeln!(request, "listen_port={}", port);
    }
    request.push_str("replace_peers=true\n");

    for peer in &config.peers {
        let _ = writeln!(request, "public_key={}", peer.public_key.to_hex());
        if let Some(ref preshared) = peer.preshared_key {
            let _ = writeln!(request, "preshared_key={}", preshared.to_hex());
        }
        if let Some(ref endpoint) = peer.endpoint {
            let _ = writeln!(request, "endpoint={}", endpoint);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(request, "persistent_keepalive_interval={}", keepalive);
        }
        request.push_str("replace_allowed_ips=true\n");
        for allowed in &peer.allowed_ips {
            let _ = writeln!(request, "allowed_ip={}", allowed);
        }
    }

    request.push('\n');
    request
}

pub fn fwmark_request(mark: u32) -> String {
    format!("set=1\nfwmark={}\n\n", mark)
}

pub const GET_REQUEST: &str = "get=1\n\n";

/// Fails unless the response ends in `errno=0`.
pub fn check_errno(response: &str) -> anyhow::Result<()> {
    let errno = response
        .lines()
        .filter_map(|line| line.strip_prefix("errno="))
        .next_back()
        .context("Engine response has no errno")?;
    ensure!(errno.trim() == "0", "Engine returned errno={}", errno.trim());
    Ok(())
}

/// Collects per-peer statistics from a `get` response.
pub fn parse_peer_stats(response: &str) -> anyhow::Result<HashMap<Key, PeerStats>> {
    check_errno(response)?;

    let mut stats = HashMap::new();
    let mut current: Option<(Key, PeerStats)> = None;
    for line in response.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "public_key" => {
                if let Some((peer, peer_stats)) = current.take() {
                    stats.insert(peer, peer_stats);
                }
                current = Some((Key::from_hex(value)?, PeerStats::default()));
            }
            "rx_bytes" | "tx_bytes" | "last_handshake_time_sec" => {
                let Some((_, ref mut peer_stats)) = current else {
                    continue;
                };
                let number: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid {} in engine response: {}", key, value))?;
                match key {
                    "rx_bytes" => peer_stats.rx_bytes = number,
                    "tx_bytes" => peer_stats.tx_bytes = number,
                    _ => peer_stats.last_handshake_unix = (number != 0).then_some(number),
                }
            }
            _ => {}
        }
    }
    if let Some((peer, peer_stats)) = current {
        stats.insert(peer, peer_stats);
    }
    Ok(stats)
}

/// Sends one request and reads the response up to its terminating empty
/// line.
pub async fn exchange(stream: BoxedStream, request: &str) -> anyhow::Result<String> {
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .context("Failed to write to engine")?;
    stream.get_mut().flush().await.context("Failed to write to engine")?;

    let mut response = String::new();
    loop {
        let mut line = String::new();
        let read = stream
            .read_line(&mut line)
            .await
            .context("Failed to read from engine")?;
        if read == 0 || line == "\n" {
            break;
        }
        response.push_str(&line);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::config::tests::sample_config;

    #[test]
    fn test_set_request_layout() {
        let mut config = sample_config("office");
        config.peers[0].endpoint = Some("192.0.2.1:51820".parse().unwrap());
        let request = set_request(&config);

        assert!(request.starts_with("set=1\nprivate_key=0707"));
        assert!(request.ends_with("\n\n"));
        let lines: Vec<&str> = request.lines().collect();
        let peer = lines
            .iter()
            .position(|l| l.starts_with("public_key="))
            .unwrap();
        assert!(lines[..peer].contains(&"replace_peers=true"));
        assert!(lines[peer..].contains(&"endpoint=192.0.2.1:51820"));
        assert!(lines[peer..].contains(&"persistent_keepalive_interval=25"));
        assert!(lines[peer..].contains(&"allowed_ip=0.0.0.0/0"));
        assert!(lines[peer..].contains(&"allowed_ip=::/0"));
    }

    #[test]
    fn test_errno() {
        assert!(check_errno("errno=0\n").is_ok());
        let err = check_errno("errno=22\n").unwrap_err();
        assert!(err.to_string().contains("22"));
        assert!(check_errno("").is_err());
    }

    #[test]
    fn test_parse_stats_for_each_peer() {
        let first = Key::from_bytes([1u8; 32]);
        let second = Key::from_bytes([2u8; 32]);
        let response = format!(
            "private_key={}\nlisten_port=51820\npublic_key={}\nrx_bytes=10\ntx_bytes=20\nlast_handshake_time_sec=1700000000\npublic_key={}\nrx_bytes=0\ntx_bytes=0\nlast_handshake_time_sec=0\nerrno=0\n",
            Key::from_bytes([7u8; 32]).to_hex(),
            first.to_hex(),
            second.to_hex()
        );

        let stats = parse_peer_stats(&response).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[&first].rx_bytes, 10);
        assert_eq!(stats[&first].tx_bytes, 20);
        assert_eq!(stats[&first].last_handshake_unix, Some(1_700_000_000));
        assert_eq!(stats[&second].last_handshake_unix, None);
    }

    #[test]
    fn test_parse_stats_rejects_failure() {
        assert!(parse_peer_stats("errno=1\n").is_err());
    }

    #[tokio::test]
    async fn test_exchange_reads_until_blank_line() {
        let (client, mut server) = tokio::io::duplex(1024);
        let responder = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buffer = vec![0u8; GET_REQUEST.len()];
            server.read_exact(&mut buffer).await.unwrap();
            assert_eq!(buffer, GET_REQUEST.as_bytes());
            server.write_all(b"listen_port=1\nerrno=0\n\n").await.unwrap();
        });

        let response = exchange(Box::new(client), GET_REQUEST).await.unwrap();
        assert_eq!(response, "listen_port=1\nerrno=0\n");
        responder.await.unwrap();
    }
}
