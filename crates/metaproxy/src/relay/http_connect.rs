//! HTTP CONNECT relay.
//!
//! 1. Dial the upstream HTTP proxy
//! 2. Send `CONNECT <dest> HTTP/1.1` with `Host` set to the proxy address
//! 3. Read the status line and drain the response headers
//! 4. Non-200: close the proxy connection and report the refusal
//! 5. 200: hand (client, proxy) to the duplex copier
//!
//! The response is read through a `BufReader` that stays wrapped around the
//! proxy stream afterwards, so tunnel bytes that arrive in the same segment as
//! the response headers are not lost.

use super::copier::{spawn_duplex, RelayHandle};
use super::{dial, BoxedStream, Client};
use metaproxy_core::{ProxyError, ProxyResult, Relay, Upstream};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Upper bound on the size of the proxy's response head. Every read is
/// limited to what is left of it.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Tunnel `client` to its original destination through the HTTP proxy named
/// by `relay`.
pub async fn relay(client: Client, relay: &Relay) -> ProxyResult<RelayHandle> {
    let upstream = relay.upstream();
    let proxy = establish(&upstream, client.dest).await?;
    debug!(
        client = %client.client_addr,
        dest = %client.dest,
        upstream = %upstream,
        "HTTP CONNECT tunnel established"
    );
    Ok(spawn_duplex(client.conn, proxy, client.dest))
}

/// Dial `upstream` and negotiate a CONNECT tunnel to `dest`.
///
/// # Errors
///
/// - [`ProxyError::UpstreamDial`] if the proxy is unreachable or the
///   connection fails mid-handshake.
/// - [`ProxyError::UpstreamRefused`] if the proxy answers with a non-200
///   status. The proxy connection is closed.
/// - [`ProxyError::Handshake`] if the response is not valid HTTP.
pub async fn establish(upstream: &Upstream, dest: SocketAddr) -> ProxyResult<BoxedStream> {
    let stream = dial(upstream).await?;
    let mut reader = BufReader::new(stream);

    let request = connect_request(dest, &proxy_host(upstream));
    reader
        .get_mut()
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProxyError::UpstreamDial(format!("failed to send CONNECT to {upstream}: {e}")))?;

    let mut head_len = 0usize;
    let status_line = read_head_line(&mut reader, upstream, &mut head_len).await?;
    let status_line = std::str::from_utf8(&status_line).map_err(|_| {
        ProxyError::Handshake(format!("non-ASCII status line from {upstream}"))
    })?;
    let (status, reason) = parse_status_line(status_line)?;

    // Drain the remaining response headers. Header values may carry any
    // octets, so they are skipped without decoding.
    loop {
        let line = read_head_line(&mut reader, upstream, &mut head_len).await?;
        if line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    if status != 200 {
        // `reader` is dropped here, closing the proxy connection.
        return Err(ProxyError::UpstreamRefused { status, reason });
    }

    Ok(Box::new(reader))
}

/// Build the CONNECT request. IPv6 destinations are bracketed by
/// `SocketAddr`'s `Display`.
fn connect_request(dest: SocketAddr, host: &str) -> String {
    format!("CONNECT {dest} HTTP/1.1\r\nHost: {host}\r\n\r\n")
}

/// Value of the `Host` header: the proxy's own address.
fn proxy_host(upstream: &Upstream) -> String {
    match upstream {
        Upstream::Tcp(addr) => addr.clone(),
        Upstream::Unix(_) => "localhost".to_string(),
    }
}

/// Read one raw line of the response head, counting it against
/// [`MAX_RESPONSE_HEAD`].
async fn read_head_line(
    reader: &mut BufReader<BoxedStream>,
    upstream: &Upstream,
    head_len: &mut usize,
) -> ProxyResult<Vec<u8>> {
    // One byte past the budget, so an overlong head is detected rather than
    // mistaken for end-of-stream.
    let limit = (MAX_RESPONSE_HEAD - *head_len + 1) as u64;
    let mut line = Vec::new();
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut line).await.map_err(|e| {
        ProxyError::UpstreamDial(format!("failed to read CONNECT response from {upstream}: {e}"))
    })?;
    if n == 0 {
        return Err(ProxyError::UpstreamDial(format!(
            "{upstream} closed the connection during the CONNECT handshake"
        )));
    }
    *head_len += n;
    if *head_len > MAX_RESPONSE_HEAD {
        return Err(ProxyError::Handshake(format!(
            "CONNECT response from {upstream} exceeds {MAX_RESPONSE_HEAD} bytes"
        )));
    }
    Ok(line)
}

/// Parse `HTTP/1.x <status> <reason>`.
fn parse_status_line(line: &str) -> ProxyResult<(u16, String)> {
    let line = line.trim_end();
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProxyError::Handshake(format!(
            "malformed HTTP response: {line:?}"
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Handshake(format!("invalid status code in response: {line:?}")))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}
