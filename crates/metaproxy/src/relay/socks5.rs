//! SOCKS5 relay (client side of RFC 1928 / RFC 1929).
//!
//! ```text
//! → VER NMETHODS METHODS        05 02 00 02   (05 01 00 without credentials)
//! ← VER METHOD                  05 xx
//!   [METHOD 02]
//!   → 01 ULEN UNAME PLEN PASSWD
//!   ← 01 STATUS                 STATUS 00 = success
//! → VER CMD RSV ATYP DST.ADDR DST.PORT   05 01 00 01|04 ...
//! ← VER REP RSV ATYP BND.ADDR BND.PORT   REP 00 = success
//! ```
//!
//! The upstream is reached over TCP or, for `unix:` relays, a unix-domain
//! stream socket. The original destination is always sent as an IP literal.

use super::copier::{spawn_duplex, RelayHandle};
use super::credentials::{CredentialPolicy, Credentials};
use super::{dial, BoxedStream, Client};
use metaproxy_core::{ProxyError, ProxyResult, Relay, Upstream};
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

// SOCKS5 protocol constants.
const VERSION5: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPT: u8 = 0xFF;
const USERPASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Tunnel `client` to its original destination through the SOCKS5 proxy
/// named by `relay`, authenticating according to `policy`.
pub async fn relay(client: Client, relay: &Relay, policy: &CredentialPolicy) -> ProxyResult<RelayHandle> {
    let upstream = relay.upstream();
    let credentials = policy.credentials();
    let proxy = establish(&upstream, client.dest, credentials.as_ref()).await?;
    debug!(
        client = %client.client_addr,
        dest = %client.dest,
        upstream = %upstream,
        username = credentials.as_ref().map(|c| c.username.as_str()).unwrap_or(""),
        "SOCKS5 tunnel established"
    );
    Ok(spawn_duplex(client.conn, proxy, client.dest))
}

/// Dial `upstream` and negotiate a SOCKS5 CONNECT to `dest`.
///
/// # Errors
///
/// - [`ProxyError::UpstreamDial`] if the proxy cannot be reached.
/// - [`ProxyError::Handshake`] if method selection, authentication or the
///   CONNECT request fails, including I/O errors mid-negotiation.
pub async fn establish(
    upstream: &Upstream,
    dest: SocketAddr,
    credentials: Option<&Credentials>,
) -> ProxyResult<BoxedStream> {
    let mut stream = dial(upstream).await?;
    negotiate(&mut stream, dest, credentials)
        .await
        .map_err(|e| match e {
            ProxyError::Io(io) => {
                ProxyError::Handshake(format!("SOCKS5 negotiation with {upstream} failed: {io}"))
            }
            other => other,
        })?;
    Ok(stream)
}

/// Run the full client-side negotiation over an already connected stream.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    dest: SocketAddr,
    credentials: Option<&Credentials>,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Method selection
    let greeting: &[u8] = if credentials.is_some() {
        &[VERSION5, 0x02, AUTH_NONE, AUTH_USERPASS]
    } else {
        &[VERSION5, 0x01, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION5 {
        return Err(ProxyError::Handshake(format!(
            "unexpected SOCKS version 0x{:02x} in method reply",
            reply[0]
        )));
    }

    match (reply[1], credentials) {
        (AUTH_NONE, _) => {}
        (AUTH_USERPASS, Some(creds)) => authenticate(stream, creds).await?,
        (AUTH_NO_ACCEPT, _) => {
            return Err(ProxyError::Handshake(
                "no acceptable authentication method".to_string(),
            ))
        }
        (method, _) => {
            return Err(ProxyError::Handshake(format!(
                "proxy selected unoffered method 0x{method:02x}"
            )))
        }
    }

    // CONNECT request
    stream.write_all(&encode_connect(dest)).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION5 {
        return Err(ProxyError::Handshake(format!(
            "unexpected SOCKS version 0x{:02x} in CONNECT reply",
            header[0]
        )));
    }
    if header[1] != REP_SUCCESS {
        return Err(ProxyError::Handshake(format!(
            "CONNECT to {dest} failed: {} (0x{:02x})",
            reply_message(header[1]),
            header[1]
        )));
    }

    // Consume the bound address.
    let remaining = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => {
            return Err(ProxyError::Handshake(format!(
                "unknown address type 0x{other:02x} in CONNECT reply"
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// RFC 1929 username/password sub-negotiation.
async fn authenticate<S>(stream: &mut S, creds: &Credentials) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let username = creds.username.as_bytes();
    let password = creds.password.as_bytes();
    if username.is_empty() || username.len() > 255 || password.len() > 255 {
        return Err(ProxyError::Handshake(
            "SOCKS5 credentials exceed protocol limits".to_string(),
        ));
    }

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(USERPASS_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username);
    request.push(password.len() as u8);
    request.extend_from_slice(password);
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != USERPASS_VERSION {
        return Err(ProxyError::Handshake(format!(
            "unexpected sub-negotiation version 0x{:02x} in authentication reply",
            reply[0]
        )));
    }
    if reply[1] != 0x00 {
        return Err(ProxyError::Handshake(format!(
            "username/password authentication rejected (status 0x{:02x})",
            reply[1]
        )));
    }
    Ok(())
}

/// Encode `VER CMD RSV ATYP DST.ADDR DST.PORT` for an IP destination.
fn encode_connect(dest: SocketAddr) -> Vec<u8> {
    let mut request = vec![VERSION5, CMD_CONNECT, 0x00];
    match dest.ip() {
        IpAddr::V4(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
    }
    request.extend_from_slice(&dest.port().to_be_bytes());
    request
}

fn reply_message(rep: u8) -> &'static str {
    match rep {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::relay::test_util::{echo_server, tcp_pair};
    use metaproxy_core::RelayType;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use tokio::net::{TcpListener, TcpStream};

    /// Usernames and targets seen by a [`fake_socks5`] server.
    #[derive(Default)]
    pub(crate) struct Seen {
        pub usernames: Vec<String>,
        pub targets: Vec<SocketAddr>,
    }

    /// Serve one SOCKS5 session on `stream`: accept user/pass when offered,
    /// reply with `rep`, and on success tunnel to the requested target.
    async fn serve_socks5<S>(mut stream: S, rep: u8, seen: Arc<Mutex<Seen>>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();

        if methods.contains(&AUTH_USERPASS) {
            stream.write_all(&[VERSION5, AUTH_USERPASS]).await.unwrap();
            let mut ver_ulen = [0u8; 2];
            stream.read_exact(&mut ver_ulen).await.unwrap();
            let mut user = vec![0u8; ver_ulen[1] as usize];
            stream.read_exact(&mut user).await.unwrap();
            let mut plen = [0u8; 1];
            stream.read_exact(&mut plen).await.unwrap();
            let mut pass = vec![0u8; plen[0] as usize];
            stream.read_exact(&mut pass).await.unwrap();
            seen.lock().unwrap().usernames.push(String::from_utf8(user).unwrap());
            stream.write_all(&[USERPASS_VERSION, 0x00]).await.unwrap();
        } else {
            stream.write_all(&[VERSION5, AUTH_NONE]).await.unwrap();
        }

        let mut req = [0u8; 4];
        stream.read_exact(&mut req).await.unwrap();
        assert_eq!(req[..3], [VERSION5, CMD_CONNECT, 0x00]);
        assert_eq!(req[3], ATYP_IPV4);
        let mut addr = [0u8; 6];
        stream.read_exact(&mut addr).await.unwrap();
        let target = SocketAddr::new(
            IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
            u16::from_be_bytes([addr[4], addr[5]]),
        );
        seen.lock().unwrap().targets.push(target);

        stream
            .write_all(&[VERSION5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        if rep != REP_SUCCESS {
            return;
        }
        let mut outbound = TcpStream::connect(target).await.unwrap();
        let _ = tokio::io::copy_bidirectional(&mut stream, &mut outbound).await;
    }

    /// Start a SOCKS5 proxy on loopback TCP that replies with `rep`.
    pub(crate) async fn fake_socks5(rep: u8) -> (SocketAddr, Arc<Mutex<Seen>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let seen_server = seen.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_socks5(stream, rep, seen_server.clone()));
                }
            }
        });
        (addr, seen)
    }

    fn relay_for(ip: String, port: String) -> Relay {
        Relay {
            destination_port: "80".into(),
            relay_type: RelayType::Socks5,
            relay_ip: ip,
            relay_port: port,
        }
    }

    #[test]
    fn test_encode_connect() {
        let v4: SocketAddr = "10.1.2.3:443".parse().unwrap();
        assert_eq!(
            encode_connect(v4),
            vec![0x05, 0x01, 0x00, 0x01, 10, 1, 2, 3, 0x01, 0xBB]
        );
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        let encoded = encode_connect(v6);
        assert_eq!(encoded[3], ATYP_IPV6);
        assert_eq!(encoded.len(), 4 + 16 + 2);
        assert_eq!(&encoded[20..], &[0x00, 0x50]);
    }

    #[tokio::test]
    async fn test_relay_round_trip_with_random_username() {
        let echo = echo_server().await;
        let (proxy, seen) = fake_socks5(REP_SUCCESS).await;
        let (accepted, mut app) = tcp_pair().await;

        let client = Client {
            client_addr: app.local_addr().unwrap(),
            dest: echo,
            conn: accepted,
        };
        let relay = relay_for(proxy.ip().to_string(), proxy.port().to_string());
        let _handle = super::relay(client, &relay, &CredentialPolicy::default())
            .await
            .unwrap();

        let payload = b"\x00\x01binary\xffpayload";
        app.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, payload);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.targets, vec![echo]);
        assert_eq!(seen.usernames.len(), 1);
        assert_eq!(seen.usernames[0].len(), 16);
    }

    #[tokio::test]
    async fn test_no_auth_policy() {
        let echo = echo_server().await;
        let (proxy, seen) = fake_socks5(REP_SUCCESS).await;

        let mut tunnel = establish(&Upstream::Tcp(proxy.to_string()), echo, None)
            .await
            .unwrap();
        tunnel.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        assert!(seen.lock().unwrap().usernames.is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused_by_proxy() {
        let (proxy, _) = fake_socks5(0x05).await;
        let err = establish(
            &Upstream::Tcp(proxy.to_string()),
            "192.0.2.1:80".parse().unwrap(),
            None,
        )
        .await
        .err()
        .unwrap();
        match err {
            ProxyError::Handshake(msg) => assert!(msg.contains("connection refused"), "{msg}"),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_method_rejected() {
        let (mut ours, mut theirs) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[VERSION5, AUTH_NO_ACCEPT]).await.unwrap();
        });
        let creds = CredentialPolicy::default().credentials();
        let err = negotiate(&mut ours, "192.0.2.1:80".parse().unwrap(), creds.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION5, 0x02, AUTH_NONE, AUTH_USERPASS]);
            theirs.write_all(&[VERSION5, AUTH_USERPASS]).await.unwrap();
            let mut auth = vec![0u8; 3 + 5 + 6];
            theirs.read_exact(&mut auth).await.unwrap();
            assert_eq!(auth[0], USERPASS_VERSION);
            assert_eq!(&auth[2..7], b"alice");
            assert_eq!(&auth[8..], b"secret");
            theirs.write_all(&[USERPASS_VERSION, 0x01]).await.unwrap();
        });
        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let err = negotiate(&mut ours, "192.0.2.1:80".parse().unwrap(), Some(&creds))
            .await
            .unwrap_err();
        match err {
            ProxyError::Handshake(msg) => assert!(msg.contains("rejected"), "{msg}"),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_reply_version_checked() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[VERSION5, AUTH_USERPASS]).await.unwrap();
            let mut auth = vec![0u8; 3 + 3 + 2];
            theirs.read_exact(&mut auth).await.unwrap();
            // Status says success, but the version byte is the SOCKS one.
            theirs.write_all(&[VERSION5, 0x00]).await.unwrap();
        });
        let creds = Credentials {
            username: "bob".into(),
            password: "pw".into(),
        };
        let err = negotiate(&mut ours, "192.0.2.1:80".parse().unwrap(), Some(&creds))
            .await
            .unwrap_err();
        match err {
            ProxyError::Handshake(msg) => assert!(msg.contains("sub-negotiation version"), "{msg}"),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unoffered_method_rejected() {
        let (mut ours, mut theirs) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[VERSION5, AUTH_USERPASS]).await.unwrap();
        });
        let err = negotiate(&mut ours, "192.0.2.1:80".parse().unwrap(), None)
            .await
            .unwrap_err();
        match err {
            ProxyError::Handshake(msg) => assert!(msg.contains("unoffered"), "{msg}"),
            other => panic!("expected handshake error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_domain_bound_address_consumed() {
        let (mut ours, mut theirs) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            theirs.read_exact(&mut greeting).await.unwrap();
            theirs.write_all(&[VERSION5, AUTH_NONE]).await.unwrap();
            let mut req = [0u8; 10];
            theirs.read_exact(&mut req).await.unwrap();
            let mut reply = vec![VERSION5, REP_SUCCESS, 0x00, ATYP_DOMAIN, 4];
            reply.extend_from_slice(b"host");
            reply.extend_from_slice(&[0x1F, 0x90]);
            reply.extend_from_slice(b"data");
            theirs.write_all(&reply).await.unwrap();
        });
        negotiate(&mut ours, "192.0.2.1:80".parse().unwrap(), None)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        ours.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
    }

    #[tokio::test]
    async fn test_proxy_hangup_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });
        let err = establish(
            &Upstream::Tcp(proxy.to_string()),
            "192.0.2.1:80".parse().unwrap(),
            None,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ProxyError::Handshake(_)), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_domain_upstream() {
        let echo = echo_server().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socks.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let seen = Arc::new(Mutex::new(Seen::default()));
        let seen_server = seen.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_socks5(stream, REP_SUCCESS, seen_server).await;
        });

        let (accepted, mut app) = tcp_pair().await;
        let client = Client {
            client_addr: app.local_addr().unwrap(),
            dest: echo,
            conn: accepted,
        };
        let relay = relay_for(format!("unix:{}", path.display()), String::new());
        let policy = CredentialPolicy::Fixed {
            username: "isolated".into(),
            password: "password".into(),
        };
        let _handle = super::relay(client, &relay, &policy).await.unwrap();

        app.write_all(b"over unix").await.unwrap();
        let mut buf = [0u8; 9];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over unix");
        assert_eq!(seen.lock().unwrap().usernames, vec!["isolated".to_string()]);
    }
}
