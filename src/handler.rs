//! Connection handling logic
//!
//! Drives one client through negotiation, authentication, request parsing
//! and relay. Any failure closes this connection only.

use crate::core::hooks::{AuthDecision, AuthMethod, Authenticator, DenyReason, OutboundType};
use crate::core::ip_filter::normalize_ip;
use crate::core::protocol::{
    encode_auth_reply, encode_method_reply, encode_reply, MethodRequest, PasswordAuthRequest,
    ReplyCode, RequestError, SocksCmd, SocksRequest, METHOD_NO_ACCEPTABLE,
};
use crate::core::{relay_bidirectional, Address, DecodeResult, RelayEnd, Server, SessionState};
use crate::error::{ProxyError, Result};
use crate::logger::log;

use bytes::{Buf, BytesMut};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Largest handshake frame: a request with a 255-byte domain is 262 bytes,
/// a full RFC 1929 sub-negotiation is 513.
const MAX_HANDSHAKE_FRAME: usize = 1024;

/// Read until `decode` yields a complete frame, then consume it from `buf`.
/// Bytes past the frame stay in `buf` for the next phase.
async fn read_frame<S, T, F>(stream: &mut S, buf: &mut BytesMut, mut decode: F) -> Result<T>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<DecodeResult<T>>,
{
    loop {
        if !buf.is_empty() {
            match decode(&buf[..])? {
                DecodeResult::Ok(frame, consumed) => {
                    buf.advance(consumed);
                    return Ok(frame);
                }
                DecodeResult::Invalid(e) => return Err(ProxyError::Protocol(e.to_string())),
                DecodeResult::NeedMoreData => {}
            }
            if buf.len() > MAX_HANDSHAKE_FRAME {
                return Err(ProxyError::Protocol("handshake frame too large".into()));
            }
        }

        buf.reserve(MAX_HANDSHAKE_FRAME);
        let n = stream.read_buf(buf).await.map_err(ProxyError::Transport)?;
        if n == 0 {
            return Err(ProxyError::Protocol(if buf.is_empty() {
                "connection closed before handshake".into()
            } else {
                "connection closed mid-frame".into()
            }));
        }
    }
}

/// Run one handshake phase under the configured timeout
async fn phase<T>(
    server: &Server,
    name: &'static str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(server.conn_config.request_timeout, fut)
        .await
        .map_err(|_| ProxyError::Timeout(name.to_string()))?
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> Result<()> {
    stream.write_all(frame).await.map_err(ProxyError::Transport)?;
    stream.flush().await.map_err(ProxyError::Transport)
}

/// Process a single accepted connection.
///
/// The policy snapshot taken here governs the whole connection; later config
/// updates do not affect it.
pub async fn process_connection<S>(server: &Server, mut stream: S, peer: SocketAddr) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_ip = normalize_ip(peer.ip());
    let auth = server.policy.snapshot();

    // Accepted: blacklist check before any protocol bytes are read
    if let AuthDecision::Denied(reason) = auth.check_client(&client_ip) {
        server.stats.record_rejection(reason);
        log::authentication(&peer.to_string(), false);
        return Err(ProxyError::Blacklisted(client_ip));
    }

    let mut buf = BytesMut::with_capacity(server.conn_config.buffer_size);

    negotiate(server, &mut stream, &mut buf, auth.as_ref(), client_ip, &peer).await?;

    // Requesting
    let mut bad_atyp = false;
    let request = phase(
        server,
        "request",
        read_frame(&mut stream, &mut buf, |b| match SocksRequest::decode(b) {
            Ok(result) => Ok(result),
            Err(RequestError::UnsupportedAddressType) => {
                bad_atyp = true;
                Ok(DecodeResult::Invalid("address type not supported"))
            }
            Err(RequestError::Malformed(msg)) => Ok(DecodeResult::Invalid(msg)),
        }),
    )
    .await;
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            if bad_atyp {
                let _ = write_frame(
                    &mut stream,
                    &encode_reply(ReplyCode::AddressTypeNotSupported, &Address::unspecified()),
                )
                .await;
            }
            return Err(e);
        }
    };

    match SocksCmd::try_from(request.cmd) {
        Ok(SocksCmd::Connect) => {}
        other => {
            let _ = write_frame(
                &mut stream,
                &encode_reply(ReplyCode::CommandNotSupported, &Address::unspecified()),
            )
            .await;
            log::debug!(peer = %peer, cmd = request.cmd, "Command not supported");
            return Err(ProxyError::Protocol(match other {
                Ok(cmd) => format!("command {:?} not supported", cmd),
                Err(_) => format!("unknown command {}", request.cmd),
            }));
        }
    }

    handle_connect(server, stream, buf, request.addr, client_ip, peer).await
}

/// MethodNegotiation and, when selected, Authenticating
async fn negotiate<S>(
    server: &Server,
    stream: &mut S,
    buf: &mut BytesMut,
    auth: &dyn Authenticator,
    client_ip: IpAddr,
    peer: &SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = phase(
        server,
        "method negotiation",
        read_frame(stream, buf, |b| Ok(MethodRequest::decode(b))),
    )
    .await?;

    let method = match auth.select_method(&greeting.methods) {
        Some(method) => method,
        None => {
            let _ = write_frame(stream, &encode_method_reply(METHOD_NO_ACCEPTABLE)).await;
            server.stats.record_rejection(DenyReason::NoAcceptableMethod);
            log::debug!(peer = %peer, offered = ?greeting.methods, "No acceptable auth method");
            return Err(ProxyError::NoAcceptableMethod);
        }
    };
    write_frame(stream, &encode_method_reply(method.code())).await?;

    match method {
        AuthMethod::NoAuth => match auth.authenticate(&client_ip, method, None) {
            AuthDecision::Authorized => Ok(()),
            AuthDecision::Denied(reason) => {
                server.stats.record_rejection(reason);
                Err(ProxyError::AuthFailed(reason.to_string()))
            }
        },
        AuthMethod::UserPass => {
            let creds = phase(
                server,
                "authentication",
                read_frame(stream, buf, |b| Ok(PasswordAuthRequest::decode(b))),
            )
            .await?;
            match auth.authenticate(&client_ip, method, Some(&creds)) {
                AuthDecision::Authorized => {
                    write_frame(stream, &encode_auth_reply(true)).await?;
                    log::authentication(&peer.to_string(), true);
                    Ok(())
                }
                AuthDecision::Denied(reason) => {
                    let _ = write_frame(stream, &encode_auth_reply(false)).await;
                    server.stats.record_rejection(reason);
                    log::authentication(&peer.to_string(), false);
                    Err(ProxyError::AuthFailed(format!(
                        "user {:?}: {}",
                        creds.username, reason
                    )))
                }
            }
        }
    }
}

/// Handle TCP CONNECT: register the session, dial, reply and relay
async fn handle_connect<S>(
    server: &Server,
    mut client: S,
    mut pending: BytesMut,
    target: Address,
    client_ip: IpAddr,
    peer: SocketAddr,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target_label = target.to_string();
    let session = server.sessions.create(client_ip, target_label.clone());
    log::session(session.id, &target_label, "opened");

    // Runs on every exit, including when the task is dropped by a restart
    let sessions = server.sessions.clone();
    let stats = Arc::clone(&server.stats);
    let counters = Arc::clone(&session.counters);
    let session_id = session.id;
    let closed_label = target_label.clone();
    let _guard = scopeguard::guard((), move |_| {
        stats.record_upload(counters.bytes_in.load(Ordering::Relaxed));
        stats.record_download(counters.bytes_out.load(Ordering::Relaxed));
        sessions.remove(session_id);
        log::session(session_id, &closed_label, "closed");
    });

    let cancel_token = session.cancel_token.clone();
    let dial = dial_target(server, &target, &peer);
    let remote = tokio::select! {
        result = dial => result,
        _ = cancel_token.cancelled() => {
            log::debug!(session = session.id, "Session disconnected while dialing");
            return Ok(());
        }
    };
    let mut remote = match remote {
        Ok(remote) => remote,
        Err((code, err)) => {
            let _ = write_frame(&mut client, &encode_reply(code, &Address::unspecified())).await;
            log::debug!(peer = %peer, target = %target_label, reply = ?code, error = %err, "Connect failed");
            return Err(err);
        }
    };

    let bind = remote
        .local_addr()
        .map(Address::from)
        .unwrap_or_else(|_| Address::unspecified());
    session.counters.set_state(SessionState::Relaying);
    write_frame(&mut client, &encode_reply(ReplyCode::Succeeded, &bind)).await?;

    // Forward anything the client pipelined behind the request
    if !pending.is_empty() {
        session
            .counters
            .bytes_in
            .fetch_add(pending.len() as u64, Ordering::Relaxed);
        remote
            .write_all(&pending)
            .await
            .map_err(ProxyError::Transport)?;
        pending.clear();
    }

    relay(server, client, remote, &session.counters, &cancel_token).await
}

/// Relay until either side closes, the link idles out, or the session is cancelled
async fn relay<S>(
    server: &Server,
    client: S,
    remote: TcpStream,
    counters: &crate::core::session::SessionCounters,
    cancel_token: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let relay_fut = relay_bidirectional(
        client,
        remote,
        server.conn_config.idle_timeout,
        Arc::clone(&counters.bytes_in),
        Arc::clone(&counters.bytes_out),
    );

    tokio::select! {
        result = relay_fut => match result {
            Ok(r) if r.end == RelayEnd::Completed => {
                log::trace!(up = r.upload, down = r.download, "Relay completed");
                Ok(())
            }
            Ok(r) => {
                log::debug!(up = r.upload, down = r.download, "Relay idle timeout");
                Ok(())
            }
            Err(e) => Err(ProxyError::Transport(e)),
        },
        _ = cancel_token.cancelled() => {
            log::debug!("Session disconnected");
            Ok(())
        }
    }
}

/// Route and dial the target, mapping failures to a SOCKS reply code
async fn dial_target(
    server: &Server,
    target: &Address,
    peer: &SocketAddr,
) -> std::result::Result<TcpStream, (ReplyCode, ProxyError)> {
    let resolved = match server.router.route(target).await {
        OutboundType::Reject => {
            log::debug!(peer = %peer, target = %target, "Target rejected by router");
            return Err((
                ReplyCode::NotAllowedByRuleset,
                ProxyError::Protocol(format!("target {} not allowed", target)),
            ));
        }
        OutboundType::Direct(resolved) => resolved,
    };

    let candidates = if resolved.is_empty() {
        target
            .to_socket_addrs()
            .await
            .map_err(|e| (ReplyCode::HostUnreachable, ProxyError::Transport(e)))?
    } else {
        resolved
    };

    match tokio::time::timeout(
        server.conn_config.connect_timeout,
        connect_any(&candidates),
    )
    .await
    {
        Ok(Ok((stream, remote_addr))) => {
            if server.conn_config.tcp_nodelay {
                let _ = stream.set_nodelay(true);
            }
            log::debug!(peer = %peer, remote = %remote_addr, "Connected to target");
            Ok(stream)
        }
        Ok(Err(e)) => Err((ReplyCode::from_io_error(&e), ProxyError::Transport(e))),
        Err(_) => Err((
            ReplyCode::HostUnreachable,
            ProxyError::Timeout(format!("connect to {}", target)),
        )),
    }
}

/// Try each address in order; the last failure is reported if none connects
async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, *addr)),
            Err(e) => {
                log::trace!(remote = %addr, error = %e, "Connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to connect to")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::{ConfigStore, ServerStatsCollector};
    use crate::config::{ConnConfig, ServerConfig};
    use crate::core::ip_filter::Blacklist;
    use crate::core::protocol::{METHOD_NO_AUTH, METHOD_USER_PASS};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;

    fn peer() -> SocketAddr {
        "203.0.113.9:40000".parse().unwrap()
    }

    fn build_server(config: ServerConfig) -> (Arc<Server>, Arc<ServerStatsCollector>) {
        let stats = Arc::new(ServerStatsCollector::new());
        let server = Server::builder()
            .policy(Arc::new(ConfigStore::new(config)))
            .stats(stats.clone())
            .conn_config(ConnConfig {
                request_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(2),
                ..ConnConfig::default()
            })
            .build()
            .unwrap();
        (Arc::new(server), stats)
    }

    fn spawn_handler(
        server: &Arc<Server>,
        peer: SocketAddr,
    ) -> (DuplexStream, tokio::task::JoinHandle<Result<()>>) {
        let (client, server_side) = tokio::io::duplex(4096);
        let server = Arc::clone(server);
        let handle =
            tokio::spawn(async move { process_connection(&server, server_side, peer).await });
        (client, handle)
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn connect_request(addr: SocketAddr) -> Vec<u8> {
        SocksRequest {
            cmd: SocksCmd::Connect as u8,
            addr: Address::from(addr),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_read_frame_handles_split_input() {
        let (mut client, mut server_side) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            client.write_all(&[5]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(&[2, 0, 2, 0xAA]).await.unwrap();
            client
        });

        let mut buf = BytesMut::new();
        let greeting = read_frame(&mut server_side, &mut buf, |b| Ok(MethodRequest::decode(b)))
            .await
            .unwrap();
        assert_eq!(greeting.methods, vec![METHOD_NO_AUTH, METHOD_USER_PASS]);
        // Trailing byte stays for the next phase
        assert_eq!(&buf[..], &[0xAA]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let (client, mut server_side) = tokio::io::duplex(64);
        drop(client);
        let mut buf = BytesMut::new();
        let err = read_frame(&mut server_side, &mut buf, |b| Ok(MethodRequest::decode(b)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_no_auth_connect_relays_and_cleans_up() {
        let (server, stats) = build_server(ServerConfig::default());
        let target = echo_server().await;
        let (mut client, handle) = spawn_handler(&server, peer());

        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);

        client.write_all(&connect_request(target)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[5, 0, 0, 1]);

        let sessions = server.sessions.list();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].target, target.to_string());
        assert_eq!(sessions[0].client_ip, peer().ip());
        assert_eq!(sessions[0].state, SessionState::Relaying);

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        handle.await.unwrap().unwrap();
        assert!(server.sessions.is_empty());
        assert_eq!(server.sessions.total_created(), 1);
        assert_eq!(stats.counters().bytes_in, 5);
        assert_eq!(stats.counters().bytes_out, 5);
    }

    #[tokio::test]
    async fn test_pipelined_payload_is_forwarded() {
        let (server, _stats) = build_server(ServerConfig::default());
        let target = echo_server().await;
        let (mut client, handle) = spawn_handler(&server, peer());

        // Greeting, request and payload in one write
        let mut burst = vec![5, 1, METHOD_NO_AUTH];
        burst.extend_from_slice(&connect_request(target));
        burst.extend_from_slice(b"early");
        client.write_all(&burst).await.unwrap();

        let mut replies = [0u8; 12];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[5, 0]);
        assert_eq!(replies[3], 0);

        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"early");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let config = ServerConfig {
            user: "admin".into(),
            password: "secret".into(),
            auth_methods: vec![AuthMethod::UserPass],
            ..ServerConfig::default()
        };
        let (server, stats) = build_server(config);
        let (mut client, handle) = spawn_handler(&server, peer());

        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0xFF]);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::NoAcceptableMethod)));
        assert_eq!(server.sessions.total_created(), 0);
        assert_eq!(stats.counters().rejected_auth, 1);
    }

    #[tokio::test]
    async fn test_password_auth_success_and_failure() {
        let config = ServerConfig {
            user: "admin".into(),
            password: "secret".into(),
            auth_methods: vec![AuthMethod::UserPass],
            ..ServerConfig::default()
        };
        let (server, stats) = build_server(config);

        // Wrong password
        let (mut client, handle) = spawn_handler(&server, peer());
        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 2]);
        let creds = PasswordAuthRequest {
            username: "admin".into(),
            password: "nope".into(),
        };
        client.write_all(&creds.encode()).await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 1]);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::AuthFailed(_))
        ));
        assert_eq!(stats.counters().rejected_auth, 1);

        // Right password
        let (mut client, handle) = spawn_handler(&server, peer());
        client.write_all(&[5, 1, METHOD_USER_PASS]).await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        let creds = PasswordAuthRequest {
            username: "admin".into(),
            password: "secret".into(),
        };
        client.write_all(&creds.encode()).await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [1, 0]);
        drop(client);
        assert!(handle.await.unwrap().is_err());
        assert_eq!(stats.counters().rejected_auth, 1);
    }

    #[tokio::test]
    async fn test_blacklisted_client_never_negotiates() {
        let config = ServerConfig {
            blacklist: Blacklist::parse(["203.0.113.0/24"]).unwrap(),
            ..ServerConfig::default()
        };
        let (server, stats) = build_server(config);
        let (mut client, handle) = spawn_handler(&server, peer());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ProxyError::Blacklisted(_))));
        assert_eq!(stats.counters().rejected_auth, 1);

        // Socket closed without any reply
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bind_and_udp_not_supported() {
        let (server, _stats) = build_server(ServerConfig::default());
        for cmd in [SocksCmd::Bind as u8, SocksCmd::UdpAssociate as u8, 9] {
            let (mut client, handle) = spawn_handler(&server, peer());
            client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();

            let request = SocksRequest {
                cmd,
                addr: Address::IPv4([127, 0, 0, 1], 80),
            };
            client.write_all(&request.encode()).await.unwrap();
            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
            assert!(handle.await.unwrap().is_err());
        }
        assert_eq!(server.sessions.total_created(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_address_type() {
        let (server, _stats) = build_server(ServerConfig::default());
        let (mut client, handle) = spawn_handler(&server, peer());
        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        client.write_all(&[5, 1, 0, 7, 1, 2, 3, 4]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::AddressTypeNotSupported as u8);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_reply() {
        let (server, _stats) = build_server(ServerConfig::default());
        // Grab a free port and close it again
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (mut client, handle) = spawn_handler(&server, peer());
        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(&connect_request(closed)).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::ConnectionRefused as u8);
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::Transport(_))
        ));
        // Session was counted, then removed
        assert_eq!(server.sessions.total_created(), 1);
        assert!(server.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_ends_relay() {
        let (server, _stats) = build_server(ServerConfig::default());
        let target = echo_server().await;
        let (mut client, handle) = spawn_handler(&server, peer());

        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(&connect_request(target)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        let id = server.sessions.list()[0].id;
        assert!(server.sessions.disconnect(id));

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("handler should stop after disconnect")
            .unwrap()
            .unwrap();
        assert!(server.sessions.get(id).is_none());
    }

    #[tokio::test]
    async fn test_domain_target_connect() {
        let (server, _stats) = build_server(ServerConfig::default());
        let target = echo_server().await;
        let (mut client, handle) = spawn_handler(&server, peer());

        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        let request = SocksRequest {
            cmd: SocksCmd::Connect as u8,
            addr: Address::Domain("localhost".into(), target.port()),
        }
        .encode();
        assert_eq!(request[3], 3);
        client.write_all(&request).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], ReplyCode::Succeeded as u8);

        let sessions = server.sessions.list();
        assert_eq!(sessions[0].target, format!("localhost:{}", target.port()));

        client.write_all(b"named").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"named");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_any_falls_back_to_next_address() {
        let open = echo_server().await;
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let (_stream, used) = connect_any(&[closed, open]).await.unwrap();
        assert_eq!(used, open);

        let err = connect_any(&[closed]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
        assert!(connect_any(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_task_still_records_bytes() {
        let (server, stats) = build_server(ServerConfig::default());
        let target = echo_server().await;
        let (mut client, handle) = spawn_handler(&server, peer());

        client.write_all(&[5, 1, METHOD_NO_AUTH]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(&connect_request(target)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();

        // A listener restart drops the task mid-relay
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(server.sessions.is_empty());
        assert_eq!(stats.counters().bytes_in, 5);
        assert_eq!(stats.counters().bytes_out, 5);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let stats = Arc::new(ServerStatsCollector::new());
        let server = Arc::new(
            Server::builder()
                .policy(Arc::new(ConfigStore::new(ServerConfig::default())))
                .stats(stats)
                .conn_config(ConnConfig {
                    request_timeout: Duration::from_millis(50),
                    ..ConnConfig::default()
                })
                .build()
                .unwrap(),
        );
        let (_client, handle) = spawn_handler(&server, peer());
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProxyError::Timeout(_))
        ));
    }
}
