use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use kestrel_dns_lib::FromBuf as _;
use kestrel_dns_lib::{ByteBuf, DnsPacket};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::{Connection, ModuleEnv, Worker, DEFAULT_EDNS_BUF_CAPACITY};

type HandlerResult = anyhow::Result<()>;

pub struct DnsServer {
    udp_sockets: Vec<Arc<UdpSocket>>,
    tcp_listeners: Vec<Arc<TcpListener>>,
    worker: Arc<Worker>,
    workers: JoinSet<HandlerResult>,
}

/// Applies so-rcvbuf/so-sndbuf/so-reuseport before the socket reaches tokio
fn make_udp_socket(bind_addr: SocketAddr, env: &ModuleEnv) -> anyhow::Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("error while creating a UDP socket")?;
    if env.cfg.so_reuseport {
        socket.set_reuse_port(true).context("error while setting SO_REUSEPORT")?;
    }
    if env.cfg.so_rcvbuf > 0 {
        socket
            .set_recv_buffer_size(env.cfg.so_rcvbuf)
            .context("error while setting SO_RCVBUF")?;
    }
    if env.cfg.so_sndbuf > 0 {
        socket
            .set_send_buffer_size(env.cfg.so_sndbuf)
            .context("error while setting SO_SNDBUF")?;
    }
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("error while binding the UDP socket to {}", bind_addr))?;
    socket.set_nonblocking(true).context("error while making the socket non-blocking")?;
    UdpSocket::from_std(socket.into()).context("error while registering the socket with tokio")
}

fn make_tcp_listener(bind_addr: SocketAddr, env: &ModuleEnv) -> anyhow::Result<TcpListener> {
    let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("error while creating a TCP socket")?;
    if env.cfg.so_reuseport {
        socket.set_reuse_port(true).context("error while setting SO_REUSEPORT")?;
    }
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("error while binding the TCP socket to {}", bind_addr))?;
    socket.listen(128).context("error while listening on the TCP socket")?;
    socket.set_nonblocking(true).context("error while making the socket non-blocking")?;
    TcpListener::from_std(socket.into()).context("error while registering the listener with tokio")
}

impl DnsServer {
    pub async fn new(env: Arc<ModuleEnv>) -> anyhow::Result<Self> {
        let worker = Arc::new(Worker::new(env.clone()));

        let mut udp_sockets = Vec::new();
        let mut tcp_listeners = Vec::new();
        for interface in &env.cfg.interface {
            match interface {
                addr if addr.is_ipv4() && !env.cfg.do_ip4 => continue,
                addr if addr.is_ipv6() && !env.cfg.do_ip6 => continue,
                _ => {}
            }
            let bind_addr = SocketAddr::new(*interface, env.cfg.port);
            if env.cfg.do_udp {
                udp_sockets.push(Arc::new(make_udp_socket(bind_addr, &env)?));
            }
            if env.cfg.do_tcp {
                tcp_listeners.push(Arc::new(make_tcp_listener(bind_addr, &env)?));
            }
        }
        anyhow::ensure!(
            !udp_sockets.is_empty() || !tcp_listeners.is_empty(),
            "no listeners configured: check interface/do-udp/do-tcp settings"
        );

        Ok(DnsServer {
            udp_sockets,
            tcp_listeners,
            worker,
            workers: JoinSet::new(),
        })
    }

    pub async fn new_with_workers(env: Arc<ModuleEnv>) -> anyhow::Result<Self> {
        let num_threads = env.cfg.num_threads;
        let mut server = DnsServer::new(env).await?;
        server.add_workers(num_threads).await;
        Ok(server)
    }

    pub async fn add_workers(&mut self, n: usize) {
        for idx in 0..n.max(1) {
            for udp_socket in &self.udp_sockets {
                let socket = udp_socket.clone();
                let worker = self.worker.clone();
                self.workers.spawn(
                    handle_udp_requests(socket, worker).instrument(tracing::trace_span!("", worker = idx)),
                );
            }
        }
        // One acceptor per TCP listener is enough; handlers are spawned per
        // connection anyway
        for (idx, tcp_listener) in self.tcp_listeners.iter().enumerate() {
            let listener = tcp_listener.clone();
            let worker = self.worker.clone();
            self.workers.spawn(
                handle_tcp_requests(listener, worker).instrument(tracing::trace_span!("", acceptor = idx)),
            );
        }
    }

    pub async fn block_until_completion(mut self) -> anyhow::Result<()> {
        while let Some(result) = self.workers.join_next().await {
            if let Err(error) = result.context("worker task failed to execute")? {
                tracing::debug!("Error in a worker: {}", error);
            }
        }
        Ok(())
    }
}

async fn handle_udp_requests(udp_socket: Arc<UdpSocket>, worker: Arc<Worker>) -> HandlerResult {
    let mut recv = vec![0u8; DEFAULT_EDNS_BUF_CAPACITY];
    let mut handlers: JoinSet<HandlerResult> = JoinSet::new();
    loop {
        tokio::select! {
            received = udp_socket.recv_from(&mut recv) => {
                let (length, from) = received.context("error while receiving a UDP packet")?;
                tracing::trace!(client = ?from, "new UDP request");

                let connection = Connection::Udp((udp_socket.clone(), Some(from)));
                let datagram = &recv[..length];
                let mut reader = ByteBuf::new(&datagram);
                let parsed = DnsPacket::from_buf(&mut reader);
                handlers.spawn(worker.clone().handle_query(connection, parsed).in_current_span());
            }
            Some(result) = handlers.join_next() => {
                result
                    .context("request handling task failed to execute")?
                    .context("unrecoverable error while handling a query")?;
            }
        }
    }
}

async fn handle_tcp_requests(tcp_listener: Arc<TcpListener>, worker: Arc<Worker>) -> HandlerResult {
    let mut handlers: JoinSet<HandlerResult> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = tcp_listener.accept() => {
                let (stream, from) = accepted.context("error while accepting a TCP connection")?;
                tracing::trace!(client = ?from, "new TCP connection");

                let worker = worker.clone();
                handlers.spawn(
                    async move {
                        let mut connection: Connection<Arc<UdpSocket>> = Connection::Tcp(stream);
                        let mut recv = ByteBuf::new_from_vec(vec![0; DEFAULT_EDNS_BUF_CAPACITY]);
                        connection.read(&mut recv).await.context("error while reading the query")?;
                        let mut reader = ByteBuf::new(&recv);
                        let parsed = DnsPacket::from_buf(&mut reader);
                        worker.handle_query(connection, parsed).await
                    }
                    .in_current_span(),
                );
            }
            Some(result) = handlers.join_next() => {
                result
                    .context("connection handling task failed to execute")?
                    .context("unrecoverable error while handling a query")?;
            }
        }
    }
}
