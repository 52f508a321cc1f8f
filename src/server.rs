// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 阻塞式多线程 HTTP 服务器
//!
//! 固定数量的工作线程在同一个监听套接字的克隆上阻塞 `accept()`，
//! 每个线程同步处理一个连接：
//!
//! ```text
//! Accepted → 读取请求行 → 畸形 → 直接关闭
//!                      → 查缓存 → 命中 → 分散写发送 → 关闭
//!                               → 未命中 → 固定 404 → 关闭
//! ```
//!
//! 缓存通过 `ArcSwap` 共享：请求处理拿到的是无锁快照，热重载时整体替换。
//!
//! 关闭连接时先关闭写端，再读空客户端未发送完的请求数据（有时间与字节上限），
//! 否则接收缓冲区中残留的数据会让内核发送 RST，客户端丢弃尚未读取的响应。

use std::{
    collections::HashMap,
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    cache::ResponseCache,
    exception::Exception,
    request::{RequestTarget, REQUEST_BUFFER_SIZE},
    response::{send_404, send_response},
};

const SEND_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const RECV_BUFFER_SIZE: usize = 1024 * 1024;
const LISTEN_BACKLOG: i32 = 512;

/// 关闭连接前读空残留请求数据的最长等待时间。
const LINGER_TIMEOUT: Duration = Duration::from_millis(500);
/// 关闭连接前最多丢弃的残留请求字节数。
const LINGER_DRAIN_LIMIT: usize = 1024 * 1024;

/// 创建监听套接字：地址复用、`TCP_NODELAY`、4 MiB 发送缓冲区、1 MiB 接收缓冲区、512 backlog。
///
/// 套接字选项设置失败只记录警告；绑定或监听失败则返回错误，不做重试。
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, Exception> {
    let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
        Ok(s) => s,
        Err(e) => {
            error!("无法创建套接字：{}", e);
            return Err(Exception::BindFailure);
        }
    };

    if let Err(e) = socket.set_reuse_address(true) {
        warn!("无法设置SO_REUSEADDR：{}", e);
    }
    if let Err(e) = socket.set_nodelay(true) {
        warn!("无法设置TCP_NODELAY：{}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SEND_BUFFER_SIZE) {
        warn!("无法设置发送缓冲区大小：{}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
        warn!("无法设置接收缓冲区大小：{}", e);
    }

    if let Err(e) = socket.bind(&addr.into()) {
        error!("无法绑定地址{}：{}", addr, e);
        return Err(Exception::BindFailure);
    }
    if let Err(e) = socket.listen(LISTEN_BACKLOG) {
        error!("无法在{}上监听：{}", addr, e);
        return Err(Exception::ListenFailure);
    }
    Ok(socket.into())
}

/// 单个连接的处理结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Served,
    NotFound,
    Malformed,
    /// 读或写出错，连接已放弃
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    served: AtomicU64,
    not_found: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
    active: AtomicUsize,
}

/// 某一时刻的服务统计。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub served: u64,
    pub not_found: u64,
    pub malformed: u64,
    pub failed: u64,
    pub active: usize,
}

/// 服务器状态：共享的响应缓存、统计计数器、连接 ID 生成器与停机标志。
/// 通过 `Arc` 在所有工作线程之间共享。
#[derive(Debug)]
pub struct Server {
    cache: ArcSwap<ResponseCache>,
    counters: Counters,
    next_id: AtomicU64,
    read_timeout: Option<Duration>,
    stopping: AtomicBool,
    /// 正在处理的 TCP 连接，停机时用来打断阻塞中的读取
    connections: Mutex<HashMap<u64, TcpStream>>,
}

impl Server {
    pub fn new(cache: ResponseCache) -> Self {
        Self {
            cache: ArcSwap::from_pointee(cache),
            counters: Counters::default(),
            next_id: AtomicU64::new(0),
            read_timeout: None,
            stopping: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// 为每个连接设置读超时，`None` 表示一直等待。
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// 当前缓存的快照。
    pub fn snapshot(&self) -> Arc<ResponseCache> {
        self.cache.load_full()
    }

    /// 原子地替换缓存，返回旧缓存。正在处理的请求继续使用旧快照。
    pub fn swap_cache(&self, cache: ResponseCache) -> Arc<ResponseCache> {
        let old = self.cache.swap(Arc::new(cache));
        info!("响应缓存已替换：{}个响应", self.cache.load().response_count());
        old
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            served: self.counters.served.load(Ordering::Relaxed),
            not_found: self.counters.not_found.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// 进入停机状态：不再接受新连接，并关闭所有进行中连接的读端。
    /// 阻塞在 `read` 上的工作线程随即读到 EOF，已开始发送的响应不受影响。
    fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let connections = self.connections();
        for (id, stream) in connections.iter() {
            if let Err(e) = stream.shutdown(Shutdown::Read) {
                debug!("[ID{}]无法关闭读端：{}", id, e);
            }
        }
        if !connections.is_empty() {
            info!("已打断{}个进行中的连接", connections.len());
        }
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        // 持锁期间只做插入、删除与 shutdown，中毒后数据仍然一致
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn register(&self, stream: &TcpStream, id: u64) {
        match stream.try_clone() {
            Ok(clone) => {
                self.connections().insert(id, clone);
            }
            Err(e) => debug!("[ID{}]无法克隆连接：{}", id, e),
        }
        // 在登记之后检查，保证与 begin_shutdown 之间不会漏掉这个连接
        if self.is_stopping() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }

    fn unregister(&self, id: u64) {
        self.connections().remove(&id);
    }

    /// 处理一个连接：读取一次请求，发送一个响应（或不发送），不负责关闭。
    pub fn handle_connection<S: Read + Write>(&self, stream: &mut S, id: u64) -> Outcome {
        let outcome = self.respond(stream, id);
        let counter = match outcome {
            Outcome::Served => &self.counters.served,
            Outcome::NotFound => &self.counters.not_found,
            Outcome::Malformed => &self.counters.malformed,
            Outcome::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn respond<S: Read + Write>(&self, stream: &mut S, id: u64) -> Outcome {
        let mut buffer = [0u8; REQUEST_BUFFER_SIZE];
        let n = loop {
            match stream.read(&mut buffer) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("[ID{}]读取请求失败：{}", id, e);
                    return Outcome::Failed;
                }
            }
        };

        let target = match RequestTarget::parse(&buffer[..n], id) {
            Ok(t) => t,
            Err(_) => return Outcome::Malformed,
        };

        let cache = self.cache.load();
        let response = match &target {
            RequestTarget::Root => cache.root(),
            RequestTarget::Path(path) => cache.get(path),
            RequestTarget::Invalid => None,
        };

        match response {
            Some(r) => match send_response(stream, r) {
                Ok(()) => {
                    debug!("[ID{}]{} 200 {}字节", id, r.uri(), r.body().len());
                    Outcome::Served
                }
                Err(e) => {
                    warn!("[ID{}]发送{}失败：{}", id, r.uri(), e);
                    Outcome::Failed
                }
            },
            None => {
                debug!("[ID{}]{:?} 404", id, target);
                match send_404(stream) {
                    Ok(()) => Outcome::NotFound,
                    Err(e) => {
                        debug!("[ID{}]发送404失败：{}", id, e);
                        Outcome::Failed
                    }
                }
            }
        }
    }

    fn serve_tcp(&self, mut stream: TcpStream, id: u64) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[ID{}]无法设置TCP_NODELAY：{}", id, e);
        }
        if let Some(timeout) = self.read_timeout {
            if let Err(e) = stream.set_read_timeout(Some(timeout)) {
                debug!("[ID{}]无法设置读超时：{}", id, e);
            }
        }

        self.register(&stream, id);
        self.counters.active.fetch_add(1, Ordering::Relaxed);
        let outcome = self.handle_connection(&mut stream, id);
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            // 读写已经出错，没有需要保护的响应数据
            Outcome::Failed => {
                let _ = stream.shutdown(Shutdown::Write);
            }
            _ => linger_close(&mut stream, id),
        }
        self.unregister(id);
        debug!("[ID{}]连接已关闭", id);
    }
}

/// 关闭写端，然后读空客户端残留的请求数据，直到对端关闭、超时或达到字节上限。
fn linger_close(stream: &mut TcpStream, id: u64) {
    if let Err(e) = stream.shutdown(Shutdown::Write) {
        debug!("[ID{}]无法关闭写端：{}", id, e);
        return;
    }
    if let Err(e) = stream.set_read_timeout(Some(LINGER_TIMEOUT)) {
        debug!("[ID{}]无法设置读超时：{}", id, e);
        return;
    }

    let deadline = Instant::now() + LINGER_TIMEOUT;
    let mut buffer = [0u8; REQUEST_BUFFER_SIZE];
    let mut drained = 0usize;
    while drained < LINGER_DRAIN_LIMIT && Instant::now() < deadline {
        match stream.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => drained += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    if drained > 0 {
        debug!("[ID{}]关闭前丢弃了{}字节未读取的请求数据", id, drained);
    }
}

/// 已启动的服务器句柄，用于获取监听地址、优雅停机或等待工作线程结束。
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    server: Arc<Server>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// 设置停机标志并关闭进行中连接的读端，用回环连接唤醒每个阻塞在 `accept()` 上的线程，
    /// 然后等待它们退出。即使没有配置读超时，空闲客户端也不会阻止停机。
    pub fn shutdown(self) {
        self.server.begin_shutdown();

        let mut wake_addr = self.local_addr;
        if wake_addr.ip().is_unspecified() {
            wake_addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        for _ in 0..self.workers.len() {
            if let Err(e) = TcpStream::connect_timeout(&wake_addr, Duration::from_secs(1)) {
                debug!("唤醒工作线程失败：{}", e);
            }
        }
        info!("正在等待{}个工作线程退出...", self.workers.len());
        self.join();
    }

    /// 等待所有工作线程结束。
    pub fn join(self) {
        for worker in self.workers {
            if worker.join().is_err() {
                error!("工作线程异常退出");
            }
        }
    }
}

/// 启动 `workers` 个工作线程，在 `listener` 的克隆上接受连接。
pub fn spawn(server: Arc<Server>, listener: TcpListener, workers: usize) -> Result<ServerHandle, Exception> {
    let local_addr = match listener.local_addr() {
        Ok(a) => a,
        Err(e) => {
            error!("无法获取监听地址：{}", e);
            return Err(Exception::ListenFailure);
        }
    };
    // 先克隆全部监听套接字，失败时还没有任何线程启动
    let mut listeners = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        match listener.try_clone() {
            Ok(l) => listeners.push(l),
            Err(e) => {
                error!("无法克隆监听套接字：{}", e);
                return Err(Exception::ListenFailure);
            }
        }
    }

    let mut handles = Vec::with_capacity(listeners.len());
    for (i, listener) in listeners.into_iter().enumerate() {
        let server = Arc::clone(&server);
        let spawned = thread::Builder::new()
            .name(format!("gemcore-worker-{}", i))
            .spawn(move || worker_loop(&server, &listener));
        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => error!("无法启动工作线程{}：{}", i, e),
        }
    }

    if handles.is_empty() {
        return Err(Exception::ListenFailure);
    }
    info!("{}个工作线程已在{}上就绪", handles.len(), local_addr);
    Ok(ServerHandle {
        local_addr,
        server,
        workers: handles,
    })
}

fn worker_loop(server: &Server, listener: &TcpListener) {
    while !server.is_stopping() {
        match listener.accept() {
            Ok((stream, addr)) => {
                if server.is_stopping() {
                    break;
                }
                let id = server.next_id();
                debug!("[ID{}]新的连接：{}", id, addr);
                server.serve_tcp(stream, id);
            }
            Err(e) => {
                if server.is_stopping() {
                    break;
                }
                warn!("accept失败：{}", e);
                // 文件描述符耗尽等情况下避免空转
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    debug!("{:?}已退出", thread::current().name());
}

/// 按配置决定的监听地址。
pub fn listen_addr(local: bool, port: u16) -> SocketAddr {
    let ip = match local {
        true => Ipv4Addr::LOCALHOST,
        false => Ipv4Addr::UNSPECIFIED,
    };
    SocketAddr::from((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{asset::AssetStore, cache::CacheBuilder, param::NOT_FOUND_RESPONSE};
    use std::io::{self, Cursor};

    /// 内存中的双向流：读取预设的请求，记录写出的响应
    struct MemoryStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl MemoryStream {
        fn new(request: &[u8]) -> Self {
            Self {
                input: Cursor::new(request.to_vec()),
                output: Vec::new(),
            }
        }
    }

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for MemoryStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn server() -> Server {
        let store = AssetStore::from_static(&[
            ("index.html", b"<html><head></head></html>"),
            ("gemcore-webgpu-helper.js", b"console.log(1)"),
            ("img/logo.png", b"\x89PNG"),
            ("my file.txt", b"spaced"),
        ]);
        let paths = store.paths().to_vec();
        Server::new(CacheBuilder::default().build(&paths, &store))
    }

    fn request(server: &Server, raw: &[u8]) -> (Outcome, Vec<u8>) {
        let mut stream = MemoryStream::new(raw);
        let outcome = server.handle_connection(&mut stream, 0);
        (outcome, stream.output)
    }

    #[test]
    fn test_root_and_entrypoint_are_identical() {
        let server = server();
        let (a, root) = request(&server, b"GET / HTTP/1.1\r\n\r\n");
        let (b, index) = request(&server, b"GET /index.html HTTP/1.1\r\n\r\n");
        assert_eq!(a, Outcome::Served);
        assert_eq!(b, Outcome::Served);
        assert_eq!(root, index);
        assert!(root.ends_with(b"<html><head><script>console.log(1)</script></head></html>"));
    }

    #[test]
    fn test_miss_returns_fixed_404() {
        let server = server();
        let (outcome, out) = request(&server, b"GET /missing.js HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::NotFound);
        assert_eq!(out, NOT_FOUND_RESPONSE);
    }

    #[test]
    fn test_malformed_request_gets_no_response() {
        let server = server();
        let (outcome, out) = request(&server, b"POST / HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::Malformed);
        assert!(out.is_empty());

        let (outcome, out) = request(&server, b"GET /");
        assert_eq!(outcome, Outcome::Malformed);
        assert!(out.is_empty());
    }

    #[test]
    fn test_percent_encoded_path() {
        let server = server();
        let (outcome, out) = request(&server, b"GET /my%20file.txt HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::Served);
        assert!(out.ends_with(b"spaced"));
    }

    #[test]
    fn test_stats_are_counted() {
        let server = server();
        request(&server, b"GET / HTTP/1.1\r\n\r\n");
        request(&server, b"GET /nope HTTP/1.1\r\n\r\n");
        request(&server, b"DELETE / HTTP/1.1\r\n\r\n");
        let stats = server.stats();
        assert_eq!(stats.served, 1);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_swap_cache() {
        let server = server();
        let old_snapshot = server.snapshot();

        let store = AssetStore::from_static(&[("index.html", b"<p>v2</p>")]);
        let paths = store.paths().to_vec();
        let old = server.swap_cache(CacheBuilder::default().build(&paths, &store));

        assert!(Arc::ptr_eq(&old, &old_snapshot));
        assert!(old_snapshot.get("/img/logo.png").is_some());
        let (_, out) = request(&server, b"GET / HTTP/1.1\r\n\r\n");
        assert!(out.ends_with(b"<p>v2</p>"));
        let (outcome, _) = request(&server, b"GET /img/logo.png HTTP/1.1\r\n\r\n");
        assert_eq!(outcome, Outcome::NotFound);
    }

    #[test]
    fn test_connection_ids_increase() {
        let server = server();
        assert_eq!(server.next_id(), 0);
        assert_eq!(server.next_id(), 1);
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(listen_addr(true, 8765).to_string(), "127.0.0.1:8765");
        assert_eq!(listen_addr(false, 80).to_string(), "0.0.0.0:80");
    }

    #[test]
    fn test_spawn_serve_and_shutdown() {
        let listener = bind_listener(listen_addr(true, 0)).unwrap();
        let server = Arc::new(server().with_read_timeout(Some(Duration::from_secs(5))));
        let handle = spawn(Arc::clone(&server), listener, 3).unwrap();
        assert_eq!(handle.worker_count(), 3);

        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream.write_all(b"GET /img/logo.png HTTP/1.1\r\n\r\n").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(b"\x89PNG"));

        handle.shutdown();
        assert_eq!(server.stats().served, 1);
    }

    #[test]
    fn test_shutdown_interrupts_idle_connection() {
        let listener = bind_listener(listen_addr(true, 0)).unwrap();
        let server = Arc::new(server());
        let handle = spawn(Arc::clone(&server), listener, 1).unwrap();

        // 连接后不发送任何数据，唯一的工作线程阻塞在没有超时的读取上
        let mut idle = TcpStream::connect(handle.local_addr()).unwrap();
        let start = Instant::now();
        while server.stats().active == 0 {
            assert!(start.elapsed() < Duration::from_secs(5), "connection was not accepted");
            thread::sleep(Duration::from_millis(5));
        }

        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            handle.shutdown();
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok(), "shutdown blocked on idle client");

        let mut buffer = Vec::new();
        idle.read_to_end(&mut buffer).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(server.stats().malformed, 1);
        assert_eq!(server.stats().active, 0);
    }

    #[test]
    fn test_unread_request_bytes_do_not_truncate_response() {
        let body: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let store = AssetStore::from_records(vec![crate::container::AssetRecord::new(
            "big.bin".to_string(),
            body.clone(),
        )]);
        let paths = store.paths().to_vec();
        let server = Arc::new(Server::new(CacheBuilder::default().build(&paths, &store)));
        let listener = bind_listener(listen_addr(true, 0)).unwrap();
        let handle = spawn(Arc::clone(&server), listener, 2).unwrap();

        // 请求头远大于单次读取的缓冲区
        let request = format!(
            "GET /big.bin HTTP/1.1\r\nCookie: session={}\r\n\r\n",
            "c".repeat(20_000)
        );
        let mut stream = TcpStream::connect(handle.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        drop(stream);

        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(&body[body.len() - 4096..]));
        let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert_eq!(&response[split + 4..], body.as_slice());

        handle.shutdown();
    }

    #[test]
    fn test_bind_conflict() {
        let first = bind_listener(listen_addr(true, 0)).unwrap();
        let port = first.local_addr().unwrap().port();
        // 同一地址上已有监听者，第二次绑定失败
        let second = bind_listener(listen_addr(true, port));
        assert_eq!(second.unwrap_err(), Exception::BindFailure);
    }
}
