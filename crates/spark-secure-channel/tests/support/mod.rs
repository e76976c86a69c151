//! 集成测试共用的确定性组件。
//!
//! - `ToyEngine`：两轮握手的玩具安全引擎，客户端在收到 WELCOME 后需要执行一次委派任务（模拟证书校验）；
//! - `MemoryTransport`：成对的内存管道，可限制单次读写的字节数以模拟分片；
//! - `QueueExecutor`：只排队不执行的执行器，由测试在确定的时间点调用 `run_all`。
//!
//! 记录格式为 `[kind u8][len u16 BE][payload]`，应用数据以 0x5A 异或“加密”，
//! 便于断言密文中不会出现明文。

#![allow(dead_code)]

#[cfg(feature = "rustls")]
pub mod tls;

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use spark_secure_channel::{
    ChannelMode, DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus,
    InlineExecutor, Job, OpenOptions, SecureChannel, SecureChannelConfig, SecurityContext,
    SecurityEngine, TaskExecutor, Transport,
};

pub const HELLO: u8 = 1;
pub const WELCOME: u8 = 2;
pub const FINISHED: u8 = 3;
pub const DATA: u8 = 4;
pub const CLOSE: u8 = 5;

pub const HEADER: usize = 3;
pub const MAX_PAYLOAD: usize = 512;
pub const MASK: u8 = 0x5A;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    SendHello,
    AwaitWelcome,
    Verify,
    AwaitHello,
    SendWelcome,
    AwaitFinished,
    Established,
}

/// 玩具引擎工厂；`reject_certificate` 使客户端的校验任务失败。
#[derive(Clone, Default)]
pub struct ToyContext {
    pub reject_certificate: bool,
    pub tasks_run: Arc<AtomicUsize>,
}

impl ToyContext {
    pub fn rejecting() -> Self {
        Self {
            reject_certificate: true,
            ..Self::default()
        }
    }

    pub fn tasks_run(&self) -> usize {
        self.tasks_run.load(Ordering::SeqCst)
    }
}

impl SecurityContext for ToyContext {
    fn create_engine(
        &self,
        mode: ChannelMode,
        _peer: Option<SocketAddr>,
    ) -> Result<Box<dyn SecurityEngine>, EngineError> {
        Ok(Box::new(ToyEngine::new(
            mode,
            self.reject_certificate,
            Arc::clone(&self.tasks_run),
        )))
    }
}

pub struct ToyEngine {
    phase: Phase,
    verified: Arc<AtomicBool>,
    task_taken: bool,
    reject_certificate: bool,
    tasks_run: Arc<AtomicUsize>,
    closing: bool,
    outbound_done: bool,
    inbound_done: bool,
}

impl ToyEngine {
    pub fn new(mode: ChannelMode, reject_certificate: bool, tasks_run: Arc<AtomicUsize>) -> Self {
        Self {
            phase: if mode.is_client() {
                Phase::SendHello
            } else {
                Phase::AwaitHello
            },
            verified: Arc::new(AtomicBool::new(false)),
            task_taken: false,
            reject_certificate,
            tasks_run,
            closing: false,
            outbound_done: false,
            inbound_done: false,
        }
    }

    fn emit(kind: u8, payload: &[u8], dst: &mut [u8]) -> Option<usize> {
        let total = HEADER + payload.len();
        if dst.len() < total {
            return None;
        }
        dst[0] = kind;
        dst[1..HEADER].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        for (out, byte) in dst[HEADER..total].iter_mut().zip(payload) {
            *out = byte ^ MASK;
        }
        Some(total)
    }

    fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.handshake_status(), consumed, produced)
    }
}

impl SecurityEngine for ToyEngine {
    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.phase {
            Phase::SendHello | Phase::SendWelcome => HandshakeStatus::NeedWrap,
            Phase::AwaitWelcome | Phase::AwaitHello | Phase::AwaitFinished => {
                HandshakeStatus::NeedUnwrap
            }
            Phase::Verify if self.verified.load(Ordering::SeqCst) => HandshakeStatus::NeedWrap,
            Phase::Verify => HandshakeStatus::NeedTask,
            Phase::Established => HandshakeStatus::NotHandshaking,
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.outbound_done {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }
        if self.closing {
            return Ok(match Self::emit(CLOSE, &[], dst) {
                Some(produced) => {
                    self.outbound_done = true;
                    self.result(EngineStatus::Closed, 0, produced)
                }
                None => self.result(EngineStatus::BufferOverflow, 0, 0),
            });
        }
        let (kind, next) = match self.phase {
            Phase::SendHello => (HELLO, Phase::AwaitWelcome),
            Phase::SendWelcome => (WELCOME, Phase::AwaitFinished),
            Phase::Verify if self.verified.load(Ordering::SeqCst) => {
                (FINISHED, Phase::Established)
            }
            Phase::Established => {
                if src.is_empty() {
                    return Ok(self.result(EngineStatus::Ok, 0, 0));
                }
                let chunk = src.len().min(MAX_PAYLOAD);
                return Ok(match Self::emit(DATA, &src[..chunk], dst) {
                    Some(produced) => self.result(EngineStatus::Ok, chunk, produced),
                    None => self.result(EngineStatus::BufferOverflow, 0, 0),
                });
            }
            _ => return Ok(self.result(EngineStatus::Ok, 0, 0)),
        };
        let Some(produced) = Self::emit(kind, &[], dst) else {
            return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
        };
        self.phase = next;
        let handshake_status = if next == Phase::Established {
            HandshakeStatus::Finished
        } else {
            self.handshake_status()
        };
        Ok(EngineResult::new(
            EngineStatus::Ok,
            handshake_status,
            0,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.inbound_done {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }
        if src.len() < HEADER {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let kind = src[0];
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        let total = HEADER + len;
        if src.len() < total {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        match (kind, self.phase) {
            (CLOSE, _) => {
                self.inbound_done = true;
                Ok(self.result(EngineStatus::Closed, total, 0))
            }
            (HELLO, Phase::AwaitHello) => {
                self.phase = Phase::SendWelcome;
                Ok(self.result(EngineStatus::Ok, total, 0))
            }
            (WELCOME, Phase::AwaitWelcome) => {
                self.phase = Phase::Verify;
                Ok(self.result(EngineStatus::Ok, total, 0))
            }
            (FINISHED, Phase::AwaitFinished) => {
                self.phase = Phase::Established;
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::Finished,
                    total,
                    0,
                ))
            }
            (DATA, Phase::Established) => {
                if dst.len() < len {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                for (out, byte) in dst[..len].iter_mut().zip(&src[HEADER..total]) {
                    *out = byte ^ MASK;
                }
                Ok(self.result(EngineStatus::Ok, total, len))
            }
            (kind, phase) => Err(EngineError::Protocol(
                format!("unexpected record {kind} in {phase:?}").into(),
            )),
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.phase != Phase::Verify || self.task_taken {
            return None;
        }
        self.task_taken = true;
        let verified = Arc::clone(&self.verified);
        let tasks_run = Arc::clone(&self.tasks_run);
        let reject = self.reject_certificate;
        Some(DelegatedTask::new("toy-verify", move || {
            tasks_run.fetch_add(1, Ordering::SeqCst);
            if reject {
                return Err(EngineError::Certificate("toy peer certificate rejected".into()));
            }
            verified.store(true, Ordering::SeqCst);
            Ok(())
        }))
    }

    fn close_outbound(&mut self) {
        self.closing = true;
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn packet_buffer_size(&self) -> usize {
        HEADER + MAX_PAYLOAD
    }

    fn application_buffer_size(&self) -> usize {
        MAX_PAYLOAD
    }
}

#[derive(Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
    written: Vec<u8>,
}

/// 内存管道的一端。
pub struct MemoryTransport {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    read_chunk: usize,
    write_chunk: usize,
    port: u16,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(Pipe::default()));
        let b = Arc::new(Mutex::new(Pipe::default()));
        (
            Self {
                inbound: Arc::clone(&a),
                outbound: Arc::clone(&b),
                read_chunk: usize::MAX,
                write_chunk: usize::MAX,
                port: 4001,
            },
            Self {
                inbound: b,
                outbound: a,
                read_chunk: usize::MAX,
                write_chunk: usize::MAX,
                port: 4002,
            },
        )
    }

    /// 限制单次 `read`/`write` 搬运的字节数。
    pub fn with_chunks(mut self, read_chunk: usize, write_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self.write_chunk = write_chunk.max(1);
        self
    }

    /// 本端写出的全部字节，用于检查线上内容。
    pub fn wire_tap(&self) -> WireTap {
        WireTap {
            pipe: Arc::clone(&self.outbound),
        }
    }

    /// 模拟本端半关闭写方向。
    pub fn close_write(&self) {
        self.outbound.lock().closed = true;
    }
}

/// 观察某一方向线上字节的句柄。
pub struct WireTap {
    pipe: Arc<Mutex<Pipe>>,
}

impl WireTap {
    pub fn written(&self) -> Vec<u8> {
        self.pipe.lock().written.clone()
    }

    pub fn pending(&self) -> usize {
        self.pipe.lock().data.len()
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = self.inbound.lock();
        if pipe.data.is_empty() {
            return if pipe.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(self.read_chunk).min(pipe.data.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.outbound.lock();
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(self.write_chunk);
        pipe.data.extend(&buf[..n]);
        pipe.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn poll_connect(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, self.port)))
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.outbound.lock().closed = true;
        }
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            self.inbound.lock().closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.outbound.lock().closed = true;
    }
}

/// 只排队、由测试显式执行的执行器。
#[derive(Clone, Default)]
pub struct QueueExecutor {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl QueueExecutor {
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// 依次执行已排队（以及执行过程中新排队）的任务，返回执行数量。
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.jobs.lock().pop_front();
            match next {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl TaskExecutor for QueueExecutor {
    fn execute(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

pub type MemoryChannel = SecureChannel<MemoryTransport>;

/// 测试用的小缓冲配置，迫使缓冲在握手与数据传输中增长。
pub fn small_buffers() -> SecureChannelConfig {
    SecureChannelConfig::new()
        .with_initial_network_buffer(8)
        .with_initial_application_buffer(8)
        .with_close_timeout(std::time::Duration::from_millis(5))
}

pub fn open_toy(
    transport: MemoryTransport,
    mode: ChannelMode,
    context: &ToyContext,
    executor: Arc<dyn TaskExecutor>,
    config: SecureChannelConfig,
) -> MemoryChannel {
    open_memory(transport, mode, Arc::new(context.clone()), executor, config)
}

/// 在内存传输上以任意安全上下文打开通道。
pub fn open_memory(
    transport: MemoryTransport,
    mode: ChannelMode,
    context: Arc<dyn SecurityContext>,
    executor: Arc<dyn TaskExecutor>,
    config: SecureChannelConfig,
) -> MemoryChannel {
    SecureChannel::open_with(
        OpenOptions::new()
            .with_transport(transport)
            .with_mode(mode)
            .with_context(context)
            .with_executor(executor)
            .with_config(config),
    )
    .expect("打开内存通道")
}

/// 一对通过内存管道相连、使用内联执行器的通道。
pub fn inline_pair(
    context: &ToyContext,
    read_chunk: usize,
    write_chunk: usize,
) -> (MemoryChannel, MemoryChannel) {
    let (a, b) = MemoryTransport::pair();
    let executor: Arc<dyn TaskExecutor> = Arc::new(InlineExecutor);
    (
        open_toy(
            a.with_chunks(read_chunk, write_chunk),
            ChannelMode::Client,
            context,
            Arc::clone(&executor),
            small_buffers(),
        ),
        open_toy(
            b.with_chunks(read_chunk, write_chunk),
            ChannelMode::Server,
            context,
            executor,
            small_buffers(),
        ),
    )
}

/// 用零长度之外的读调用推进握手；仅推进尚未完成握手的一端，因此不会吞掉明文。
pub fn poke(channel: &MemoryChannel) -> io::Result<()> {
    if channel.is_handshake_complete() {
        return Ok(());
    }
    let mut scratch = [0_u8; 64];
    match channel.read(&mut scratch) {
        Ok(n) => {
            assert_eq!(n, 0, "握手完成前不得交付明文");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(err) => Err(err),
    }
}

/// 交替推进两端直到握手完成；返回是否在轮次上限内完成。
pub fn complete_handshake(client: &MemoryChannel, server: &MemoryChannel, rounds: usize) -> bool {
    for _ in 0..rounds {
        if client.is_handshake_complete() && server.is_handshake_complete() {
            return true;
        }
        poke(client).expect("客户端握手失败");
        poke(server).expect("服务端握手失败");
    }
    client.is_handshake_complete() && server.is_handshake_complete()
}

/// 把 `data` 从 `writer` 发送到 `reader`，交替推进两端，返回读到的全部字节。
pub fn transfer(writer: &MemoryChannel, reader: &MemoryChannel, data: &[u8], rounds: usize) -> Vec<u8> {
    let mut offset = 0;
    let mut received = Vec::with_capacity(data.len());
    let mut buf = [0_u8; 97];
    for _ in 0..rounds {
        if offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(n) => offset += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => panic!("写入失败: {err}"),
            }
        }
        match writer.flush() {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("刷新失败: {err}"),
        }
        match reader.read(&mut buf) {
            Ok(0) => panic!("传输过程中不应读到结束"),
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("读取失败: {err}"),
        }
        if received.len() == data.len() && offset == data.len() {
            break;
        }
    }
    received
}
