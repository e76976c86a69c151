//! 基于 `rustls` 的 [`SecurityEngine`] 适配。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - `rustls` 的连接对象以 `read_tls`/`write_tls` 搬运密文、以 `reader`/`writer` 搬运明文，
//!   状态通过 `wants_write`/`is_handshaking` 查询；通道状态机需要的是“缓冲进、缓冲出”的
//!   `wrap`/`unwrap` 语义，本模块负责两者之间的翻译。
//!
//! ## 逻辑（How）
//! - 握手状态推导：有待发送密文 → `NeedWrap`；仍在握手 → `NeedUnwrap`；否则 `NotHandshaking`；
//!   握手完成后的首个 `wrap`/`unwrap` 结果报告一次 `Finished`；
//! - `wrap`：仅在没有积压密文时接收新的明文（按单条记录上限截断），随后把积压密文写入目标切片；
//! - `unwrap`：交替执行“读出明文”与“喂入密文 + `process_new_packets`”，直到源耗尽、
//!   目标写满或 `rustls` 因明文积压而暂停读取；
//! - 证书校验在 `process_new_packets` 内同步完成，因此本引擎从不交出委派任务。
//!
//! ## 契约（What）
//! - `rustls::Error` 被映射为 [`EngineError`]：证书相关 → `Certificate`，收到告警 → `Alert`，
//!   其余 → `Protocol`；
//! - 客户端角色若未显式提供服务器名称，则退化为对端 IP 地址进行校验。
//!
//! ## 风险与权衡（Trade-offs）
//! - `rustls` 在内部缓存未读明文与未发密文，`bytes_consumed` 可能先于密文真正写出；
//!   通道依赖随后的 `NeedWrap` 状态继续排空，不会丢失数据。

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use ::rustls::{
    AlertDescription, ClientConfig, ClientConnection, Error as RustlsError, RootCertStore,
    ServerConfig, ServerConnection, pki_types::ServerName,
};

use super::{
    ChannelMode, DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus,
    SecurityContext, SecurityEngine,
};

/// TLS 明文分片上限（2^14）。
const MAX_PLAINTEXT: usize = 16 * 1024;
/// 单条密文记录的上限：明文上限 + 记录头 + 加密扩展余量。
const MAX_PACKET: usize = MAX_PLAINTEXT + 325;

enum TlsConnection {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl TlsConnection {
    fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.read_tls(rd),
            Self::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            Self::Client(conn) => conn.write_tls(wr),
            Self::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<::rustls::IoState, RustlsError> {
        match self {
            Self::Client(conn) => conn.process_new_packets(),
            Self::Server(conn) => conn.process_new_packets(),
        }
    }

    fn reader(&mut self) -> ::rustls::Reader<'_> {
        match self {
            Self::Client(conn) => conn.reader(),
            Self::Server(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> ::rustls::Writer<'_> {
        match self {
            Self::Client(conn) => conn.writer(),
            Self::Server(conn) => conn.writer(),
        }
    }

    fn wants_read(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_read(),
            Self::Server(conn) => conn.wants_read(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Self::Client(conn) => conn.wants_write(),
            Self::Server(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Self::Client(conn) => conn.is_handshaking(),
            Self::Server(conn) => conn.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Self::Client(conn) => conn.send_close_notify(),
            Self::Server(conn) => conn.send_close_notify(),
        }
    }
}

/// 包装一个 `rustls` 连接的安全引擎。
pub struct RustlsEngine {
    conn: TlsConnection,
    started: bool,
    finished_reported: bool,
    outbound_closed: bool,
    inbound_done: bool,
    pending_plaintext: usize,
}

impl RustlsEngine {
    pub fn client(conn: ClientConnection) -> Self {
        Self::new(TlsConnection::Client(conn))
    }

    pub fn server(conn: ServerConnection) -> Self {
        Self::new(TlsConnection::Server(conn))
    }

    fn new(conn: TlsConnection) -> Self {
        Self {
            conn,
            started: false,
            finished_reported: false,
            outbound_closed: false,
            inbound_done: false,
            pending_plaintext: 0,
        }
    }

    /// 计算一次操作之后应报告的握手状态，握手完成的那一刻报告一次 `Finished`。
    fn settle_status(&mut self) -> HandshakeStatus {
        if self.started
            && !self.finished_reported
            && !self.conn.is_handshaking()
            && !self.conn.wants_write()
        {
            self.finished_reported = true;
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, EngineError> {
        if dst.is_empty() {
            return Ok(0);
        }
        match self.conn.reader().read(dst) {
            Ok(n) => {
                self.pending_plaintext = self.pending_plaintext.saturating_sub(n);
                Ok(n)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.inbound_done = true;
                Ok(0)
            }
            Err(err) => Err(EngineError::Protocol(err.to_string().into())),
        }
    }
}

impl SecurityEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), EngineError> {
        self.started = true;
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.started {
            return HandshakeStatus::NotHandshaking;
        }
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if self.outbound_closed && !self.conn.wants_write() {
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                self.settle_status(),
                0,
                0,
            ));
        }

        let mut consumed = 0;
        if !src.is_empty()
            && !self.outbound_closed
            && !self.conn.is_handshaking()
            && !self.conn.wants_write()
        {
            let chunk = &src[..src.len().min(MAX_PLAINTEXT)];
            consumed = self
                .conn
                .writer()
                .write(chunk)
                .map_err(|err| EngineError::Protocol(err.to_string().into()))?;
        }

        let mut cursor = io::Cursor::new(&mut dst[..]);
        while self.conn.wants_write() {
            let written = self
                .conn
                .write_tls(&mut cursor)
                .map_err(|err| EngineError::Protocol(err.to_string().into()))?;
            if written == 0 {
                break;
            }
        }
        let produced = cursor.position() as usize;

        let status = if produced == 0 && consumed == 0 && self.conn.wants_write() {
            EngineStatus::BufferOverflow
        } else if self.outbound_closed && !self.conn.wants_write() {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.settle_status(),
            consumed,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        let mut input = src;
        let mut consumed = 0;
        let mut produced = 0;

        loop {
            produced += self.read_plaintext(&mut dst[produced..])?;
            if produced == dst.len() && self.pending_plaintext > 0 {
                break;
            }
            if input.is_empty() || !self.conn.wants_read() {
                break;
            }
            let n = match self.conn.read_tls(&mut input) {
                Ok(n) => n,
                Err(_) if consumed > 0 => break,
                Err(err) => return Err(EngineError::Protocol(err.to_string().into())),
            };
            if n == 0 {
                break;
            }
            consumed += n;
            let state = self.conn.process_new_packets().map_err(map_rustls_error)?;
            self.pending_plaintext = state.plaintext_bytes_to_read();
            if state.peer_has_closed() {
                self.inbound_done = true;
            }
        }

        let status = if produced == 0 && self.pending_plaintext > 0 {
            EngineStatus::BufferOverflow
        } else if produced == 0 && self.inbound_done {
            EngineStatus::Closed
        } else if produced == 0 && consumed == 0 {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.settle_status(),
            consumed,
            produced,
        ))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && !self.conn.wants_write()
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn has_buffered_plaintext(&self) -> bool {
        self.pending_plaintext > 0
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_PACKET
    }

    fn application_buffer_size(&self) -> usize {
        MAX_PLAINTEXT
    }
}

/// 将 `rustls::Error` 归类为 [`EngineError`]。
pub(crate) fn map_rustls_error(error: RustlsError) -> EngineError {
    use RustlsError::*;
    match &error {
        NoCertificatesPresented
        | InvalidCertificate(_)
        | InvalidCertRevocationList(_)
        | UnsupportedNameType => EngineError::Certificate(error.to_string().into()),
        AlertReceived(alert) => EngineError::Alert(alert_name(alert).into()),
        _ => EngineError::Protocol(error.to_string().into()),
    }
}

fn alert_name(alert: &AlertDescription) -> String {
    format!("{alert:?}")
}

/// 基于 `rustls` 配置的引擎工厂。
#[derive(Clone, Default)]
pub struct RustlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<ServerName<'static>>,
}

impl RustlsContext {
    pub fn client(config: Arc<ClientConfig>) -> Self {
        Self {
            client: Some(config),
            ..Self::default()
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            server: Some(config),
            ..Self::default()
        }
    }

    pub fn with_client_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }

    pub fn with_server_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    /// 指定客户端校验证书时使用的服务器名称。
    pub fn with_server_name(mut self, name: ServerName<'static>) -> Self {
        self.server_name = Some(name);
        self
    }
}

impl SecurityContext for RustlsContext {
    fn create_engine(
        &self,
        mode: ChannelMode,
        peer: Option<SocketAddr>,
    ) -> Result<Box<dyn SecurityEngine>, EngineError> {
        match mode {
            ChannelMode::Client => {
                let config = self.client.clone().ok_or(EngineError::Configuration(
                    "no rustls client configuration".into(),
                ))?;
                let name = self
                    .server_name
                    .clone()
                    .or_else(|| peer.map(|addr| ServerName::from(addr.ip())))
                    .ok_or(EngineError::Configuration(
                        "server name unknown: no explicit name and no peer address".into(),
                    ))?;
                let conn = ClientConnection::new(config, name).map_err(map_rustls_error)?;
                Ok(Box::new(RustlsEngine::client(conn)))
            }
            ChannelMode::Server => {
                let config = self.server.clone().ok_or(EngineError::Configuration(
                    "no rustls server configuration".into(),
                ))?;
                let conn = ServerConnection::new(config).map_err(map_rustls_error)?;
                Ok(Box::new(RustlsEngine::server(conn)))
            }
        }
    }
}

/// 进程级默认上下文：客户端角色，信任 `webpki-roots` 内置的根证书。
pub fn default_context() -> Result<Arc<dyn SecurityContext>, EngineError> {
    static DEFAULT: OnceLock<Result<Arc<RustlsContext>, EngineError>> = OnceLock::new();
    let context = DEFAULT.get_or_init(build_default_context).clone()?;
    Ok(context)
}

fn build_default_context() -> Result<Arc<RustlsContext>, EngineError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(::rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(map_rustls_error)?
        .with_root_certificates(roots)
        .with_no_client_auth();
    tracing::debug!(
        roots = webpki_roots::TLS_SERVER_ROOTS.len(),
        "built default rustls client context"
    );
    Ok(Arc::new(RustlsContext::client(Arc::new(config))))
}
