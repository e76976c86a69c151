//! 安全通道的工厂入口。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 调用方大多只关心“连到哪里”，其余组件（安全上下文、握手角色、任务执行器、底层传输）都应有合理默认；
//! - 需要定制时，通过 [`OpenOptions`] 一次性声明，避免出现一长串可选位置参数。
//!
//! ## 逻辑（How）
//! - 省略的上下文回落到进程级默认安全上下文（`rustls` + `webpki-roots` 根证书）；
//! - 省略的执行器回落到进程级共享任务池 [`DefaultTaskPool`](crate::dispatch::DefaultTaskPool)；
//! - 省略的传输在给出地址时由 [`Transport::connect`] 新建，否则通道保持未绑定状态，等待
//!   [`SecureChannel::connect`]；
//! - 调用方提供的传输可能仍在连接中，工厂只做一次非阻塞的连接进度查询。
//!
//! ## 契约（What）
//! - 工厂本身不执行任何握手 I/O；握手在首次 `read`/`write` 时惰性开始；
//! - 配置在此处校验一次，非法组合以 [`SecureChannelError::Configuration`] 拒绝。
//!
//! ## 风险与权衡（Trade-offs）
//! - 同时给出传输与地址时以传输为准，地址仅用于日志。

use std::{fmt, net::SocketAddr, sync::Arc};

use mio::net::TcpStream;
use tracing::debug;

use crate::{
    channel::SecureChannel,
    config::SecureChannelConfig,
    dispatch::{TaskDispatcher, TaskExecutor},
    engine::{ChannelMode, SecurityContext},
    error::{self, SecureChannelError},
    transport::Transport,
};

/// 打开安全通道所需的全部可选组件。
pub struct OpenOptions<T: Transport = TcpStream> {
    address: Option<SocketAddr>,
    context: Option<Arc<dyn SecurityContext>>,
    mode: ChannelMode,
    executor: Option<Arc<dyn TaskExecutor>>,
    transport: Option<T>,
    config: SecureChannelConfig,
}

impl<T: Transport> OpenOptions<T> {
    pub fn new() -> Self {
        Self {
            address: None,
            context: None,
            mode: ChannelMode::Client,
            executor: None,
            transport: None,
            config: SecureChannelConfig::new(),
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_context(mut self, context: Arc<dyn SecurityContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_mode(mut self, mode: ChannelMode) -> Self {
        self.mode = mode;
        self
    }

    /// 注入委派任务执行器，覆盖进程级共享池。
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 使用一条已经存在（已连接或正在连接）的传输。
    pub fn with_transport(mut self, transport: T) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_config(mut self, config: SecureChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn config(&self) -> &SecureChannelConfig {
        &self.config
    }
}

impl<T: Transport> Default for OpenOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> fmt::Debug for OpenOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("address", &self.address)
            .field("custom_context", &self.context.is_some())
            .field("mode", &self.mode)
            .field("custom_executor", &self.executor.is_some())
            .field("transport", &self.transport.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl SecureChannel<TcpStream> {
    /// 使用全部默认组件打开一个未连接的客户端通道。
    pub fn open() -> Result<Self, SecureChannelError> {
        Self::open_with(OpenOptions::new())
    }

    /// 打开客户端通道并发起到 `address` 的非阻塞连接。
    pub fn open_to(address: SocketAddr) -> Result<Self, SecureChannelError> {
        Self::open_with(OpenOptions::new().with_address(address))
    }

    /// 使用给定的安全上下文打开未连接的通道；`None` 表示默认上下文。
    pub fn open_with_context(
        context: Option<Arc<dyn SecurityContext>>,
    ) -> Result<Self, SecureChannelError> {
        Self::open_with(options_with_context(context))
    }

    pub fn open_to_with_context(
        address: SocketAddr,
        context: Option<Arc<dyn SecurityContext>>,
    ) -> Result<Self, SecureChannelError> {
        Self::open_with(options_with_context(context).with_address(address))
    }
}

fn options_with_context(context: Option<Arc<dyn SecurityContext>>) -> OpenOptions<TcpStream> {
    let options = OpenOptions::new();
    match context {
        Some(context) => options.with_context(context),
        None => options,
    }
}

impl<T: Transport> SecureChannel<T> {
    /// 按 [`OpenOptions`] 组装通道；未给出的组件使用默认值。
    pub fn open_with(options: OpenOptions<T>) -> Result<Self, SecureChannelError> {
        let OpenOptions {
            address,
            context,
            mode,
            executor,
            transport,
            config,
        } = options;
        config.validate()?;

        let context = match context {
            Some(context) => context,
            None => default_security_context()?,
        };
        let dispatcher = match executor {
            Some(executor) => TaskDispatcher::new(executor),
            None => TaskDispatcher::shared_default()?,
        };

        let (transport, connecting) = match (transport, address) {
            (Some(transport), address) => {
                if let Some(address) = address {
                    debug!(%address, %mode, "supplied transport takes precedence over address");
                }
                let (transport, connected) = poll_supplied(transport)?;
                (Some(transport), !connected)
            }
            (None, Some(address)) => {
                let transport = T::connect(address)
                    .map_err(|err| SecureChannelError::transport(error::CONNECT, err))?;
                debug!(%address, %mode, "initiated transport connect");
                let (transport, connected) = poll_supplied(transport)?;
                (Some(transport), !connected)
            }
            (None, None) => (None, false),
        };

        Ok(Self::assemble(
            transport, connecting, context, mode, dispatcher, config,
        ))
    }
}

fn poll_supplied<T: Transport>(mut transport: T) -> Result<(T, bool), SecureChannelError> {
    let connected = transport
        .poll_connect()
        .map_err(|err| SecureChannelError::transport(error::CONNECT, err))?;
    Ok((transport, connected))
}

#[cfg(feature = "rustls")]
fn default_security_context() -> Result<Arc<dyn SecurityContext>, SecureChannelError> {
    crate::engine::rustls_engine::default_context().map_err(|err| {
        SecureChannelError::Configuration(
            format!("default security context unavailable: {err}").into(),
        )
    })
}

#[cfg(not(feature = "rustls"))]
fn default_security_context() -> Result<Arc<dyn SecurityContext>, SecureChannelError> {
    Err(SecureChannelError::Configuration(
        "no default security context: enable the `rustls` feature or supply one".into(),
    ))
}
