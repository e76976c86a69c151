use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Instant,
};

use mio::{Interest, Registry, Token, event::Source, net::TcpStream};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    buffer::{BufferKind, BufferSet},
    config::SecureChannelConfig,
    dispatch::{TaskDispatcher, TaskHandle},
    engine::{ChannelMode, DelegatedTask, EngineError, HandshakeStatus, SecurityContext},
    error::{self, OperationKind, SecureChannelError},
    handshake::{DrainProgress, Drive, Flush, HandshakeEngine, ReadProgress},
    readiness::{ReadinessAdapter, ReadinessInputs, required_interest, sync_source},
    transport::Transport,
};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 非阻塞、可注册到 `mio` selector 的安全字节通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 对调用方而言，它与普通的非阻塞 `TcpStream` 一样：`read`/`write` 要么推进，要么返回
///   [`io::ErrorKind::WouldBlock`]，并且可以注册到 `mio::Poll`；
/// - 所有流量都经由安全引擎加解密，握手在首次 I/O 时惰性启动，并由每一次 `read`/`write` 顺带推进。
///
/// ## 逻辑 (How)
/// - 通道是一个廉价句柄（`Arc`），内部状态由一把 `parking_lot::Mutex` 保护；引擎与缓冲只在锁内访问；
/// - 引擎交出委派任务时，任务在**释放锁之后**提交给调度器；任务完成回调持有 `Weak` 句柄，
///   重新加锁后检查通道是否仍然存活、任务代次是否匹配，再恢复握手并刷新 selector 兴趣；
/// - 每次操作结束时按 [`required_interest`] 重新计算应注册的兴趣集合。
///
/// ## 契约 (What)
/// - 握手完成前 `read` 不会交付任何明文，`write` 不会接收任何明文；
/// - 握手期间对端关闭连接视为错误；握手完成后传输读到 EOF（无论是否收到关闭告警）时 `read` 返回 `Ok(0)`；
/// - 终止性错误（传输失败、协议失败、缓冲超限）使通道进入 broken 状态，此后的每次
///   `read`/`write`/`connect` 都返回同一个错误；
/// - [`SecureChannel::close`] 发送关闭告警，在 `close_timeout` 内等待对端告警，然后关闭传输；
///   关闭之后完成的委派任务结果被丢弃，不再修改任何状态。
///
/// ## 风险与权衡 (Trade-offs)
/// - 同一通道允许一个读线程与一个写线程并发调用，但二者会在内部锁上串行化；
/// - `close` 是唯一可能短暂阻塞的调用，其等待上限由配置决定。
pub struct SecureChannel<T: Transport = TcpStream> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Transport> {
    id: u64,
    mode: ChannelMode,
    closed: AtomicBool,
    dispatcher: TaskDispatcher,
    core: Mutex<Core<T>>,
}

enum Lifecycle {
    Open,
    Closed,
    Broken(SecureChannelError),
}

struct Core<T: Transport> {
    id: u64,
    mode: ChannelMode,
    transport: Option<T>,
    connecting: bool,
    context: Arc<dyn SecurityContext>,
    config: SecureChannelConfig,
    session: Option<HandshakeEngine>,
    lifecycle: Lifecycle,
    readiness: ReadinessAdapter<T>,
    task_epoch: u64,
    /// 最近一次提交的委派任务。
    task: Option<TaskHandle>,
}

/// 锁内操作的结果：完成、暂时无法推进，或需要在锁外提交委派任务。
enum Outcome<R> {
    Done(R),
    WouldBlock,
    Task(DelegatedTask),
}

impl<T: Transport> SecureChannel<T> {
    pub(crate) fn assemble(
        transport: Option<T>,
        connecting: bool,
        context: Arc<dyn SecurityContext>,
        mode: ChannelMode,
        dispatcher: TaskDispatcher,
        config: SecureChannelConfig,
    ) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            channel = id,
            %mode,
            bound = transport.is_some(),
            connecting,
            "secure channel opened"
        );
        Self {
            shared: Arc::new(Shared {
                id,
                mode,
                closed: AtomicBool::new(false),
                dispatcher,
                core: Mutex::new(Core {
                    id,
                    mode,
                    transport,
                    connecting,
                    context,
                    config,
                    session: None,
                    lifecycle: Lifecycle::Open,
                    readiness: ReadinessAdapter::new(),
                    task_epoch: 0,
                    task: None,
                }),
            }),
        }
    }

    /// 进程内唯一的通道编号，与日志中的 `channel` 字段一致。
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn mode(&self) -> ChannelMode {
        self.shared.mode
    }

    pub fn is_open(&self) -> bool {
        matches!(self.shared.core.lock().lifecycle, Lifecycle::Open)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.shared
            .core
            .lock()
            .session
            .as_ref()
            .is_some_and(HandshakeEngine::is_established)
    }

    /// 握手当前所处的状态；尚未开始握手时为 `NotHandshaking`。
    pub fn handshake_status(&self) -> HandshakeStatus {
        self.shared
            .core
            .lock()
            .session
            .as_ref()
            .map_or(HandshakeStatus::NotHandshaking, HandshakeEngine::status)
    }

    pub fn has_pending_task(&self) -> bool {
        self.shared
            .core
            .lock()
            .session
            .as_ref()
            .is_some_and(HandshakeEngine::is_task_pending)
    }

    /// 最近一次提交的委派任务的观察句柄；关闭后不再保留。
    pub fn task_handle(&self) -> Option<TaskHandle> {
        self.shared.core.lock().task.clone()
    }

    /// 按当前状态推导出的 selector 兴趣集合；`None` 表示不应被任何事件唤醒。
    pub fn interest(&self) -> Option<Interest> {
        required_interest(&self.shared.core.lock().readiness_inputs())
    }

    /// 底层传输已建立连接。
    pub fn is_connected(&self) -> bool {
        let core = self.shared.core.lock();
        core.transport.is_some() && !core.connecting
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let core = self.shared.core.lock();
        match core.transport.as_ref() {
            Some(transport) => transport.peer_addr(),
            None => Err(SecureChannelError::NotConnected {
                op: error::CONNECT,
            }
            .into()),
        }
    }

    pub fn config(&self) -> SecureChannelConfig {
        self.shared.core.lock().config
    }

    /// 读取已解密的明文。
    ///
    /// 握手未完成或暂无明文时返回 `WouldBlock`；`Ok(0)` 表示对端已结束会话。
    pub fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        self.run(|core| core.read_op(dst))
    }

    /// 提交明文，返回被接收的字节数。
    ///
    /// 握手未完成或出站缓冲已满时返回 `WouldBlock`。
    pub fn write(&self, src: &[u8]) -> io::Result<usize> {
        self.run(|core| core.write_op(src))
    }

    /// 把已接收的明文全部加密并写入传输；无法一次完成时返回 `WouldBlock`。
    pub fn flush(&self) -> io::Result<()> {
        self.run(Core::flush_op)
    }

    /// 推进一个尚在进行中的非阻塞连接，返回是否已经建立。
    pub fn finish_connect(&self) -> io::Result<bool> {
        self.run(Core::finish_connect_op)
    }

    /// 发起到 `addr` 的非阻塞连接，返回是否已经立即建立。
    pub fn connect(&self, addr: SocketAddr) -> io::Result<bool> {
        self.run(|core| core.connect_op(addr))
    }

    /// 执行关闭流程并关闭底层传输；重复调用是空操作。
    pub fn close(&self) -> io::Result<()> {
        if let Some(transport) = self.shutdown(error::CLOSE)? {
            if let Err(err) = transport.shutdown(Shutdown::Both) {
                debug!(channel = self.shared.id, error = %err, "transport shutdown failed");
            }
        }
        Ok(())
    }

    /// 执行关闭流程，但把底层传输交还调用方而不关闭它。
    pub fn close_and_take_transport(&self) -> io::Result<Option<T>> {
        Ok(self.shutdown(error::CLOSE)?)
    }

    fn shutdown(&self, op: OperationKind) -> Result<Option<T>, SecureChannelError> {
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        if matches!(core.lifecycle, Lifecycle::Closed) {
            return Ok(None);
        }
        self.shared.closed.store(true, Ordering::Release);
        core.task_epoch = core.task_epoch.wrapping_add(1);
        if let Some(task) = core.task.take().filter(|task| !task.is_finished()) {
            debug!(
                channel = core.id,
                task = task.label(),
                "closing while handshake task is still running"
            );
        }
        if matches!(core.lifecycle, Lifecycle::Open) && !core.connecting {
            core.close_session();
        }

        let mut transport = core.transport.take();
        if let Err(err) = core.readiness.unbind(transport.as_mut()) {
            debug!(channel = core.id, error = %err, "selector deregistration failed");
        }
        core.session = None;
        core.lifecycle = Lifecycle::Closed;
        debug!(channel = core.id, code = op.code, "secure channel closed");
        Ok(transport)
    }

    fn run<R>(
        &self,
        op: impl FnOnce(&mut Core<T>) -> Result<Outcome<R>, SecureChannelError>,
    ) -> io::Result<R> {
        let mut core = self.shared.core.lock();
        let outcome = match op(&mut *core) {
            Ok(outcome) => outcome,
            Err(err) => {
                let err = core.fail(err);
                core.refresh_interest();
                return Err(err.into());
            }
        };
        match outcome {
            Outcome::Done(value) => {
                core.refresh_interest();
                Ok(value)
            }
            Outcome::WouldBlock => {
                core.refresh_interest();
                Err(error::would_block())
            }
            Outcome::Task(task) => {
                let epoch = core.arm_task();
                core.refresh_interest();
                drop(core);
                self.shared.submit_task(epoch, task);
                Err(error::would_block())
            }
        }
    }
}

impl<T: Transport> Shared<T> {
    fn submit_task(self: &Arc<Self>, epoch: u64, task: DelegatedTask) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.id;
        trace!(channel = id, task = task.label(), epoch, "submitting handshake task");
        let handle = self.dispatcher.submit(task, move |outcome| match weak.upgrade() {
            Some(shared) => shared.resume(epoch, outcome),
            None => debug!(channel = id, "channel dropped before handshake task completed"),
        });
        // 内联执行器可能已在 submit 内恢复并提交了下一代任务。
        let mut core = self.core.lock();
        if core.task_epoch == epoch && !self.closed.load(Ordering::Acquire) {
            core.task = Some(handle);
        }
    }

    /// 委派任务完成后的恢复入口，运行在执行器线程上。
    fn resume(self: &Arc<Self>, epoch: u64, outcome: Result<(), EngineError>) {
        let mut core = self.core.lock();
        if self.closed.load(Ordering::Acquire)
            || core.task_epoch != epoch
            || !matches!(core.lifecycle, Lifecycle::Open)
        {
            warn!(
                channel = self.id,
                epoch,
                succeeded = outcome.is_ok(),
                "discarding handshake task result for closed channel"
            );
            return;
        }
        let next = core.resume_op(outcome);
        match next {
            Ok(Some(task)) => {
                let epoch = core.arm_task();
                core.refresh_interest();
                drop(core);
                self.submit_task(epoch, task);
            }
            Ok(None) => core.refresh_interest(),
            Err(err) => {
                core.fail(err);
                core.refresh_interest();
            }
        }
    }
}

impl<T: Transport> Core<T> {
    fn check_open(&self, op: OperationKind) -> Result<(), SecureChannelError> {
        match &self.lifecycle {
            Lifecycle::Open => Ok(()),
            Lifecycle::Closed => Err(SecureChannelError::Closed { op }),
            Lifecycle::Broken(err) => Err(err.clone()),
        }
    }

    /// 推进非阻塞连接；传输缺失时报告未连接。
    fn ensure_connected(&mut self, op: OperationKind) -> Result<bool, SecureChannelError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(SecureChannelError::NotConnected { op });
        };
        if !self.connecting {
            return Ok(true);
        }
        match transport.poll_connect() {
            Ok(true) => {
                self.connecting = false;
                debug!(channel = self.id, "transport connected");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(err) => Err(SecureChannelError::transport(error::CONNECT, err)),
        }
    }

    /// 首次 I/O 时创建引擎并开始握手。
    fn ensure_session(&mut self) -> Result<(), SecureChannelError> {
        if self.session.is_some() {
            return Ok(());
        }
        let peer = self
            .transport
            .as_ref()
            .and_then(|transport| transport.peer_addr().ok());
        let engine = self
            .context
            .create_engine(self.mode, peer)
            .map_err(|err| SecureChannelError::protocol(error::HANDSHAKE, err))?;
        let network = self
            .config
            .initial_network_buffer()
            .unwrap_or_else(|| engine.packet_buffer_size());
        let application = self
            .config
            .initial_application_buffer()
            .unwrap_or_else(|| engine.application_buffer_size());
        let buffers = BufferSet::new(network, application, self.config.max_buffer_size());
        self.session = Some(HandshakeEngine::start(
            engine,
            buffers,
            self.config.max_idle_steps(),
            self.id,
        )?);
        Ok(())
    }

    fn parts(
        &mut self,
        op: OperationKind,
    ) -> Result<(&mut HandshakeEngine, &mut T), SecureChannelError> {
        match (self.session.as_mut(), self.transport.as_mut()) {
            (Some(session), Some(transport)) => Ok((session, transport)),
            _ => Err(SecureChannelError::NotConnected { op }),
        }
    }

    fn arm_task(&mut self) -> u64 {
        self.task_epoch = self.task_epoch.wrapping_add(1);
        self.task_epoch
    }

    /// 把终止性错误记录为 broken 状态；协议失败时先尽力刷出引擎排队的告警。
    fn fail(&mut self, err: SecureChannelError) -> SecureChannelError {
        if !err.is_terminal() || !matches!(self.lifecycle, Lifecycle::Open) {
            return err;
        }
        if err.is_protocol()
            && let (Some(session), Some(transport)) =
                (self.session.as_mut(), self.transport.as_mut())
        {
            session.flush_alert(transport);
        }
        warn!(
            channel = self.id,
            mode = %self.mode,
            code = err.code(),
            error = %err,
            "secure channel broken"
        );
        self.lifecycle = Lifecycle::Broken(err.clone());
        err
    }

    fn readiness_inputs(&self) -> ReadinessInputs {
        let session = self.session.as_ref();
        let pending = |kind: BufferKind| {
            session.is_some_and(|session| !session.buffers().get(kind).is_empty())
        };
        ReadinessInputs {
            status: session.map_or(HandshakeStatus::NotHandshaking, HandshakeEngine::status),
            started: session.is_some(),
            established: session.is_some_and(HandshakeEngine::is_established),
            connecting: self.connecting,
            task_pending: session.is_some_and(HandshakeEngine::is_task_pending),
            network_outbound_pending: pending(BufferKind::NetworkOutbound),
            application_outbound_pending: pending(BufferKind::ApplicationOutbound),
            inbound_plaintext_buffered: session
                .is_some_and(HandshakeEngine::has_buffered_plaintext),
            application_interest: self.readiness.application_interest(),
        }
    }

    fn desired_interest(&self) -> Option<Interest> {
        match self.lifecycle {
            Lifecycle::Open => required_interest(&self.readiness_inputs()),
            _ => self.readiness.application_interest(),
        }
    }

    fn sync_interest(&mut self) -> io::Result<()> {
        let desired = self.desired_interest();
        self.readiness.apply(self.transport.as_mut(), desired)
    }

    fn refresh_interest(&mut self) {
        if let Err(err) = self.sync_interest() {
            warn!(channel = self.id, error = %err, "failed to update selector registration");
        }
    }

    fn read_op(&mut self, dst: &mut [u8]) -> Result<Outcome<usize>, SecureChannelError> {
        self.check_open(error::READ)?;
        if !self.ensure_connected(error::READ)? {
            return Ok(Outcome::WouldBlock);
        }
        if dst.is_empty() {
            return Ok(Outcome::Done(0));
        }
        self.ensure_session()?;
        let id = self.id;
        let (session, io) = self.parts(error::READ)?;
        loop {
            let delivered = session.take_plaintext(dst);
            if delivered > 0 {
                return Ok(Outcome::Done(delivered));
            }
            let drive = session.drive(io)?;
            if let Some(outcome) = handshake_outcome(session, drive)? {
                return Ok(outcome);
            }
            match session.read_application(io)? {
                ReadProgress::Data | ReadProgress::Handshake => continue,
                ReadProgress::WouldBlock => return Ok(Outcome::WouldBlock),
                ReadProgress::Eof => {
                    if !session.is_inbound_done() {
                        debug!(channel = id, "transport ended without close alert");
                    }
                    return Ok(Outcome::Done(session.take_plaintext(dst)));
                }
                ReadProgress::Closed => return Ok(Outcome::Done(session.take_plaintext(dst))),
            }
        }
    }

    fn write_op(&mut self, src: &[u8]) -> Result<Outcome<usize>, SecureChannelError> {
        self.check_open(error::WRITE)?;
        if !self.ensure_connected(error::WRITE)? {
            return Ok(Outcome::WouldBlock);
        }
        if src.is_empty() {
            return Ok(Outcome::Done(0));
        }
        self.ensure_session()?;
        let (session, io) = self.parts(error::WRITE)?;
        let drive = session.drive(io)?;
        if let Some(outcome) = handshake_outcome(session, drive)? {
            return Ok(outcome);
        }
        if session.is_outbound_done() {
            return Err(SecureChannelError::Closed { op: error::WRITE });
        }
        match session.write_application(src, io)? {
            0 => Ok(Outcome::WouldBlock),
            accepted => Ok(Outcome::Done(accepted)),
        }
    }

    fn flush_op(&mut self) -> Result<Outcome<()>, SecureChannelError> {
        self.check_open(error::FLUSH)?;
        if !self.ensure_connected(error::FLUSH)? {
            return Ok(Outcome::WouldBlock);
        }
        if self.session.is_none() {
            return Ok(Outcome::Done(()));
        }
        let (session, io) = self.parts(error::FLUSH)?;
        let drive = session.drive(io)?;
        if let Some(outcome) = handshake_outcome::<()>(session, drive)? {
            return Ok(match outcome {
                Outcome::WouldBlock if session.is_output_drained() => Outcome::Done(()),
                Outcome::Task(task) => Outcome::Task(task),
                _ => Outcome::WouldBlock,
            });
        }
        session.write_application(&[], io)?;
        if session.is_output_drained() {
            Ok(Outcome::Done(()))
        } else {
            Ok(Outcome::WouldBlock)
        }
    }

    fn connect_op(&mut self, addr: SocketAddr) -> Result<Outcome<bool>, SecureChannelError> {
        self.check_open(error::CONNECT)?;
        if self.transport.is_some() {
            return Err(SecureChannelError::AlreadyConnected { op: error::CONNECT });
        }
        let transport =
            T::connect(addr).map_err(|err| SecureChannelError::transport(error::CONNECT, err))?;
        debug!(channel = self.id, %addr, "connecting transport");
        self.transport = Some(transport);
        self.connecting = true;
        Ok(Outcome::Done(self.ensure_connected(error::CONNECT)?))
    }

    fn finish_connect_op(&mut self) -> Result<Outcome<bool>, SecureChannelError> {
        self.check_open(error::CONNECT)?;
        Ok(Outcome::Done(self.ensure_connected(error::CONNECT)?))
    }

    /// 委派任务完成后恢复握手，必要时返回下一个待提交的任务。
    fn resume_op(
        &mut self,
        outcome: Result<(), EngineError>,
    ) -> Result<Option<DelegatedTask>, SecureChannelError> {
        let id = self.id;
        let (session, io) = self.parts(error::TASK)?;
        session.complete_task(outcome)?;
        match session.drive(io)? {
            Drive::Task(task) => Ok(Some(task)),
            other => {
                trace!(channel = id, drive = ?other, "handshake resumed after task");
                Ok(None)
            }
        }
    }

    /// 发送关闭告警并在限定时间内等待对端告警；失败只记录日志。
    fn close_session(&mut self) {
        let id = self.id;
        let timeout = self.config.close_timeout();
        let interval = self.config.close_poll_interval();
        let (Some(session), Some(io)) = (self.session.as_mut(), self.transport.as_mut()) else {
            return;
        };
        let deadline = Instant::now() + timeout;
        let mut flushed = match session.close_outbound(io) {
            Ok(flush) => flush == Flush::Done,
            Err(err) => {
                debug!(channel = id, error = %err, "failed to send close alert");
                return;
            }
        };
        if timeout.is_zero() {
            return;
        }
        loop {
            if !flushed {
                match session.flush(io) {
                    Ok(Flush::Done) => flushed = true,
                    Ok(Flush::Partial) => {}
                    Err(err) => {
                        debug!(channel = id, error = %err, "failed to flush close alert");
                        return;
                    }
                }
            }
            if flushed {
                match session.drain_inbound(io) {
                    Ok(DrainProgress::PeerClosed) => {
                        debug!(channel = id, "peer acknowledged close");
                        return;
                    }
                    Ok(DrainProgress::Eof) => {
                        debug!(channel = id, "transport ended before peer close alert");
                        return;
                    }
                    Ok(DrainProgress::WouldBlock) => {}
                    Err(err) => {
                        debug!(channel = id, error = %err, "failed to drain inbound data on close");
                        return;
                    }
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    channel = id,
                    ?timeout,
                    "peer close alert not received before timeout, closing transport"
                );
                return;
            }
            thread::sleep(interval);
        }
    }
}

/// 把驱动结果翻译为读写路径的提前返回；握手已完成且可以继续搬运数据时返回 `None`。
fn handshake_outcome<R>(
    session: &HandshakeEngine,
    drive: Drive,
) -> Result<Option<Outcome<R>>, SecureChannelError> {
    let established = session.is_established();
    match drive {
        Drive::Task(task) => Ok(Some(Outcome::Task(task))),
        Drive::TaskPending => Ok(Some(Outcome::WouldBlock)),
        Drive::Eof if !established => Err(SecureChannelError::transport(
            error::HANDSHAKE,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection during the handshake",
            ),
        )),
        Drive::Closed if !established => Err(SecureChannelError::protocol(
            error::HANDSHAKE,
            EngineError::Protocol("session closed during the handshake".into()),
        )),
        _ if !established => Ok(Some(Outcome::WouldBlock)),
        _ => Ok(None),
    }
}

impl<T: Transport> Clone for SecureChannel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> fmt::Debug for SecureChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SecureChannel");
        debug
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed));
        if let Some(core) = self.shared.core.try_lock() {
            debug
                .field("registered", &core.readiness.is_registered())
                .field("interest", &core.readiness.desired())
                .field("task", &core.task.as_ref().map(TaskHandle::label));
        }
        debug.finish_non_exhaustive()
    }
}

impl<T: Transport> Read for SecureChannel<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SecureChannel::read(self, buf)
    }
}

impl<T: Transport> Read for &SecureChannel<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SecureChannel::read(self, buf)
    }
}

impl<T: Transport> Write for SecureChannel<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SecureChannel::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        SecureChannel::flush(self)
    }
}

impl<T: Transport> Write for &SecureChannel<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SecureChannel::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        SecureChannel::flush(self)
    }
}

/// 注册时记录应用兴趣与 registry，实际注册的兴趣由握手状态推导。
impl<T: Transport + Source> Source for SecureChannel<T> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        let registry = registry.try_clone()?;
        let mut core = self.shared.core.lock();
        core.readiness
            .bind(registry, token, interests, sync_source::<T>);
        core.sync_interest()
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.register(registry, token, interests)
    }

    fn deregister(&mut self, _registry: &Registry) -> io::Result<()> {
        let mut guard = self.shared.core.lock();
        let core = &mut *guard;
        core.readiness.unbind(core.transport.as_mut())
    }
}
