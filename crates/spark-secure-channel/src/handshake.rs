//! 握手状态机与非阻塞驱动循环。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 安全引擎只会告诉我们“下一步需要什么”，而非阻塞传输随时可能只读到半条记录、只写出半段密文；
//!   状态机负责把两者拼接起来，在不阻塞的前提下把握手推进到尽可能远的位置；
//! - 每个 [`HandshakeStatus`] 对应一个独立的转移函数，便于用脚本化的假引擎逐一验证。
//!
//! ## 逻辑（How）
//! - [`HandshakeEngine`] 独占引擎与四个缓冲，`step` 按当前状态分派到 `on_need_wrap` /
//!   `on_need_unwrap` / `on_need_task` / `on_finished`，返回一个 [`Step`] 描述“还需要外界提供什么”；
//! - `drive` 是外层循环：先刷出积压密文，再执行一步，缺数据就从传输读，直到被 would-block、
//!   委派任务或连接结束打断，返回 [`Drive`]；
//! - 握手完成后，读写路径分别经 `read_application` / `write_application` 搬运应用数据，
//!   每次仍然只调用一次 `wrap`/`unwrap`；引擎内部仍有明文时先以空源 `unwrap` 取出，再读传输；
//! - 关闭路径：`close_outbound` 产出并刷出关闭告警，`drain_inbound` 丢弃剩余入站数据直至对端告警。
//!
//! ## 契约（What）
//! - 网络出站缓冲非空时，任何新的 `wrap` 之前都会先尝试刷出；
//! - `Finished` 只处理一次：标记已建立，并把状态替换为引擎当前报告的状态；
//! - 委派任务挂起期间 `step` 只返回 [`Step::TaskPending`]，直到 `complete_task` 被调用；
//! - 连续 `max_idle_steps` 次无进展的步骤视为引擎故障，返回协议错误。
//!
//! ## 风险与权衡（Trade-offs）
//! - 驱动循环在调用线程上同步执行，单次调用的耗时与积压数据量成正比；通道通过“读到 would-block 即返回”
//!   控制单次调用的上限。

use std::io;

use tracing::{debug, trace};

use crate::{
    buffer::{BufferKind, BufferSet},
    engine::{
        DelegatedTask, EngineError, EngineResult, EngineStatus, HandshakeStatus, SecurityEngine,
    },
    error::{self, OperationKind, SecureChannelError},
    transport::{Transport, retry_interrupted},
};

/// 单步转移的结果。
#[derive(Debug)]
pub(crate) enum Step {
    /// 取得进展，可以继续下一步。
    Continue,
    /// 引擎既未产出也未消费，状态也未改变。
    Stalled,
    /// 握手刚刚完成。
    Finished,
    /// 当前没有握手工作。
    Idle,
    /// 必须先刷出网络出站缓冲。
    NeedsFlush,
    /// 必须从传输读取更多密文。
    NeedsNetworkData,
    /// 应用入站缓冲需要先交付给应用。
    InboundFull,
    /// 引擎交出了一个委派任务。
    Task(DelegatedTask),
    /// 委派任务尚未完成。
    TaskPending,
    /// 引擎报告连接已关闭。
    Closed,
}

/// 驱动循环停下来的原因。
#[derive(Debug)]
pub(crate) enum Drive {
    Ready,
    WantRead,
    WantWrite,
    Task(DelegatedTask),
    TaskPending,
    Eof,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Fill {
    Read(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flush {
    Done,
    Partial,
}

/// 握手完成后一次读路径推进的结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadProgress {
    /// 应用入站缓冲中已有明文。
    Data,
    /// 收到握手后消息，需要重新驱动状态机。
    Handshake,
    WouldBlock,
    /// 传输在没有关闭告警的情况下结束。
    Eof,
    /// 已收到对端关闭告警。
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DrainProgress {
    PeerClosed,
    WouldBlock,
    Eof,
}

/// 单个会话的握手状态机，独占安全引擎与缓冲。
pub(crate) struct HandshakeEngine {
    engine: Box<dyn SecurityEngine>,
    buffers: BufferSet,
    status: HandshakeStatus,
    established: bool,
    task_pending: bool,
    max_idle_steps: usize,
    channel: u64,
}

impl HandshakeEngine {
    /// 开始握手并读取引擎的初始状态。
    pub(crate) fn start(
        mut engine: Box<dyn SecurityEngine>,
        buffers: BufferSet,
        max_idle_steps: usize,
        channel: u64,
    ) -> Result<Self, SecureChannelError> {
        engine
            .begin_handshake()
            .map_err(|err| SecureChannelError::protocol(error::HANDSHAKE, err))?;
        let status = engine.handshake_status();
        debug!(channel, ?status, "secure channel handshake started");
        let mut session = Self {
            engine,
            buffers,
            status,
            established: false,
            task_pending: false,
            max_idle_steps: max_idle_steps.max(1),
            channel,
        };
        if status == HandshakeStatus::NotHandshaking {
            session.on_finished();
        }
        Ok(session)
    }

    pub(crate) fn status(&self) -> HandshakeStatus {
        self.status
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established
    }

    pub(crate) fn is_task_pending(&self) -> bool {
        self.task_pending
    }

    pub(crate) fn buffers(&self) -> &BufferSet {
        &self.buffers
    }

    pub(crate) fn is_inbound_done(&self) -> bool {
        self.engine.is_inbound_done()
    }

    pub(crate) fn is_outbound_done(&self) -> bool {
        self.engine.is_outbound_done()
    }

    /// 已解密、尚未交付给应用的明文，无论位于应用入站缓冲还是引擎内部。
    pub(crate) fn has_buffered_plaintext(&self) -> bool {
        !self.buffers.application_inbound.is_empty() || self.engine.has_buffered_plaintext()
    }

    /// 不读传输也能让 `unwrap` 取得进展：有未处理的密文，或引擎内部仍有明文。
    fn has_unwrap_input(&self) -> bool {
        !self.buffers.network_inbound.is_empty() || self.engine.has_buffered_plaintext()
    }

    /// 按当前状态执行一次转移。
    pub(crate) fn step(&mut self) -> Result<Step, SecureChannelError> {
        if self.task_pending {
            return Ok(Step::TaskPending);
        }
        match self.status {
            HandshakeStatus::NotHandshaking => Ok(Step::Idle),
            HandshakeStatus::NeedWrap => self.on_need_wrap(),
            HandshakeStatus::NeedUnwrap => self.on_need_unwrap(),
            HandshakeStatus::NeedTask => self.on_need_task(),
            HandshakeStatus::Finished => Ok(self.on_finished()),
        }
    }

    fn on_need_wrap(&mut self) -> Result<Step, SecureChannelError> {
        let op = self.write_op();
        loop {
            let result = self.wrap_once(self.established, op)?;
            match result.status {
                EngineStatus::BufferOverflow => {
                    if !self.buffers.network_outbound.is_empty() {
                        return Ok(Step::NeedsFlush);
                    }
                    let hint = self.engine.packet_buffer_size();
                    self.buffers
                        .grow_for_overflow(BufferKind::NetworkOutbound, hint)?;
                }
                EngineStatus::Closed => {
                    self.advance(result.handshake_status);
                    return Ok(Step::Closed);
                }
                EngineStatus::Ok | EngineStatus::BufferUnderflow => {
                    let before = self.status;
                    let step = self.advance(result.handshake_status);
                    if matches!(step, Step::Continue)
                        && !result.made_progress()
                        && self.status == before
                    {
                        return Ok(Step::Stalled);
                    }
                    return Ok(step);
                }
            }
        }
    }

    fn on_need_unwrap(&mut self) -> Result<Step, SecureChannelError> {
        let op = self.read_op();
        loop {
            if !self.has_unwrap_input() {
                return Ok(Step::NeedsNetworkData);
            }
            let result = self.unwrap_once(op)?;
            match result.status {
                EngineStatus::BufferOverflow => {
                    if self.established && !self.buffers.application_inbound.is_empty() {
                        return Ok(Step::InboundFull);
                    }
                    let hint = self.engine.application_buffer_size();
                    self.buffers
                        .grow_for_overflow(BufferKind::ApplicationInbound, hint)?;
                }
                EngineStatus::Closed => {
                    self.advance(result.handshake_status);
                    return Ok(Step::Closed);
                }
                EngineStatus::Ok if result.made_progress() => {
                    return Ok(self.advance(result.handshake_status));
                }
                EngineStatus::Ok | EngineStatus::BufferUnderflow => {
                    self.advance(result.handshake_status);
                    self.make_room_for_network_data()?;
                    return Ok(Step::NeedsNetworkData);
                }
            }
        }
    }

    fn on_need_task(&mut self) -> Result<Step, SecureChannelError> {
        match self.engine.delegated_task() {
            Some(task) => {
                self.task_pending = true;
                debug!(
                    channel = self.channel,
                    task = task.label(),
                    "security engine delegated a handshake task"
                );
                Ok(Step::Task(task))
            }
            None => {
                let next = self.engine.handshake_status();
                if next == HandshakeStatus::NeedTask {
                    return Err(SecureChannelError::protocol(
                        error::HANDSHAKE,
                        EngineError::Protocol(
                            "engine requested a task but did not supply one".into(),
                        ),
                    ));
                }
                Ok(self.advance(next))
            }
        }
    }

    fn on_finished(&mut self) -> Step {
        let next = match self.engine.handshake_status() {
            HandshakeStatus::Finished => HandshakeStatus::NotHandshaking,
            other => other,
        };
        if !self.established {
            debug!(channel = self.channel, ?next, "secure channel handshake finished");
        }
        self.established = true;
        self.status = next;
        Step::Finished
    }

    /// 接收委派任务的结果并重新读取引擎状态。
    pub(crate) fn complete_task(
        &mut self,
        outcome: Result<(), EngineError>,
    ) -> Result<(), SecureChannelError> {
        self.task_pending = false;
        outcome.map_err(|err| SecureChannelError::protocol(error::TASK, err))?;
        let next = self.engine.handshake_status();
        trace!(channel = self.channel, ?next, "handshake task completed");
        self.advance(next);
        Ok(())
    }

    fn advance(&mut self, reported: HandshakeStatus) -> Step {
        match reported {
            HandshakeStatus::Finished => self.on_finished(),
            HandshakeStatus::NotHandshaking if !self.established => self.on_finished(),
            other => {
                self.status = other;
                Step::Continue
            }
        }
    }

    fn read_op(&self) -> OperationKind {
        if self.established {
            error::READ
        } else {
            error::HANDSHAKE
        }
    }

    fn write_op(&self) -> OperationKind {
        if self.established {
            error::WRITE
        } else {
            error::HANDSHAKE
        }
    }

    fn wrap_once(
        &mut self,
        with_application: bool,
        op: OperationKind,
    ) -> Result<EngineResult, SecureChannelError> {
        let engine = &mut self.engine;
        let source: &[u8] = if with_application {
            self.buffers.application_outbound.unread()
        } else {
            &[]
        };
        let result = self
            .buffers
            .network_outbound
            .write_with(|dst| match engine.wrap(source, dst) {
                Ok(result) => (result.bytes_produced, Ok(result)),
                Err(err) => (0, Err(err)),
            })
            .map_err(|err| SecureChannelError::protocol(op, err))?;
        if with_application {
            self.buffers
                .application_outbound
                .consume(result.bytes_consumed);
        }
        trace!(
            channel = self.channel,
            status = ?result.status,
            handshake = ?result.handshake_status,
            consumed = result.bytes_consumed,
            produced = result.bytes_produced,
            "wrap"
        );
        Ok(result)
    }

    fn unwrap_once(&mut self, op: OperationKind) -> Result<EngineResult, SecureChannelError> {
        let engine = &mut self.engine;
        let source = self.buffers.network_inbound.unread();
        let result = self
            .buffers
            .application_inbound
            .write_with(|dst| match engine.unwrap(source, dst) {
                Ok(result) => (result.bytes_produced, Ok(result)),
                Err(err) => (0, Err(err)),
            })
            .map_err(|err| SecureChannelError::protocol(op, err))?;
        self.buffers.network_inbound.consume(result.bytes_consumed);
        trace!(
            channel = self.channel,
            status = ?result.status,
            handshake = ?result.handshake_status,
            consumed = result.bytes_consumed,
            produced = result.bytes_produced,
            "unwrap"
        );
        Ok(result)
    }

    /// 记录不完整时为后续密文腾出空间。
    fn make_room_for_network_data(&mut self) -> Result<(), SecureChannelError> {
        self.buffers.network_inbound.compact();
        if self.buffers.network_inbound.is_full() {
            let hint = self.engine.packet_buffer_size();
            self.buffers
                .grow_for_overflow(BufferKind::NetworkInbound, hint)?;
        }
        Ok(())
    }

    /// 尽可能把网络出站缓冲写入传输。
    pub(crate) fn flush<T: Transport>(&mut self, io: &mut T) -> Result<Flush, SecureChannelError> {
        let op = self.write_op();
        let outbound = &mut self.buffers.network_outbound;
        while !outbound.is_empty() {
            match retry_interrupted(|| io.write(outbound.unread())) {
                Ok(0) => {
                    return Err(SecureChannelError::transport(
                        op,
                        io::Error::from(io::ErrorKind::WriteZero),
                    ));
                }
                Ok(n) => {
                    outbound.consume(n);
                    trace!(channel = self.channel, bytes = n, "flushed ciphertext");
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Partial);
                }
                Err(err) => return Err(SecureChannelError::transport(op, err)),
            }
        }
        outbound.compact();
        Ok(Flush::Done)
    }

    /// 从传输读取一次密文到网络入站缓冲。
    pub(crate) fn fill<T: Transport>(&mut self, io: &mut T) -> Result<Fill, SecureChannelError> {
        if self.buffers.network_inbound.is_full() {
            self.make_room_for_network_data()?;
        }
        let op = self.read_op();
        let outcome = self.buffers.network_inbound.write_with(|dst| {
            match retry_interrupted(|| io.read(dst)) {
                Ok(n) => (n, Ok(n)),
                Err(err) => (0, Err(err)),
            }
        });
        match outcome {
            Ok(0) => {
                debug!(channel = self.channel, "transport reached end of stream");
                Ok(Fill::Eof)
            }
            Ok(n) => {
                trace!(channel = self.channel, bytes = n, "read ciphertext");
                Ok(Fill::Read(n))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(err) => Err(SecureChannelError::transport(op, err)),
        }
    }

    /// 把握手推进到被 I/O、任务或连接结束打断为止。
    pub(crate) fn drive<T: Transport>(&mut self, io: &mut T) -> Result<Drive, SecureChannelError> {
        let mut idle = 0;
        loop {
            if !self.buffers.network_outbound.is_empty() && self.flush(io)? == Flush::Partial {
                return Ok(Drive::WantWrite);
            }
            match self.step()? {
                Step::Continue | Step::Finished => idle = 0,
                Step::Stalled => {
                    idle += 1;
                    if idle >= self.max_idle_steps {
                        return Err(SecureChannelError::protocol(
                            error::HANDSHAKE,
                            EngineError::Protocol(
                                format!("security engine made no progress in {idle} steps")
                                    .into(),
                            ),
                        ));
                    }
                }
                Step::Idle | Step::InboundFull => return Ok(Drive::Ready),
                Step::NeedsFlush => {
                    if self.flush(io)? == Flush::Partial {
                        return Ok(Drive::WantWrite);
                    }
                    idle = 0;
                }
                Step::NeedsNetworkData => match self.fill(io)? {
                    Fill::Read(_) => idle = 0,
                    Fill::WouldBlock => return Ok(Drive::WantRead),
                    Fill::Eof => return Ok(Drive::Eof),
                },
                Step::Task(task) => return Ok(Drive::Task(task)),
                Step::TaskPending => return Ok(Drive::TaskPending),
                Step::Closed => {
                    if !self.buffers.network_outbound.is_empty() {
                        self.flush(io)?;
                    }
                    return Ok(Drive::Closed);
                }
            }
        }
    }

    /// 从应用入站缓冲复制明文；握手完成前永远返回 0。
    pub(crate) fn take_plaintext(&mut self, dst: &mut [u8]) -> usize {
        if !self.established {
            return 0;
        }
        self.buffers.application_inbound.take_into(dst)
    }

    /// 握手完成后推进读路径，直到得到明文或被打断。
    pub(crate) fn read_application<T: Transport>(
        &mut self,
        io: &mut T,
    ) -> Result<ReadProgress, SecureChannelError> {
        loop {
            if self.has_unwrap_input() {
                let result = self.unwrap_once(error::READ)?;
                match result.status {
                    EngineStatus::Ok if result.made_progress() => {
                        self.advance(result.handshake_status);
                        if result.bytes_produced > 0 {
                            return Ok(ReadProgress::Data);
                        }
                        if self.status != HandshakeStatus::NotHandshaking {
                            return Ok(ReadProgress::Handshake);
                        }
                        continue;
                    }
                    EngineStatus::BufferOverflow => {
                        self.advance(result.handshake_status);
                        if !self.buffers.application_inbound.is_empty() {
                            return Ok(ReadProgress::Data);
                        }
                        let hint = self.engine.application_buffer_size();
                        self.buffers
                            .grow_for_overflow(BufferKind::ApplicationInbound, hint)?;
                        continue;
                    }
                    EngineStatus::Closed => {
                        self.advance(result.handshake_status);
                        debug!(channel = self.channel, "peer sent close alert");
                        return Ok(if self.buffers.application_inbound.is_empty() {
                            ReadProgress::Closed
                        } else {
                            ReadProgress::Data
                        });
                    }
                    EngineStatus::Ok | EngineStatus::BufferUnderflow => {
                        self.advance(result.handshake_status);
                        self.make_room_for_network_data()?;
                    }
                }
            }
            if self.engine.is_inbound_done() {
                return Ok(ReadProgress::Closed);
            }
            match self.fill(io)? {
                Fill::Read(_) => continue,
                Fill::WouldBlock => return Ok(ReadProgress::WouldBlock),
                Fill::Eof => return Ok(ReadProgress::Eof),
            }
        }
    }

    /// 握手完成后接收应用明文并尽可能加密、刷出；返回接收的字节数。
    ///
    /// 网络出站缓冲无法刷空时不接收新数据。
    pub(crate) fn write_application<T: Transport>(
        &mut self,
        src: &[u8],
        io: &mut T,
    ) -> Result<usize, SecureChannelError> {
        if self.flush(io)? == Flush::Partial {
            return Ok(0);
        }
        let accepted = self.buffers.application_outbound.extend_from(src);
        self.wrap_pending(io)?;
        Ok(accepted)
    }

    /// 加密应用出站缓冲中的明文（以及引擎积压的握手后消息）并刷出。
    pub(crate) fn wrap_pending<T: Transport>(&mut self, io: &mut T) -> Result<(), SecureChannelError> {
        loop {
            let wants_wrap = self.status == HandshakeStatus::NeedWrap
                || (self.status == HandshakeStatus::NotHandshaking
                    && !self.buffers.application_outbound.is_empty());
            if !wants_wrap || self.task_pending {
                return Ok(());
            }
            let result = self.wrap_once(true, error::WRITE)?;
            match result.status {
                EngineStatus::Ok => {
                    self.advance(result.handshake_status);
                    if !result.made_progress() {
                        return Ok(());
                    }
                }
                EngineStatus::BufferOverflow => {
                    if self.buffers.network_outbound.is_empty() {
                        let hint = self.engine.packet_buffer_size();
                        self.buffers
                            .grow_for_overflow(BufferKind::NetworkOutbound, hint)?;
                        continue;
                    }
                }
                EngineStatus::Closed => {
                    self.advance(result.handshake_status);
                    return Err(SecureChannelError::Closed { op: error::WRITE });
                }
                EngineStatus::BufferUnderflow => return Ok(()),
            }
            if self.flush(io)? == Flush::Partial {
                return Ok(());
            }
        }
    }

    /// 网络出站与应用出站缓冲都已清空。
    pub(crate) fn is_output_drained(&self) -> bool {
        self.buffers.network_outbound.is_empty() && self.buffers.application_outbound.is_empty()
    }

    /// 请求引擎发送关闭告警，并尽可能刷出。
    pub(crate) fn close_outbound<T: Transport>(
        &mut self,
        io: &mut T,
    ) -> Result<Flush, SecureChannelError> {
        if self.established && !self.task_pending {
            self.wrap_pending(io)?;
        }
        self.engine.close_outbound();
        debug!(channel = self.channel, "close alert requested");
        let mut attempts = 0;
        while !self.engine.is_outbound_done() && attempts < self.max_idle_steps {
            attempts += 1;
            let result = self.wrap_once(false, error::CLOSE)?;
            match result.status {
                EngineStatus::BufferOverflow => {
                    if self.buffers.network_outbound.is_empty() {
                        let hint = self.engine.packet_buffer_size();
                        self.buffers
                            .grow_for_overflow(BufferKind::NetworkOutbound, hint)?;
                    } else if self.flush(io)? == Flush::Partial {
                        return Ok(Flush::Partial);
                    }
                }
                _ if !result.made_progress() => break,
                _ => {}
            }
        }
        self.flush(io)
    }

    /// 丢弃剩余入站数据，直到收到对端关闭告警或被打断。
    pub(crate) fn drain_inbound<T: Transport>(
        &mut self,
        io: &mut T,
    ) -> Result<DrainProgress, SecureChannelError> {
        loop {
            if self.engine.is_inbound_done() {
                return Ok(DrainProgress::PeerClosed);
            }
            if self.has_unwrap_input() {
                let result = self.unwrap_once(error::CLOSE)?;
                let discarded = self.buffers.application_inbound.len();
                match result.status {
                    EngineStatus::Closed => return Ok(DrainProgress::PeerClosed),
                    EngineStatus::BufferOverflow if discarded == 0 => {
                        let hint = self.engine.application_buffer_size();
                        self.buffers
                            .grow_for_overflow(BufferKind::ApplicationInbound, hint)?;
                        continue;
                    }
                    EngineStatus::Ok if result.made_progress() => {}
                    EngineStatus::BufferOverflow => {}
                    EngineStatus::Ok | EngineStatus::BufferUnderflow => {
                        self.make_room_for_network_data()?;
                    }
                }
                self.buffers.application_inbound.consume(discarded);
                if result.made_progress() || discarded > 0 {
                    continue;
                }
            }
            match self.fill(io)? {
                Fill::Read(_) => continue,
                Fill::WouldBlock => return Ok(DrainProgress::WouldBlock),
                Fill::Eof => return Ok(DrainProgress::Eof),
            }
        }
    }

    /// 协议失败后尽力刷出引擎排队的告警；失败只记录日志。
    pub(crate) fn flush_alert<T: Transport>(&mut self, io: &mut T) {
        for _ in 0..2 {
            match self.wrap_once(false, error::CLOSE) {
                Ok(result) if result.bytes_produced > 0 => {}
                _ => break,
            }
        }
        if let Err(err) = self.flush(io) {
            debug!(channel = self.channel, error = %err, "failed to flush alert");
        }
    }
}
