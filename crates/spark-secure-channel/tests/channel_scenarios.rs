//! 安全通道端到端场景：玩具引擎 + 内存传输。
//!
//! # 教案级注释
//!
//! - **目标 (Why)**：在不依赖真实 TLS 与 socket 的前提下，覆盖门面层的关键契约：
//!   握手惰性启动、握手前不交付明文、委派任务恢复、失败后的 broken 状态、关闭后丢弃任务结果；
//! - **手法 (How)**：`support` 提供确定性的引擎、传输与执行器，测试按固定顺序交替推进两端；
//! - **边界 (What)**：兴趣集合通过 [`SecureChannel::interest`] 观察，真实 selector 注册由
//!   `rustls_loopback` 覆盖。

mod support;

use std::{io, sync::Arc};

use mio::Interest;
use spark_secure_channel::{
    ChannelMode, EngineError, HandshakeStatus, InlineExecutor, SecureChannelError, TaskExecutor,
};
use support::{
    CLOSE, DATA, MASK, MemoryTransport, QueueExecutor, ToyContext, complete_handshake,
    inline_pair, open_toy, poke, small_buffers, transfer,
};
use tracing_test::traced_test;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn handshake_then_echo_round_trip() {
    let context = ToyContext::default();
    let (client, server) = inline_pair(&context, 7, 5);

    assert!(complete_handshake(&client, &server, 64), "握手应在有限轮次内完成");
    assert_eq!(context.tasks_run(), 1, "只有客户端执行一次校验任务");
    assert!(!client.has_pending_task());
    assert_eq!(client.handshake_status(), HandshakeStatus::NotHandshaking);

    let request = payload(2_000);
    let received = transfer(&client, &server, &request, 10_000);
    assert_eq!(received, request, "服务端应收到完整请求");

    let reply = transfer(&server, &client, &received, 10_000);
    assert_eq!(reply, request, "客户端应收到完整回显");
}

#[test]
fn ciphertext_never_carries_plaintext() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let tap = a.wire_tap();
    let executor: Arc<dyn TaskExecutor> = Arc::new(InlineExecutor);
    let client = open_toy(
        a,
        ChannelMode::Client,
        &context,
        Arc::clone(&executor),
        small_buffers(),
    );
    let server = open_toy(b, ChannelMode::Server, &context, executor, small_buffers());
    assert!(complete_handshake(&client, &server, 64));

    let secret = b"attack at dawn, attack at dawn";
    assert_eq!(transfer(&client, &server, secret, 1_000), secret);

    let wire = tap.written();
    assert!(
        !wire.windows(secret.len()).any(|window| window == secret),
        "线上不应出现明文"
    );
    // 应用出站缓冲初始为 8 字节，第一条 DATA 记录恰好承载前 8 个字节。
    let mut record = vec![DATA, 0, 8];
    record.extend(secret[..8].iter().map(|byte| byte ^ MASK));
    assert!(
        wire.windows(record.len()).any(|window| window == record.as_slice()),
        "线上应出现加密后的 DATA 记录"
    );
}

#[test]
fn server_waits_for_client_hello() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let tap = b.wire_tap();
    let _client_end = a;
    let server = open_toy(
        b,
        ChannelMode::Server,
        &context,
        Arc::new(InlineExecutor),
        small_buffers(),
    );

    for _ in 0..3 {
        poke(&server).expect("等待期间不应失败");
    }
    assert!(!server.is_handshake_complete());
    assert_eq!(server.handshake_status(), HandshakeStatus::NeedUnwrap);
    assert_eq!(server.interest(), Some(Interest::READABLE));
    assert!(tap.written().is_empty(), "服务端不应先发送任何握手字节");
}

#[test]
fn would_block_read_requests_read_interest() {
    let context = ToyContext::default();
    let (client, server) = inline_pair(&context, usize::MAX, usize::MAX);

    assert_eq!(client.interest(), None, "未注册且未开始握手时没有兴趣");
    let mut buf = [0_u8; 16];
    let err = client.read(&mut buf).expect_err("对端未回应时必须 would-block");
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    assert_eq!(client.handshake_status(), HandshakeStatus::NeedUnwrap);
    assert_eq!(client.interest(), Some(Interest::READABLE));

    let early = client.write(b"too early").expect_err("握手前不接收明文");
    assert_eq!(early.kind(), io::ErrorKind::WouldBlock);

    assert!(complete_handshake(&client, &server, 64));
    let err = server.read(&mut buf).expect_err("无数据时必须 would-block");
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
}

#[test]
fn certificate_failure_breaks_channel() {
    let context = ToyContext::rejecting();
    let (client, server) = inline_pair(&context, usize::MAX, usize::MAX);

    poke(&client).expect("发送 HELLO");
    poke(&server).expect("回应 WELCOME");
    poke(&client).expect("校验任务在内联执行器上完成，本次调用只会 would-block");
    assert_eq!(context.tasks_run(), 1);
    let task = client.task_handle().expect("校验任务已提交");
    assert_eq!(task.label(), "toy-verify");
    assert!(task.is_failed(), "被拒绝的证书使任务以失败结束");

    let mut buf = [0_u8; 8];
    let first = client.read(&mut buf).expect_err("校验失败后读取必须报错");
    assert_eq!(first.kind(), io::ErrorKind::InvalidData);
    let typed = SecureChannelError::from_io(&first).expect("结构化错误").clone();
    assert_eq!(typed.code(), "spark.secure_channel.protocol_violation");
    match &typed {
        SecureChannelError::Protocol { source, .. } => {
            assert!(matches!(source, EngineError::Certificate(_)), "{source:?}");
        }
        other => panic!("意外的错误: {other:?}"),
    }

    for _ in 0..2 {
        let again = client.write(b"data").expect_err("broken 通道必须重复报告");
        let repeated = SecureChannelError::from_io(&again).expect("结构化错误");
        assert_eq!(repeated.code(), typed.code());
        assert_eq!(repeated.to_string(), typed.to_string());
    }
    assert!(!client.is_open());
    assert!(!client.is_handshake_complete());
}

#[test]
fn eof_during_handshake_is_an_error() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let server = open_toy(
        b,
        ChannelMode::Server,
        &context,
        Arc::new(InlineExecutor),
        small_buffers(),
    );
    drop(a);

    let mut buf = [0_u8; 8];
    let err = server.read(&mut buf).expect_err("握手期间的 EOF 必须报错");
    assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    assert!(!server.is_open());
}

#[test]
fn peer_close_alert_reads_as_end_of_stream() {
    let context = ToyContext::default();
    let (client, server) = inline_pair(&context, usize::MAX, usize::MAX);
    assert!(complete_handshake(&client, &server, 64));

    assert_eq!(transfer(&client, &server, b"bye", 100), b"bye");
    client.close().expect("关闭客户端");
    client.close().expect("重复关闭是空操作");

    let mut buf = [0_u8; 8];
    assert_eq!(server.read(&mut buf).expect("关闭告警读作结束"), 0);

    let err = client.read(&mut buf).expect_err("关闭后读取必须失败");
    assert_eq!(
        SecureChannelError::from_io(&err).map(SecureChannelError::code),
        Some("spark.secure_channel.closed")
    );
}

#[test]
fn close_and_take_transport_returns_the_transport() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let tap = a.wire_tap();
    let client = open_toy(
        a,
        ChannelMode::Client,
        &context,
        Arc::new(InlineExecutor),
        small_buffers(),
    );
    let _server_end = b;

    poke(&client).expect("发送 HELLO");
    let transport = client
        .close_and_take_transport()
        .expect("关闭流程不应失败")
        .expect("应交还底层传输");
    let wire = tap.written();
    assert_eq!(wire.last_chunk::<3>(), Some(&[CLOSE, 0, 0]), "关闭告警应已写出");
    drop(transport);
    assert!(client.close_and_take_transport().expect("重复关闭").is_none());
}

#[test]
#[traced_test]
fn close_while_task_pending_discards_result() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let queue = QueueExecutor::default();
    let client = open_toy(
        a,
        ChannelMode::Client,
        &context,
        Arc::new(queue.clone()),
        small_buffers(),
    );
    let server = open_toy(
        b,
        ChannelMode::Server,
        &context,
        Arc::new(InlineExecutor),
        small_buffers(),
    );

    poke(&client).expect("发送 HELLO");
    poke(&server).expect("回应 WELCOME");
    poke(&client).expect("交出校验任务");
    assert!(client.has_pending_task());
    assert_eq!(client.interest(), None, "任务挂起期间不关注任何事件");
    assert_eq!(queue.pending(), 1);
    let task = client.task_handle().expect("校验任务已提交");
    assert!(!task.is_finished());

    client.close().expect("关闭不应失败");
    assert!(logs_contain("closing while handshake task is still running"));
    assert!(client.task_handle().is_none(), "关闭后不再保留任务句柄");
    assert_eq!(queue.run_all(), 1);
    assert_eq!(context.tasks_run(), 1, "关闭不会取消已提交的任务");
    assert!(task.is_finished() && !task.is_failed());
    assert!(logs_contain("discarding handshake task result"));

    assert!(!client.is_handshake_complete());
    let mut buf = [0_u8; 8];
    let err = client.read(&mut buf).expect_err("关闭后读取必须失败");
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    assert!(server.read(&mut buf).is_err(), "握手期间收到关闭告警是错误");
}

#[test]
fn queued_task_resumes_handshake_when_run() {
    let context = ToyContext::default();
    let (a, b) = MemoryTransport::pair();
    let queue = QueueExecutor::default();
    let client = open_toy(
        a,
        ChannelMode::Client,
        &context,
        Arc::new(queue.clone()),
        small_buffers(),
    );
    let server = open_toy(
        b,
        ChannelMode::Server,
        &context,
        Arc::new(InlineExecutor),
        small_buffers(),
    );

    poke(&client).expect("发送 HELLO");
    poke(&server).expect("回应 WELCOME");
    poke(&client).expect("交出校验任务");
    poke(&client).expect("任务挂起时只会 would-block");
    assert_eq!(queue.pending(), 1, "同一时间最多一个委派任务");
    let task = client.task_handle().expect("校验任务已提交");
    assert!(!task.is_finished(), "排队中的任务尚未执行");

    assert_eq!(queue.run_all(), 1);
    assert!(task.is_finished() && !task.is_failed());
    assert!(client.is_handshake_complete(), "任务完成回调直接推进握手");
    assert!(complete_handshake(&client, &server, 8));
    assert_eq!(transfer(&server, &client, b"welcome aboard", 100), b"welcome aboard");
}
