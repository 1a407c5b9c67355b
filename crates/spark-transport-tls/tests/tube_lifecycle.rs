//! `TlsTube` 订阅生命周期与握手中断检测。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：Tube 对外是普通的 `FlowTube`，订阅者可能晚到、可能被替换，
//!   传输层也可能在握手途中关闭；这些情况下信号次序与错误分类必须可预测。
//! - **设计手法 (How)**：`MemoryTransport` 作为底层传输，由测试直接喂入密文、结束或失败读方向；
//!   `RecordingSubscriber` 记录应用侧看到的完整信号序列。
//! - **合同与边界 (What)**：
//!   - 握手进行中传输层结束且未收到 close_notify：订阅者收到 `tls.handshake_aborted`；
//!   - 握手期间的传输错误被重新归类为握手中断并保留原始描述；
//!   - 订阅之前到达的数据与完成信号在 `on_subscribe` 之后按序投递；
//!   - 错误重放给之后的每个订阅者，完成只交给第一个；
//!   - 写方向需求在写发布者接入前累积，读方向结束后按策略取消写方向。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use spark_buffer::SlabBufferPool;
use spark_flow::{FlowError, FlowTube, InlineExecutor, Publisher};
use spark_transport_tls::{
    TlsEngine, TlsFlowConfig, TlsTube, TubePhase, WriteCancelPolicy,
    test_stubs::{Event, MemoryTransport, QueuePublisher, RecordingSubscriber, ToyEngine},
};

fn tube_over(
    engine: impl TlsEngine + 'static,
    transport: &Arc<MemoryTransport>,
    config: TlsFlowConfig,
) -> Arc<TlsTube> {
    TlsTube::new(
        Arc::new(engine),
        Arc::new(InlineExecutor),
        Arc::new(SlabBufferPool::new()),
        transport.clone(),
        config,
    )
    .expect("配置合法")
}

#[test]
fn transport_close_during_handshake_aborts_instead_of_completing() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(ToyEngine::client(), &transport, TlsFlowConfig::named("client"));
    assert!(!transport.written().is_empty(), "客户端应已发出 client-hello");

    let app = RecordingSubscriber::unbounded();
    tube.subscribe(app.clone());
    transport.complete_inbound();

    let err = app.error().expect("应收到握手中断错误");
    assert_eq!(err.kind(), "tls.handshake_aborted");
    assert!(err.detail().contains("terminated the handshake"), "{err}");
    assert!(!app.is_completed(), "不得静默完成");
    assert_eq!(app.terminal_count(), 1);
    assert!(tube.is_finished());
    assert_eq!(tube.phase(), TubePhase::Finished);
    let completion = tube.completion().peek().expect("完成信号应已解析");
    assert_eq!(
        completion.expect_err("应为失败").kind(),
        "tls.handshake_aborted"
    );
    assert!(transport.write_error().is_some(), "写方向也应以错误结束");
}

#[test]
fn transport_close_before_any_handshake_activity() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(ToyEngine::server(), &transport, TlsFlowConfig::named("server"));
    let app = RecordingSubscriber::unbounded();
    tube.subscribe(app.clone());
    transport.complete_inbound();

    let err = app.error().expect("应收到握手中断错误");
    assert_eq!(err.kind(), "tls.handshake_aborted");
    assert!(err.detail().contains("before handshake"), "{err}");
}

/// 对端在 server-hello 记录中途挂断：残留的半条记录也属于握手中断，而不是普通协议错误。
#[test]
fn transport_close_inside_a_handshake_record_aborts_the_handshake() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(ToyEngine::client(), &transport, TlsFlowConfig::named("client"));
    let app = RecordingSubscriber::unbounded();
    tube.subscribe(app.clone());

    let server = ToyEngine::server();
    server
        .unwrap(&transport.written(), &mut BytesMut::new())
        .expect("服务端接收 client-hello");
    let mut reply = BytesMut::new();
    server.wrap(&[], &mut reply).expect("server-hello");
    transport.push_inbound(vec![reply.freeze().slice(..3)]);
    transport.complete_inbound();

    let err = app.error().expect("应收到握手中断错误");
    assert_eq!(err.kind(), "tls.handshake_aborted");
    assert!(err.detail().contains("3 bytes"), "应保留残留字节数: {err}");
    assert!(!app.is_completed());
    assert_eq!(app.terminal_count(), 1);
}

#[test]
fn transport_error_during_handshake_is_reclassified() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(ToyEngine::client(), &transport, TlsFlowConfig::named("client"));
    let app = RecordingSubscriber::unbounded();
    tube.subscribe(app.clone());
    transport.fail_inbound(FlowError::transport("connection reset by peer"));

    let err = app.error().expect("应收到错误");
    assert_eq!(err.kind(), "tls.handshake_aborted");
    assert!(err.detail().contains("connection reset by peer"), "应保留原始描述: {err}");
}

#[test]
fn data_before_subscribe_is_delivered_after_on_subscribe() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig::named("early"),
    );
    assert_eq!(tube.phase(), TubePhase::NoSubscriber);
    transport.push_inbound_bytes(ToyEngine::seal(b"early bird", 16));
    transport.complete_inbound();
    assert!(!tube.is_finished(), "输出仍在排队，读方向尚未结束");

    let first = RecordingSubscriber::unbounded();
    tube.subscribe(first.clone());
    assert_eq!(
        first.events(),
        vec![
            Event::Subscribed,
            Event::Next(vec![Bytes::from_static(b"early bird")]),
            Event::Complete,
        ],
        "数据与完成必须排在 on_subscribe 之后"
    );
    assert!(tube.is_finished());

    let second = RecordingSubscriber::unbounded();
    tube.subscribe(second.clone());
    assert_eq!(second.events(), vec![Event::Subscribed], "完成信号只交给第一个订阅者");
    assert_eq!(first.terminal_count(), 1);
    assert_eq!(first.events().last(), Some(&Event::Detached));
}

#[test]
fn early_error_is_replayed_to_every_later_subscriber() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig::named("replay"),
    );
    transport.fail_inbound(FlowError::transport("socket closed"));
    assert!(tube.is_finished(), "错误无订阅者时也应结束读方向");

    let first = RecordingSubscriber::unbounded();
    tube.subscribe(first.clone());
    let second = RecordingSubscriber::unbounded();
    tube.subscribe(second.clone());

    for app in [&first, &second] {
        let events = app.events();
        assert_eq!(events.first(), Some(&Event::Subscribed));
        assert_eq!(
            app.error().map(|err| err.kind()),
            Some("transport.io"),
            "错误应重放给每个订阅者"
        );
    }
    assert_eq!(first.events().last(), Some(&Event::Detached));
}

#[test]
fn resubscription_detaches_previous_subscriber() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig::named("switch"),
    );
    let first = RecordingSubscriber::unbounded();
    tube.subscribe(first.clone());
    assert_eq!(tube.phase(), TubePhase::Active);
    transport.push_inbound_bytes(ToyEngine::seal(b"one", 16));

    let second = RecordingSubscriber::unbounded();
    tube.subscribe(second.clone());
    transport.push_inbound_bytes(ToyEngine::seal(b"two", 16));

    assert_eq!(first.collected(), Bytes::from_static(b"one"));
    assert_eq!(first.events().last(), Some(&Event::Detached));
    assert_eq!(second.collected(), Bytes::from_static(b"two"));
    assert!(!second.events().contains(&Event::Detached));
}

#[test]
fn write_demand_is_replayed_when_publisher_connects() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig::named("writer"),
    );
    let plaintext = QueuePublisher::new("app-writes");
    tube.connect_flows(plaintext.clone(), RecordingSubscriber::unbounded());
    assert!(plaintext.requested() >= 1, "接入前累积的需求应被重放");

    plaintext.push_bytes(b"hello over tls");
    let (payload, _) = ToyEngine::open_stream(&transport.written(), 16).expect("密文应可解析");
    assert_eq!(payload, b"hello over tls");
}

#[test]
fn read_side_finish_cancels_writes_by_default() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig::named("propagate"),
    );
    let plaintext = QueuePublisher::new("app-writes");
    tube.connect_flows(plaintext.clone(), RecordingSubscriber::unbounded());
    transport.complete_inbound();

    assert!(tube.is_finished());
    assert!(plaintext.is_cancelled(), "Propagate 策略应取消写发布者");
}

#[test]
fn inert_policy_keeps_writes_alive() {
    let transport = MemoryTransport::new("raw");
    let tube = tube_over(
        ToyEngine::established(),
        &transport,
        TlsFlowConfig {
            write_cancel_policy: WriteCancelPolicy::Inert,
            ..TlsFlowConfig::named("inert")
        },
    );
    let plaintext = QueuePublisher::new("app-writes");
    tube.connect_flows(plaintext.clone(), RecordingSubscriber::unbounded());
    transport.complete_inbound();

    assert!(tube.is_finished());
    assert!(!plaintext.is_cancelled(), "Inert 策略不得取消写发布者");
    plaintext.push_bytes(b"still writing");
    let (payload, _) = ToyEngine::open_stream(&transport.written(), 16).expect("密文应可解析");
    assert_eq!(payload, b"still writing");
}
