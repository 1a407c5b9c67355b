//! 客户端与服务端两个 `TlsTube` 经内存传输对接的端到端流程。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：单个方向的测试无法覆盖“一方的 Reader 唤醒另一方的 Writer”这类跨连接交互；
//!   两端同时运行才能验证握手、双向数据与 close_notify 交换的完整闭环。
//! - **设计手法 (How)**：`MemoryTransport::pair` 把一端写出的密文交给另一端读取，
//!   两端都使用 `ToyEngine` 与内联执行器，整个流程在测试线程上同步完成。
//! - **合同与边界 (What)**：
//!   - 握手完成后两端 ALPN 均解析为 `h2`；
//!   - 任意方向的明文按写入顺序到达对端；
//!   - 客户端结束写方向后双方交换 close_notify，两端读方向正常完成，完成信号成功解析。

use std::sync::Arc;

use bytes::Bytes;
use spark_buffer::SlabBufferPool;
use spark_flow::{FlowTube, InlineExecutor};
use spark_transport_tls::{
    TlsFlowConfig, TlsTube,
    test_stubs::{MemoryTransport, QueuePublisher, RecordingSubscriber, ToyEngine},
};

struct Endpoint {
    tube: Arc<TlsTube>,
    writes: Arc<QueuePublisher>,
    reads: Arc<RecordingSubscriber>,
}

fn endpoint(engine: ToyEngine, transport: &Arc<MemoryTransport>, name: &str) -> Endpoint {
    let tube = TlsTube::new(
        Arc::new(engine),
        Arc::new(InlineExecutor),
        Arc::new(SlabBufferPool::new()),
        transport.clone(),
        TlsFlowConfig::named(name),
    )
    .expect("默认配置合法");
    let writes = QueuePublisher::new(format!("{name}-writes"));
    let reads = RecordingSubscriber::unbounded();
    tube.connect_flows(writes.clone(), reads.clone());
    Endpoint {
        tube,
        writes,
        reads,
    }
}

fn connected_pair() -> (Endpoint, Endpoint) {
    let (left, right) = MemoryTransport::pair();
    let server = endpoint(ToyEngine::server().with_alpn("h2"), &right, "server");
    let client = endpoint(ToyEngine::client().with_alpn("h2"), &left, "client");
    (client, server)
}

fn negotiated(tube: &TlsTube) -> Option<String> {
    tube.alpn()
        .peek()
        .and_then(Result::ok)
        .flatten()
}

#[test]
fn handshake_negotiates_alpn_on_both_sides() {
    let (client, server) = connected_pair();
    assert_eq!(negotiated(&client.tube).as_deref(), Some("h2"));
    assert_eq!(negotiated(&server.tube).as_deref(), Some("h2"));
}

#[test]
fn data_flows_in_order_both_ways() {
    let (client, server) = connected_pair();
    for chunk in ["alpha", "beta", "gamma"] {
        client.writes.push(vec![Bytes::from(chunk)]);
    }
    server.writes.push_bytes(b"pong");

    assert_eq!(server.reads.collected(), Bytes::from_static(b"alphabetagamma"));
    assert_eq!(client.reads.collected(), Bytes::from_static(b"pong"));
}

#[test]
fn writes_before_handshake_completion_are_held_then_sent() {
    let (left, right) = MemoryTransport::pair();
    let client = endpoint(ToyEngine::client(), &left, "early-client");
    client.writes.push_bytes(b"queued before server exists");
    assert!(negotiated(&client.tube).is_none(), "服务端尚未接入，握手不可能完成");

    let server = endpoint(ToyEngine::server(), &right, "late-server");
    assert_eq!(
        server.reads.collected(),
        Bytes::from_static(b"queued before server exists")
    );
}

#[test]
fn client_close_exchanges_close_notify_and_completes_both_sides() {
    let (client, server) = connected_pair();
    client.writes.push_bytes(b"goodbye");
    client.writes.complete();

    assert_eq!(server.reads.collected(), Bytes::from_static(b"goodbye"));
    assert!(server.tube.close_notify_received(), "服务端应收到 close_notify");
    assert!(client.tube.close_notify_received(), "服务端应回复 close_notify");

    for endpoint in [&client, &server] {
        assert!(endpoint.reads.is_completed(), "读方向应正常完成");
        assert!(endpoint.reads.error().is_none());
        assert!(endpoint.tube.is_finished());
        let outcome = endpoint.tube.completion().peek().expect("完成信号应已解析");
        assert!(outcome.is_ok(), "正常关闭应以成功解析: {outcome:?}");
    }
    assert!(server.writes.is_cancelled(), "出站关闭后服务端写发布者应被取消");
}
