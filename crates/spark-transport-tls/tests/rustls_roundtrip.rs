//! 基于 rustls 的真实握手往返。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：脚本化引擎只能证明编排逻辑自洽；真实 TLS 1.3 握手包含会话票据、
//!   握手后消息与 close_notify 应答，必须用 rustls 跑一遍才能确认状态映射正确。
//! - **设计手法 (How)**：`rcgen` 生成自签名证书，客户端只信任该证书；两端 `TlsTube`
//!   经 `MemoryTransport::pair` 对接，全部在测试线程上同步推进。
//! - **合同与边界 (What)**：
//!   - 握手后两端 ALPN 均为 `h2`；
//!   - 双向明文逐字节一致且保持顺序；
//!   - 客户端结束写方向后两端都收到 close_notify 并正常完成。

#![cfg(feature = "rustls")]

use std::sync::{Arc, Once};

use bytes::Bytes;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::ring::default_provider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use spark_buffer::SlabBufferPool;
use spark_flow::{FlowTube, InlineExecutor};
use spark_transport_tls::{
    RustlsEngine, TlsEngine, TlsFlowConfig, TlsTube,
    test_stubs::{MemoryTransport, QueuePublisher, RecordingSubscriber},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装一次 fmt 日志层；`RUST_LOG=spark_transport_tls=trace` 可观察完整握手过程。
fn install_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    install_logging();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
        .expect("生成自签名证书");
    let cert_der = CertificateDer::from(certified.cert.der().to_vec());
    let key_der: PrivateKeyDer<'static> =
        PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into();
    let provider = Arc::new(default_provider());

    let mut server = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .expect("服务端证书");
    server.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).expect("加入根证书");
    let mut client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("协议版本")
        .with_root_certificates(roots)
        .with_no_client_auth();
    client.alpn_protocols = vec![b"h2".to_vec()];

    (Arc::new(server), Arc::new(client))
}

struct Endpoint {
    tube: Arc<TlsTube>,
    writes: Arc<QueuePublisher>,
    reads: Arc<RecordingSubscriber>,
}

fn endpoint(engine: RustlsEngine, transport: &Arc<MemoryTransport>, name: &str) -> Endpoint {
    let engine: Arc<dyn TlsEngine> = Arc::new(engine);
    let tube = TlsTube::new(
        engine,
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

fn connected() -> (Endpoint, Endpoint) {
    let (server_config, client_config) = configs();
    let (left, right) = MemoryTransport::pair();
    let server = endpoint(
        RustlsEngine::server(server_config).expect("服务端连接"),
        &right,
        "rustls-server",
    );
    let name = ServerName::try_from("localhost").expect("合法的服务器名");
    let client = endpoint(
        RustlsEngine::client(client_config, name).expect("客户端连接"),
        &left,
        "rustls-client",
    );
    (client, server)
}

fn negotiated(tube: &TlsTube) -> Option<String> {
    tube.alpn().peek().and_then(Result::ok).flatten()
}

#[test]
fn handshake_negotiates_h2() {
    let (client, server) = connected();
    assert_eq!(negotiated(&client.tube).as_deref(), Some("h2"));
    assert_eq!(negotiated(&server.tube).as_deref(), Some("h2"));
}

#[test]
fn plaintext_round_trips_in_order() {
    let (client, server) = connected();
    let request: Vec<Bytes> = (0..16)
        .map(|index| Bytes::from(format!("request-{index:02};")))
        .collect();
    let expected: Vec<u8> = request.iter().flat_map(|chunk| chunk.to_vec()).collect();
    for chunk in request {
        client.writes.push(vec![chunk]);
    }
    let large = Bytes::from(vec![0x42u8; 40 * 1024]);
    server.writes.push(vec![large.clone()]);

    assert_eq!(server.reads.collected().to_vec(), expected);
    assert_eq!(client.reads.collected(), large, "超过单条记录上限的数据也应完整到达");
}

#[test]
fn graceful_close_completes_both_sides() {
    let (client, server) = connected();
    client.writes.push_bytes(b"bye");
    client.writes.complete();

    assert_eq!(server.reads.collected(), Bytes::from_static(b"bye"));
    for endpoint in [&client, &server] {
        assert!(endpoint.tube.close_notify_received());
        assert!(endpoint.reads.is_completed());
        let outcome = endpoint.tube.completion().peek().expect("完成信号应已解析");
        assert!(outcome.is_ok(), "正常关闭应以成功解析: {outcome:?}");
    }
}
