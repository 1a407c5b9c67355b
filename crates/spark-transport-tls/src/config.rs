//! TLS 流封装配置。
//!
//! # 模块角色（Why）
//! - 背压阈值与写方向取消策略在不同部署中取值不同，集中为一个可序列化结构，
//!   便于从 TOML 配置文件加载；
//! - 所有字段都有默认值，空配置即可得到可用实例。
//!
//! # 契约说明（What）
//! - [`TlsFlowConfig::validate`] 拒绝为 0 的阈值；
//! - [`TlsFlowConfig::from_toml_str`] 解析后自动校验。

use serde::{Deserialize, Serialize};
use spark_flow::FlowError;
use thiserror::Error;

/// Reader 缓冲的未解密字节超过该值后暂停向上游请求。
pub const DEFAULT_READER_TARGET_BUFFERED: usize = 16 * 1024;
pub const DEFAULT_READER_INITIAL_CAPACITY: usize = 1024;
/// Writer 待加密列表超过该长度后暂停向上游请求。
pub const DEFAULT_WRITER_HIGH_WATER_MARK: usize = 10;
/// 下游输出队列达到该长度后暂停向上游请求。
pub const DEFAULT_DOWNSTREAM_QUEUE_LIMIT: usize = 5;

/// Tube 写方向订阅被取消时的处理策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteCancelPolicy {
    /// 把取消转发给当前的明文写发布者。
    #[default]
    Propagate,
    /// 忽略取消，写发布者不受影响。
    Inert,
}

/// `TlsFlowConfig` 汇总流封装的可调参数。
///
/// # 教案式说明
/// - **意图 (Why)**：阈值决定了内存占用与吞吐之间的取舍，需要按部署调整而非写死在代码中。
/// - **契约 (What)**：
///   - `name` 仅用于日志中的 `flow` 字段；
///   - `reader_target_buffered`、`writer_high_water_mark`、`downstream_queue_limit` 为背压阈值；
///   - `close_notify_on_complete` 为 `true` 时，明文上游正常结束会先发送 close_notify 再结束写方向。
/// - **风险 (Trade-offs)**：阈值过小会让每条记录都触发一次上游请求往返，过大则放大单连接内存峰值。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsFlowConfig {
    pub name: String,
    pub reader_target_buffered: usize,
    pub reader_initial_capacity: usize,
    pub writer_high_water_mark: usize,
    pub downstream_queue_limit: usize,
    pub write_cancel_policy: WriteCancelPolicy,
    pub close_notify_on_complete: bool,
}

impl Default for TlsFlowConfig {
    fn default() -> Self {
        Self {
            name: "tls-flow".to_owned(),
            reader_target_buffered: DEFAULT_READER_TARGET_BUFFERED,
            reader_initial_capacity: DEFAULT_READER_INITIAL_CAPACITY,
            writer_high_water_mark: DEFAULT_WRITER_HIGH_WATER_MARK,
            downstream_queue_limit: DEFAULT_DOWNSTREAM_QUEUE_LIMIT,
            write_cancel_policy: WriteCancelPolicy::default(),
            close_notify_on_complete: true,
        }
    }
}

impl TlsFlowConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let thresholds = [
            ("reader_target_buffered", self.reader_target_buffered),
            ("reader_initial_capacity", self.reader_initial_capacity),
            ("writer_high_water_mark", self.writer_high_water_mark),
            ("downstream_queue_limit", self.downstream_queue_limit),
        ];
        for (field, value) in thresholds {
            if value == 0 {
                return Err(ConfigError::ZeroThreshold { field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to parse tls flow config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`{field}` must be greater than zero")]
    ZeroThreshold { field: &'static str },
}

impl From<ConfigError> for FlowError {
    fn from(err: ConfigError) -> Self {
        FlowError::config(err.to_string())
    }
}
