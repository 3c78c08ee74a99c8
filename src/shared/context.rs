use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 协调核心全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// 注册表健康探测周期（秒）
    pub probe_interval_secs: u64,
    /// 连续探测失败阈值，超过后Worker转为Error状态
    pub max_consecutive_failures: u32,
    /// 心跳超时清理窗口（秒），超过后Worker被回收
    pub cleanup_window_secs: i64,
    /// 注册表清理周期（秒）
    pub reaper_interval_secs: u64,
    /// 收件箱总容量上限，所有优先级队列共享
    pub inbox_capacity: usize,
    /// 心跳间隔（秒），3倍间隔无心跳则链路转为不活跃
    pub heartbeat_interval_secs: u64,
    /// 默认请求超时（秒）
    pub default_timeout_secs: u64,
    /// 工作流超时巡检周期（秒）
    pub workflow_sweep_interval_secs: u64,
    /// 工作流执行历史上限
    pub history_capacity: usize,
    /// 步骤重试的固定退避（毫秒）
    pub retry_backoff_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 30,
            max_consecutive_failures: 3,
            cleanup_window_secs: 300,
            reaper_interval_secs: 60,
            inbox_capacity: 1000,
            heartbeat_interval_secs: 10,
            default_timeout_secs: 30,
            workflow_sweep_interval_secs: 1,
            history_capacity: 100,
            retry_backoff_ms: 1000,
        }
    }
}

/// 运行时信息
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            start_time: chrono::Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// 协调上下文，进程启动时构造一次，按引用传给各组件。
/// 取代模块级全局单例，便于隔离测试。
#[derive(Clone, Debug)]
pub struct CoordinationContext {
    /// 全局配置
    pub config: Arc<RwLock<CoordinatorConfig>>,
    /// 运行时信息
    pub runtime_info: Arc<RuntimeInfo>,
}

impl CoordinationContext {
    /// 创建新的协调上下文
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            runtime_info: Arc::new(RuntimeInfo::default()),
        }
    }

    /// 获取配置的只读副本
    pub async fn get_config(&self) -> CoordinatorConfig {
        self.config.read().await.clone()
    }

    /// 更新配置
    pub async fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut CoordinatorConfig),
    {
        let mut config = self.config.write().await;
        updater(&mut config);
    }
}

impl Default for CoordinationContext {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
