/// Failure taxonomy of the coordination core.
///
/// Lookups that merely miss return `Option` or `bool` at the call site;
/// these variants are reserved for contract violations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    // -- registration --
    #[error("注册失败: {0}")]
    Registration(String),

    #[error("重复注册: {0}")]
    DuplicateRegistration(String),

    // -- communication --
    #[error("接收者不可用: {0}")]
    ReceiverUnavailable(String),

    #[error("消息队列已满: {0}")]
    QueueFull(String),

    #[error("消息传递失败: {0}")]
    MessageDeliveryError(String),

    // -- workflow --
    #[error("工作流定义无效: {0}")]
    InvalidWorkflow(String),

    #[error("存在循环依赖: {0}")]
    DependencyCycle(String),

    #[error("工作流未找到: {0}")]
    WorkflowNotFound(String),

    #[error("没有满足能力要求的Worker: {0}")]
    NoWorkerAvailable(String),

    // -- timeout --
    #[error("操作超时: {0}秒")]
    Timeout(u64),

    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
