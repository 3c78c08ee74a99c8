use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// 请求，期待响应
    Request,
    /// 响应，通过correlation_id关联请求
    Response,
    /// 单向通知
    Notification,
    /// 广播
    Broadcast,
    /// 心跳
    Heartbeat,
    /// 错误
    Error,
}

/// 消息优先级，五个有序级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessagePriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
    Critical = 4,
}

impl MessagePriority {
    pub const LEVELS: usize = 5;

    /// 收件箱队列下标
    pub fn index(self) -> usize {
        self as usize
    }

    /// 从高到低遍历
    pub fn descending() -> [MessagePriority; Self::LEVELS] {
        [
            MessagePriority::Critical,
            MessagePriority::Urgent,
            MessagePriority::High,
            MessagePriority::Normal,
            MessagePriority::Low,
        ]
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// 消息结构体。逻辑对象，不规定线上编码。
///
/// Request类消息携带params；Response类消息携带result或error，
/// 并通过correlation_id指回原始请求。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// 消息ID
    pub id: Uuid,
    /// 消息类型
    pub kind: MessageKind,
    /// 发送者ID
    pub sender: String,
    /// 接收者ID
    pub receiver: String,
    /// 方法名
    pub method: String,
    /// 请求参数
    pub params: Option<serde_json::Value>,
    /// 响应结果
    pub result: Option<serde_json::Value>,
    /// 错误信息
    pub error: Option<serde_json::Value>,
    /// 优先级
    pub priority: MessagePriority,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
    /// 相关ID（响应指向请求）
    pub correlation_id: Option<Uuid>,
    /// 超时（秒）
    pub timeout_secs: Option<u64>,
    /// 已重试次数
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
}

impl Message {
    fn base(kind: MessageKind, sender: String, receiver: String, method: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender,
            receiver,
            method,
            params: None,
            result: None,
            error: None,
            priority: MessagePriority::default(),
            timestamp: Utc::now(),
            correlation_id: None,
            timeout_secs: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    /// 创建请求消息
    pub fn request(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let mut msg = Self::base(MessageKind::Request, sender.into(), receiver.into(), method.into());
        msg.params = Some(params);
        msg
    }

    /// 创建通知消息
    pub fn notification(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        let mut msg = Self::base(
            MessageKind::Notification,
            sender.into(),
            receiver.into(),
            method.into(),
        );
        msg.params = Some(params);
        msg
    }

    /// 由请求构造成功响应
    pub fn response_to(original: &Message, result: serde_json::Value) -> Self {
        let mut msg = Self::base(
            MessageKind::Response,
            original.receiver.clone(),
            original.sender.clone(),
            original.method.clone(),
        );
        msg.result = Some(result);
        msg.priority = original.priority;
        msg.correlation_id = Some(original.id);
        msg
    }

    /// 创建心跳消息
    pub fn heartbeat(sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self::base(MessageKind::Heartbeat, sender.into(), receiver.into(), "heartbeat".into())
    }

    /// 设置优先级
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// 设置超时
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::Urgent);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
        assert_eq!(MessagePriority::descending()[0], MessagePriority::Critical);
    }

    #[test]
    fn test_response_correlation() {
        let req = Message::request("w1", "w2", "build.compile", serde_json::json!({"target": "x"}))
            .with_priority(MessagePriority::High);

        let resp = Message::response_to(&req, serde_json::json!({"ok": true}));

        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.sender, "w2");
        assert_eq!(resp.receiver, "w1");
        assert_eq!(resp.correlation_id, Some(req.id));
        assert_eq!(resp.priority, MessagePriority::High);
    }
}
