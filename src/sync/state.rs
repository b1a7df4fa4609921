//! 连接状态机
//!
//! 纯状态转换，不涉及任何 IO 或定时器：驱动任务把连接事件作为 [`Input`] 喂进来，
//! 根据返回的 [`Action`] 决定下一步（连接 / 等待 / 停止）。
//!
//! ```text
//! Disconnected → Connecting → Connected → Disconnected (retry) → ... → Failed
//! ```
//!
//! 重连计数只在连接成功时清零：一条长时间健康的连接断开后重新从 0 开始计数。

use std::fmt;
use std::time::Duration;

use crate::config::SyncConfig;

/// 达到最大重连次数时的错误信息
pub const MAX_ATTEMPTS_REACHED: &str = "已达到最大重连次数";

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 终态，不再自动重连
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// 面向展示层的连接健康度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// 首次连接中
    Connecting,
    Connected,
    /// 断线重连中（attempt 从 1 开始）
    Reconnecting { attempt: u32 },
    Failed,
}

/// 状态机输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// 组件启动
    Start,
    /// 握手成功
    Opened,
    /// 连接关闭或出错（包括连接建立失败）
    Closed { reason: String },
    /// 重连等待结束
    RetryElapsed,
    /// 手动重连（仅 Failed 下生效）
    Retry,
    /// 组件拆除
    Shutdown,
}

/// 驱动任务需要执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// 发起连接
    Connect,
    /// 等待指定时长后喂入 RetryElapsed
    Wait(Duration),
    /// 停止自动重连
    Stop,
    /// 无事可做
    None,
}

/// 连接状态机
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    max_attempts: u32,
    delay: Duration,
    error: Option<String>,
}

impl ConnectionMachine {
    /// 创建状态机
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            max_attempts,
            delay,
            error: None,
        }
    }

    /// 从订阅配置创建
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.reconnect_delay, config.max_reconnect_attempts)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 自上次连接成功以来的重连次数
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 当前对外暴露的错误信息
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// 健康度
    pub fn health(&self) -> ConnectionHealth {
        match self.state {
            ConnectionState::Connected => ConnectionHealth::Connected,
            ConnectionState::Failed => ConnectionHealth::Failed,
            ConnectionState::Disconnected | ConnectionState::Connecting if self.attempts == 0 => {
                ConnectionHealth::Connecting
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                ConnectionHealth::Reconnecting {
                    attempt: self.attempts,
                }
            }
        }
    }

    /// 处理一个输入，返回下一步动作
    pub fn handle(&mut self, input: Input) -> Action {
        use ConnectionState::*;

        match (self.state, input) {
            (_, Input::Shutdown) => {
                self.state = Disconnected;
                Action::Stop
            }

            (Disconnected, Input::Start) | (Disconnected, Input::RetryElapsed) => {
                self.state = Connecting;
                Action::Connect
            }

            (Connecting, Input::Opened) => {
                self.state = Connected;
                self.attempts = 0;
                self.error = None;
                Action::None
            }

            (Connecting, Input::Closed { reason }) | (Connected, Input::Closed { reason }) => {
                if self.attempts < self.max_attempts {
                    self.attempts += 1;
                    self.state = Disconnected;
                    self.error = Some(reason);
                    Action::Wait(self.delay)
                } else {
                    self.state = Failed;
                    self.error = Some(MAX_ATTEMPTS_REACHED.to_string());
                    Action::Stop
                }
            }

            (Failed, Input::Retry) => {
                self.attempts = 0;
                self.error = None;
                self.state = Connecting;
                Action::Connect
            }

            (state, input) => {
                tracing::trace!("忽略状态机输入: state={}, input={:?}", state, input);
                Action::None
            }
        }
    }
}
