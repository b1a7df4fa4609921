//! StreamSync 订阅实例
//!
//! 每个实例拥有独立的连接、重连计数和 Agent 集合，由一个驱动任务串行处理
//! 所有连接事件与入站消息；外部只能通过快照读取状态，通过 `send` 发送消息。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::reducer::AgentCollection;
use super::state::{Action, ConnectionHealth, ConnectionMachine, ConnectionState, Input};
use super::transport::{Connection, Connector, Inbound};
use crate::config::SyncConfig;
use crate::protocol::{decode_event, DecodeError};

/// 对外暴露的状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    /// 最后一次已知的 Agent 集合（断线期间保持不变）
    pub agents: AgentCollection,
    pub state: ConnectionState,
    pub health: ConnectionHealth,
    /// 可读的连接错误
    pub error: Option<String>,
}

impl SyncSnapshot {
    fn from_parts(machine: &ConnectionMachine, agents: &AgentCollection) -> Self {
        Self {
            agents: agents.clone(),
            state: machine.state(),
            health: machine.health(),
            error: machine.error().map(str::to_string),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// 当前连接的出站发送端，未连接时为 None
type OutboundSlot = Arc<RwLock<Option<mpsc::Sender<String>>>>;

/// 手动重连请求
///
/// 每次进入 Failed 都开启新的一代；请求记录发出时所在的代，驱动只响应当前代的请求，
/// 上一代遗留的唤醒许可不会让新的 Failed 自动重连。
#[derive(Default)]
struct RetryGate {
    generation: AtomicU64,
    requested: AtomicU64,
    notify: Notify,
}

impl RetryGate {
    /// 进入 Failed，返回新的代号
    fn enter_failed(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn request(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.requested.store(generation, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// 等待针对 `generation` 的重连请求
    async fn wait(&self, generation: u64) {
        loop {
            self.notify.notified().await;
            if self.requested.load(Ordering::SeqCst) == generation {
                return;
            }
            tracing::debug!("忽略过期的重连请求");
        }
    }
}

/// 事件流订阅
pub struct StreamSync {
    subscription_id: Uuid,
    snapshot_rx: watch::Receiver<SyncSnapshot>,
    outbound: OutboundSlot,
    retry: Arc<RetryGate>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSync {
    /// 使用 WebSocket 连接器启动订阅
    ///
    /// 必须在 tokio 运行时内调用。
    #[cfg(feature = "websocket")]
    pub fn start(config: SyncConfig) -> Self {
        let connector = super::transport::WebSocketConnector::new(config.outbound_buffer);
        Self::with_connector(config, Arc::new(connector))
    }

    /// 使用指定连接器启动订阅
    pub fn with_connector(config: SyncConfig, connector: Arc<dyn Connector>) -> Self {
        let subscription_id = Uuid::new_v4();
        let machine = ConnectionMachine::from_config(&config);
        let agents = AgentCollection::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::from_parts(&machine, &agents));

        let outbound: OutboundSlot = Arc::new(RwLock::new(None));
        let retry = Arc::new(RetryGate::default());
        let cancel = CancellationToken::new();

        let driver = Driver {
            config,
            connector,
            machine,
            agents,
            snapshot_tx,
            outbound: outbound.clone(),
            retry: retry.clone(),
            cancel: cancel.clone(),
        };

        let span = tracing::info_span!("stream_sync", subscription = %subscription_id);
        let task = tokio::spawn(driver.run().instrument(span));

        Self {
            subscription_id,
            snapshot_rx,
            outbound,
            retry,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// 订阅 ID（用于日志区分多个实例）
    pub fn subscription_id(&self) -> Uuid {
        self.subscription_id
    }

    /// 当前快照
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// 当前 Agent 集合
    pub fn agents(&self) -> AgentCollection {
        self.snapshot_rx.borrow().agents.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot_rx.borrow().is_connected()
    }

    pub fn error(&self) -> Option<String> {
        self.snapshot_rx.borrow().error.clone()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.snapshot_rx.borrow().health
    }

    /// 获取快照接收器，每次状态变化都会收到通知
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_rx.clone()
    }

    /// 在当前连接上发送一条消息（非阻塞）
    ///
    /// 未连接时丢弃并告警，返回 false。
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> bool {
        let sender = self.outbound.read().clone();
        let Some(sender) = sender else {
            tracing::warn!(subscription = %self.subscription_id, "⚠️ 未连接，丢弃出站消息");
            return false;
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(subscription = %self.subscription_id, "序列化出站消息失败: {}", e);
                return false;
            }
        };

        match sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(subscription = %self.subscription_id, "出站缓冲区已满，丢弃消息");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(subscription = %self.subscription_id, "连接已关闭，丢弃出站消息");
                false
            }
        }
    }

    /// 手动重连
    ///
    /// 仅在 Failed 状态下生效：清零重连计数并立即发起连接。
    pub fn reconnect(&self) {
        if self.snapshot_rx.borrow().state == ConnectionState::Failed {
            tracing::info!(subscription = %self.subscription_id, "🔄 手动重连");
            self.retry.request();
        }
    }

    /// 拆除订阅：取消等待中的重连、关闭连接，并等待驱动任务退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for StreamSync {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 驱动任务：独占状态机与 Agent 集合
struct Driver {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    machine: ConnectionMachine,
    agents: AgentCollection,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    outbound: OutboundSlot,
    retry: Arc<RetryGate>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let retry = self.retry.clone();
        let mut action = self.machine.handle(Input::Start);
        let mut failed_generation = 0;

        loop {
            // 先开启新的一代再发布快照，看到 Failed 的调用方总能命中当前代
            if action == Action::Stop {
                failed_generation = retry.enter_failed();
            }
            self.publish();

            action = match action {
                Action::Connect => match self.connect_and_pump().await {
                    Some(input) => self.machine.handle(input),
                    None => break,
                },

                Action::Wait(delay) => {
                    tracing::info!(
                        "🔄 {}ms 后重连 ({}/{})",
                        delay.as_millis(),
                        self.machine.attempts(),
                        self.config.max_reconnect_attempts
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => self.machine.handle(Input::RetryElapsed),
                    }
                }

                Action::Stop => {
                    tracing::error!("❌ 已达到最大重连次数，停止自动重连: {}", self.config.url);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = retry.wait(failed_generation) => self.machine.handle(Input::Retry),
                    }
                }

                Action::None => break,
            };
        }

        self.machine.handle(Input::Shutdown);
        self.outbound.write().take();
        self.publish();
        tracing::debug!("👋 订阅已拆除");
    }

    /// 连接并持续处理入站消息
    ///
    /// 返回 None 表示被取消，否则返回连接结束对应的输入。
    async fn connect_and_pump(&mut self) -> Option<Input> {
        let cancel = self.cancel.clone();
        let connector = self.connector.clone();

        let connected = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = connector.connect(&self.config.url) => result,
        };

        let mut connection: Connection = match connected {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("连接失败: {:#}", e);
                return Some(Input::Closed {
                    reason: format!("连接失败: {}", e),
                });
            }
        };

        self.machine.handle(Input::Opened);
        *self.outbound.write() = Some(connection.sender());
        tracing::info!("✅ 已连接: {}", self.config.url);
        self.publish();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.outbound.write().take();
                    return None;
                }
                inbound = connection.recv() => match inbound {
                    Some(Inbound::Text(text)) => self.handle_message(&text),
                    Some(Inbound::Error(e)) => break format!("连接错误: {}", e),
                    None => break "连接已关闭".to_string(),
                },
            }
        };

        self.outbound.write().take();
        tracing::warn!("🔌 连接断开: {}", reason);
        Some(Input::Closed { reason })
    }

    /// 处理一条入站消息，解析失败只记录日志
    fn handle_message(&mut self, text: &str) {
        let event = match decode_event(text) {
            Ok(event) => event,
            Err(DecodeError::UnknownKind(kind)) => {
                tracing::warn!("未知事件类型，忽略: {}", kind);
                return;
            }
            Err(e) => {
                tracing::warn!("解析事件失败，丢弃: {}", e);
                return;
            }
        };

        let kind = event.kind();
        let change = self.agents.apply(event);
        tracing::debug!(
            "📨 {} → {:?} (agents={})",
            kind,
            change,
            self.agents.len()
        );

        if change.is_changed() {
            self.publish();
        }
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(SyncSnapshot::from_parts(&self.machine, &self.agents));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentStatus;
    use futures_util::FutureExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 测试用服务端一侧
    struct ServerEnd {
        to_client: mpsc::Sender<Inbound>,
        from_client: mpsc::Receiver<String>,
    }

    impl ServerEnd {
        async fn push(&self, json: &str) {
            self.to_client.send(Inbound::Text(json.to_string())).await.unwrap();
        }
    }

    /// 按脚本接受/拒绝连接的连接器；脚本耗尽后一律拒绝
    struct ScriptedConnector {
        attempts: AtomicUsize,
        script: parking_lot::Mutex<VecDeque<bool>>,
        accepted: mpsc::UnboundedSender<ServerEnd>,
    }

    impl ScriptedConnector {
        fn new(script: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                attempts: AtomicUsize::new(0),
                script: parking_lot::Mutex::new(script.iter().copied().collect()),
                accepted: tx,
            });
            (connector, rx)
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Connector for ScriptedConnector {
        fn connect(&self, _url: &str) -> futures_util::future::BoxFuture<'static, anyhow::Result<Connection>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let accept = self.script.lock().pop_front().unwrap_or(false);

            let result = if accept {
                let (out_tx, out_rx) = mpsc::channel(16);
                let (in_tx, in_rx) = mpsc::channel(16);
                let _ = self.accepted.send(ServerEnd {
                    to_client: in_tx,
                    from_client: out_rx,
                });
                Ok(Connection::new(out_tx, in_rx))
            } else {
                Err(anyhow::anyhow!("connection refused"))
            };

            async move { result }.boxed()
        }
    }

    fn config(max: u32) -> SyncConfig {
        SyncConfig::new("ws://test/agents")
            .with_reconnect_delay(Duration::from_millis(3000))
            .with_max_reconnect_attempts(max)
    }

    const INITIAL: &str = r#"{"type":"initial","agents":[
        {"id":"a","name":"planner","task":"plan","status":"active","startTime":"2024-05-01T10:00:00Z"},
        {"id":"b","name":"coder","task":"code","status":"idle","parentId":"a","startTime":"2024-05-01T10:01:00Z"}
    ]}"#;

    #[tokio::test(start_paused = true)]
    async fn test_events_fold_into_snapshot() {
        let (connector, mut accepted) = ScriptedConnector::new(&[true]);
        let sync = StreamSync::with_connector(config(5), connector);
        let mut rx = sync.subscribe();

        let server = accepted.recv().await.unwrap();
        server.push(INITIAL).await;
        server
            .push(r#"{"type":"update","agent":{"id":"a","status":"completed","startTime":"2024-05-01T10:00:00Z"}}"#)
            .await;
        server.push(r#"{"type":"remove","agentId":"b"}"#).await;

        rx.wait_for(|s| s.agents.len() == 1 && s.agents.get("b").is_none())
            .await
            .unwrap();

        let snapshot = sync.snapshot();
        assert!(snapshot.is_connected());
        assert_eq!(snapshot.health, ConnectionHealth::Connected);
        assert_eq!(snapshot.agents.get("a").unwrap().status, AgentStatus::Completed);
        assert_eq!(snapshot.error, None);

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_messages_do_not_break_stream() {
        let (connector, mut accepted) = ScriptedConnector::new(&[true]);
        let sync = StreamSync::with_connector(config(5), connector);
        let mut rx = sync.subscribe();

        let server = accepted.recv().await.unwrap();
        server.push("not json").await;
        server.push(r#"{"type":"heartbeat"}"#).await;
        server.push(r#"{"type":"spawn"}"#).await;
        server
            .push(r#"{"type":"spawn","agent":{"id":"c","status":"active","startTime":"2024-05-01T10:00:00Z"}}"#)
            .await;

        rx.wait_for(|s| s.agents.len() == 1).await.unwrap();
        assert!(sync.is_connected());
        assert!(sync.agents().get("c").is_some());

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_max_attempts_and_stops() {
        let (connector, _accepted) = ScriptedConnector::new(&[]);
        let sync = StreamSync::with_connector(config(5), connector.clone());
        let mut rx = sync.subscribe();

        rx.wait_for(|s| s.state == ConnectionState::Failed).await.unwrap();

        // 首次连接 + 5 次重连
        assert_eq!(connector.attempts(), 6);
        assert_eq!(sync.health(), ConnectionHealth::Failed);
        assert_eq!(sync.error().as_deref(), Some(crate::sync::state::MAX_ATTEMPTS_REACHED));

        // 之后不再自动重连
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 6);

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connection_resets_attempts() {
        let (connector, mut accepted) = ScriptedConnector::new(&[false, false, true]);
        let sync = StreamSync::with_connector(config(5), connector.clone());
        let mut rx = sync.subscribe();

        // 第三次连接成功，随后服务端断开
        let server = accepted.recv().await.unwrap();
        rx.wait_for(|s| s.is_connected()).await.unwrap();
        assert_eq!(connector.attempts(), 3);
        drop(server);

        rx.wait_for(|s| s.state == ConnectionState::Failed).await.unwrap();

        // 断开后又经历了 5 次失败的重连
        assert_eq!(connector.attempts(), 3 + 5);

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_last_snapshot() {
        let (connector, mut accepted) = ScriptedConnector::new(&[true]);
        let sync = StreamSync::with_connector(config(5), connector);
        let mut rx = sync.subscribe();

        let server = accepted.recv().await.unwrap();
        server.push(INITIAL).await;
        rx.wait_for(|s| s.agents.len() == 2).await.unwrap();

        drop(server);
        rx.wait_for(|s| !s.is_connected()).await.unwrap();

        let snapshot = sync.snapshot();
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.error.as_deref(), Some("连接已关闭"));
        assert_eq!(snapshot.health, ConnectionHealth::Reconnecting { attempt: 1 });

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_when_connected() {
        let (connector, mut accepted) = ScriptedConnector::new(&[true]);
        let sync = StreamSync::with_connector(config(5), connector);
        let mut rx = sync.subscribe();

        let mut server = accepted.recv().await.unwrap();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        assert!(sync.send(&serde_json::json!({"type": "ping", "seq": 1})));
        let received = server.from_client.recv().await.unwrap();
        assert_eq!(received, r#"{"seq":1,"type":"ping"}"#);

        drop(server);
        rx.wait_for(|s| !s.is_connected()).await.unwrap();

        // 断线期间发送为 no-op
        assert!(!sync.send(&serde_json::json!({"type": "ping"})));

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let (connector, mut accepted) = ScriptedConnector::new(&[true]);
        let sync = StreamSync::with_connector(config(5), connector.clone());
        let mut rx = sync.subscribe();

        let mut server = accepted.recv().await.unwrap();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        sync.shutdown().await;

        // 客户端发送端已全部释放
        assert!(server.from_client.recv().await.is_none());
        assert!(!sync.is_connected());
        assert!(!sync.send(&"after shutdown"));

        // 不会再有连接尝试
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let (connector, _accepted) = ScriptedConnector::new(&[]);
        let sync = StreamSync::with_connector(config(5), connector.clone());
        let mut rx = sync.subscribe();

        rx.wait_for(|s| s.health == ConnectionHealth::Reconnecting { attempt: 1 })
            .await
            .unwrap();
        sync.shutdown().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_from_failed() {
        let (connector, mut accepted) = ScriptedConnector::new(&[false, true]);
        let sync = StreamSync::with_connector(config(0), connector.clone());
        let mut rx = sync.subscribe();

        rx.wait_for(|s| s.state == ConnectionState::Failed).await.unwrap();
        assert_eq!(connector.attempts(), 1);

        sync.reconnect();
        let _server = accepted.recv().await.unwrap();
        rx.wait_for(|s| s.is_connected()).await.unwrap();

        assert_eq!(connector.attempts(), 2);
        assert_eq!(sync.error(), None);

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_reconnect_does_not_leak_into_next_failure() {
        let (connector, _accepted) = ScriptedConnector::new(&[]);
        let sync = StreamSync::with_connector(config(0), connector.clone());
        let mut rx = sync.subscribe();

        rx.wait_for(|s| s.state == ConnectionState::Failed).await.unwrap();
        assert_eq!(connector.attempts(), 1);

        // 快照仍是 Failed 时连续请求两次
        sync.reconnect();
        sync.reconnect();

        // 只发起一次手动连接，再次 Failed 后不会自动重连
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 2);
        assert_eq!(sync.health(), ConnectionHealth::Failed);

        // 新一代的手动重连仍然有效
        sync.reconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 3);

        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_subscriptions() {
        let (first, mut first_accepted) = ScriptedConnector::new(&[true]);
        let (second, _second_accepted) = ScriptedConnector::new(&[]);

        let a = StreamSync::with_connector(config(1), first);
        let b = StreamSync::with_connector(config(1), second);
        assert_ne!(a.subscription_id(), b.subscription_id());

        let _server = first_accepted.recv().await.unwrap();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        rx_a.wait_for(|s| s.is_connected()).await.unwrap();
        rx_b.wait_for(|s| s.state == ConnectionState::Failed).await.unwrap();

        // b 的失败不影响 a
        assert!(a.is_connected());

        a.shutdown().await;
        b.shutdown().await;
    }
}
