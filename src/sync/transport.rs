//! 传输层
//!
//! [`Connector`] 负责建立连接，连接建立后统一表现为一对通道：
//! 出站文本（`mpsc::Sender<String>`）和入站帧（`mpsc::Receiver<Inbound>`）。
//! 入站通道关闭即视为连接关闭。

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 入站帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 文本消息
    Text(String),
    /// 传输层错误，之后连接视为断开
    Error(String),
}

/// 一条已建立的连接
pub struct Connection {
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<Inbound>,
    /// 连接释放时一并终止的后台任务
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(outgoing: mpsc::Sender<String>, incoming: mpsc::Receiver<Inbound>) -> Self {
        Self {
            outgoing,
            incoming,
            tasks: Vec::new(),
        }
    }

    /// 绑定一个随连接释放而 abort 的后台任务
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    /// 出站发送端
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }

    /// 接收下一帧，None 表示连接已关闭
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.incoming.recv().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// 连接器
///
/// 每次调用 `connect` 发起一次新的连接尝试。
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Connection>>;
}

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use anyhow::Context;
    use futures_util::{FutureExt, SinkExt, StreamExt};
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    use super::{BoxFuture, Connection, Connector, Inbound};

    /// WebSocket 连接器
    #[derive(Debug, Clone)]
    pub struct WebSocketConnector {
        /// 通道缓冲区大小
        buffer: usize,
    }

    impl WebSocketConnector {
        pub fn new(buffer: usize) -> Self {
            Self {
                buffer: buffer.max(1),
            }
        }
    }

    impl Default for WebSocketConnector {
        fn default() -> Self {
            Self::new(100)
        }
    }

    impl Connector for WebSocketConnector {
        fn connect(&self, url: &str) -> BoxFuture<'static, anyhow::Result<Connection>> {
            let url = url.to_string();
            let buffer = self.buffer;

            async move {
                let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .with_context(|| format!("WebSocket 握手失败: {}", url))?;
                tracing::debug!("🔗 WebSocket 握手成功: {}", url);

                let (mut sink, mut stream) = ws.split();
                let (out_tx, mut out_rx) = mpsc::channel::<String>(buffer);
                let (in_tx, in_rx) = mpsc::channel::<Inbound>(buffer);

                // 发送任务：所有发送端释放后发送 Close 帧并退出
                tokio::spawn(async move {
                    while let Some(text) = out_rx.recv().await {
                        if let Err(e) = sink.send(Message::text(text)).await {
                            tracing::warn!("发送失败: {}", e);
                            break;
                        }
                    }
                    let _ = sink.close().await;
                });

                // 读取任务
                let reader = tokio::spawn(async move {
                    while let Some(frame) = stream.next().await {
                        let inbound = match frame {
                            Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
                            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                                Ok(text) => Inbound::Text(text),
                                Err(_) => {
                                    tracing::warn!("忽略非 UTF-8 二进制帧 ({} bytes)", bytes.len());
                                    continue;
                                }
                            },
                            Ok(Message::Close(frame)) => {
                                tracing::debug!("服务端关闭连接: {:?}", frame);
                                break;
                            }
                            // Ping/Pong 由 tungstenite 处理
                            Ok(_) => continue,
                            Err(e) => Inbound::Error(e.to_string()),
                        };

                        let is_error = matches!(inbound, Inbound::Error(_));
                        if in_tx.send(inbound).await.is_err() || is_error {
                            break;
                        }
                    }
                });

                Ok(Connection::new(out_tx, in_rx).with_task(reader))
            }
            .boxed()
        }
    }
}
