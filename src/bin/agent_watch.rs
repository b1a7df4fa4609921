//! agent-watch - 订阅 Agent 事件流并打印状态变化
//!
//! 配置来自环境变量（见 `SyncConfig::from_env`），Ctrl-C 退出。

use agent_fleet_sync::{ConnectionHealth, StreamSync, SyncConfig};
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("agent_fleet_sync=debug".parse()?))
        .init();

    tracing::info!("🚀 agent-watch v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::from_env();
    config.validate()?;
    tracing::info!("订阅事件流: {}", config.url);

    let sync = StreamSync::start(config);
    let mut rx = sync.subscribe();
    let mut last_health = None;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();

                if last_health != Some(snapshot.health) {
                    match snapshot.health {
                        ConnectionHealth::Connecting => tracing::info!("⏳ 连接中"),
                        ConnectionHealth::Connected => tracing::info!("🟢 已连接"),
                        ConnectionHealth::Reconnecting { attempt } => tracing::warn!(
                            "🟡 重连中 (attempt={}): {}",
                            attempt,
                            snapshot.error.as_deref().unwrap_or("-")
                        ),
                        ConnectionHealth::Failed => tracing::error!(
                            "🔴 连接失败: {}",
                            snapshot.error.as_deref().unwrap_or("-")
                        ),
                    }
                    last_health = Some(snapshot.health);
                }

                let counts = snapshot.agents.count_by_status();
                tracing::info!(
                    "📊 agents={} running={} {:?}",
                    snapshot.agents.len(),
                    snapshot.agents.running_count(),
                    counts
                );
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到中断信号，准备退出...");
                break;
            }
        }
    }

    sync.shutdown().await;
    tracing::info!("👋 agent-watch exiting");
    Ok(())
}
