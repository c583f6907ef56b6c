//! AgentStack 命令行入口
//!
//! 用法：`agentstack [session_id] [user_id]`。读取配置、初始化日志、装配编排器，
//! 然后逐行读取标准输入，每行作为一轮 user 消息提交，打印 assistant 回复。

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::Instrument;

use agentstack::config::{load_config, AppConfig};
use agentstack::memory::{Message, Role};
use agentstack::observability::init_logging;
use agentstack::{AgentBuilder, AgentOrchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let session_id = args.next().unwrap_or_else(|| "cli-session".to_string());
    let user_id = args.next().unwrap_or_else(|| "cli-user".to_string());

    let (config, load_error) = match load_config(None) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    let root = init_logging(&config.logging, config.environment);
    if let Some(e) = load_error {
        tracing::warn!(error = %e, "config_load_failed_using_defaults");
    }

    async move {
        let orchestrator = AgentBuilder::new(config)
            .build()
            .await
            .context("Failed to build agent")?;
        run_repl(&orchestrator, &session_id, &user_id).await
    }
    .instrument(root)
    .await
}

async fn run_repl(
    orchestrator: &AgentOrchestrator,
    session_id: &str,
    user_id: &str,
) -> anyhow::Result<()> {
    tracing::info!(session_id, user_id, "repl_started");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/exit" || line == "/quit" {
            break;
        }

        match orchestrator
            .handle_turn(vec![Message::user(line)], session_id, user_id)
            .await
        {
            Ok(replies) => {
                for reply in replies.iter().filter(|m| m.role == Role::Assistant) {
                    println!("{}", reply.content);
                }
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }
    Ok(())
}
