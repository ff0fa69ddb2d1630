use clap::{Parser, Subcommand};
use convo_sync::cache::FileCache;
use convo_sync::config::Config;
use convo_sync::conversation::{CreateConversationParams, NewMessageParams};
use convo_sync::error::Result;
use convo_sync::service::ConversationService;
use convo_sync::store::RemoteStore;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "convo-sync", about = "会话持久化与同步命令行")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", env = "CONVO_SYNC_CONFIG")]
    config: String,

    /// 输出 debug 级日志
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 发送一条消息（必要时先创建会话）
    Send {
        #[arg(long)]
        user: String,
        #[arg(long)]
        agent: String,
        /// 省略时新建会话
        #[arg(long)]
        conversation: Option<String>,
        message: String,
    },
    /// 列出用户可见的全部会话（远端 + 本地）
    List {
        #[arg(long)]
        user: String,
    },
    /// 显示单个会话的完整消息
    Show {
        #[arg(long)]
        user: String,
        conversation: String,
    },
    /// 把离线期间落在本地的会话迁移回远端
    Sync {
        #[arg(long)]
        user: String,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = Config::load(&cli.config)?;
    let mut store = RemoteStore::new(&config.remote.base_url).with_collections(
        &config.remote.namespace_collection,
        &config.remote.subcollection,
    );
    if let Some(key) = &config.remote.api_key {
        store = store.with_api_key(key);
    }
    let cache = FileCache::new(&config.cache_path)?;
    let service = ConversationService::with_policy(
        Arc::new(store),
        Arc::new(cache),
        config.retry.to_policy(),
    );

    match cli.command {
        Command::Send {
            user,
            agent,
            conversation,
            message,
        } => {
            let conversation_id = match conversation {
                Some(id) => id,
                None => {
                    let params = CreateConversationParams {
                        agent_id: agent.clone(),
                        user_id: user.clone(),
                        initial_message: None,
                        ..Default::default()
                    };
                    let created = service.create_conversation_with_fallback(&params).await?;
                    info!(conversation_id = %created.id, "已创建新会话");
                    created.id
                }
            };
            let params = NewMessageParams {
                conversation_id: conversation_id.clone(),
                content: message,
                role: None,
                metadata: None,
            };
            let sent = service
                .add_message_with_fallback(&user, &agent, &params)
                .await?;
            println!("✅ 已发送 ({} -> {})", sent.id, conversation_id);
        }
        Command::List { user } => {
            let conversations = service.list_conversations(&user).await?;
            for conv in &conversations {
                let marker = if conv.is_local_only() { "💾" } else { "🔄" };
                println!(
                    "{} {}  [{}]  {}  ({} 条消息)",
                    marker,
                    conv.id,
                    conv.agent_id,
                    conv.title,
                    conv.messages.len()
                );
            }
            println!("共 {} 个会话", conversations.len());
        }
        Command::Show { user, conversation } => {
            let conv = service.find_conversation_by_id(&user, &conversation).await?;
            println!("# {} ({})", conv.title, conv.id);
            for msg in &conv.messages {
                println!("[{}] {}", msg.role.as_str(), msg.content);
            }
        }
        Command::Sync { user } => {
            let report = service.sync_local_conversations(&user).await?;
            println!("✅ 同步完成：迁移 {} 个，失败 {} 个", report.migrated, report.failed);
        }
    }

    Ok(())
}
