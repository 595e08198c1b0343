use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use relaychat_core_sdk::{
    auth,
    chat::ChatService,
    config::{ConfigStore, Settings},
    db, extract, legacy,
    llm::UpstreamClient,
    models::UserRole,
    prompt::{self, SystemPrompt},
    server, telemetry,
};

/**
 * \brief CLI 程序入口。路径类设置来自 RELAYCHAT_* 环境变量。
 */
#[derive(Parser, Debug)]
#[command(name = "relaychat", version, about = "RelayChat web front-end for chat-completion APIs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5000")]
        addr: String,
    },

    /**
     * \brief 写入上游配置（追加密钥并设为当前，设置模型与地址）。
     */
    Init {
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        base_url: Option<String>,
    },

    /**
     * \brief 新增登录账户。
     */
    Useradd {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
    },

    /**
     * \brief 导入旧版账户文件、密钥与提示词。
     */
    Migrate {
        #[arg(long)]
        users_file: PathBuf,
        #[arg(long)]
        config_file: PathBuf,
        /** \brief 获得 admin 角色的用户名。 */
        #[arg(long)]
        admin: String,
    },

    /**
     * \brief 发送一条消息（可附带文档）并打印回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        attach: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    telemetry::init(settings.audit_log);

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr, settings).await?;
        }
        Commands::Init {
            api_key,
            model,
            base_url,
        } => {
            let store = ConfigStore::load(&settings.config_path).context("load config failed")?;
            let config = store
                .modify(|config| {
                    let key_index = match config.api_keys.iter().position(|k| *k == api_key) {
                        Some(idx) => idx,
                        None => {
                            config.api_keys.push(api_key.clone());
                            config.api_keys.len() - 1
                        }
                    };
                    config.models = vec![model.clone()];
                    if let Some(base_url) = &base_url {
                        config.base_url = base_url.clone();
                    }
                    config.active_key_index = Some(key_index);
                    config.active_model_index = Some(0);
                    Ok(())
                })
                .map(|_| store.get())
                .context("save config failed")?;
            println!(
                "Saved config to {} (keys={} | {} | {})",
                settings.config_path.display(),
                config.api_keys.len(),
                config.base_url,
                model
            );
        }
        Commands::Useradd {
            username,
            password,
            admin,
        } => {
            let conn = db::open(&settings.db_path).context("open database failed")?;
            db::migrate(&conn).context("apply migrations failed")?;
            let role = if admin { UserRole::Admin } else { UserRole::User };
            let hash = auth::hash_password(&password)?;
            db::insert_user(&conn, &username, &hash, role).context("create user failed")?;
            println!("Created user {} ({})", username, role.as_str());
        }
        Commands::Migrate {
            users_file,
            config_file,
            admin,
        } => {
            let conn = db::open(&settings.db_path).context("open database failed")?;
            db::migrate(&conn).context("apply migrations failed")?;
            let store = ConfigStore::load(&settings.config_path).context("load config failed")?;
            let report = legacy::import(
                &conn,
                &store,
                &users_file,
                &config_file,
                &settings.prompt_path,
                &admin,
            )
            .context("legacy import failed")?;
            println!(
                "Imported users={} (skipped {}), api keys={}, prompt created={}",
                report.users_imported,
                report.users_skipped,
                report.keys_imported,
                report.prompt_created
            );
        }
        Commands::Chat { prompt: text, attach } => {
            let store = Arc::new(
                ConfigStore::load(&settings.config_path).context("load config failed")?,
            );
            let client = UpstreamClient::new(
                settings.upstream_timeout,
                &settings.referer,
                &settings.title,
            )?;
            let service =
                ChatService::new(store, SystemPrompt::from_file(&settings.prompt_path), client);

            let message = match attach {
                Some(path) => {
                    let doc = extract::extract(&path)
                        .with_context(|| format!("extract {} failed", path.display()))?;
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    prompt::with_attachment(&text, &name, &doc)
                }
                None => text,
            };

            let envelope = ChatService::envelope(service.respond(Vec::new(), &message).await);
            println!("{}", envelope.reply);
            if let Some(kind) = envelope.error {
                anyhow::bail!("chat failed ({})", kind);
            }
        }
    }

    Ok(())
}
