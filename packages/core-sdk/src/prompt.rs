use std::{io::ErrorKind, path::PathBuf};

use crate::{
    models::{Message, Role},
    telemetry,
};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI.";

/**
 * \brief 系统提示词来源：文本文件，每次调用读取一次；文件缺失时使用内置默认值。
 */
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    path: PathBuf,
}

impl SystemPrompt {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> String {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => DEFAULT_SYSTEM_PROMPT.to_string(),
            Err(e) => {
                telemetry::log_error(
                    "prompt",
                    &format!("read {} failed, using default: {}", self.path.display(), e),
                );
                DEFAULT_SYSTEM_PROMPT.to_string()
            }
        }
    }
}

/**
 * \brief 组装对话：system + 历史（原样保序）+ 新用户消息。
 */
pub fn compose(system: &str, history: Vec<Message>, message: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system));
    messages.extend(history);
    messages.push(Message::user(message));
    messages
}

/**
 * \brief 历史中不允许再出现 system 消息，保证对话只有一条 system 且位于首位。
 */
pub fn validate_history(history: &[Message]) -> Result<(), String> {
    match history.iter().position(|m| m.role == Role::System) {
        Some(idx) => Err(format!(
            "history[{}] has role 'system'; only user/assistant turns are accepted",
            idx
        )),
        None => Ok(()),
    }
}

/** \brief 将抽取出的文档正文拼接到用户消息之后。 */
pub fn with_attachment(message: &str, name: &str, text: &str) -> String {
    format!(
        "{}\n\n--- Attached document: {} ---\n{}\n--- End of document ---",
        message,
        name,
        text.trim_end()
    )
}
