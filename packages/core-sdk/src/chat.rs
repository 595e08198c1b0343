use std::sync::Arc;

use crate::{
    config::{select_credentials, ConfigStore},
    llm::{ChatError, UpstreamClient},
    models::{Message, ReplyEnvelope},
    prompt::{self, SystemPrompt},
    telemetry,
};

/**
 * \brief 聊天编排：选择凭据与模型 → 组装对话 → 调用上游。
 */
pub struct ChatService {
    config: Arc<ConfigStore>,
    prompt: SystemPrompt,
    client: UpstreamClient,
}

impl ChatService {
    pub fn new(config: Arc<ConfigStore>, prompt: SystemPrompt, client: UpstreamClient) -> Self {
        Self {
            config,
            prompt,
            client,
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /**
     * \brief 处理一轮用户消息。每次调用都读取最新配置快照与系统提示词。
     */
    pub async fn respond(&self, history: Vec<Message>, message: &str) -> Result<String, ChatError> {
        let config = self.config.get();
        let (credential, model) = select_credentials(&config);
        let system = self.prompt.load().await;
        let conversation = prompt::compose(&system, history, message);

        telemetry::log_event(
            "chat",
            &format!(
                "request -> base={} model={} msgs={} key_set={}",
                config.base_url,
                model,
                conversation.len(),
                !credential.is_empty()
            ),
        );

        let result = self
            .client
            .complete(
                &config.base_url,
                &credential,
                &model,
                &conversation,
                Some(config.effective_max_tokens()),
            )
            .await;
        if let Err(e) = &result {
            telemetry::log_error("chat", &format!("model={} failed: {}", model, e));
        }
        result
    }

    /** \brief 将结果渲染为统一回复，错误只在此处转成文本。 */
    pub fn envelope(result: Result<String, ChatError>) -> ReplyEnvelope {
        match result {
            Ok(reply) => ReplyEnvelope { reply, error: None },
            Err(e) => ReplyEnvelope {
                reply: e.to_string(),
                error: Some(e.kind().to_string()),
            },
        }
    }
}
