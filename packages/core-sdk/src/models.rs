use serde::{Deserialize, Serialize};

/**
 * \brief 消息角色，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 单条对话消息。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 账户角色。admin 可管理用户、密钥与配置。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::User => "user",
        }
    }

    /** \brief 未知取值一律降级为普通用户。 */
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("admin") {
            UserRole::Admin
        } else {
            UserRole::User
        }
    }
}

/**
 * \brief 持久化的用户记录。`password` 为 argon2 PHC 串或旧版 SHA-256 十六进制摘要。
 */
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password: String,
    pub role: UserRole,
}

/**
 * \brief 已通过会话校验的调用方。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub username: String,
    pub role: UserRole,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/**
 * \brief 聊天接口的统一回复；失败时 `error` 给出错误类别，`reply` 仍携带可展示的文本。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub reply: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
