use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;

use crate::{
    config::ConfigStore,
    db,
    models::UserRole,
    prompt::DEFAULT_SYSTEM_PROMPT,
    telemetry,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub users_imported: usize,
    pub users_skipped: usize,
    pub keys_imported: usize,
    pub prompt_created: bool,
}

#[derive(Debug, Deserialize)]
struct LegacyConfig {
    #[serde(default)]
    api_keys: Vec<String>,
}

/**
 * \brief 导入旧版平面文件部署：用户 JSON、配置 JSON 与提示词文件。
 * \details 用户文件为 `{用户名: sha256 十六进制}`，`admin_user` 获得 admin 角色（不区分大小写），
 *          已存在的用户跳过；旧配置中的密钥去重后并入当前配置；提示词文件缺失时写入默认值。
 *          任一源文件不存在时跳过该步骤。
 */
pub fn import(
    conn: &Connection,
    store: &ConfigStore,
    users_file: &Path,
    config_file: &Path,
    prompt_file: &Path,
    admin_user: &str,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    if users_file.exists() {
        let raw = std::fs::read_to_string(users_file)
            .with_context(|| format!("read {} failed", users_file.display()))?;
        let users: BTreeMap<String, String> = serde_json::from_str(&raw)
            .with_context(|| format!("parse {} failed", users_file.display()))?;
        for (username, digest) in users {
            if db::get_user(conn, &username)?.is_some() {
                report.users_skipped += 1;
                continue;
            }
            let role = if username.eq_ignore_ascii_case(admin_user) {
                UserRole::Admin
            } else {
                UserRole::User
            };
            db::insert_user(conn, &username, &digest.to_ascii_lowercase(), role)?;
            telemetry::log_event("legacy", &format!("imported user {} ({})", username, role.as_str()));
            report.users_imported += 1;
        }
    } else {
        telemetry::log_event("legacy", &format!("{} not found, skipping users", users_file.display()));
    }

    if config_file.exists() {
        let raw = std::fs::read_to_string(config_file)
            .with_context(|| format!("read {} failed", config_file.display()))?;
        let legacy: LegacyConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parse {} failed", config_file.display()))?;
        report.keys_imported = store.modify(|config| {
            let mut added = 0;
            for key in legacy.api_keys.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
                if !config.api_keys.iter().any(|existing| existing == key) {
                    config.api_keys.push(key.to_string());
                    added += 1;
                }
            }
            Ok(added)
        })?;
        telemetry::log_event("legacy", &format!("imported {} api keys", report.keys_imported));
    } else {
        telemetry::log_event("legacy", &format!("{} not found, skipping keys", config_file.display()));
    }

    if !prompt_file.exists() {
        std::fs::write(prompt_file, DEFAULT_SYSTEM_PROMPT)
            .with_context(|| format!("write {} failed", prompt_file.display()))?;
        report.prompt_created = true;
    }

    Ok(report)
}
