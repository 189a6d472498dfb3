use std::{collections::HashMap, sync::Mutex};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};

pub const DEFAULT_API_BASE: &str = "https://api.venice.ai/api/v1";

pub const KEY_API_KEY: &str = "api_key";
pub const KEY_API_BASE: &str = "api_base";
pub const KEY_TEXT_MODEL: &str = "text_model";
pub const KEY_IMAGE_MODEL: &str = "image_model";
pub const KEY_VIDEO_MODEL: &str = "video_model";
pub const KEY_UPSCALE_MODEL: &str = "upscale_model";

/**
 * \brief 键值持久化适配器。
 * \details 生产环境使用 SQLite（见 `db::SqliteStore`），测试使用 `MemoryStore`。
 */
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

/**
 * \brief 纯内存实现。
 */
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let guard = self.inner.lock().map_err(|_| anyhow!("settings lock poisoned"))?;
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| anyhow!("settings lock poisoned"))?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| anyhow!("settings lock poisoned"))?;
        guard.remove(key);
        Ok(())
    }
}

/**
 * \brief 客户端会话配置，构造 `ProviderClient` 时按引用传入。
 */
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /** \brief API 基地址 */
    pub api_base: String,
    /** \brief API Key；缺失时所有请求在发出前失败 */
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub text_model: String,
    pub image_model: String,
    pub video_model: String,
    pub upscale_model: String,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            text_model: "llama-3.3-70b".to_string(),
            image_model: "flux-dev".to_string(),
            video_model: "wan-2.1-pro".to_string(),
            upscale_model: "upscaler".to_string(),
        }
    }
}

impl Session {
    pub fn new(api_base: &str, api_key: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: Some(api_key.to_string()).filter(|k| !k.trim().is_empty()),
            ..Self::default()
        }
    }

    /**
     * \brief 从持久化存储加载，缺省项回退到环境变量，再回退到内置默认值。
     */
    pub fn load(store: &dyn SettingsStore) -> Result<Session> {
        Self::resolve(store, |name| std::env::var(name).ok())
    }

    /**
     * \brief 同 `load`，环境变量来源可注入。
     */
    pub fn resolve<F>(store: &dyn SettingsStore, env: F) -> Result<Session>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |key: &str, var: &str| -> Result<Option<String>> {
            let stored = store.get(key)?.filter(|v| !v.trim().is_empty());
            Ok(stored.or_else(|| env(var).filter(|v| !v.trim().is_empty())))
        };

        let mut session = Session::default();
        if let Some(base) = pick(KEY_API_BASE, "PROMPTDECK_API_BASE")? {
            session.api_base = base.trim_end_matches('/').to_string();
        }
        session.api_key = pick(KEY_API_KEY, "PROMPTDECK_API_KEY")?;
        if let Some(m) = pick(KEY_TEXT_MODEL, "PROMPTDECK_TEXT_MODEL")? {
            session.text_model = m;
        }
        if let Some(m) = pick(KEY_IMAGE_MODEL, "PROMPTDECK_IMAGE_MODEL")? {
            session.image_model = m;
        }
        if let Some(m) = pick(KEY_VIDEO_MODEL, "PROMPTDECK_VIDEO_MODEL")? {
            session.video_model = m;
        }
        if let Some(m) = pick(KEY_UPSCALE_MODEL, "PROMPTDECK_UPSCALE_MODEL")? {
            session.upscale_model = m;
        }
        Ok(session)
    }

    /**
     * \brief 写回存储；api_key 为 None 时清除已存的 key。
     */
    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        store.set(KEY_API_BASE, &self.api_base)?;
        match &self.api_key {
            Some(key) => store.set(KEY_API_KEY, key)?,
            None => store.clear(KEY_API_KEY)?,
        }
        store.set(KEY_TEXT_MODEL, &self.text_model)?;
        store.set(KEY_IMAGE_MODEL, &self.image_model)?;
        store.set(KEY_VIDEO_MODEL, &self.video_model)?;
        store.set(KEY_UPSCALE_MODEL, &self.upscale_model)?;
        Ok(())
    }

    /**
     * \brief 清除存储中的 API Key。
     */
    pub fn forget_key(store: &dyn SettingsStore) -> Result<()> {
        store.clear(KEY_API_KEY)
    }

    pub fn api_key(&self) -> ApiResult<&str> {
        self.api_key.as_deref().ok_or(ApiError::MissingApiKey)
    }

    /** \brief 仅展示首尾的 key，用于界面回显。 */
    pub fn masked_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| {
            let chars: Vec<char> = k.chars().collect();
            if chars.len() <= 8 {
                "*".repeat(chars.len())
            } else {
                let head: String = chars[..4].iter().collect();
                let tail: String = chars[chars.len() - 4..].iter().collect();
                format!("{}…{}", head, tail)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_memory_store_get_set_clear() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.clear("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_stored_value_wins_over_env() {
        let store = MemoryStore::new();
        store.set(KEY_API_KEY, "stored-key").unwrap();
        let session = Session::resolve(&store, |name| match name {
            "PROMPTDECK_API_KEY" => Some("env-key".into()),
            "PROMPTDECK_API_BASE" => Some("https://env.example.com/v1/".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(session.api_key.as_deref(), Some("stored-key"));
        assert_eq!(session.api_base, "https://env.example.com/v1");
    }

    #[test]
    fn test_env_fallback_and_missing_key() {
        let store = MemoryStore::new();
        let session = Session::resolve(&store, no_env).unwrap();
        assert_eq!(session.api_base, DEFAULT_API_BASE);
        assert!(matches!(session.api_key(), Err(ApiError::MissingApiKey)));

        let session =
            Session::resolve(&store, |n| (n == "PROMPTDECK_API_KEY").then(|| "env".into()))
                .unwrap();
        assert_eq!(session.api_key().unwrap(), "env");
    }

    #[test]
    fn test_save_then_forget() {
        let store = MemoryStore::new();
        let mut session = Session::new("https://api.example.com/", "sk-abcdefgh1234");
        session.image_model = "sdxl".into();
        session.save(&store).unwrap();

        let loaded = Session::resolve(&store, no_env).unwrap();
        assert_eq!(loaded.api_base, "https://api.example.com");
        assert_eq!(loaded.image_model, "sdxl");
        assert_eq!(loaded.masked_key().as_deref(), Some("sk-a…1234"));

        Session::forget_key(&store).unwrap();
        let loaded = Session::resolve(&store, no_env).unwrap();
        assert!(loaded.api_key.is_none());
    }
}
