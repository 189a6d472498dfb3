use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::Feature;

/**
 * \brief Provider 调用的错误分类。
 * \details HTTP 失败、鉴权问题、响应结构不符、能力缺失各自独立成型，调用方据此给出不同提示。
 */
#[derive(Debug, Error)]
pub enum ApiError {
    /** \brief 非 2xx 响应；Display 优先使用 Provider 返回的消息。 */
    #[error("{}", http_display(.status, .message))]
    Http { status: u16, message: Option<String> },

    #[error("API key rejected ({status}): {message}. Update it with `promptdeck init --api-key ...`")]
    Unauthorized { status: u16, message: String },

    #[error("No API key configured. Run `promptdeck init --api-key ...` or set PROMPTDECK_API_KEY")]
    MissingApiKey,

    #[error("unexpected response from {endpoint}: {source}")]
    Schema {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no data returned from {endpoint}")]
    NoData { endpoint: &'static str },

    #[error("provider does not support {0}")]
    Unsupported(Feature),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("media decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Serialize for ApiError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

fn http_display(status: &u16, message: &Option<String>) -> String {
    match message {
        Some(m) => m.clone(),
        None => format!("API error: {}", status),
    }
}

impl ApiError {
    /**
     * \brief 由状态码与响应体构造错误。
     * \details 依次尝试 `error.message`、字符串形式的 `error`、顶层 `message`；都没有时为 None。
     */
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = provider_message(body);
        if status == 401 || status == 403 {
            return ApiError::Unauthorized {
                status,
                message: message.unwrap_or_else(|| format!("API error: {}", status)),
            };
        }
        ApiError::Http { status, message }
    }

    /** \brief HTTP 状态码（仅对 HTTP 类错误有值）。 */
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } | ApiError::Unauthorized { status, .. } => Some(*status),
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /** \brief 是否属于需要用户去配置 API Key 的错误。 */
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ApiError::MissingApiKey | ApiError::Unauthorized { .. }
        )
    }
}

fn provider_message(body: &str) -> Option<String> {
    let v: Value = serde_json::from_str(body).ok()?;
    let msg = match v.get("error") {
        Some(Value::Object(obj)) => obj.get("message").and_then(|m| m.as_str()),
        Some(Value::String(s)) => Some(s.as_str()),
        _ => None,
    }
    .or_else(|| v.get("message").and_then(|m| m.as_str()))?;
    let msg = msg.trim();
    if msg.is_empty() {
        None
    } else {
        Some(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_message_wins_over_status() {
        let err = ApiError::from_status(404, r#"{"error":{"message":"x"}}"#);
        assert_eq!(err.to_string(), "x");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn test_empty_body_falls_back_to_status() {
        let err = ApiError::from_status(500, "");
        assert_eq!(err.to_string(), "API error: 500");
    }

    #[test]
    fn test_string_error_and_top_level_message() {
        assert_eq!(
            ApiError::from_status(400, r#"{"error":"bad prompt"}"#).to_string(),
            "bad prompt"
        );
        assert_eq!(
            ApiError::from_status(429, r#"{"message":"slow down"}"#).to_string(),
            "slow down"
        );
        assert_eq!(
            ApiError::from_status(502, "<html>gateway</html>").to_string(),
            "API error: 502"
        );
    }

    #[test]
    fn test_unauthorized_is_distinct() {
        let err = ApiError::from_status(401, r#"{"error":{"message":"invalid key"}}"#);
        assert!(err.is_auth());
        assert!(err.to_string().contains("invalid key"));
        assert!(err.to_string().contains("promptdeck init"));
        assert!(ApiError::MissingApiKey.is_auth());
    }

    #[test]
    fn test_serializes_as_display_string() {
        let err = ApiError::Unsupported(Feature::Upscale);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            serde_json::json!("provider does not support upscaling")
        );
    }
}
