use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ApiError, ApiResult};

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

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /** \brief 从存储中的字符串还原角色；未知值视为 user。 */
    pub fn parse(s: &str) -> Role {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            _ => Role::User,
        }
    }
}

/**
 * \brief 对话中的一条消息。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色 */
    pub role: Role,
    /** \brief 文本内容；流式回复期间逐步填充 */
    pub content: String,
    /** \brief 助手占位消息，内容仍在流式生成中 */
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thinking: bool,
    /** \brief 视觉分析时随消息附带的图片 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaPayload>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: false,
            image: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /** \brief 附带一张图片（用于视觉分析）。 */
    pub fn with_image(mut self, image: MediaPayload) -> Self {
        self.image = Some(image);
        self
    }
}

/**
 * \brief 有序对话列表。
 * \details 只追加；唯一的原地修改是向最后一条 thinking 占位消息填充流式内容。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /** \brief 追加一条空的助手占位消息。 */
    pub fn begin_assistant(&mut self) {
        let mut msg = ChatMessage::assistant(String::new());
        msg.thinking = true;
        self.messages.push(msg);
    }

    /**
     * \brief 向当前占位消息追加增量。
     * \return 没有进行中的占位消息时返回 false。
     */
    pub fn append_delta(&mut self, delta: &str) -> bool {
        match self.messages.last_mut() {
            Some(last) if last.thinking => {
                last.content.push_str(delta);
                true
            }
            _ => false,
        }
    }

    /** \brief 结束当前占位消息，返回其最终内容。 */
    pub fn finish_assistant(&mut self) -> Option<&str> {
        match self.messages.last_mut() {
            Some(last) if last.thinking => {
                last.thinking = false;
                Some(last.content.as_str())
            }
            _ => None,
        }
    }

    /** \brief 丢弃进行中的占位消息（请求失败时使用）。 */
    pub fn abandon_assistant(&mut self) {
        if self.messages.last().map(|m| m.thinking).unwrap_or(false) {
            self.messages.pop();
        }
    }

    /**
     * \brief 生成发往 Provider 的消息序列：系统指令在前，跳过空的占位消息。
     */
    pub fn to_provider_messages(&self, system: Option<&str>) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(sys) = system.filter(|s| !s.trim().is_empty()) {
            out.push(ChatMessage::system(sys));
        }
        out.extend(
            self.messages
                .iter()
                .filter(|m| !(m.thinking && m.content.is_empty()))
                .cloned(),
        );
        out
    }
}

/**
 * \brief Provider 返回的媒体：base64 内容或可下载地址。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MediaPayload {
    Base64(String),
    Url(String),
}

impl MediaPayload {
    /** \brief 以 http(s) 开头视为 URL，否则视为 base64（去掉 data: 前缀）。 */
    pub fn from_provider(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return MediaPayload::Url(raw.to_string());
        }
        let data = match raw.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, b)| b).unwrap_or(rest),
            None => raw,
        };
        MediaPayload::Base64(data.to_string())
    }

    /** \brief 本地文件内容转为 base64 载荷。 */
    pub fn from_bytes(bytes: &[u8]) -> Self {
        MediaPayload::Base64(STANDARD.encode(bytes))
    }

    /** \brief 作为 image_url 内容块使用的地址。 */
    pub fn as_data_url(&self, mime: &str) -> String {
        match self {
            MediaPayload::Url(url) => url.clone(),
            MediaPayload::Base64(b64) => format!("data:{};base64,{}", mime, b64),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MediaPayload::Base64(s) | MediaPayload::Url(s) => s.trim().is_empty(),
        }
    }
}

/**
 * \brief Provider 可选能力。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Chat,
    Image,
    Video,
    Upscale,
    Vision,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feature::Chat => "chat",
            Feature::Image => "image generation",
            Feature::Video => "image-to-video",
            Feature::Upscale => "upscaling",
            Feature::Vision => "vision analysis",
        };
        f.write_str(name)
    }
}

/**
 * \brief GET /models 返回的模型描述。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    /** \brief 模型类型：text / image / video / upscale ... */
    #[serde(rename = "type", default)]
    pub kind: String,
    /** \brief 能力标签；兼容字符串数组与 `{name: bool}` 两种写法 */
    #[serde(default, deserialize_with = "capability_list")]
    pub capabilities: Vec<String>,
}

impl ModelDescriptor {
    /** \brief 模型是否提供某项能力（类型或能力标签命中即可）。 */
    pub fn supports(&self, feature: Feature) -> bool {
        let names: &[&str] = match feature {
            Feature::Chat => &["text", "chat"],
            Feature::Image => &["image"],
            Feature::Video => &["video"],
            Feature::Upscale => &["upscale"],
            Feature::Vision => &["vision", "supportsvision"],
        };
        let kind = self.kind.to_ascii_lowercase();
        names.iter().any(|n| kind == *n)
            || self
                .capabilities
                .iter()
                .any(|c| names.contains(&c.to_ascii_lowercase().as_str()))
    }
}

fn capability_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(match v {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|i| i.as_str().map(|s| s.to_string()))
            .collect(),
        Value::Object(map) => map
            .into_iter()
            .filter(|(_, v)| v.as_bool().unwrap_or(false))
            .map(|(k, _)| k)
            .collect(),
        _ => Vec::new(),
    })
}

/**
 * \brief 能力探测结果，取代以 404 判断端点是否存在的做法。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub chat: bool,
    pub image: bool,
    pub video: bool,
    pub upscale: bool,
    pub vision: bool,
}

impl Capabilities {
    pub fn from_models(models: &[ModelDescriptor]) -> Self {
        let any = |f: Feature| models.iter().any(|m| m.supports(f));
        Self {
            chat: any(Feature::Chat),
            image: any(Feature::Image),
            video: any(Feature::Video),
            upscale: any(Feature::Upscale),
            vision: any(Feature::Vision),
        }
    }

    pub fn has(&self, feature: Feature) -> bool {
        match feature {
            Feature::Chat => self.chat,
            Feature::Image => self.image,
            Feature::Video => self.video,
            Feature::Upscale => self.upscale,
            Feature::Vision => self.vision,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/**
 * \brief 画幅比例，宽高以 1024 基准给出。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectRatio {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub fn new(label: &str, width: u32, height: u32) -> Self {
        Self {
            label: label.to_string(),
            width,
            height,
        }
    }

    /** \brief 内置比例列表。 */
    pub fn presets() -> Vec<AspectRatio> {
        vec![
            AspectRatio::new("1:1", 1024, 1024),
            AspectRatio::new("16:9", 1024, 576),
            AspectRatio::new("9:16", 576, 1024),
            AspectRatio::new("4:3", 1024, 768),
            AspectRatio::new("3:4", 768, 1024),
        ]
    }

    pub fn find(label: &str) -> Option<AspectRatio> {
        Self::presets().into_iter().find(|a| a.label == label)
    }

    /**
     * \brief 按分辨率档位线性放大：两边同乘 `tier.base / 1024`，四舍五入到像素。
     */
    pub fn scaled(&self, tier: &ResolutionTier) -> Dimensions {
        let factor = tier.base as f64 / 1024.0;
        Dimensions {
            width: (self.width as f64 * factor).round() as u32,
            height: (self.height as f64 * factor).round() as u32,
        }
    }
}

/**
 * \brief 分辨率档位：基准像素与单张成本估算（仅展示，不做预算控制）。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionTier {
    pub label: String,
    pub base: u32,
    pub cost_per_image: f64,
}

impl ResolutionTier {
    pub fn new(label: &str, base: u32, cost_per_image: f64) -> Self {
        Self {
            label: label.to_string(),
            base,
            cost_per_image,
        }
    }

    pub fn presets() -> Vec<ResolutionTier> {
        vec![
            ResolutionTier::new("1K", 1024, 0.01),
            ResolutionTier::new("2K", 2048, 0.02),
            ResolutionTier::new("4K", 4096, 0.05),
        ]
    }

    pub fn find(label: &str) -> Option<ResolutionTier> {
        Self::presets()
            .into_iter()
            .find(|t| t.label.eq_ignore_ascii_case(label))
    }
}

/**
 * \brief 风格/画廊条目，只读参考数据。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleEntry {
    pub id: String,
    pub title: String,
    pub category: String,
    pub description: String,
    pub example_prompt: String,
    pub preview: String,
}

impl StyleEntry {
    pub fn validate(&self) -> ApiResult<()> {
        require("id", &self.id)?;
        require("title", &self.title)?;
        require("category", &self.category)?;
        require("example_prompt", &self.example_prompt)?;
        Ok(())
    }
}

/**
 * \brief 聊天补全请求体。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            temperature: None,
            response_format: None,
        }
    }

    pub fn validate(&self) -> ApiResult<()> {
        require("model", &self.model)?;
        if self.messages.is_empty() {
            return Err(ApiError::Invalid("messages must not be empty".into()));
        }
        Ok(())
    }
}

/**
 * \brief 文生图请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(
        default,
        rename = "style_preset",
        skip_serializing_if = "Option::is_none"
    )]
    pub style: Option<String>,
}

impl ImageRequest {
    pub fn validate(&self) -> ApiResult<()> {
        require("model", &self.model)?;
        require("prompt", &self.prompt)?;
        positive(self.width, self.height)
    }
}

/**
 * \brief 图生视频请求体（beta）。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoRequest {
    pub model: String,
    /** \brief 源图片 base64 */
    pub image: String,
    pub prompt: String,
    pub duration_seconds: u32,
    pub width: u32,
    pub height: u32,
}

impl VideoRequest {
    pub fn validate(&self) -> ApiResult<()> {
        require("model", &self.model)?;
        require("image", &self.image)?;
        require("prompt", &self.prompt)?;
        if self.duration_seconds == 0 {
            return Err(ApiError::Invalid("duration_seconds must be > 0".into()));
        }
        positive(self.width, self.height)
    }
}

/**
 * \brief 放大请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscaleRequest {
    pub model: String,
    pub image: String,
    pub scale: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl UpscaleRequest {
    pub fn validate(&self) -> ApiResult<()> {
        require("model", &self.model)?;
        require("image", &self.image)?;
        if self.scale < 2 {
            return Err(ApiError::Invalid("scale must be >= 2".into()));
        }
        Ok(())
    }
}

fn require(field: &str, value: &str) -> ApiResult<()> {
    if value.trim().is_empty() {
        return Err(ApiError::Invalid(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn positive(width: u32, height: u32) -> ApiResult<()> {
    if width == 0 || height == 0 {
        return Err(ApiError::Invalid(format!(
            "dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_dimensions_follow_tier_base() {
        let ratio = AspectRatio::new("16:9", 1024, 576);
        let tier = ResolutionTier::new("2K", 2048, 0.02);
        assert_eq!(
            ratio.scaled(&tier),
            Dimensions {
                width: 2048,
                height: 1152
            }
        );
        let one_k = ResolutionTier::find("1k").unwrap();
        assert_eq!(ratio.scaled(&one_k).width, 1024);
    }

    #[test]
    fn test_conversation_streaming_lifecycle() {
        let mut conv = Conversation::new();
        conv.push_user("make a prompt");
        conv.begin_assistant();
        assert!(conv.append_delta("Hel"));
        assert!(conv.append_delta("lo"));
        assert_eq!(conv.finish_assistant(), Some("Hello"));
        assert!(!conv.append_delta("late"));
        assert_eq!(conv.messages()[1].content, "Hello");
        assert!(!conv.messages()[1].thinking);
    }

    #[test]
    fn test_provider_messages_skip_empty_placeholder() {
        let mut conv = Conversation::new();
        conv.push_user("hi");
        conv.begin_assistant();
        let msgs = conv.to_provider_messages(Some("be terse"));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);

        conv.abandon_assistant();
        assert_eq!(conv.len(), 1);
    }

    #[test]
    fn test_thinking_flag_not_serialized() {
        let mut msg = ChatMessage::assistant("x");
        let v = serde_json::to_value(&msg).unwrap();
        assert!(v.get("thinking").is_none());
        msg.thinking = true;
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["thinking"], true);
    }

    #[test]
    fn test_media_payload_detection() {
        assert_eq!(
            MediaPayload::from_provider("https://cdn.example.com/a.png"),
            MediaPayload::Url("https://cdn.example.com/a.png".into())
        );
        assert_eq!(
            MediaPayload::from_provider("data:image/png;base64,QUJD"),
            MediaPayload::Base64("QUJD".into())
        );
        assert_eq!(
            MediaPayload::from_provider("QUJD"),
            MediaPayload::Base64("QUJD".into())
        );
        assert_eq!(MediaPayload::from_bytes(b"ABC"), MediaPayload::Base64("QUJD".into()));
    }

    #[test]
    fn test_capabilities_from_descriptors() {
        let models: Vec<ModelDescriptor> = serde_json::from_value(serde_json::json!([
            {"id": "llama", "type": "text", "capabilities": {"supportsVision": true}},
            {"id": "flux", "type": "image"},
            {"id": "upscaler", "type": "upscale", "capabilities": ["upscale"]}
        ]))
        .unwrap();
        let caps = Capabilities::from_models(&models);
        assert!(caps.chat && caps.image && caps.upscale && caps.vision);
        assert!(!caps.video);
        assert!(!caps.has(Feature::Video));
    }

    #[test]
    fn test_request_validation() {
        let req = ImageRequest {
            model: "flux".into(),
            prompt: "  ".into(),
            width: 1024,
            height: 1024,
            steps: None,
            format: None,
            style: None,
        };
        assert!(matches!(req.validate(), Err(ApiError::Invalid(_))));

        let style = StyleEntry {
            id: "noir".into(),
            title: "Noir".into(),
            category: "film".into(),
            description: String::new(),
            example_prompt: "rain-soaked street".into(),
            preview: String::new(),
        };
        assert!(style.validate().is_ok());
    }
}
