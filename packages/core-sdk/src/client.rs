use std::{path::Path, pin::Pin, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::Stream;
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    Response,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Session,
    error::{ApiError, ApiResult},
    models::{
        Capabilities, ChatMessage, ChatRequest, Feature, ImageRequest, MediaPayload,
        ModelDescriptor, Role, UpscaleRequest, VideoRequest,
    },
    sse::{self, Completion, Finish},
    telemetry,
};

const EP_CHAT: &str = "/chat/completions";
const EP_IMAGE: &str = "/image/generate";
const EP_VIDEO: &str = "/image/video";
const EP_UPSCALE: &str = "/image/upscale";
const EP_MODELS: &str = "/models";

pub type DeltaStream = Pin<Box<dyn Stream<Item = ApiResult<String>> + Send>>;

/**
 * \brief Provider HTTP 客户端。
 * \details 克隆开销很小：底层连接池与能力探测缓存共享。
 */
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    capabilities: Arc<OnceCell<Capabilities>>,
}

#[derive(Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: Role,
    content: WireContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

impl<'a> WireChatRequest<'a> {
    fn from_request(req: &'a ChatRequest, stream: bool) -> Self {
        let messages = req
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role,
                content: match &m.image {
                    None => WireContent::Text(&m.content),
                    Some(image) => WireContent::Parts(vec![
                        ContentPart::Text { text: &m.content },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: image.as_data_url("image/png"),
                            },
                        },
                    ]),
                },
            })
            .collect();
        Self {
            model: &req.model,
            messages,
            stream,
            temperature: req.temperature,
            response_format: req.response_format.as_ref(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct VideoResponse {
    #[serde(default)]
    video: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelList {
    Wrapped { data: Vec<ModelDescriptor> },
    Bare(Vec<ModelDescriptor>),
}

impl ProviderClient {
    /**
     * \brief 由会话配置构造客户端。
     */
    pub fn new(session: &Session) -> ApiResult<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            api_base: session.api_base.trim_end_matches('/').to_string(),
            api_key: session.api_key.clone(),
            capabilities: Arc::new(OnceCell::new()),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.api_base, endpoint)
    }

    fn bearer(&self) -> ApiResult<String> {
        let key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ApiError::MissingApiKey)?;
        Ok(format!("Bearer {}", key))
    }

    async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> ApiResult<Response> {
        let auth = self.bearer()?;
        let resp = self
            .http
            .post(self.url(endpoint))
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, auth)
            .json(body)
            .send()
            .await?;
        ensure_success(resp).await
    }

    /**
     * \brief 非流式聊天补全，返回 `choices[0].message.content`。
     */
    pub async fn chat_once(&self, req: &ChatRequest) -> ApiResult<String> {
        req.validate()?;
        let body = WireChatRequest::from_request(req, false);
        telemetry::log_event(
            "client.chat",
            &format!("model={} msgs={} stream=false", req.model, req.messages.len()),
        );
        let resp = self.post(EP_CHAT, &body).await?;
        let parsed: ChatCompletionResponse = read_schema(EP_CHAT, resp).await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ApiError::NoData { endpoint: EP_CHAT })
    }

    /**
     * \brief 便捷接口：系统指令 + 历史消息，一次性返回回复。
     */
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        system: Option<&str>,
    ) -> ApiResult<String> {
        let req = ChatRequest::new(model, with_system(messages, system));
        self.chat_once(&req).await
    }

    /**
     * \brief 流式补全，以 Stream 形式返回增量。
     */
    pub async fn stream_chat(
        &self,
        req: &ChatRequest,
        cancel: CancellationToken,
    ) -> ApiResult<DeltaStream> {
        req.validate()?;
        let body = WireChatRequest::from_request(req, true);
        telemetry::log_event(
            "client.chat",
            &format!("model={} msgs={} stream=true", req.model, req.messages.len()),
        );
        let resp = self.post(EP_CHAT, &body).await?;
        let bytes = Box::pin(resp.bytes_stream());
        Ok(Box::pin(sse::delta_stream(bytes, cancel)))
    }

    /**
     * \brief 流式补全，每个增量立即交给回调，返回累计文本。
     * \details 取消令牌在建立连接期间触发同样生效。
     */
    pub async fn stream_chat_with<F>(
        &self,
        req: &ChatRequest,
        cancel: &CancellationToken,
        on_delta: F,
    ) -> ApiResult<Completion>
    where
        F: FnMut(&str),
    {
        req.validate()?;
        let body = WireChatRequest::from_request(req, true);
        telemetry::log_event(
            "client.chat",
            &format!("model={} msgs={} stream=true", req.model, req.messages.len()),
        );
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(Completion { text: String::new(), finish: Finish::Cancelled, malformed: 0 });
            }
            resp = self.post(EP_CHAT, &body) => resp?,
        };
        let completion = sse::consume(Box::pin(resp.bytes_stream()), cancel, on_delta).await?;
        if completion.malformed > 0 {
            telemetry::log_warn(
                "client.chat",
                &format!(
                    "model={} skipped {} malformed events",
                    req.model, completion.malformed
                ),
            );
        }
        Ok(completion)
    }

    /**
     * \brief 视觉分析：把图片作为 image_url 内容块随问题发送。
     */
    pub async fn analyze_image(
        &self,
        model: &str,
        image: MediaPayload,
        question: &str,
    ) -> ApiResult<String> {
        if image.is_empty() {
            return Err(ApiError::Invalid("image must not be empty".into()));
        }
        self.ensure(Feature::Vision).await?;
        let req = ChatRequest::new(model, vec![ChatMessage::user(question).with_image(image)]);
        self.chat_once(&req).await
    }

    /**
     * \brief 文生图，返回 `images[0]`。
     */
    pub async fn generate_image(&self, req: &ImageRequest) -> ApiResult<MediaPayload> {
        req.validate()?;
        telemetry::log_event(
            "client.image",
            &format!(
                "model={} size={}x{} prompt_len={}",
                req.model,
                req.width,
                req.height,
                req.prompt.len()
            ),
        );
        let resp = self.post(EP_IMAGE, req).await?;
        read_media(EP_IMAGE, resp, "image/", |v: ImagesResponse| {
            v.images.into_iter().find(|s| !s.trim().is_empty())
        })
        .await
    }

    /**
     * \brief 图生视频（beta），返回 `video` 或 `url`。
     */
    pub async fn image_to_video(&self, req: &VideoRequest) -> ApiResult<MediaPayload> {
        req.validate()?;
        self.ensure(Feature::Video).await?;
        telemetry::log_event(
            "client.video",
            &format!(
                "model={} duration={}s size={}x{}",
                req.model, req.duration_seconds, req.width, req.height
            ),
        );
        let resp = self
            .post(EP_VIDEO, req)
            .await
            .map_err(unsupported_on_404(Feature::Video))?;
        read_media(EP_VIDEO, resp, "video/", |v: VideoResponse| {
            v.video
                .filter(|s| !s.trim().is_empty())
                .or(v.url.filter(|s| !s.trim().is_empty()))
        })
        .await
    }

    /**
     * \brief 放大已有图片。
     */
    pub async fn upscale_image(&self, req: &UpscaleRequest) -> ApiResult<MediaPayload> {
        req.validate()?;
        self.ensure(Feature::Upscale).await?;
        telemetry::log_event(
            "client.upscale",
            &format!("model={} scale={}", req.model, req.scale),
        );
        let resp = self
            .post(EP_UPSCALE, req)
            .await
            .map_err(unsupported_on_404(Feature::Upscale))?;
        read_media(EP_UPSCALE, resp, "image/", |v: ImagesResponse| {
            v.images.into_iter().find(|s| !s.trim().is_empty())
        })
        .await
    }

    /**
     * \brief 列出 Provider 可用模型；兼容 `{data: [...]}` 与裸数组。
     */
    pub async fn list_models(&self) -> ApiResult<Vec<ModelDescriptor>> {
        let auth = self.bearer()?;
        let resp = self
            .http
            .get(self.url(EP_MODELS))
            .header(AUTHORIZATION, auth)
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        let list: ModelList = read_schema(EP_MODELS, resp).await?;
        Ok(match list {
            ModelList::Wrapped { data } => data,
            ModelList::Bare(items) => items,
        })
    }

    /**
     * \brief 能力探测：根据模型列表判断各项功能是否可用，成功结果会被缓存。
     */
    pub async fn probe_capabilities(&self) -> ApiResult<Capabilities> {
        let caps = self
            .capabilities
            .get_or_try_init(|| async {
                let models = self.list_models().await?;
                Ok::<_, ApiError>(Capabilities::from_models(&models))
            })
            .await?;
        telemetry::log_event("client.probe", &format!("{:?}", caps));
        Ok(*caps)
    }

    /** \brief 已缓存的探测结果（未探测时为 None）。 */
    pub fn cached_capabilities(&self) -> Option<Capabilities> {
        self.capabilities.get().copied()
    }

    /**
     * \brief 发请求前确认 Provider 提供该功能，首次调用时触发能力探测。
     * \details 鉴权错误直接返回；探测本身不可用时放行，由端点的 404 兜底。
     */
    async fn ensure(&self, feature: Feature) -> ApiResult<()> {
        match self.probe_capabilities().await {
            Ok(caps) if caps.has(feature) => Ok(()),
            Ok(_) => Err(ApiError::Unsupported(feature)),
            Err(e) if e.is_auth() => Err(e),
            Err(e) => {
                telemetry::log_warn(
                    "client.probe",
                    &format!("probe unavailable, trying {} anyway: {}", feature, e),
                );
                Ok(())
            }
        }
    }

    /**
     * \brief 取得媒体字节：base64 直接解码，URL 用同一连接池下载。
     */
    pub async fn fetch_media(&self, media: &MediaPayload) -> ApiResult<Vec<u8>> {
        match media {
            MediaPayload::Base64(b64) => Ok(STANDARD.decode(b64.trim())?),
            MediaPayload::Url(url) => {
                let resp = ensure_success(self.http.get(url).send().await?).await?;
                Ok(resp.bytes().await?.to_vec())
            }
        }
    }

    /**
     * \brief 把媒体写入文件，返回写入字节数。
     */
    pub async fn save_media(&self, media: &MediaPayload, path: &Path) -> ApiResult<usize> {
        let bytes = self.fetch_media(media).await?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len())
    }
}

fn with_system(messages: &[ChatMessage], system: Option<&str>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(sys) = system.filter(|s| !s.trim().is_empty()) {
        out.push(ChatMessage::system(sys));
    }
    out.extend(messages.iter().cloned());
    out
}

/** \brief 媒体端点返回 404 视为 Provider 未开放该功能。 */
fn unsupported_on_404(feature: Feature) -> impl FnOnce(ApiError) -> ApiError {
    move |e| match e.status() {
        Some(404) => ApiError::Unsupported(feature),
        _ => e,
    }
}

async fn ensure_success(resp: Response) -> ApiResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let err = ApiError::from_status(status.as_u16(), &text);
    telemetry::log_error("client.http", &format!("{} -> {}", status, err));
    Err(err)
}

async fn read_schema<R: DeserializeOwned>(endpoint: &'static str, resp: Response) -> ApiResult<R> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|source| ApiError::Schema { endpoint, source })
}

/**
 * \brief 解析媒体响应：二进制响应体直接转为 base64，JSON 响应按 schema 提取。
 */
async fn read_media<R, F>(
    endpoint: &'static str,
    resp: Response,
    binary_prefix: &str,
    extract: F,
) -> ApiResult<MediaPayload>
where
    R: DeserializeOwned,
    F: FnOnce(R) -> Option<String>,
{
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if content_type.starts_with(binary_prefix) || content_type == "application/octet-stream" {
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::NoData { endpoint });
        }
        return Ok(MediaPayload::Base64(STANDARD.encode(&bytes)));
    }
    let parsed: R = read_schema(endpoint, resp).await?;
    extract(parsed)
        .map(|raw| MediaPayload::from_provider(&raw))
        .ok_or(ApiError::NoData { endpoint })
}
