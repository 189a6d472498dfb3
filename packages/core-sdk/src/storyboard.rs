use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use crate::{
    client::ProviderClient,
    error::{ApiError, ApiResult},
    fanout::{fan_out, Slot},
    models::{AspectRatio, Dimensions, ImageRequest, MediaPayload, ResolutionTier, VideoRequest},
    telemetry,
};

/**
 * \brief 歌词分段：以空行分隔，id 从 1 开始。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub id: u32,
    pub lines: Vec<String>,
}

impl Segment {
    pub fn text(&self) -> String {
        self.lines.join(" / ")
    }
}

/**
 * \brief 把歌词切成段落；全空白输入返回空列表。
 */
pub fn split_lyrics(text: &str) -> Vec<Segment> {
    fn flush(current: &mut Vec<String>, segments: &mut Vec<Segment>) {
        if !current.is_empty() {
            segments.push(Segment {
                id: segments.len() as u32 + 1,
                lines: std::mem::take(current),
            });
        }
    }

    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            flush(&mut current, &mut segments);
        } else {
            current.push(line.to_string());
        }
    }
    flush(&mut current, &mut segments);
    segments
}

/**
 * \brief 单段歌词对应的图像提示词。
 */
pub fn segment_prompt(segment: &Segment, style: Option<&str>) -> String {
    let mut prompt = format!(
        "Cinematic storyboard frame illustrating the lyrics: \"{}\"",
        segment.text()
    );
    if let Some(style) = style.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!(", in {} style", style.trim()));
    }
    prompt
}

#[derive(Debug, Clone)]
pub struct StoryboardOptions {
    pub model: String,
    pub aspect: AspectRatio,
    pub tier: ResolutionTier,
    pub style: Option<String>,
    pub steps: Option<u32>,
}

/**
 * \brief 一次渲染的结果：按段落 id 排列的图片槽位与成本估算。
 */
#[derive(Debug, Serialize)]
pub struct RenderedStoryboard {
    pub frames: Vec<Slot<u32, MediaPayload>>,
    pub dimensions: Dimensions,
    pub estimated_cost: f64,
}

impl RenderedStoryboard {
    pub fn failed(&self) -> usize {
        self.frames.iter().filter(|f| !f.is_ok()).count()
    }
}

#[derive(Debug, Clone)]
pub struct Storyboard {
    segments: Vec<Segment>,
    options: StoryboardOptions,
}

impl Storyboard {
    pub fn new(lyrics: &str, options: StoryboardOptions) -> ApiResult<Self> {
        let segments = split_lyrics(lyrics);
        if segments.is_empty() {
            return Err(ApiError::Invalid("lyrics contain no segments".into()));
        }
        Ok(Self { segments, options })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn dimensions(&self) -> Dimensions {
        self.options.aspect.scaled(&self.options.tier)
    }

    pub fn estimated_cost(&self) -> f64 {
        self.segments.len() as f64 * self.options.tier.cost_per_image
    }

    /** \brief 每段对应的图像请求。 */
    pub fn requests(&self) -> Vec<(u32, ImageRequest)> {
        let dims = self.dimensions();
        self.segments
            .iter()
            .map(|seg| {
                (
                    seg.id,
                    ImageRequest {
                        model: self.options.model.clone(),
                        prompt: segment_prompt(seg, self.options.style.as_deref()),
                        width: dims.width,
                        height: dims.height,
                        steps: self.options.steps,
                        format: Some("png".to_string()),
                        style: self.options.style.clone(),
                    },
                )
            })
            .collect()
    }

    /**
     * \brief 所有段落并发生成图片；单段失败只影响该段。
     */
    pub async fn render(&self, client: &ProviderClient) -> RenderedStoryboard {
        let requests = self.requests();
        let jobs = requests
            .iter()
            .map(|(id, req)| (*id, client.generate_image(req)));
        let frames = fan_out(jobs).await;
        let rendered = RenderedStoryboard {
            frames,
            dimensions: self.dimensions(),
            estimated_cost: self.estimated_cost(),
        };
        telemetry::log_event(
            "storyboard.render",
            &format!(
                "segments={} failed={} cost={:.2}",
                self.segments.len(),
                rendered.failed(),
                rendered.estimated_cost
            ),
        );
        rendered
    }

    /**
     * \brief 把某段的图片转为短视频。URL 形式的图片会先下载再转 base64。
     */
    pub async fn animate(
        &self,
        client: &ProviderClient,
        segment_id: u32,
        image: &MediaPayload,
        video_model: &str,
        duration_seconds: u32,
    ) -> ApiResult<MediaPayload> {
        let segment = self
            .segments
            .iter()
            .find(|s| s.id == segment_id)
            .ok_or_else(|| ApiError::Invalid(format!("unknown segment {}", segment_id)))?;
        let image = match image {
            MediaPayload::Base64(b64) => b64.clone(),
            MediaPayload::Url(_) => STANDARD.encode(client.fetch_media(image).await?),
        };
        let req = VideoRequest {
            model: video_model.to_string(),
            image,
            prompt: format!(
                "{}, gentle camera motion",
                segment_prompt(segment, self.options.style.as_deref())
            ),
            duration_seconds,
            width: self.options.aspect.width,
            height: self.options.aspect.height,
        };
        client.image_to_video(&req).await
    }
}
