//! 流式聊天补全的增量解码。
//!
//! 响应体按字节缓冲，只有遇到 `\n` 的完整行才会被解析；末尾不完整的一行留在缓冲区，
//! 与下一块数据拼接后再切分，因此任意的分块边界（包括多字节 UTF-8 字符被截断）
//! 都得到与整块处理相同的结果。

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{error::ApiError, telemetry};

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/**
 * \brief 解码得到的事件。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /** \brief 一段增量文本 */
    Delta(String),
    /** \brief `data: [DONE]`，流结束 */
    Done,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

enum Line {
    Ignored,
    Done,
    Delta(String),
    Malformed,
}

fn classify(line: &str) -> Line {
    let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Ignored;
    };
    let payload = rest.strip_prefix(' ').unwrap_or(rest).trim();
    if payload == DONE_MARKER {
        return Line::Done;
    }
    if payload.is_empty() {
        return Line::Ignored;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|s| !s.is_empty())
            .map(Line::Delta)
            .unwrap_or(Line::Ignored),
        Err(_) => Line::Malformed,
    }
}

/**
 * \brief 增量 SSE 解码器。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    done: bool,
    malformed: u64,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 送入一块字节，返回其中所有完整行产生的事件。
     * \details 遇到 Done 后不再产生任何事件。
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(pos) = self.buf[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + pos;
            let text = String::from_utf8_lossy(&self.buf[consumed..end]).into_owned();
            consumed = end + 1;

            let line = text.strip_suffix('\r').unwrap_or(text.as_str());
            match classify(line) {
                Line::Ignored => {}
                Line::Delta(d) => events.push(SseEvent::Delta(d)),
                Line::Malformed => {
                    self.malformed += 1;
                    telemetry::record_malformed_event("sse", line);
                }
                Line::Done => {
                    self.done = true;
                    self.buf.clear();
                    events.push(SseEvent::Done);
                    return events;
                }
            }
        }
        self.buf.drain(..consumed);
        events
    }

    /**
     * \brief 响应体结束：丢弃未以换行结尾的残留数据，返回丢弃的字节数。
     */
    pub fn finish(&mut self) -> usize {
        let dropped = self.buf.len();
        if dropped > 0 {
            telemetry::log_warn(
                "sse",
                &format!("discarded {} bytes of unterminated trailing data", dropped),
            );
        }
        self.buf.clear();
        dropped
    }

    /** \brief 取消时清空缓冲区。 */
    pub fn reset(&mut self) {
        self.buf.clear();
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /** \brief 本次流中被跳过的无效 JSON 行数。 */
    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/**
 * \brief 流的结束方式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Finish {
    /** \brief 收到 `[DONE]` */
    Done,
    /** \brief 响应体读完但没有 `[DONE]` */
    Eof,
    /** \brief 调用方取消 */
    Cancelled,
}

/**
 * \brief 一次流式补全的汇总结果。
 */
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub finish: Finish,
    pub malformed: u64,
}

/**
 * \brief 读取字节流，每个增量在读取下一块之前交给回调。
 * \details 取消令牌触发后立即停止读取并丢弃缓冲区，返回已累计文本。
 */
pub async fn consume<S, B, E, F>(
    mut stream: S,
    cancel: &CancellationToken,
    mut on_delta: F,
) -> Result<Completion, ApiError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ApiError>,
    F: FnMut(&str),
{
    let mut decoder = SseDecoder::new();
    let mut text = String::new();

    let finish = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                decoder.reset();
                break Finish::Cancelled;
            }
            item = stream.next() => item,
        };
        let Some(chunk) = item else {
            decoder.finish();
            break Finish::Eof;
        };
        let chunk = chunk.map_err(Into::<ApiError>::into)?;
        let mut done = false;
        for event in decoder.push(chunk.as_ref()) {
            match event {
                SseEvent::Delta(delta) => {
                    text.push_str(&delta);
                    on_delta(&delta);
                }
                SseEvent::Done => done = true,
            }
        }
        if done {
            break Finish::Done;
        }
    };

    Ok(Completion {
        text,
        finish,
        malformed: decoder.malformed(),
    })
}

/**
 * \brief 把字节流转换为增量文本流；取消或 `[DONE]` 时正常结束。
 */
pub fn delta_stream<S, B, E>(
    mut stream: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<String, ApiError>> + Send
where
    S: Stream<Item = Result<B, E>> + Unpin + Send,
    B: AsRef<[u8]> + Send,
    E: Into<ApiError> + Send,
{
    try_stream! {
        let mut decoder = SseDecoder::new();
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            let Some(item) = item else {
                decoder.reset();
                break;
            };
            let Some(chunk) = item else {
                decoder.finish();
                break;
            };
            let chunk = chunk.map_err(Into::<ApiError>::into)?;
            for event in decoder.push(chunk.as_ref()) {
                if let SseEvent::Delta(delta) = event {
                    yield delta;
                }
            }
            if decoder.is_done() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    const PAYLOAD: &str = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n",
        "\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Héllo\"}}]}\n",
        ": keep-alive comment\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\", 世界\"}}]}\r\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n",
        "data: [DONE]\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n",
    );

    fn chunk(s: &str) -> Result<Vec<u8>, ApiError> {
        Ok(s.as_bytes().to_vec())
    }

    fn decode_all(chunks: &[&[u8]]) -> (String, bool) {
        let mut decoder = SseDecoder::new();
        let mut text = String::new();
        let mut done = false;
        for c in chunks {
            for ev in decoder.push(c) {
                match ev {
                    SseEvent::Delta(d) => text.push_str(&d),
                    SseEvent::Done => done = true,
                }
            }
        }
        (text, done)
    }

    #[test]
    fn test_single_chunk() {
        let (text, done) = decode_all(&[PAYLOAD.as_bytes()]);
        assert_eq!(text, "Héllo, 世界!");
        assert!(done);
    }

    #[test]
    fn test_chunk_boundary_invariance_at_every_split() {
        let bytes = PAYLOAD.as_bytes();
        let (expected, _) = decode_all(&[bytes]);
        for i in 0..=bytes.len() {
            let (a, b) = bytes.split_at(i);
            let (text, done) = decode_all(&[a, b]);
            assert_eq!(text, expected, "split at {}", i);
            assert!(done);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let chunks: Vec<&[u8]> = PAYLOAD.as_bytes().chunks(1).collect();
        let (text, done) = decode_all(&chunks);
        assert_eq!(text, "Héllo, 世界!");
        assert!(done);
    }

    #[test]
    fn test_partial_line_is_held_until_newline() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}");
        assert!(events.is_empty());
        assert!(decoder.pending() > 0);
        let events = decoder.push(b"\n");
        assert_eq!(events, vec![SseEvent::Delta("a".into())]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_malformed_line_does_not_stop_stream() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"one\"}}]}\n",
                "data: {\"choices\":[{\"delta\":\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"two\"}}]}\n",
            )
            .as_bytes(),
        );
        assert_eq!(
            events,
            vec![SseEvent::Delta("one".into()), SseEvent::Delta("two".into())]
        );
        assert_eq!(decoder.malformed(), 1);
    }

    #[test]
    fn test_done_emits_no_delta() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: [DONE]\n");
        assert_eq!(events, vec![SseEvent::Done]);
        assert!(decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n").is_empty());
    }

    #[test]
    fn test_unterminated_tail_is_discarded() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}");
        assert!(decoder.finish() > 0);
        assert_eq!(decoder.pending(), 0);
    }

    #[tokio::test]
    async fn test_consume_forwards_each_delta() {
        let chunks: Vec<Result<Vec<u8>, ApiError>> = PAYLOAD
            .as_bytes()
            .chunks(7)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let mut seen = Vec::new();
        let cancel = CancellationToken::new();
        let completion = consume(stream::iter(chunks), &cancel, |d| seen.push(d.to_string()))
            .await
            .unwrap();
        assert_eq!(completion.text, "Héllo, 世界!");
        assert_eq!(completion.finish, Finish::Done);
        assert_eq!(seen.concat(), completion.text);
        assert!(!seen.iter().any(|d| d.contains("after done")));
    }

    #[tokio::test]
    async fn test_consume_without_done_reports_eof() {
        let chunks = vec![chunk("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")];
        let completion = consume(stream::iter(chunks), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(completion.text, "x");
        assert_eq!(completion.finish, Finish::Eof);
    }

    #[tokio::test]
    async fn test_consume_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let chunks = vec![chunk("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")];
        let mut calls = 0;
        let completion = consume(stream::iter(chunks), &cancel, |_| calls += 1)
            .await
            .unwrap();
        assert_eq!(completion.finish, Finish::Cancelled);
        assert_eq!(calls, 0);
        assert!(completion.text.is_empty());
    }

    #[tokio::test]
    async fn test_consume_propagates_transport_error() {
        let chunks = vec![
            chunk("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"),
            Err(ApiError::NoData { endpoint: "test" }),
        ];
        let err = consume(stream::iter(chunks), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NoData { .. }));
    }

    #[tokio::test]
    async fn test_delta_stream_yields_in_order() {
        let chunks: Vec<Result<Vec<u8>, ApiError>> = PAYLOAD
            .as_bytes()
            .chunks(5)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let s = delta_stream(stream::iter(chunks), CancellationToken::new());
        futures_util::pin_mut!(s);
        let mut out = String::new();
        while let Some(d) = s.next().await {
            out.push_str(&d.unwrap());
        }
        assert_eq!(out, "Héllo, 世界!");
    }
}
