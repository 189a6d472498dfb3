use tokio_util::sync::CancellationToken;

use crate::{
    client::ProviderClient,
    error::ApiResult,
    models::{ChatRequest, Conversation},
    sse::{Completion, Finish},
    telemetry,
};

pub const ARCHITECT_SYSTEM_PROMPT: &str = "You are a prompt architect. Turn the user's rough idea \
into a precise, production-ready prompt for a generative model. Ask at most one clarifying \
question when the goal is ambiguous. Always answer with the finished prompt first, followed by a \
short list of optional variations.";

/**
 * \brief 提示词架构师会话：多轮对话，助手回复以流式填充。
 */
#[derive(Debug, Clone)]
pub struct ArchitectSession {
    model: String,
    system: String,
    temperature: Option<f32>,
    conversation: Conversation,
}

impl ArchitectSession {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: ARCHITECT_SYSTEM_PROMPT.to_string(),
            temperature: Some(0.7),
            conversation: Conversation::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /**
     * \brief 发送一轮用户输入并流式接收回复。
     * \details 失败时移除占位消息，用户消息保留；取消时保留已收到的部分内容。
     */
    pub async fn ask<F>(
        &mut self,
        client: &ProviderClient,
        text: &str,
        cancel: &CancellationToken,
        mut on_delta: F,
    ) -> ApiResult<Completion>
    where
        F: FnMut(&str),
    {
        self.conversation.push_user(text);
        let mut req = ChatRequest::new(
            self.model.clone(),
            self.conversation.to_provider_messages(Some(&self.system)),
        );
        req.temperature = self.temperature;
        self.conversation.begin_assistant();

        let conversation = &mut self.conversation;
        let result = client
            .stream_chat_with(&req, cancel, |delta| {
                conversation.append_delta(delta);
                on_delta(delta);
            })
            .await;

        match result {
            Ok(completion) => {
                if completion.finish == Finish::Cancelled && completion.text.is_empty() {
                    self.conversation.abandon_assistant();
                } else {
                    self.conversation.finish_assistant();
                }
                telemetry::log_event(
                    "architect.ask",
                    &format!(
                        "model={} turns={} finish={:?} reply_len={}",
                        self.model,
                        self.conversation.len(),
                        completion.finish,
                        completion.text.len()
                    ),
                );
                Ok(completion)
            }
            Err(e) => {
                self.conversation.abandon_assistant();
                telemetry::log_error("architect.ask", &format!("model={} {}", self.model, e));
                Err(e)
            }
        }
    }
}
