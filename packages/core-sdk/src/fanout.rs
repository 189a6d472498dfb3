use std::future::Future;

use futures_util::future::join_all;
use serde::{ser::SerializeStruct, Serialize, Serializer};

use crate::{
    client::ProviderClient,
    error::ApiResult,
    models::ChatMessage,
    telemetry,
};

/**
 * \brief 并发任务的一个结果槽位：成功值或该分支自身的错误。
 */
#[derive(Debug)]
pub struct Slot<K, T> {
    pub key: K,
    pub outcome: ApiResult<T>,
}

impl<K, T> Slot<K, T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }
}

impl<K: Serialize, T: Serialize> Serialize for Slot<K, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("Slot", 3)?;
        st.serialize_field("key", &self.key)?;
        match &self.outcome {
            Ok(v) => {
                st.serialize_field("value", v)?;
                st.serialize_field("error", &Option::<String>::None)?;
            }
            Err(e) => {
                st.serialize_field("value", &Option::<()>::None)?;
                st.serialize_field("error", e)?;
            }
        }
        st.end()
    }
}

/**
 * \brief 并发执行全部任务，每个任务独立结算。
 * \details 任何分支失败都不会取消其他分支；结果按输入顺序返回。
 */
pub async fn fan_out<K, T, Fut, I>(jobs: I) -> Vec<Slot<K, T>>
where
    I: IntoIterator<Item = (K, Fut)>,
    Fut: Future<Output = ApiResult<T>>,
{
    let (keys, futures): (Vec<K>, Vec<Fut>) = jobs.into_iter().unzip();
    let results = join_all(futures).await;
    keys.into_iter()
        .zip(results)
        .map(|(key, outcome)| Slot { key, outcome })
        .collect()
}

/**
 * \brief 同一组消息并发发送给多个模型，用于对比回复。
 */
pub async fn compare_models(
    client: &ProviderClient,
    models: &[String],
    messages: &[ChatMessage],
    system: Option<&str>,
) -> Vec<Slot<String, String>> {
    let jobs = models
        .iter()
        .map(|model| (model.clone(), client.complete(model, messages, system)));
    let slots = fan_out(jobs).await;
    let failed = slots.iter().filter(|s| !s.is_ok()).count();
    telemetry::log_event(
        "fanout.compare",
        &format!("models={} failed={}", slots.len(), failed),
    );
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use std::time::Duration;

    async fn job(i: u64) -> ApiResult<u64> {
        tokio::time::sleep(Duration::from_millis(10 * (3 - i))).await;
        if i == 1 {
            return Err(ApiError::from_status(500, ""));
        }
        Ok(i * 10)
    }

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let slots = fan_out((0..3u64).map(|i| (format!("m{}", i), job(i)))).await;
        assert_eq!(slots.len(), 3);
        assert_eq!(slots[0].key, "m0");
        assert_eq!(slots[0].value(), Some(&0));
        assert_eq!(
            slots[1].outcome.as_ref().unwrap_err().to_string(),
            "API error: 500"
        );
        assert_eq!(slots[2].value(), Some(&20));
        assert_eq!(slots.iter().filter(|s| s.is_ok()).count(), 2);
    }

    #[tokio::test]
    async fn test_slot_serialization() {
        let slots = fan_out(vec![(1u32, job(0)), (2u32, job(1))]).await;
        let v = serde_json::to_value(&slots).unwrap();
        assert_eq!(v[0]["key"], 1);
        assert_eq!(v[0]["value"], 0);
        assert!(v[0]["error"].is_null());
        assert_eq!(v[1]["error"], "API error: 500");
        assert!(v[1]["value"].is_null());
    }

    #[tokio::test]
    async fn test_compare_models_against_mock() {
        use crate::{config::Session, testing::MockProvider};
        use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};
        use serde_json::{json, Value};

        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                if body["model"] == json!("broken") {
                    return (StatusCode::BAD_GATEWAY, "").into_response();
                }
                let reply = format!("from {}", body["model"].as_str().unwrap_or(""));
                Json(json!({"choices": [{"message": {"content": reply}}]})).into_response()
            }),
        );
        let mock = MockProvider::start(router).await;
        let client = ProviderClient::new(&Session::new(&mock.base_url(), "sk")).unwrap();
        let models = vec!["a".to_string(), "broken".to_string(), "b".to_string()];
        let slots = compare_models(&client, &models, &[ChatMessage::user("hi")], None).await;
        assert_eq!(slots[0].value().map(String::as_str), Some("from a"));
        assert_eq!(
            slots[1].outcome.as_ref().unwrap_err().to_string(),
            "API error: 502"
        );
        assert_eq!(slots[2].value().map(String::as_str), Some("from b"));
    }
}
