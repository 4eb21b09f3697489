//! NSFW classification over an OpenAI-compatible chat completions API.

use crate::config::NsfwConfig;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const SKIPPED_EXTENSIONS: &[&str] = &["avif", "gif"];

const CLASSIFY_PROMPT: &str = "Classify this image as SAFE or NSFW. NSFW includes explicit sexual \
or pornographic content, blood, gore, etc.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NsfwLabel {
    Safe,
    Nsfw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NsfwVerdict {
    #[serde(rename = "classification")]
    pub label: NsfwLabel,
    #[serde(default)]
    pub confidence: u32,
}

impl NsfwVerdict {
    #[must_use]
    pub fn is_unsafe(&self) -> bool {
        self.label == NsfwLabel::Nsfw
    }
}

#[async_trait]
pub trait NsfwClassifier: Send + Sync {
    /// `Ok(None)` when the image is not classified (skipped type, disabled backend).
    async fn classify(&self, url: &str, image: Option<&DynamicImage>)
        -> Result<Option<NsfwVerdict>>;
}

/// Used when no API key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledClassifier;

#[async_trait]
impl NsfwClassifier for DisabledClassifier {
    async fn classify(
        &self,
        url: &str,
        _image: Option<&DynamicImage>,
    ) -> Result<Option<NsfwVerdict>> {
        log::debug!("NSFW classifier disabled, skipping {url}");
        Ok(None)
    }
}

fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

#[must_use]
pub fn is_skipped_url(url: &str) -> bool {
    url_extension(url).is_some_and(|ext| SKIPPED_EXTENSIONS.contains(&ext.as_str()))
}

/// Parse the model's message content; anything but the expected JSON object is `None`.
#[must_use]
pub fn parse_answer(content: &str) -> Option<NsfwVerdict> {
    let content = content.trim();
    if content.is_empty() {
        return None;
    }
    serde_json::from_str(content).ok()
}

/// Sends one chat completions request body and returns the response JSON.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    async fn complete(&self, body: &Value) -> Result<Value>;
}

/// Bearer-authenticated POST to an OpenAI-compatible endpoint.
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &NsfwConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(&self, body: &Value) -> Result<Value> {
        Ok(self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

/// Asks each configured model in turn until one gives a usable answer.
pub struct ChatNsfwClassifier {
    transport: Arc<dyn CompletionTransport>,
    models: Vec<String>,
}

impl ChatNsfwClassifier {
    pub fn new(config: &NsfwConfig, api_key: impl Into<String>) -> Result<Self> {
        let transport = HttpTransport::new(config, api_key)?;
        Self::with_transport(config.models.clone(), Arc::new(transport))
    }

    pub fn with_transport(
        models: Vec<String>,
        transport: Arc<dyn CompletionTransport>,
    ) -> Result<Self> {
        if models.is_empty() {
            return Err(EngineError::Config(
                "nsfw.models must name at least one model".to_string(),
            ));
        }
        Ok(Self { transport, models })
    }

    /// Remote URLs are passed through; local images are inlined as a JPEG data URL.
    fn image_reference(url: &str, image: Option<&DynamicImage>) -> Option<String> {
        if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:") {
            return Some(url.to_string());
        }
        let image = image?;
        let jpeg = sentinel_vision::evidence::encode_jpeg(
            image,
            sentinel_vision::evidence::NSFW_EVIDENCE_QUALITY,
        )
        .ok()?;
        Some(format!("data:image/jpeg;base64,{}", BASE64.encode(jpeg)))
    }

    fn request_body(model: &str, image_url: &str) -> Value {
        let example = json!({ "classification": "SAFE", "confidence": 100 });
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": format!("Example answer: {example}") },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": CLASSIFY_PROMPT },
                        { "type": "image_url", "image_url": { "url": image_url } }
                    ]
                }
            ],
            "response_format": { "type": "json_object" }
        })
    }

    async fn ask(&self, model: &str, image_url: &str) -> Result<Option<NsfwVerdict>> {
        let response = self
            .transport
            .complete(&Self::request_body(model, image_url))
            .await?;
        let content = response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(parse_answer(content))
    }
}

#[async_trait]
impl NsfwClassifier for ChatNsfwClassifier {
    async fn classify(
        &self,
        url: &str,
        image: Option<&DynamicImage>,
    ) -> Result<Option<NsfwVerdict>> {
        if is_skipped_url(url) {
            log::debug!("Skipping NSFW classification for {url}");
            return Ok(None);
        }
        let Some(image_url) = Self::image_reference(url, image) else {
            log::debug!("No classifiable reference for {url}");
            return Ok(None);
        };
        for model in &self.models {
            match self.ask(model, &image_url).await {
                Ok(Some(verdict)) => {
                    log::info!(
                        "NSFW model {model}: {:?} ({}%) for {url}",
                        verdict.label,
                        verdict.confidence
                    );
                    return Ok(Some(verdict));
                }
                Ok(None) => log::warn!("Model {model} gave no usable answer, trying next"),
                Err(err) => log::warn!("Model {model} failed: {err}, trying next"),
            }
        }
        Err(EngineError::Classifier(format!(
            "no model could classify {url}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Reply {
        Fail,
        Content(&'static str),
    }

    /// Answers per model name and records the order models were asked in.
    struct ScriptedTransport {
        replies: HashMap<&'static str, Reply>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: impl IntoIterator<Item = (&'static str, Reply)>) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.into_iter().collect(),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionTransport for ScriptedTransport {
        async fn complete(&self, body: &Value) -> Result<Value> {
            let model = body["model"].as_str().unwrap_or_default().to_string();
            self.asked.lock().unwrap().push(model.clone());
            match self.replies.get(model.as_str()) {
                Some(Reply::Content(content)) => Ok(json!({
                    "choices": [{ "message": { "content": content } }]
                })),
                Some(Reply::Fail) | None => Err(EngineError::Classifier(format!("{model}: 503"))),
            }
        }
    }

    fn classifier(transport: Arc<ScriptedTransport>) -> ChatNsfwClassifier {
        let models = vec!["first".to_string(), "second".to_string(), "third".to_string()];
        ChatNsfwClassifier::with_transport(models, transport).unwrap()
    }

    #[test]
    fn skips_animated_and_avif() {
        assert!(is_skipped_url("https://cdn.example/a/b/image.GIF"));
        assert!(is_skipped_url("https://cdn.example/x.avif?ex=123&is=456"));
        assert!(!is_skipped_url("https://cdn.example/x.png?format=gif"));
        assert!(!is_skipped_url("https://cdn.example/noext"));
    }

    #[test]
    fn parses_expected_answer() {
        assert_eq!(
            parse_answer(r#"{"classification":"NSFW","confidence":87}"#),
            Some(NsfwVerdict {
                label: NsfwLabel::Nsfw,
                confidence: 87
            })
        );
        let safe = parse_answer(" {\"classification\":\"SAFE\"} ").unwrap();
        assert!(!safe.is_unsafe());
    }

    #[test]
    fn ambiguous_answers_are_no_verdict() {
        assert_eq!(parse_answer(""), None);
        assert_eq!(parse_answer("I think it is safe"), None);
        assert_eq!(parse_answer(r#"{"classification":"MAYBE"}"#), None);
    }

    #[test]
    fn request_carries_prompt_and_image() {
        let body = ChatNsfwClassifier::request_body("m", "https://x/y.png");
        assert_eq!(body["model"], "m");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][1]["content"][1]["image_url"]["url"], "https://x/y.png");
    }

    #[test]
    fn local_images_become_data_urls() {
        let img = DynamicImage::new_rgb8(8, 8);
        let reference = ChatNsfwClassifier::image_reference("/tmp/a.png", Some(&img)).unwrap();
        assert!(reference.starts_with("data:image/jpeg;base64,"));
        assert_eq!(ChatNsfwClassifier::image_reference("/tmp/a.png", None), None);
    }

    #[tokio::test]
    async fn disabled_classifier_never_decides() {
        let out = DisabledClassifier
            .classify("https://x/y.png", None)
            .await
            .unwrap();
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn empty_model_list_is_a_config_error() {
        let config = NsfwConfig {
            models: Vec::new(),
            ..NsfwConfig::default()
        };
        assert!(matches!(
            ChatNsfwClassifier::new(&config, "k"),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn failing_model_falls_through_to_next() {
        let transport = ScriptedTransport::new([
            ("first", Reply::Fail),
            ("second", Reply::Content(r#"{"classification":"NSFW","confidence":91}"#)),
            ("third", Reply::Content(r#"{"classification":"SAFE"}"#)),
        ]);
        let verdict = classifier(transport.clone())
            .classify("https://cdn.example/a.png", None)
            .await
            .unwrap()
            .unwrap();
        assert!(verdict.is_unsafe());
        assert_eq!(verdict.confidence, 91);
        assert_eq!(transport.asked(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn unusable_answer_also_falls_through() {
        let transport = ScriptedTransport::new([
            ("first", Reply::Content("")),
            ("second", Reply::Content("looks fine to me")),
            ("third", Reply::Content(r#"{"classification":"SAFE","confidence":80}"#)),
        ]);
        let verdict = classifier(transport.clone())
            .classify("https://cdn.example/a.png", None)
            .await
            .unwrap()
            .unwrap();
        assert!(!verdict.is_unsafe());
        assert_eq!(transport.asked().len(), 3);
    }

    #[tokio::test]
    async fn every_model_failing_is_a_classifier_error() {
        let transport = ScriptedTransport::new([
            ("first", Reply::Fail),
            ("second", Reply::Content("{}")),
            ("third", Reply::Fail),
        ]);
        let err = classifier(transport.clone())
            .classify("https://cdn.example/a.png", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Classifier(_)));
        assert_eq!(transport.asked(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn skipped_urls_never_reach_the_transport() {
        let transport = ScriptedTransport::new([]);
        let out = classifier(transport.clone())
            .classify("https://cdn.example/a.gif", None)
            .await
            .unwrap();
        assert_eq!(out, None);
        assert!(transport.asked().is_empty());
    }
}
