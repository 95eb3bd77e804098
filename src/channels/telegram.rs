use super::metadata_cache::MetadataCache;
use super::traits::{
    ChannelOutbound, OutboundCapabilities, OutboundDeliveryResult, OutboundSendContext,
};
use crate::config::{MetadataCacheConfig, TelegramConfig};
use crate::outbound::chunk::{chunk_markdown_text, ChunkUnit, ChunkerMode, TextChunking};
use crate::util::file_name_from_url;
use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Telegram Bot API message size limit is 4096; keep headroom for fence repair.
pub const TELEGRAM_TEXT_CHUNK_LIMIT: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TelegramMediaKind {
    Photo,
    Animation,
    Video,
    Voice,
    Audio,
    Document,
}

impl TelegramMediaKind {
    fn from_url(url: &str) -> Self {
        let ext = file_name_from_url(url)
            .and_then(|name| {
                name.rsplit_once('.')
                    .map(|(_, ext)| ext.to_ascii_lowercase())
            })
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "webp" | "bmp" => Self::Photo,
            "gif" => Self::Animation,
            "mp4" | "mov" | "webm" | "mkv" => Self::Video,
            "ogg" | "oga" | "opus" => Self::Voice,
            "mp3" | "m4a" | "wav" | "flac" | "aac" => Self::Audio,
            _ => Self::Document,
        }
    }

    /// Bot API method and the body field carrying the media.
    fn method_and_field(self) -> (&'static str, &'static str) {
        match self {
            Self::Photo => ("sendPhoto", "photo"),
            Self::Animation => ("sendAnimation", "animation"),
            Self::Video => ("sendVideo", "video"),
            Self::Voice => ("sendVoice", "voice"),
            Self::Audio => ("sendAudio", "audio"),
            Self::Document => ("sendDocument", "document"),
        }
    }
}

/// Telegram outbound adapter over the Bot API.
pub struct TelegramOutbound {
    bot_token: String,
    api_base: String,
    client: Client,
    /// `chat_id -> is_forum`, used to decide how a thread id is addressed.
    forum_cache: MetadataCache<bool>,
}

impl TelegramOutbound {
    pub fn new(config: &TelegramConfig, cache: &MetadataCacheConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build Telegram HTTP client")?;
        Ok(Self {
            bot_token: config.bot_token.trim().to_string(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            client,
            forum_cache: MetadataCache::from_config(cache),
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.bot_token)
    }

    async fn fetch_is_forum(&self, chat_id: &str) -> anyhow::Result<Option<bool>> {
        let resp = self
            .client
            .post(self.api_url("getChat"))
            .json(&serde_json::json!({ "chat_id": chat_id }))
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("Telegram getChat failed: {}", resp.status());
        }
        let data: serde_json::Value = resp.json().await?;
        Ok(data
            .get("result")
            .map(|chat| chat.get("is_forum").and_then(serde_json::Value::as_bool).unwrap_or(false)))
    }

    /// Attach reply/thread addressing. Forum chats (and chats whose kind could
    /// not be resolved) take the thread as a topic; other chats reply to it.
    async fn apply_addressing(&self, body: &mut serde_json::Value, ctx: &OutboundSendContext) {
        if let Some(reply_to) = ctx.reply_to_id.as_deref() {
            body["reply_to_message_id"] = serde_json::Value::String(reply_to.to_string());
        }
        if let Some(tid) = ctx.thread_id.as_deref() {
            let is_forum = self
                .forum_cache
                .resolve_with(&ctx.to, None, || self.fetch_is_forum(&ctx.to))
                .await
                .unwrap_or(true);
            if is_forum {
                body["message_thread_id"] = serde_json::Value::String(tid.to_string());
            } else if ctx.reply_to_id.is_none() {
                body["reply_to_message_id"] = serde_json::Value::String(tid.to_string());
            }
        }
        if ctx.silent {
            body["disable_notification"] = serde_json::Value::Bool(true);
        }
    }

    async fn post_method(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<Result<serde_json::Value, (reqwest::StatusCode, String)>> {
        let resp = self.client.post(self.api_url(method)).json(body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(Ok(resp.json().await?))
        } else {
            Ok(Err((status, resp.text().await.unwrap_or_default())))
        }
    }

    fn result_from_response(data: &serde_json::Value) -> OutboundDeliveryResult {
        let message = data.get("result");
        let message_id = message
            .and_then(|m| m.get("message_id"))
            .and_then(serde_json::Value::as_i64)
            .map(|id| id.to_string())
            .unwrap_or_default();
        let mut result = OutboundDeliveryResult::new("telegram", message_id);
        result.chat_id = message
            .and_then(|m| m.get("chat"))
            .and_then(|chat| chat.get("id"))
            .map(|id| match id {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        result.timestamp = message
            .and_then(|m| m.get("date"))
            .and_then(serde_json::Value::as_i64);
        result
    }

    /// Send with Markdown parse mode, falling back to plain text when Telegram
    /// rejects the entities.
    async fn send_with_markdown_fallback(
        &self,
        method: &str,
        text_field: &str,
        mut body: serde_json::Value,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        body["parse_mode"] = serde_json::Value::String("Markdown".into());
        let (markdown_status, markdown_err) = match self.post_method(method, &body).await? {
            Ok(data) => return Ok(Self::result_from_response(&data)),
            Err(failure) => failure,
        };
        if body.get(text_field).is_none() {
            anyhow::bail!("Telegram {method} failed ({markdown_status}): {markdown_err}");
        }

        tracing::warn!(
            status = ?markdown_status,
            "Telegram {method} with Markdown failed; retrying without parse_mode"
        );
        if let Some(map) = body.as_object_mut() {
            map.remove("parse_mode");
        }
        match self.post_method(method, &body).await? {
            Ok(data) => Ok(Self::result_from_response(&data)),
            Err((plain_status, plain_err)) => anyhow::bail!(
                "Telegram {} failed (markdown {}: {}; plain {}: {})",
                method,
                markdown_status,
                markdown_err,
                plain_status,
                plain_err
            ),
        }
    }
}

#[async_trait]
impl ChannelOutbound for TelegramOutbound {
    fn id(&self) -> &str {
        "telegram"
    }

    fn capabilities(&self) -> OutboundCapabilities {
        OutboundCapabilities {
            text: true,
            media: true,
            payload: false,
        }
    }

    fn text_chunking(&self) -> Option<TextChunking> {
        Some(TextChunking::Plain {
            chunker: chunk_markdown_text,
            mode: ChunkerMode::Markdown,
        })
    }

    fn text_chunk_limit(&self) -> Option<usize> {
        Some(TELEGRAM_TEXT_CHUNK_LIMIT)
    }

    async fn send_text(
        &self,
        ctx: &OutboundSendContext,
        unit: &ChunkUnit,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let mut body = serde_json::json!({
            "chat_id": ctx.to,
            "text": unit.text,
        });
        self.apply_addressing(&mut body, ctx).await;
        self.send_with_markdown_fallback("sendMessage", "text", body)
            .await
    }

    async fn send_media(
        &self,
        ctx: &OutboundSendContext,
        caption: &ChunkUnit,
        media_url: &str,
    ) -> anyhow::Result<OutboundDeliveryResult> {
        let (method, media_field) = TelegramMediaKind::from_url(media_url).method_and_field();
        let mut body = serde_json::json!({ "chat_id": ctx.to });
        body[media_field] = serde_json::Value::String(media_url.to_string());
        if !caption.text.trim().is_empty() {
            body["caption"] = serde_json::Value::String(caption.text.clone());
        }
        self.apply_addressing(&mut body, ctx).await;

        let result = self
            .send_with_markdown_fallback(method, "caption", body)
            .await?;
        tracing::info!("Telegram {method} sent to {}: {media_url}", ctx.to);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn outbound(server: &MockServer) -> TelegramOutbound {
        TelegramOutbound::new(
            &TelegramConfig {
                bot_token: "123:ABC".into(),
                api_base: server.uri(),
            },
            &MetadataCacheConfig::default(),
        )
        .unwrap()
    }

    fn ok_message(id: i64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "result": {"message_id": id, "date": 1_700_000_000, "chat": {"id": -100}}
        }))
    }

    fn ctx(thread: Option<&str>) -> OutboundSendContext {
        OutboundSendContext {
            to: "-100".into(),
            thread_id: thread.map(str::to_string),
            ..OutboundSendContext::default()
        }
    }

    #[test]
    fn media_kind_follows_extension() {
        assert_eq!(
            TelegramMediaKind::from_url("https://x/a.JPG?s=1"),
            TelegramMediaKind::Photo
        );
        assert_eq!(
            TelegramMediaKind::from_url("https://x/clip.gif"),
            TelegramMediaKind::Animation
        );
        assert_eq!(
            TelegramMediaKind::from_url("https://x/report"),
            TelegramMediaKind::Document
        );
        assert_eq!(
            TelegramMediaKind::from_url("/tmp/note.ogg").method_and_field(),
            ("sendVoice", "voice")
        );
    }

    #[tokio::test]
    async fn send_text_uses_markdown_and_reports_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .and(body_partial_json(serde_json::json!({
                "chat_id": "-100",
                "text": "*hi*",
                "parse_mode": "Markdown"
            })))
            .respond_with(ok_message(42))
            .expect(1)
            .mount(&server)
            .await;

        let result = outbound(&server)
            .send_text(&ctx(None), &ChunkUnit::plain("*hi*"))
            .await
            .unwrap();
        assert_eq!(result.message_id, "42");
        assert_eq!(result.chat_id.as_deref(), Some("-100"));
        assert_eq!(result.timestamp, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn markdown_rejection_retries_as_plain_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .respond_with(|req: &Request| {
                let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
                if body.get("parse_mode").is_some() {
                    ResponseTemplate::new(400).set_body_string("can't parse entities")
                } else {
                    ok_message(7)
                }
            })
            .expect(2)
            .mount(&server)
            .await;

        let result = outbound(&server)
            .send_text(&ctx(None), &ChunkUnit::plain("a_b"))
            .await
            .unwrap();
        assert_eq!(result.message_id, "7");
    }

    #[tokio::test]
    async fn forum_chat_threads_use_message_thread_id_and_are_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"id": -100, "is_forum": true}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .and(body_partial_json(serde_json::json!({"message_thread_id": "9"})))
            .respond_with(ok_message(1))
            .expect(2)
            .mount(&server)
            .await;

        let outbound = outbound(&server);
        for _ in 0..2 {
            outbound
                .send_text(&ctx(Some("9")), &ChunkUnit::plain("hi"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn non_forum_thread_becomes_reply_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/getChat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"id": -100, "is_forum": false}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendMessage"))
            .and(body_partial_json(serde_json::json!({"reply_to_message_id": "9"})))
            .respond_with(ok_message(2))
            .expect(1)
            .mount(&server)
            .await;

        outbound(&server)
            .send_text(&ctx(Some("9")), &ChunkUnit::plain("hi"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_media_picks_method_and_sets_caption() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendPhoto"))
            .and(body_partial_json(serde_json::json!({
                "photo": "https://x/cat.png",
                "caption": "cat",
                "disable_notification": true
            })))
            .respond_with(ok_message(3))
            .expect(1)
            .mount(&server)
            .await;

        let mut silent = ctx(None);
        silent.silent = true;
        let result = outbound(&server)
            .send_media(&silent, &ChunkUnit::plain("cat"), "https://x/cat.png")
            .await
            .unwrap();
        assert_eq!(result.message_id, "3");
    }

    #[tokio::test]
    async fn media_failure_without_caption_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:ABC/sendDocument"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad file"))
            .expect(1)
            .mount(&server)
            .await;

        let err = outbound(&server)
            .send_media(&ctx(None), &ChunkUnit::plain(""), "https://x/file.bin")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad file"));
    }
}
