//! Transcript mirroring: a copy of delivered content appended to the
//! conversation's session transcript.

use crate::util::file_name_from_url;
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// What to mirror after a delivery, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSpec {
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
}

#[async_trait]
pub trait TranscriptMirror: Send + Sync {
    async fn append_assistant_message(
        &self,
        agent_id: Option<&str>,
        session_key: &str,
        text: &str,
    ) -> anyhow::Result<()>;
}

/// Text to mirror: media file names when media was sent, else the trimmed text.
pub fn resolve_mirrored_transcript_text(text: Option<&str>, media_urls: &[String]) -> Option<String> {
    let media: Vec<&String> = media_urls
        .iter()
        .filter(|url| !url.trim().is_empty())
        .collect();
    if !media.is_empty() {
        let names: Vec<String> = media
            .iter()
            .filter_map(|url| file_name_from_url(url.trim()))
            .collect();
        return Some(if names.is_empty() {
            "media".to_string()
        } else {
            names.join(", ")
        });
    }

    text.map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: String,
}

/// One JSONL file per session key under a transcript directory.
pub struct JsonlTranscriptStore {
    dir: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn transcript_path(&self, session_key: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", sanitize_session_key(session_key)))
    }
}

fn sanitize_session_key(key: &str) -> String {
    let sanitized: String = key
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "session".into()
    } else {
        sanitized
    }
}

#[async_trait]
impl TranscriptMirror for JsonlTranscriptStore {
    async fn append_assistant_message(
        &self,
        agent_id: Option<&str>,
        session_key: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create transcript dir: {}", self.dir.display()))?;

        let line = TranscriptLine {
            role: "assistant".into(),
            text: text.to_string(),
            agent_id: agent_id.map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
        };
        let mut encoded = serde_json::to_string(&line)?;
        encoded.push('\n');

        let path = self.transcript_path(session_key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open transcript: {}", path.display()))?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
