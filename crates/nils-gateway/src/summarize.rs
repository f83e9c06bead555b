// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use nils_model::{Message, StreamEvent, StreamFactory, StreamOptions, StreamRequest};
use nils_store::{SummaryMode, Summarizer};

/// Run one tool-free model turn and return the assistant text. Shared by
/// the compaction summarizer and the title generator.
pub async fn complete_text(
    factory: &dyn StreamFactory,
    prompt: &str,
    opts: StreamOptions,
) -> anyhow::Result<String> {
    let request = StreamRequest {
        messages: vec![Message::user(prompt)],
        system_prompt: String::new(),
        tools: vec![],
    };
    let mut stream = factory.stream(request, opts).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        if let StreamEvent::Completed { message } = event? {
            text = message.text();
        }
    }
    Ok(text)
}

/// Compaction summaries are produced by the live model factory.
pub struct FactorySummarizer {
    factory: Arc<dyn StreamFactory>,
    api_key: Option<String>,
}

impl FactorySummarizer {
    pub fn new(factory: Arc<dyn StreamFactory>, api_key: Option<String>) -> Self {
        Self { factory, api_key }
    }
}

#[async_trait]
impl Summarizer for FactorySummarizer {
    async fn summarize(&self, _mode: SummaryMode, prompt: &str) -> anyhow::Result<String> {
        complete_text(
            self.factory.as_ref(),
            prompt,
            StreamOptions {
                api_key: self.api_key.clone(),
                ..StreamOptions::default()
            },
        )
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use nils_model::ScriptedFactory;

    use super::*;

    #[tokio::test]
    async fn complete_text_returns_assistant_text() {
        let factory = ScriptedFactory::always_text("summary text");
        let out = complete_text(&factory, "summarize this", StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "summary text");
        let requests = factory.requests.lock().unwrap();
        assert!(requests[0].tools.is_empty(), "summaries run tool-free");
        assert_eq!(requests[0].messages[0].text(), "summarize this");
    }

    #[tokio::test]
    async fn summarizer_adapts_the_factory() {
        let factory: Arc<dyn StreamFactory> = Arc::new(ScriptedFactory::always_text("condensed"));
        let s = FactorySummarizer::new(factory, None);
        let out = s.summarize(SummaryMode::Initial, "history").await.unwrap();
        assert_eq!(out, "condensed");
    }
}
