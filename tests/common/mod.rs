//! In-process fakes of the provider traits shared by the integration tests.
#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use docgpt::archive::Archiver;
use docgpt::config::Config;
use docgpt::embedding::EmbeddingProvider;
use docgpt::llm::{ChatMessage, ChatModel, ChatRole, TokenStream};
use docgpt::pipeline::Pipeline;

const VOCAB: &[&str] = &[
    "hour", "open", "9am", "6pm", "park", "weekend", "price", "doctor",
];

/// Bag-of-keywords embedder. Counts texts it embeds.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub embedded_texts: AtomicUsize,
    pub query_calls: AtomicUsize,
    pub fail: bool,
}

impl KeywordEmbedder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = VOCAB
            .iter()
            .map(|w| lower.matches(w).count() as f32)
            .collect();
        v.push(0.1);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail {
            bail!("embedding quota exceeded");
        }
        self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::vector(text))
    }
}

/// How the scripted chat model behaves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ChatScript {
    /// Paraphrases succeed; answers quote the hours found in the context.
    Normal,
    /// The paraphrase call fails; answering still works.
    ParaphraseFails,
    /// The answer stream yields two fragments and then fails.
    StreamBreaks,
}

pub struct ScriptedChat {
    script: ChatScript,
    pub complete_calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub last_system_prompt: Mutex<Option<String>>,
}

impl ScriptedChat {
    pub fn new(script: ChatScript) -> Self {
        Self {
            script,
            complete_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            last_system_prompt: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if self.script == ChatScript::ParaphraseFails {
            bail!("rate limited");
        }
        Ok("1. What are the clinic's opening hours?\n2. When does the clinic open?\n3. What hours is the clinic open on weekdays?".to_string())
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let system = messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        *self.last_system_prompt.lock().unwrap() = Some(system.clone());

        let items: Vec<Result<String>> = match self.script {
            ChatScript::StreamBreaks => vec![
                Ok("Hello~ ".to_string()),
                Ok("We open at ".to_string()),
                Err(anyhow::anyhow!("connection reset by peer")),
            ],
            _ if system.contains("9am") && system.contains("6pm") => vec![
                Ok("Hello~ ".to_string()),
                Ok("We are open 9am".to_string()),
                Ok("–6pm, Mon–Fri ^^".to_string()),
            ],
            _ => vec![Ok(
                "Please contact the hospital directly for more information.".to_string(),
            )],
        };
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Records uploaded keys; optionally fails every upload.
#[derive(Default)]
pub struct RecordingArchiver {
    pub keys: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl Archiver for RecordingArchiver {
    fn destination(&self) -> String {
        "memory://test".to_string()
    }

    async fn upload(&self, key: &str, _bytes: &[u8]) -> Result<()> {
        if self.fail {
            bail!("bucket unreachable");
        }
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

pub struct Fakes {
    pub embedder: Arc<KeywordEmbedder>,
    pub chat: Arc<ScriptedChat>,
    pub archiver: Arc<RecordingArchiver>,
}

impl Fakes {
    pub fn new(script: ChatScript) -> Self {
        Self {
            embedder: Arc::new(KeywordEmbedder::default()),
            chat: Arc::new(ScriptedChat::new(script)),
            archiver: Arc::new(RecordingArchiver::default()),
        }
    }

    pub fn pipeline(&self, cache_root: &Path) -> Arc<Pipeline> {
        self.pipeline_with(Config::with_cache_root(cache_root))
    }

    pub fn pipeline_with(&self, config: Config) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            config,
            self.embedder.clone(),
            self.chat.clone(),
            self.archiver.clone(),
        ))
    }
}

/// Every file below `root`, relative, sorted.
pub fn list_files(root: &Path) -> Vec<String> {
    let mut out = Vec::new();
    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, out);
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.display().to_string());
            }
        }
    }
    walk(root, root, &mut out);
    out.sort();
    out
}
