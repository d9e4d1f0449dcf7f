mod common;

use common::{list_files, ChatScript, Fakes, KeywordEmbedder};
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

use docgpt::config::Config;
use docgpt::embedding::EmbeddingProvider;
use docgpt::extract::ExtractError;
use docgpt::models::{Role, UploadedFile};
use docgpt::pipeline::Pipeline;
use docgpt::progress::NoProgress;
use docgpt::prompt::FALLBACK_ANSWER;
use docgpt::session::{Session, SessionError, SessionState};

const POLICY: &str = "Clinic hours are 9am–6pm, Mon–Fri.";

fn policy() -> UploadedFile {
    UploadedFile::new("policy.txt", POLICY)
}

#[tokio::test]
async fn answers_opening_hours_from_policy() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));

    let stats = session.load_document(&policy(), &NoProgress).await.unwrap();
    assert_eq!(stats.chunks, 1);
    assert_eq!(stats.embedded, 1);
    assert!(stats.archived);
    assert_eq!(session.state(), SessionState::AwaitingQuestion);

    let answer = session.ask("When are you open?").await.unwrap();
    assert!(answer.context().chunks[0].text.contains("9am–6pm"));
    assert_eq!(answer.context().queries[0], "When are you open?");
    assert_eq!(answer.context().queries.len(), 4);
    let text = answer.collect_text().await.unwrap();

    assert!(text.contains("9am"));
    assert!(text.contains("6pm"));
    assert!(!text.contains("Sat"));
    assert!(!text.contains("Sun"));

    let prompt = fakes.chat.last_system_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.contains("urology"));
    assert!(prompt.ends_with(POLICY));

    let roles: Vec<Role> = session.transcript().iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![Role::Human, Role::Ai]);
    assert_eq!(session.transcript()[1].message, text);
    assert_eq!(fakes.archiver.keys.lock().unwrap().clone(), vec!["policy.txt"]);
}

#[tokio::test]
async fn empty_file_streams_fallback_without_calling_model() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));

    let stats = session
        .load_document(&UploadedFile::new("empty.txt", ""), &NoProgress)
        .await
        .unwrap();
    assert_eq!(stats.chunks, 0);

    let answer = session.ask("When are you open?").await.unwrap();
    assert!(answer.context().is_empty());
    let text = answer.collect_text().await.unwrap();

    assert_eq!(text, FALLBACK_ANSWER);
    assert!(text.contains("contact the hospital directly"));
    assert_eq!(fakes.chat.stream_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fakes.chat.complete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.transcript().len(), 2);
}

#[tokio::test]
async fn transcript_alternates_human_and_ai() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();

    for q in ["When are you open?", "Is there parking?"] {
        session.ask(q).await.unwrap().collect_text().await.unwrap();
    }

    let transcript = session.transcript();
    let roles: Vec<Role> = transcript.iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![Role::Human, Role::Ai, Role::Human, Role::Ai]);
    assert_eq!(transcript[0].message, "When are you open?");
    assert_eq!(transcript[2].message, "Is there parking?");
}

#[tokio::test]
async fn reopening_reuses_cache_but_rebuilds_index() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);

    {
        let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
        let stats = session.load_document(&policy(), &NoProgress).await.unwrap();
        assert!(!stats.reused);
        session
            .document()
            .unwrap()
            .retriever
            .embedder()
            .cache()
            .close()
            .await;
    }
    assert_eq!(fakes.embedder.embedded_texts.load(Ordering::SeqCst), 1);

    let mut session = Session::new("s2", "alice", fakes.pipeline(tmp.path()));
    let stats = session.load_document(&policy(), &NoProgress).await.unwrap();
    assert!(stats.reused);
    assert_eq!(stats.embedded, 0);
    assert_eq!(stats.cached, 1);
    assert_eq!(fakes.embedder.embedded_texts.load(Ordering::SeqCst), 1);
    assert_eq!(session.document().unwrap().retriever.index().len(), 1);
}

#[tokio::test]
async fn namespaces_do_not_share_cache() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let pipeline = fakes.pipeline(tmp.path());

    let mut alice = Session::new("a", "alice", pipeline.clone());
    let mut bob = Session::new("b", "bob", pipeline);
    alice.load_document(&policy(), &NoProgress).await.unwrap();
    let stats = bob.load_document(&policy(), &NoProgress).await.unwrap();

    assert!(!stats.reused);
    assert_eq!(stats.embedded, 1);
    let files = list_files(tmp.path());
    assert!(files.contains(&"alice/policy.txt/policy.txt".to_string()));
    assert!(files.contains(&"bob/policy.txt/policy.txt".to_string()));
}

#[tokio::test]
async fn paraphrase_failure_falls_back_to_original_question() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::ParaphraseFails);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();

    let answer = session.ask("When are you open?").await.unwrap();
    assert_eq!(answer.context().queries, vec!["When are you open?"]);
    assert_eq!(answer.context().chunks.len(), 1);
    let text = answer.collect_text().await.unwrap();
    assert!(text.contains("9am"));
    assert_eq!(fakes.embedder.query_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn zero_query_count_skips_paraphrasing() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut config = Config::with_cache_root(tmp.path());
    config.retrieval.query_count = 0;
    let mut session = Session::new("s1", "alice", fakes.pipeline_with(config));
    session.load_document(&policy(), &NoProgress).await.unwrap();

    session.ask("When are you open?").await.unwrap().collect_text().await.unwrap();
    assert_eq!(fakes.chat.complete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mid_stream_failure_keeps_partial_answer() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::StreamBreaks);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();

    let mut answer = session.ask("When are you open?").await.unwrap();
    let mut fragments = Vec::new();
    let mut failed = false;
    while let Some(item) = answer.next().await {
        match item {
            Ok(t) => fragments.push(t),
            Err(_) => failed = true,
        }
    }
    drop(answer);

    assert!(failed);
    assert_eq!(fragments.concat(), "Hello~ We open at ");
    let last = session.transcript().last().unwrap();
    assert_eq!(last.role, Role::Ai);
    assert_eq!(last.message, "Hello~ We open at ");
}

#[tokio::test]
async fn unsupported_type_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));

    let err = session
        .load_document(&UploadedFile::new("scan.png", vec![0u8; 16]), &NoProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExtractError>(),
        Some(ExtractError::UnsupportedFileType(ext)) if ext == "png"
    ));
    assert!(list_files(tmp.path()).is_empty());
    assert!(fakes.archiver.keys.lock().unwrap().is_empty());
    assert_eq!(session.state(), SessionState::NoDocument);
}

#[tokio::test]
async fn rejected_upload_keeps_active_document() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();
    session.ask("When are you open?").await.unwrap().collect_text().await.unwrap();
    assert_eq!(session.transcript().len(), 2);

    let err = session
        .load_document(&UploadedFile::new("scan.png", vec![0u8; 16]), &NoProgress)
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<ExtractError>().is_some());
    session
        .load_document(&UploadedFile::new("..", "text"), &NoProgress)
        .await
        .unwrap_err();

    assert_eq!(session.state(), SessionState::AwaitingQuestion);
    assert_eq!(session.transcript().len(), 2);
    assert_eq!(session.document().unwrap().stats.filename, "policy.txt");
}

#[tokio::test]
async fn asking_without_document_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));

    let err = session.ask("When are you open?").await.err().unwrap();
    assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::NoDocument));
    assert!(session.transcript().is_empty());
}

#[tokio::test]
async fn failed_load_clears_document_and_transcript() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();
    session.ask("When are you open?").await.unwrap().collect_text().await.unwrap();
    assert_eq!(session.transcript().len(), 2);

    // Same root and namespace, but the embedding provider now fails.
    let failing = Arc::new(Pipeline::new(
        Config::with_cache_root(tmp.path()),
        Arc::new(KeywordEmbedder::failing()),
        fakes.chat.clone(),
        fakes.archiver.clone(),
    ));
    let mut session = Session::new("s1", "alice", failing);
    session.load_document(&policy(), &NoProgress).await.unwrap();
    session.ask("hours?").await.unwrap().collect_text().await.unwrap();

    let err = session
        .load_document(&UploadedFile::new("handbook.txt", "Parking is free."), &NoProgress)
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("embedding quota exceeded"));
    assert_eq!(session.state(), SessionState::NoDocument);
    assert!(!session.is_ready());
    assert!(session.transcript().is_empty());
}

#[tokio::test]
async fn loading_new_document_keeps_transcript() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();
    session.ask("When are you open?").await.unwrap().collect_text().await.unwrap();

    session
        .load_document(&UploadedFile::new("parking.txt", "Parking is free for patients."), &NoProgress)
        .await
        .unwrap();
    assert_eq!(session.transcript().len(), 2);
    assert_eq!(session.document().unwrap().stats.filename, "parking.txt");

    session.clear_document();
    assert!(session.transcript().is_empty());
    assert_eq!(session.state(), SessionState::NoDocument);
}

#[tokio::test]
async fn archive_failure_does_not_fail_load() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let pipeline = Arc::new(Pipeline::new(
        Config::with_cache_root(tmp.path()),
        fakes.embedder.clone(),
        fakes.chat.clone(),
        Arc::new(common::RecordingArchiver {
            fail: true,
            ..Default::default()
        }),
    ));
    let mut session = Session::new("s1", "alice", pipeline);

    let stats = session.load_document(&policy(), &NoProgress).await.unwrap();
    assert!(!stats.archived);
    assert!(session.is_ready());
}

#[tokio::test]
async fn merged_context_has_no_duplicate_chunks() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut config = Config::with_cache_root(tmp.path());
    config.chunking.chunk_size = 40;
    config.chunking.chunk_overlap = 8;
    let mut session = Session::new("s1", "alice", fakes.pipeline_with(config));

    let text = "Clinic hours are 9am-6pm.\nWe open on weekdays only.\nParking is free.\n\
                A doctor is on call.\nPrices are listed at the desk.\nWeekend visits need a booking.\n";
    let stats = session
        .load_document(&UploadedFile::new("handbook.txt", text), &NoProgress)
        .await
        .unwrap();
    assert!(stats.chunks > 4);

    let answer = session.ask("When are you open?").await.unwrap();
    let indexes: Vec<usize> = answer.context().chunks.iter().map(|c| c.chunk_index).collect();
    let unique: HashSet<usize> = indexes.iter().copied().collect();
    assert_eq!(indexes.len(), unique.len());
    assert!(indexes.len() >= 4);
}

#[tokio::test]
async fn blank_question_is_rejected_without_recording() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    session.load_document(&policy(), &NoProgress).await.unwrap();

    let err = session.ask("   ").await.err().unwrap();
    assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::EmptyQuestion));
    assert!(session.transcript().is_empty());
}

#[tokio::test]
async fn configured_dims_mismatch_fails_load_without_caching() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut config = Config::with_cache_root(tmp.path());
    config.embedding.dims = Some(5);
    let mut session = Session::new("s1", "alice", fakes.pipeline_with(config));

    let err = session.load_document(&policy(), &NoProgress).await.unwrap_err();
    assert!(format!("{:#}", err).contains("expected 5"), "{:#}", err);
    assert_eq!(session.state(), SessionState::NoDocument);

    let mut session = Session::new("s1", "alice", fakes.pipeline(tmp.path()));
    let stats = session.load_document(&policy(), &NoProgress).await.unwrap();
    assert_eq!(stats.cached, 0);
    assert_eq!(stats.embedded, 1);
}

/// Embeds documents like [`KeywordEmbedder`] but returns short query vectors.
struct ShortQueryEmbedder(KeywordEmbedder);

#[async_trait::async_trait]
impl EmbeddingProvider for ShortQueryEmbedder {
    fn model_name(&self) -> &str {
        self.0.model_name()
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.0.embed(texts).await
    }

    async fn embed_query(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

#[tokio::test]
async fn query_vector_of_wrong_length_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let fakes = Fakes::new(ChatScript::Normal);
    let mut config = Config::with_cache_root(tmp.path());
    config.retrieval.query_count = 0;
    let pipeline = Arc::new(Pipeline::new(
        config,
        Arc::new(ShortQueryEmbedder(KeywordEmbedder::default())),
        fakes.chat.clone(),
        fakes.archiver.clone(),
    ));
    let mut session = Session::new("s1", "alice", pipeline);
    session.load_document(&policy(), &NoProgress).await.unwrap();

    let err = session.ask("When are you open?").await.err().unwrap();
    assert!(err.to_string().contains("2 dimensions"), "{}", err);
    assert_eq!(fakes.chat.stream_calls.load(Ordering::SeqCst), 0);
}
