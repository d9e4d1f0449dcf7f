//! One user's conversation with one document.
//!
//! ```text
//! NoDocument --load ok--> AwaitingQuestion --ask--> Generating --stream ends--> AwaitingQuestion
//!     ^                        |
//!     +------load fails--------+   (rejected uploads change nothing)
//! ```
//!
//! A session handles one interaction at a time: [`Session::ask`] borrows it
//! mutably for as long as the returned [`AnswerStream`] lives. Loading a new
//! document keeps the transcript; a failed load or [`Session::clear_document`]
//! clears it.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::answer::{self, AnswerStream};
use crate::cache;
use crate::extract;
use crate::models::{Role, TranscriptEntry, UploadedFile};
use crate::pipeline::{LoadStats, LoadedDocument, Pipeline};
use crate::progress::LoadProgressReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoDocument,
    AwaitingQuestion,
    /// Only observable from outside the session, e.g. while the server holds
    /// the session lock for a streaming answer.
    Generating,
    /// Like `Generating`, but the lock is held by a document upload.
    Loading,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no document loaded; upload a document first")]
    NoDocument,
    #[error("question must not be empty")]
    EmptyQuestion,
}

pub struct Session {
    id: String,
    namespace: String,
    pipeline: Arc<Pipeline>,
    document: Option<LoadedDocument>,
    transcript: Vec<TranscriptEntry>,
}

impl Session {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            id: id.into(),
            namespace: namespace.into(),
            pipeline,
            document: None,
            transcript: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        if self.document.is_some() {
            SessionState::AwaitingQuestion
        } else {
            SessionState::NoDocument
        }
    }

    pub fn is_ready(&self) -> bool {
        self.document.is_some()
    }

    pub fn document(&self) -> Option<&LoadedDocument> {
        self.document.as_ref()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    /// Process `file` and make it the session's document.
    ///
    /// A file that is rejected up front (unsupported type, bad name) leaves
    /// the session untouched. A failure after processing has started leaves
    /// it without a document.
    pub async fn load_document(
        &mut self,
        file: &UploadedFile,
        progress: &dyn LoadProgressReporter,
    ) -> Result<&LoadStats> {
        extract::check_supported(file)?;
        cache::validate_namespace(&self.namespace)?;
        cache::sanitize_filename(&file.filename)?;

        // Drop the previous index before building the new one.
        self.document = None;
        let loaded = self
            .pipeline
            .load_document(&self.namespace, file, progress)
            .await;
        match loaded {
            Ok(doc) => {
                let doc = self.document.insert(doc);
                Ok(&doc.stats)
            }
            Err(e) => {
                tracing::warn!(session = %self.id, file = %file.filename, error = %format!("{:#}", e), "document load failed");
                self.clear_document();
                Err(e)
            }
        }
    }

    /// Forget the document and the transcript.
    pub fn clear_document(&mut self) {
        self.document = None;
        self.transcript.clear();
    }

    /// Ask a question about the loaded document.
    ///
    /// The question is recorded immediately; the answer is recorded when the
    /// returned stream ends, fails, or is dropped.
    pub async fn ask(&mut self, question: &str) -> Result<AnswerStream<'_>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(SessionError::EmptyQuestion.into());
        }
        let doc = self.document.as_ref().ok_or(SessionError::NoDocument)?;

        self.transcript.push(TranscriptEntry {
            message: question.to_string(),
            role: Role::Human,
        });

        let context = doc.retriever.retrieve(question).await?;
        let tokens = answer::generate_answer(self.pipeline.chat().as_ref(), &context, question).await?;
        Ok(AnswerStream::new(tokens, &mut self.transcript, context))
    }
}
