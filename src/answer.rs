//! Answer generation and transcript bookkeeping for one question.

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::llm::{ChatModel, TokenStream};
use crate::models::{RetrievedContext, Role, TranscriptEntry};
use crate::prompt;

/// Start streaming an answer grounded in `context`.
///
/// With no context there is nothing to ground an answer in, so the model is
/// not called and the fixed fallback is streamed instead.
pub async fn generate_answer(
    chat: &dyn ChatModel,
    context: &RetrievedContext,
    question: &str,
) -> Result<TokenStream> {
    if context.is_empty() {
        return Ok(Box::pin(futures_util::stream::iter(vec![Ok(
            prompt::FALLBACK_ANSWER.to_string(),
        )])));
    }
    let messages = prompt::answer_messages(&context.format(), question);
    chat.stream(&messages).await
}

/// Fragments of one answer, recorded in the transcript when the stream ends.
///
/// The accumulated text is appended as an `ai` entry exactly once: when the
/// model finishes, when it fails mid-stream (partial text is kept), or when
/// the stream is dropped before the end. Nothing is recorded if no text was
/// produced.
pub struct AnswerStream<'a> {
    inner: TokenStream,
    buffer: String,
    transcript: &'a mut Vec<TranscriptEntry>,
    context: RetrievedContext,
    finished: bool,
}

impl<'a> AnswerStream<'a> {
    pub fn new(
        inner: TokenStream,
        transcript: &'a mut Vec<TranscriptEntry>,
        context: RetrievedContext,
    ) -> Self {
        Self {
            inner,
            buffer: String::new(),
            transcript,
            context,
            finished: false,
        }
    }

    /// The chunks the answer is grounded in.
    pub fn context(&self) -> &RetrievedContext {
        &self.context
    }

    pub fn text_so_far(&self) -> &str {
        &self.buffer
    }

    /// Drain the stream and return the full answer.
    pub async fn collect_text(mut self) -> Result<String> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.buffer.clone())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if !self.buffer.is_empty() {
            self.transcript.push(TranscriptEntry {
                message: self.buffer.clone(),
                role: Role::Ai,
            });
        }
    }
}

impl Stream for AnswerStream<'_> {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(token))) => {
                this.buffer.push_str(&token);
                Poll::Ready(Some(Ok(token)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, kept = this.buffer.len(), "answer stream failed; keeping partial answer");
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for AnswerStream<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn tokens(items: Vec<Result<&str>>) -> TokenStream {
        let owned: Vec<Result<String>> = items.into_iter().map(|r| r.map(String::from)).collect();
        Box::pin(futures_util::stream::iter(owned))
    }

    #[tokio::test]
    async fn complete_answer_recorded_once() {
        let mut transcript = Vec::new();
        let stream = AnswerStream::new(
            tokens(vec![Ok("Hello"), Ok("~ "), Ok("9am")]),
            &mut transcript,
            RetrievedContext::default(),
        );
        let text = stream.collect_text().await.unwrap();
        assert_eq!(text, "Hello~ 9am");
        assert_eq!(
            transcript,
            vec![TranscriptEntry {
                message: "Hello~ 9am".to_string(),
                role: Role::Ai
            }]
        );
    }

    #[tokio::test]
    async fn partial_answer_kept_on_error() {
        let mut transcript = Vec::new();
        {
            let mut stream = AnswerStream::new(
                tokens(vec![
                    Ok("Clinic opens "),
                    Err(anyhow::anyhow!("connection reset")),
                    Ok("never seen"),
                ]),
                &mut transcript,
                RetrievedContext::default(),
            );
            assert_eq!(stream.next().await.unwrap().unwrap(), "Clinic opens ");
            assert!(stream.next().await.unwrap().is_err());
            assert!(stream.next().await.is_none());
        }
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].message, "Clinic opens ");
    }

    #[tokio::test]
    async fn dropped_stream_keeps_partial() {
        let mut transcript = Vec::new();
        {
            let mut stream = AnswerStream::new(
                tokens(vec![Ok("first"), Ok(" second")]),
                &mut transcript,
                RetrievedContext::default(),
            );
            stream.next().await;
        }
        assert_eq!(transcript[0].message, "first");
    }

    #[tokio::test]
    async fn nothing_recorded_without_text() {
        let mut transcript = Vec::new();
        let stream = AnswerStream::new(
            tokens(vec![Err(anyhow::anyhow!("401"))]),
            &mut transcript,
            RetrievedContext::default(),
        );
        assert!(stream.collect_text().await.is_err());
        assert!(transcript.is_empty());
    }

    struct UnreachableModel;

    #[async_trait::async_trait]
    impl ChatModel for UnreachableModel {
        fn model_name(&self) -> &str {
            "unreachable"
        }
        async fn complete(&self, _messages: &[crate::llm::ChatMessage]) -> Result<String> {
            panic!("model must not be called")
        }
        async fn stream(&self, _messages: &[crate::llm::ChatMessage]) -> Result<TokenStream> {
            panic!("model must not be called")
        }
    }

    #[tokio::test]
    async fn empty_context_streams_fallback_without_model() {
        let stream = generate_answer(&UnreachableModel, &RetrievedContext::default(), "Hours?")
            .await
            .unwrap();
        let parts: Vec<String> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(parts.concat(), prompt::FALLBACK_ANSWER);
    }

    #[test]
    fn context_accessor_returns_chunks() {
        let mut transcript = Vec::new();
        let context = RetrievedContext {
            chunks: vec![Chunk {
                chunk_index: 0,
                start: 0,
                end: 5,
                text: "hours".to_string(),
                hash: String::new(),
            }],
            queries: vec!["q".to_string()],
        };
        let stream = AnswerStream::new(tokens(vec![]), &mut transcript, context);
        assert_eq!(stream.context().chunks.len(), 1);
        assert_eq!(stream.text_so_far(), "");
    }
}
