//! Fixed prompts: the consultation persona, query paraphrasing, and the
//! answer used when nothing relevant was retrieved.

use crate::llm::ChatMessage;

/// Persona prompt. `{context}` is replaced by the retrieved chunks.
pub const SYSTEM_PROMPT: &str = "\
You are the head of professional consultation at the urology department. \
Our goal is to welcome patients to our hospital by answering every inquiry \
with the utmost kindness and warmth. \
Answer using ONLY the context below. Never add facts that are not in the context. \
If you are unsure, or the context does not contain the answer, kindly and warmly \
encourage the inquirer to contact the hospital directly for more information.

To help patients feel at ease, use friendly emoticons like these:
Example 1: Hello~ Good morning!
Example 2: Thank you for your question ^^ The answer is as follows!

If you have already greeted the patient with 안녕하세요, do not repeat 안녕하세요.

Context: {context}";

/// Streamed instead of calling the model when retrieval found nothing.
pub const FALLBACK_ANSWER: &str = "Thank you for your question ^^ \
I'm sorry, I couldn't find that information in the document I was given. \
Please contact the hospital directly and our staff will be happy to help you!";

/// Messages for the answer model: persona with context, then the question.
pub fn answer_messages(context: &str, question: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT.replace("{context}", context)),
        ChatMessage::user(question),
    ]
}

/// Messages asking for `count` alternative phrasings of `question`.
pub fn paraphrase_messages(question: &str, count: usize) -> Vec<ChatMessage> {
    vec![ChatMessage::user(format!(
        "You are an AI language model assistant. Your task is to generate {count} \
different versions of the given user question to retrieve relevant documents \
from a vector database. By generating multiple perspectives on the user question, \
your goal is to help the user overcome some of the limitations of distance-based \
similarity search. Provide these alternative questions separated by newlines, \
with no numbering.\nOriginal question: {question}"
    ))]
}

/// Pull up to `count` questions out of the model's reply, one per line.
///
/// List markers such as `1.`, `2)`, `-` and `*` are stripped.
pub fn parse_paraphrases(reply: &str, count: usize) -> Vec<String> {
    reply
        .lines()
        .map(strip_list_marker)
        .filter(|l| !l.is_empty())
        .take(count)
        .map(|l| l.to_string())
        .collect()
}

fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let line = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line);
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return rest.trim();
        }
    }
    line.trim()
}
