//! `docgpt ask` and `docgpt chat`: question answering from the terminal.
//!
//! Answers stream to stdout as they are generated; diagnostics go to stderr.

use anyhow::Result;
use futures_util::StreamExt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::answer::AnswerStream;
use crate::config::Config;
use crate::embed_cmd::read_upload;
use crate::models::TranscriptEntry;
use crate::pipeline::Pipeline;
use crate::progress::LoadProgressReporter;
use crate::session::Session;

const GREETING: &str = "I'm ready! Ask away!";

async fn open_session(
    config: &Config,
    namespace: &str,
    path: &Path,
    progress: &dyn LoadProgressReporter,
) -> Result<Session> {
    let file = read_upload(path)?;
    let pipeline = Arc::new(Pipeline::from_config(config.clone())?);
    let mut session = Session::new(uuid::Uuid::new_v4().to_string(), namespace, pipeline);
    session.load_document(&file, progress).await?;
    Ok(session)
}

/// Answer one question and exit.
pub async fn run_ask(
    config: &Config,
    namespace: &str,
    path: &Path,
    question: &str,
    progress: &dyn LoadProgressReporter,
) -> Result<()> {
    let mut session = open_session(config, namespace, path, progress).await?;
    let answer = session.ask(question).await?;
    print_answer(answer).await
}

/// Interactive loop on stdin until `/quit` or end of input.
pub async fn run_chat(
    config: &Config,
    namespace: &str,
    path: &Path,
    progress: &dyn LoadProgressReporter,
) -> Result<()> {
    let mut session = open_session(config, namespace, path, progress).await?;
    let interactive = atty::is(atty::Stream::Stdin);
    println!("{}", GREETING);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if interactive {
            print!("> ");
            std::io::stdout().flush()?;
        }
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/history" => print_transcript(session.transcript()),
            question => match session.ask(question).await {
                Ok(answer) => {
                    if let Err(e) = print_answer(answer).await {
                        eprintln!("Error: {:#}", e);
                    }
                }
                Err(e) => eprintln!("Error: {:#}", e),
            },
        }
    }
    Ok(())
}

async fn print_answer(mut answer: AnswerStream<'_>) -> Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(token) = answer.next().await {
        match token {
            Ok(token) => {
                write!(stdout, "{}", token)?;
                stdout.flush()?;
            }
            Err(e) => {
                writeln!(stdout)?;
                return Err(e);
            }
        }
    }
    writeln!(stdout)?;
    Ok(())
}

fn print_transcript(transcript: &[TranscriptEntry]) {
    if transcript.is_empty() {
        println!("(no messages yet)");
        return;
    }
    for entry in transcript {
        println!("[{}] {}", entry.role, entry.message);
    }
}
