//! Interactive chat loop.

use anyhow::Result;
use compare_core::{SessionController, SessionError};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::render;

const HELP: &str = "\
Commands:
  <text>              send a message to every active model
  /add <id>           bring a model into the comparison
  /remove <id>        drop a model from the comparison
  /rate <n> <1-5>     rate response [n]
  /status             show models, budgets and the transcript
  /end                end the session and show the summary
  /help               show this help";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Send(String),
    Add(String),
    Remove(String),
    Rate { index: usize, value: u8 },
    Status,
    End,
    Help,
}

/// Parse a line of input. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ReplCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(ReplCommand::Send(line.to_string())));
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let parsed = match (command, args.as_slice()) {
        ("/add", [id]) => ReplCommand::Add((*id).to_string()),
        ("/remove", [id]) => ReplCommand::Remove((*id).to_string()),
        ("/rate", [index, value]) => ReplCommand::Rate {
            index: index
                .parse()
                .map_err(|_| format!("'{index}' is not a response number"))?,
            value: value
                .parse()
                .map_err(|_| format!("'{value}' is not a rating"))?,
        },
        ("/status", []) => ReplCommand::Status,
        ("/end" | "/quit" | "/exit", []) => ReplCommand::End,
        ("/help", []) => ReplCommand::Help,
        ("/add" | "/remove", _) => return Err(format!("usage: {command} <id>")),
        ("/rate", _) => return Err("usage: /rate <n> <1-5>".to_string()),
        _ => return Err(format!("unknown command '{command}', try /help")),
    };
    Ok(Some(parsed))
}

/// Drive one session from stdin until `/end`, EOF or Ctrl-C.
pub async fn run(session: SessionController) -> Result<()> {
    println!("{HELP}\n");
    print_status(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let command = match parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            ReplCommand::Send(text) => send(&session, &text),
            ReplCommand::Add(id) => report(session.add_provider(&id), &format!("{id} joined")),
            ReplCommand::Remove(id) => report(session.remove_provider(&id), &format!("{id} left")),
            ReplCommand::Rate { index, value } => rate(&session, index, value),
            ReplCommand::Status => print_status(&session),
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::End => break,
        }
    }

    let summary = session.end();
    for line in render::summary_lines(&session, &summary) {
        println!("{line}");
    }
    Ok(())
}

fn send(session: &SessionController, text: &str) {
    let round = match session.send_user_message(text) {
        Ok(Some(round)) => round,
        Ok(None) => return,
        Err(e) => {
            println!("{e}");
            return;
        }
    };

    tracing::debug!(trace_id = %round.trace_id(), in_flight = round.in_flight(), "Round dispatched");

    // Print as providers settle without blocking the prompt
    let session = session.clone();
    tokio::spawn(async move {
        let mut round = round;
        while let Some(outcome) = round.next_outcome().await {
            println!("{}", render::outcome_line(&session, &outcome));
        }
    });
}

fn rate(session: &SessionController, index: usize, value: u8) {
    let Some(message) = index
        .checked_sub(1)
        .and_then(|i| session.messages().get(i).cloned())
    else {
        println!("No response [{index}]");
        return;
    };
    report(session.rate(message.id, value), &format!("Rated [{index}] {value}/5"));
}

fn report(result: Result<(), SessionError>, ok: &str) {
    match result {
        Ok(()) => println!("{ok}"),
        Err(e) => println!("{e}"),
    }
}

fn print_status(session: &SessionController) {
    println!("Active models:");
    for member in session.active_providers() {
        let id = member.provider_id.as_str();
        let entry = session.ledger_entry(id);
        let mut line = format!("  {id}: {}", render::budget_label(entry));
        let refresh = render::refresh_label(entry, session.refresh_in(id));
        if !refresh.is_empty() {
            line.push_str(&format!(" ({refresh})"));
        }
        if session.is_exhausted(id) {
            line.push_str(" [exhausted]");
        }
        println!("{line}");
    }

    let messages = session.messages();
    if !messages.is_empty() {
        println!("Transcript:");
        for (i, message) in messages.iter().enumerate() {
            println!("  {}", render::message_line(session, i + 1, message));
        }
    }
}
