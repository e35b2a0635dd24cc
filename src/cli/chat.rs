//! Line-oriented interactive chat

use std::error::Error;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::cli::health::{change_line, offline_line, status_report};
use crate::cli::say::{cancel_on_ctrl_c, reply_footer};
use crate::core::config::Config;
use crate::core::services::Services;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Input<'a> {
    Empty,
    Quit,
    New,
    Status,
    Unknown(&'a str),
    Message(&'a str),
}

pub(crate) fn parse_input(line: &str) -> Input<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Input::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(trimmed);
    };
    match command.split_whitespace().next().unwrap_or_default() {
        "quit" | "exit" | "q" => Input::Quit,
        "new" => Input::New,
        "status" => Input::Status,
        _ => Input::Unknown(trimmed),
    }
}

pub async fn run_chat(config: &Config, conversation: Option<String>) -> Result<(), Box<dyn Error>> {
    let services = Services::from_config(config)?;

    let health = services.health.clone();
    let _status = services.health.subscribe(move |change| {
        eprintln!("\n{}", change_line(change, &health.status()));
    });
    let _offline = services
        .recovery
        .subscribe(|change| eprintln!("\n{}", offline_line(change)));
    services.start();

    println!(
        "Chatting with {}. Type /quit to leave, /new for a fresh conversation.",
        services.base_url
    );

    let mut conversation = conversation;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::New => {
                conversation = None;
                println!("Started a new conversation.");
            }
            Input::Status => {
                let report = status_report(
                    &services.health.status(),
                    services.recovery.degradation_level(),
                    services.recovery.is_offline(),
                    &services.recovery.circuit_states(),
                    &services.requests.stats(),
                );
                for line in report {
                    println!("  {line}");
                }
            }
            Input::Unknown(command) => eprintln!("❌ Unknown command: {command}"),
            Input::Message(text) => {
                let cancel = CancellationToken::new();
                let interrupt = cancel_on_ctrl_c(&cancel);
                let result = services
                    .chat
                    .send_message(text, conversation.as_deref(), Some(cancel))
                    .await;
                interrupt.abort();

                match result {
                    Ok(reply) => {
                        println!("{}", reply.response);
                        let is_new =
                            conversation.as_deref() != Some(reply.conversation_id.as_str());
                        for line in reply_footer(&reply, is_new) {
                            eprintln!("{line}");
                        }
                        conversation = Some(reply.conversation_id);
                    }
                    Err(err) if err.is_cancelled() => eprintln!("Cancelled."),
                    Err(err) => eprintln!("❌ {}", err.user_message()),
                }
            }
        }
    }

    services.shutdown();
    Ok(())
}
