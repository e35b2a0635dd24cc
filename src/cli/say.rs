//! One-shot "say" command

use std::error::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ChatResponse;
use crate::core::config::Config;
use crate::core::services::Services;

pub async fn run_say(
    config: &Config,
    prompt: Vec<String>,
    conversation: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    let services = Services::from_config(config)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel_on_ctrl_c(&cancel);
    let result = services
        .chat
        .send_message(&prompt, conversation.as_deref(), Some(cancel))
        .await;
    interrupt.abort();
    services.shutdown();

    match result {
        Ok(reply) => {
            println!("{}", reply.response);
            for line in reply_footer(&reply, true) {
                eprintln!("{line}");
            }
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            eprintln!("Cancelled.");
            Ok(())
        }
        Err(err) => Err(err.user_message().into()),
    }
}

/// Cancels `token` when the user presses Ctrl+C. Abort the handle once the
/// guarded work is done.
pub(crate) fn cancel_on_ctrl_c(token: &CancellationToken) -> JoinHandle<()> {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

pub(crate) fn reply_footer(reply: &ChatResponse, show_conversation: bool) -> Vec<String> {
    let mut lines = Vec::new();
    if !reply.mcp_tools_used.is_empty() {
        lines.push(format!("🔧 Tools used: {}", reply.mcp_tools_used.join(", ")));
    }
    if show_conversation {
        lines.push(format!("💬 Conversation: {}", reply.conversation_id));
    }
    lines
}
