//! Line-based terminal chat against a running Dealchat server.
//!
//! Plain lines are sent as messages. Lines starting with `/` are session
//! commands. Tool proposals are shown and run only after a `y` answer.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use dealchat_client::{
    ChatSession, ClientError, ConfirmReply, HttpConversationApi, SendOutcome,
};
use dealchat_core::clock::SystemClock;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    List,
    New,
    Open(usize),
    Rename(String),
    Delete,
    Help,
    Quit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "list" | "ls" => Command::List,
        "new" => Command::New,
        "open" => match arg.parse::<usize>() {
            Ok(n) if n > 0 => Command::Open(n),
            _ => Command::Unknown(line.to_string()),
        },
        "rename" if !arg.is_empty() => Command::Rename(arg.to_string()),
        "delete" => Command::Delete,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    };
    Some(command)
}

const HELP: &str = "Commands: /list, /open <n>, /new, /rename <title>, /delete, /quit";

/// Run the interactive loop until stdin closes or `/quit`.
pub async fn run(base_url: &str, token: String) -> Result<(), ClientError> {
    let api = Arc::new(HttpConversationApi::new(base_url, token));
    let mut session = ChatSession::new(api, Arc::new(SystemClock));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    session.refresh().await?;
    println!("Connected to {}. {}", base_url, HELP);

    loop {
        prompt("> ");
        let Some(line) = next_line(&mut lines).await else {
            return Ok(());
        };
        let Some(command) = parse_command(&line) else {
            continue;
        };

        let result = match command {
            Command::Quit => return Ok(()),
            Command::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Command::Unknown(input) => {
                println!("Unknown command: {}. {}", input, HELP);
                Ok(())
            }
            Command::List => session.refresh().await.map(|_| print_list(&session)),
            Command::New => {
                session.start_new();
                println!("Started a new conversation.");
                Ok(())
            }
            Command::Open(n) => {
                let id = session.state().conversations().get(n - 1).map(|c| c.id);
                if id.is_some_and(|id| session.select(id)) {
                    print_transcript(&session);
                } else {
                    println!("No conversation #{}", n);
                }
                Ok(())
            }
            Command::Rename(title) => match session.state().active_id() {
                Some(id) => session.rename(id, &title).await,
                None => {
                    println!("No active conversation.");
                    Ok(())
                }
            },
            Command::Delete => {
                match session.state().active_id() {
                    Some(id) => {
                        // Fire and forget; failures are logged by the session.
                        drop(session.delete(id));
                        println!("Deleted.");
                    }
                    None => println!("No active conversation."),
                }
                Ok(())
            }
            Command::Send(text) => send(&mut session, &mut lines, &text).await,
        };

        if let Err(e) = result {
            println!("Error: {}", e);
        }
    }
}

async fn send(
    session: &mut ChatSession<HttpConversationApi>,
    lines: &mut Lines<BufReader<Stdin>>,
    text: &str,
) -> Result<(), ClientError> {
    let outcome = session
        .send(text, |chunk| {
            print!("{}", chunk);
            let _ = std::io::stdout().flush();
        })
        .await?;

    match outcome {
        SendOutcome::Replied => println!(),
        SendOutcome::Unconfirmed => println!("\n(reply not confirmed by the server)"),
        SendOutcome::Proposal(proposal) => {
            let input = serde_json::to_string(&proposal.input).unwrap_or_default();
            println!("The assistant wants to run {} with {}", proposal.tool_name, input);
            prompt("Run it? [y/N] ");
            let answer = next_line(lines).await.unwrap_or_default();
            let confirmed = matches!(answer.trim(), "y" | "Y" | "yes");
            match session.confirm(confirmed).await? {
                ConfirmReply::Results(rows) => {
                    println!("{} result(s)", rows.len());
                    for row in rows {
                        println!("{}", serde_json::to_string_pretty(&row).unwrap_or_default());
                    }
                }
                ConfirmReply::Cancelled => println!("Cancelled."),
            }
        }
    }
    Ok(())
}

async fn next_line(lines: &mut Lines<BufReader<Stdin>>) -> Option<String> {
    match lines.next_line().await {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read stdin");
            None
        }
    }
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

fn print_list(session: &ChatSession<HttpConversationApi>) {
    let state = session.state();
    if state.conversations().is_empty() {
        println!("No conversations yet.");
        return;
    }
    for (i, c) in state.conversations().iter().enumerate() {
        let marker = if state.active_id() == Some(c.id) { "*" } else { " " };
        println!("{}{:>3}. {} ({} messages)", marker, i + 1, c.title, c.messages.len());
    }
}

fn print_transcript(session: &ChatSession<HttpConversationApi>) {
    for message in session.state().messages() {
        println!("[{}] {}", message.role.as_str(), message.content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_sent() {
        assert_eq!(
            parse_command("  deals in Austin? "),
            Some(Command::Send("deals in Austin?".to_string()))
        );
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse_command("/list"), Some(Command::List));
        assert_eq!(parse_command("/open 2"), Some(Command::Open(2)));
        assert_eq!(
            parse_command("/rename Q3 pipeline"),
            Some(Command::Rename("Q3 pipeline".to_string()))
        );
        assert_eq!(parse_command("/exit"), Some(Command::Quit));
    }

    #[test]
    fn test_bad_commands_are_unknown() {
        assert!(matches!(parse_command("/open 0"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/open x"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/rename"), Some(Command::Unknown(_))));
        assert!(matches!(parse_command("/frobnicate"), Some(Command::Unknown(_))));
    }
}
