//! Line-oriented console frontend.
//!
//! Prints backend events to stdout and turns stdin lines into frontend
//! events. Logging goes to stderr so the two never mix.

use colored::Colorize;
use parley_bus::{EventBus, Subscription};
use parley_types::event::{BackendEvent, FrontendEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// Command that leaves the chat.
pub const QUIT_COMMAND: &str = "/quit";

/// What one line of input asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Quit,
    Blank,
}

pub fn parse_line(line: &str) -> Input {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim() == QUIT_COMMAND {
        Input::Quit
    } else if trimmed.trim().is_empty() {
        Input::Blank
    } else {
        Input::Message(trimmed.to_string())
    }
}

/// Format a backend event for the terminal.
pub fn render(event: &BackendEvent) -> String {
    match event {
        BackendEvent::ReceiveMessage { from, message } => {
            format!("{}> {}", from.bright_cyan().bold(), message)
        }
        BackendEvent::SetPeerName { name } => {
            format!("{} peer is now known as {}", "*".bright_yellow(), name.bold())
        }
        BackendEvent::PeerConnected => {
            format!("{} {}", "+".bright_green(), "peer connected".dimmed())
        }
        BackendEvent::PeerDisconnected => {
            format!("{} {}", "-".bright_red(), "peer disconnected".dimmed())
        }
    }
}

/// Print every backend event until the subscription is dropped.
pub fn attach(bus: &Arc<EventBus>) -> Subscription {
    bus.subscribe(|event: &BackendEvent| println!("{}", render(event)))
}

pub fn banner(name: &str, listen: SocketAddr) {
    println!(
        "  {} {} {}",
        ">>".bright_cyan().bold(),
        "parley".bold(),
        format!("as {name} on {listen}").dimmed()
    );
    println!(
        "     {}",
        format!("type to chat, {QUIT_COMMAND} to leave").dimmed()
    );
}

/// Publish one `SendMessage` per input line until `/quit` or EOF, then
/// publish `Terminate`.
pub async fn pump_lines<R>(reader: R, bus: &EventBus)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Input::Message(message) => {
                    bus.send(FrontendEvent::send_message(message));
                }
                Input::Quit => break,
                Input::Blank => {}
            },
            Ok(None) => {
                debug!("Input closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read input");
                break;
            }
        }
    }
    bus.send(FrontendEvent::Terminate);
}

/// [`pump_lines`] over the process's stdin.
pub async fn read_stdin(bus: Arc<EventBus>) {
    pump_lines(BufReader::new(tokio::io::stdin()), &bus).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pumped(input: &'static str) -> Vec<FrontendEvent> {
        let bus = EventBus::new();
        let (_sub, mut rx) = bus.subscribe_channel::<FrontendEvent>();
        pump_lines(input.as_bytes(), &bus).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("hello"), Input::Message("hello".to_string()));
        assert_eq!(parse_line("  spaced  "), Input::Message("  spaced  ".to_string()));
        assert_eq!(parse_line("/quit\r"), Input::Quit);
        assert_eq!(parse_line("   "), Input::Blank);
    }

    #[test]
    fn test_render_contains_sender_and_text() {
        let line = render(&BackendEvent::ReceiveMessage {
            from: "alice".to_string(),
            message: "hi there".to_string(),
        });
        assert!(line.contains("alice"));
        assert!(line.ends_with("hi there"));
        assert!(render(&BackendEvent::PeerDisconnected).contains("disconnected"));
    }

    #[tokio::test]
    async fn test_lines_become_messages_then_terminate() {
        let events = pumped("hi\n\nsecond line\n").await;
        assert_eq!(
            events,
            vec![
                FrontendEvent::send_message("hi"),
                FrontendEvent::send_message("second line"),
                FrontendEvent::Terminate,
            ]
        );
    }

    #[tokio::test]
    async fn test_quit_stops_reading() {
        let events = pumped("bye\n/quit\nnever sent\n").await;
        assert_eq!(
            events,
            vec![FrontendEvent::send_message("bye"), FrontendEvent::Terminate]
        );
    }
}
