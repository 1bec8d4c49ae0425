//! Interactive console.
//!
//! One conversation (`console`), one turn at a time. Besides chat turns the
//! REPL understands `quit`/`exit`, `clear` and `!tool <name> <arg>`.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::agent_core::ConversationLoop;

/// Conversation identity used by the console.
pub const CONSOLE_IDENTITY: &str = "console";

const TURN_FAILURE_REPLY: &str = "Sorry, something went wrong while handling that message.";

/// A parsed line of console input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Clear,
    Tool { name: &'a str, arg: &'a str },
    ToolUsage,
    Message(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
        return Command::Quit;
    }
    if line.eq_ignore_ascii_case("clear") {
        return Command::Clear;
    }

    let rest = match line.strip_prefix("!tool") {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest.trim(),
        _ => return Command::Message(line),
    };
    match rest.split_once(char::is_whitespace) {
        Some((name, arg)) if !arg.trim().is_empty() => Command::Tool {
            name,
            arg: arg.trim(),
        },
        _ => Command::ToolUsage,
    }
}

/// Run the REPL until `quit`, `exit` or end of input.
pub async fn run_console<R, W>(
    chat: &ConversationLoop,
    preamble: &str,
    input: R,
    mut output: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let banner = format!(
        "\n--- toolchat console ---\nModel: {}\nTools: {}\nType 'quit' to exit, 'clear' to reset memory, '!tool <name> <arg>' to run a tool.\n{}\n",
        chat.model_name(),
        if chat.tools_enabled() { "enabled" } else { "disabled" },
        "-".repeat(25),
    );
    output.write_all(banner.as_bytes()).await?;

    let mut lines = input.lines();
    loop {
        output.write_all(b"User: ").await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            output.write_all(b"\nExiting...\n").await?;
            break;
        };

        match parse_command(&line) {
            Command::Empty => continue,
            Command::Quit => {
                output.write_all(b"Exiting.\n").await?;
                break;
            }
            Command::Clear => {
                let text = match chat.clear(CONSOLE_IDENTITY).await {
                    Ok(removed) => {
                        tracing::info!(removed, "console memory cleared");
                        "Memory cleared.\n".to_string()
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to clear console memory");
                        format!("Failed to clear memory: {e}\n")
                    }
                };
                output.write_all(text.as_bytes()).await?;
            }
            Command::ToolUsage => {
                output.write_all(b"Usage: !tool <name> <arg>\n").await?;
            }
            Command::Tool { .. } if !chat.tools_enabled() => {
                output.write_all(b"Tools are disabled.\n").await?;
            }
            Command::Tool { name, arg } => {
                let text = match chat.registry().invoke_direct(name, arg).await {
                    None => format!("Tool '{name}' not found.\n"),
                    Some(Ok(result)) => format!("Tool '{name}' result:\n{result}\n"),
                    Some(Err(e)) => format!("Tool '{name}' failed: {e}\n"),
                };
                output.write_all(text.as_bytes()).await?;
            }
            Command::Message(text) => {
                output.write_all(b"Bot: Thinking...\n").await?;
                output.flush().await?;
                let reply = match chat.handle_turn(CONSOLE_IDENTITY, preamble, text).await {
                    Ok(outcome) => {
                        let mut out = String::new();
                        for tool in &outcome.tools_used {
                            out.push_str(&format!("Bot: (used tool '{tool}')\n"));
                        }
                        out.push_str(&format!("Bot: {}\n", outcome.display_text()));
                        out
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "console turn failed");
                        format!("Bot: {TURN_FAILURE_REPLY}\n")
                    }
                };
                output.write_all(reply.as_bytes()).await?;
            }
        }
    }

    output.write_all(b"--- Session ended ---\n").await?;
    output.flush().await
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::conversation_loop::tests::{build_loop, ScriptedBackend};
    use crate::agent_core::LoopSettings;
    use crate::inference::types::Role;
    use std::sync::Arc;

    async fn run_script(chat: &ConversationLoop, input: &str) -> String {
        let mut out = Vec::new();
        run_console(chat, "You are helpful.", input.as_bytes(), &mut out)
            .await
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    fn tools_on() -> LoopSettings {
        LoopSettings {
            max_tool_iterations: 3,
            tools_enabled: true,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), Command::Empty);
        assert_eq!(parse_command("QUIT"), Command::Quit);
        assert_eq!(parse_command("exit"), Command::Quit);
        assert_eq!(parse_command(" clear "), Command::Clear);
        assert_eq!(parse_command("!tool"), Command::ToolUsage);
        assert_eq!(parse_command("!tool nmap_scan"), Command::ToolUsage);
        assert_eq!(
            parse_command("!tool nmap_scan 10.0.0.1"),
            Command::Tool {
                name: "nmap_scan",
                arg: "10.0.0.1"
            }
        );
        assert_eq!(
            parse_command("!toolbox please"),
            Command::Message("!toolbox please")
        );
        assert_eq!(parse_command("hello there"), Command::Message("hello there"));
    }

    #[tokio::test]
    async fn test_turn_prints_tools_and_reply() {
        let backend = Arc::new(ScriptedBackend::replies(&[
            r#"{"tool_name":"get_current_datetime","arguments":{}}"#,
            "It is late.",
        ]));
        let (chat, store) = build_loop(backend, tools_on());

        let out = run_script(&chat, "what time is it?\nquit\n").await;
        assert!(out.contains("Bot: (used tool 'get_current_datetime')\n"));
        assert!(out.contains("Bot: It is late.\n"));
        assert!(out.contains("Exiting."));
        assert_eq!(store.read(CONSOLE_IDENTITY, None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_clear_command() {
        let backend = Arc::new(ScriptedBackend::always("hi"));
        let (chat, store) = build_loop(backend, LoopSettings::default());
        store
            .append(CONSOLE_IDENTITY, Role::User, "old")
            .await
            .unwrap();

        let out = run_script(&chat, "clear\n").await;
        assert!(out.contains("Memory cleared."));
        assert!(store.read(CONSOLE_IDENTITY, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tool_command_bypasses_model() {
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (chat, _store) = build_loop(Arc::clone(&backend), tools_on());

        let out = run_script(
            &chat,
            "!tool get_current_datetime now\n!tool nope x\n!tool\n",
        )
        .await;
        assert!(out.contains("Tool 'get_current_datetime' result:\nThe current date and time is: "));
        assert!(out.contains("Tool 'nope' not found."));
        assert!(out.contains("Usage: !tool <name> <arg>"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_tool_command_refused_when_tools_disabled() {
        let backend = Arc::new(ScriptedBackend::always("unused"));
        let (chat, _store) = build_loop(Arc::clone(&backend), LoopSettings::default());

        let out = run_script(&chat, "!tool get_current_datetime now\n").await;
        assert!(out.contains("Tools are disabled."));
        assert!(!out.contains("result:"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_eof_exits_cleanly() {
        let backend = Arc::new(ScriptedBackend::always("hi"));
        let (chat, _store) = build_loop(Arc::clone(&backend), LoopSettings::default());

        let out = run_script(&chat, "").await;
        assert!(out.contains("Exiting..."));
        assert!(out.ends_with("--- Session ended ---\n"));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_reply_placeholder() {
        let backend = Arc::new(ScriptedBackend::always("   "));
        let (chat, _store) = build_loop(backend, LoopSettings::default());

        let out = run_script(&chat, "hello\n").await;
        assert!(out.contains("Bot: (empty response)\n"));
    }
}
