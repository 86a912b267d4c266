//! Command surface (C12): `/sessions`, `/switch`, `/name`, `/delete`,
//! `/new`, `/clear` parsing, plus the shared prefix-resolution helper used
//! by `/switch` and `/delete`. Grounded on `zdx-bot/src/commands.rs`'s
//! static command table and bot-mention matcher, and
//! `original_source/src/takopi/telegram/commands/sessions.py` for which
//! operations each command performs.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BotCommand {
    /// `/sessions [engine]` — list sessions, optionally filtered to one engine.
    Sessions { engine: Option<String> },
    /// `/switch <prefix>` — switch the active session by resume-token prefix.
    Switch { prefix: String },
    /// `/name <title>` — name the active session of the current engine.
    Name { title: String },
    /// `/delete <prefix>` — delete a session by resume-token prefix.
    Delete { prefix: String },
    /// `/new` — clear the active pointer for the current engine.
    New,
    /// `/clear` — clear all active pointers (history retained).
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TelegramCommandSpec {
    pub command: &'static str,
    pub description: &'static str,
}

const TELEGRAM_COMMAND_SPECS: &[TelegramCommandSpec] = &[
    TelegramCommandSpec { command: "sessions", description: "List sessions for an engine" },
    TelegramCommandSpec { command: "switch", description: "Switch the active session by prefix" },
    TelegramCommandSpec { command: "name", description: "Name the active session" },
    TelegramCommandSpec { command: "delete", description: "Delete a session by prefix" },
    TelegramCommandSpec { command: "new", description: "Start a new conversation" },
    TelegramCommandSpec { command: "clear", description: "Clear all active sessions" },
];

pub(crate) fn telegram_command_specs() -> Vec<TelegramCommandSpec> {
    TELEGRAM_COMMAND_SPECS.to_vec()
}

/// Parses one line of chat text into a command, or `None` if it isn't one.
/// `/new` and `/clear` take no arguments and reject a trailing remainder
/// (mirroring the teacher's `parse_command`, which rejected `"/new please"`).
pub(crate) fn parse_command(text: &str) -> Option<BotCommand> {
    let trimmed = text.trim();
    let (head, rest) = split_head(trimmed);
    let rest = rest.trim();

    if command_matches(head, "/sessions") {
        let engine = (!rest.is_empty()).then(|| rest.to_string());
        return Some(BotCommand::Sessions { engine });
    }
    if command_matches(head, "/switch") {
        return Some(BotCommand::Switch { prefix: rest.to_string() });
    }
    if command_matches(head, "/name") {
        return Some(BotCommand::Name { title: rest.to_string() });
    }
    if command_matches(head, "/delete") {
        return Some(BotCommand::Delete { prefix: rest.to_string() });
    }
    if command_matches(head, "/new") && rest.is_empty() {
        return Some(BotCommand::New);
    }
    if command_matches(head, "/clear") && rest.is_empty() {
        return Some(BotCommand::Clear);
    }
    None
}

fn split_head(text: &str) -> (&str, &str) {
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim_start()),
        None => (text, ""),
    }
}

fn command_matches(head: &str, command: &str) -> bool {
    if head == command {
        return true;
    }
    head.strip_prefix(command).is_some_and(|stripped| stripped.starts_with('@'))
}

/// Result of resolving a user-typed prefix against a set of candidate keys.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PrefixMatch<T> {
    None,
    Unique(T),
    Ambiguous(usize),
}

/// Shared prefix-resolution logic for `/switch` and `/delete`: a prefix
/// must match exactly one candidate key to resolve. An empty prefix matches
/// everything, which is deliberate (ambiguous unless there's exactly one
/// session).
pub(crate) fn resolve_prefix<'a, T>(
    candidates: impl IntoIterator<Item = (&'a str, T)>,
    prefix: &str,
) -> PrefixMatch<T> {
    let mut matches: Vec<T> = candidates
        .into_iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .map(|(_, value)| value)
        .collect();

    match matches.len() {
        0 => PrefixMatch::None,
        1 => PrefixMatch::Unique(matches.pop().expect("len checked above")),
        n => PrefixMatch::Ambiguous(n),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{BotCommand, PrefixMatch, command_matches, parse_command, resolve_prefix, telegram_command_specs};

    #[test]
    fn parse_new_and_clear_reject_arguments() {
        assert_eq!(parse_command("/new"), Some(BotCommand::New));
        assert_eq!(parse_command(" /new@takopi_bot "), Some(BotCommand::New));
        assert_eq!(parse_command("/new please"), None);
        assert_eq!(parse_command("/clear"), Some(BotCommand::Clear));
        assert_eq!(parse_command("/clear now"), None);
    }

    #[test]
    fn parse_sessions_with_and_without_engine_filter() {
        assert_eq!(parse_command("/sessions"), Some(BotCommand::Sessions { engine: None }));
        assert_eq!(
            parse_command("/sessions codex"),
            Some(BotCommand::Sessions { engine: Some("codex".to_string()) })
        );
        assert_eq!(
            parse_command("/sessions@takopi_bot claude"),
            Some(BotCommand::Sessions { engine: Some("claude".to_string()) })
        );
    }

    #[test]
    fn parse_switch_name_delete_capture_their_argument() {
        assert_eq!(parse_command("/switch abc1"), Some(BotCommand::Switch { prefix: "abc1".to_string() }));
        assert_eq!(
            parse_command("/name  fix the parser  "),
            Some(BotCommand::Name { title: "fix the parser".to_string() })
        );
        assert_eq!(parse_command("/delete abc1"), Some(BotCommand::Delete { prefix: "abc1".to_string() }));
    }

    #[test]
    fn rejects_non_commands() {
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("switch abc1"), None);
    }

    #[test]
    fn command_matcher_accepts_bot_mentions_only() {
        assert!(command_matches("/new", "/new"));
        assert!(command_matches("/new@takopi_bot", "/new"));
        assert!(!command_matches("/newer", "/new"));
    }

    #[test]
    fn telegram_command_specs_are_unique_and_non_empty() {
        let specs = telegram_command_specs();
        assert!(!specs.is_empty());

        let mut names = HashSet::new();
        for spec in specs {
            assert!(!spec.command.trim().is_empty());
            assert!(!spec.description.trim().is_empty());
            assert!(names.insert(spec.command));
        }
    }

    #[test]
    fn resolve_prefix_distinguishes_unique_none_and_ambiguous() {
        let candidates = vec![("abc123", "session-a"), ("abd456", "session-b"), ("zzz", "session-c")];

        assert_eq!(resolve_prefix(candidates.clone(), "abc"), PrefixMatch::Unique("session-a"));
        assert_eq!(resolve_prefix(candidates.clone(), "zz"), PrefixMatch::Unique("session-c"));
        assert_eq!(resolve_prefix(candidates.clone(), "missing"), PrefixMatch::None);
        assert_eq!(resolve_prefix(candidates, "ab"), PrefixMatch::Ambiguous(2));
    }
}
