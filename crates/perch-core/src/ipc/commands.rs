//! Command registry and name resolution.
//!
//! Collaborators contribute named commands through [`CommandRegistry`]
//! builders which the daemon merges into one registry before serving.
//! Names are whitespace-separated words (`"brightness set"`). A client may
//! abbreviate every word of a name as long as exactly one registered name
//! matches, see [`CommandRegistry::resolve`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use tracing::debug;

use super::connection::Connection;
use super::message::Message;
use crate::BoxFuture;
use crate::backlight::BacklightError;

/// Payload of a request, passed to the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub value: String,
    pub complement: Vec<String>,
}

impl Request {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            complement: Vec::new(),
        }
    }
}

impl From<Message> for Request {
    fn from(message: Message) -> Self {
        Self {
            value: message.value,
            complement: message.complement,
        }
    }
}

/// Failure of a command handler.
///
/// Everything except [`Transport`](CommandError::Transport) is reported to
/// the client as an `error` message; the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("invalid {name}: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Backlight(#[from] BacklightError),

    #[error(transparent)]
    Config(#[from] perch_config::ConfigError),

    /// The response could not be written; the peer is gone.
    #[error("failed to send response: {0}")]
    Transport(#[from] io::Error),
}

impl CommandError {
    /// True when the connection is unusable and nothing should be reported.
    pub fn is_transport(&self) -> bool {
        matches!(self, CommandError::Transport(_))
    }
}

/// Why a requested name did not map to exactly one command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no command provided")]
    Empty,

    #[error("command not found")]
    NotFound,

    #[error("ambiguous command, candidates: {}", .0.join(", "))]
    Ambiguous(Vec<String>),
}

type Handler = Arc<
    dyn Fn(Arc<Connection>, Request) -> BoxFuture<'static, Result<(), CommandError>>
        + Send
        + Sync,
>;

/// A registered command: handler plus help text.
#[derive(Clone)]
pub struct Command {
    handler: Handler,
    description: String,
    arguments: Vec<String>,
}

impl Command {
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Human-readable descriptions of the expected arguments, in order.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Run the handler for one request.
    pub async fn call(&self, conn: Arc<Connection>, request: Request) -> Result<(), CommandError> {
        (self.handler)(conn, request).await
    }

    /// The `help` message describing this command under `name`.
    pub fn help_message(&self, name: &str) -> Message {
        let complement =
            std::iter::once(self.description.clone()).chain(self.arguments.iter().cloned());
        Message::new("help", name).with_complement(complement)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("description", &self.description)
            .field("arguments", &self.arguments)
            .finish_non_exhaustive()
    }
}

/// Name → command table.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous command with
    /// that name.
    pub fn command<F, Fut>(
        mut self,
        name: &str,
        description: &str,
        arguments: &[&str],
        handler: F,
    ) -> Self
    where
        F: Fn(Arc<Connection>, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |conn, request| Box::pin(handler(conn, request)));
        self.insert(
            name.to_string(),
            Command {
                handler,
                description: description.to_string(),
                arguments: arguments.iter().map(|a| a.to_string()).collect(),
            },
        );
        self
    }

    /// Move every command of `other` into this registry.
    pub fn merge(&mut self, other: CommandRegistry) {
        for (name, command) in other.commands {
            self.insert(name, command);
        }
    }

    fn insert(&mut self, name: String, command: Command) {
        if self.commands.insert(name.clone(), command).is_some() {
            debug!(command = %name, "command replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Registered commands, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Command)> {
        self.commands.iter().map(|(name, command)| (name.as_str(), command))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Find the command `name` designates, returning its full name too.
    ///
    /// An exact match wins. Otherwise `name` is split into words and
    /// compared against every registered name with the same number of
    /// words: each requested word must be a case-sensitive prefix of the
    /// word at the same position. Exactly one survivor resolves; zero is
    /// [`ResolveError::NotFound`], more is [`ResolveError::Ambiguous`]
    /// listing the survivors in sorted order.
    pub fn resolve(&self, name: &str) -> Result<(&str, &Command), ResolveError> {
        if name.is_empty() {
            return Err(ResolveError::Empty);
        }
        if let Some((full, command)) = self.commands.get_key_value(name) {
            return Ok((full.as_str(), command));
        }

        let requested: Vec<&str> = name.split_whitespace().collect();
        if requested.is_empty() {
            return Err(ResolveError::NotFound);
        }

        let mut candidates: Vec<(&str, &Command)> = self
            .iter()
            .filter(|(full, _)| {
                let words: Vec<&str> = full.split_whitespace().collect();
                words.len() == requested.len()
                    && words
                        .iter()
                        .zip(&requested)
                        .all(|(word, prefix)| word.starts_with(prefix))
            })
            .collect();

        match candidates.len() {
            0 => Err(ResolveError::NotFound),
            1 => Ok(candidates.remove(0)),
            _ => Err(ResolveError::Ambiguous(
                candidates.into_iter().map(|(full, _)| full.to_string()).collect(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn noop(_conn: Arc<Connection>, _request: Request) -> Result<(), CommandError> {
        Ok(())
    }

    fn registry(names: &[&str]) -> CommandRegistry {
        names
            .iter()
            .fold(CommandRegistry::new(), |reg, name| reg.command(name, "test", &[], noop))
    }

    fn resolved(reg: &CommandRegistry, name: &str) -> Result<String, ResolveError> {
        reg.resolve(name).map(|(full, _)| full.to_string())
    }

    #[test]
    fn test_exact_match() {
        let reg = registry(&["brightness", "brightness up", "brightness set"]);
        assert_eq!(resolved(&reg, "brightness").unwrap(), "brightness");
        assert_eq!(resolved(&reg, "brightness up").unwrap(), "brightness up");
    }

    #[test]
    fn test_unique_abbreviation() {
        let reg = registry(&["volume set", "volume subscribe"]);
        assert_eq!(resolved(&reg, "volume su").unwrap(), "volume subscribe");
        assert_eq!(resolved(&reg, "v su").unwrap(), "volume subscribe");
        // Each word is abbreviated independently
        assert_eq!(resolved(&reg, "vol se").unwrap(), "volume set");
    }

    #[test]
    fn test_ambiguous_abbreviation_names_all_candidates() {
        let reg = registry(&["volume set", "volume subscribe"]);
        let err = resolved(&reg, "volume s").unwrap_err();
        assert_eq!(
            err,
            ResolveError::Ambiguous(vec!["volume set".to_string(), "volume subscribe".to_string()])
        );
        let text = err.to_string();
        assert!(text.contains("volume set"));
        assert!(text.contains("volume subscribe"));
    }

    #[test]
    fn test_word_count_must_match() {
        let reg = registry(&["volume set", "volume subscribe"]);
        assert_eq!(resolved(&reg, "vol"), Err(ResolveError::NotFound));
        assert_eq!(resolved(&reg, "volume set now"), Err(ResolveError::NotFound));
    }

    #[test]
    fn test_prefix_is_case_sensitive() {
        let reg = registry(&["brightness up"]);
        assert_eq!(resolved(&reg, "B u"), Err(ResolveError::NotFound));
        assert_eq!(resolved(&reg, "b u").unwrap(), "brightness up");
    }

    #[test]
    fn test_same_shape_names_conflict() {
        let reg = registry(&["brightness up", "backlight unmute"]);
        assert!(matches!(resolved(&reg, "b u"), Err(ResolveError::Ambiguous(c)) if c.len() == 2));
        assert_eq!(resolved(&reg, "br u").unwrap(), "brightness up");
    }

    #[test]
    fn test_empty_and_blank_names() {
        let reg = registry(&["brightness"]);
        assert_eq!(resolved(&reg, ""), Err(ResolveError::Empty));
        assert_eq!(resolved(&reg, "   "), Err(ResolveError::NotFound));
    }

    #[test]
    fn test_extra_whitespace_is_ignored_for_abbreviations() {
        let reg = registry(&["brightness set"]);
        assert_eq!(resolved(&reg, "  brightness   set ").unwrap(), "brightness set");
    }

    #[test]
    fn test_merge_and_names_are_sorted() {
        let mut reg = registry(&["volume", "brightness"]);
        reg.merge(registry(&["player status", "brightness"]));
        let names: Vec<&str> = reg.names().collect();
        assert_eq!(names, vec!["brightness", "player status", "volume"]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_help_message_layout() {
        let reg = CommandRegistry::new().command(
            "brightness set",
            "Set brightness",
            &["brightness percent"],
            noop,
        );
        let (name, command) = reg.resolve("brightness set").unwrap();
        assert_eq!(
            command.help_message(name),
            Message::new("help", "brightness set")
                .with_complement(["Set brightness", "brightness percent"])
        );
    }

    #[tokio::test]
    async fn test_call_invokes_handler_with_request() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reg = CommandRegistry::new().command("echo", "Echo", &[], move |_conn, request| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(request);
                Ok(())
            }
        });

        let (_client, server) = tokio::io::duplex(64);
        let conn = Arc::new(Connection::new(server));
        let (_, command) = reg.resolve("e").unwrap();
        let request = Request {
            value: "40".to_string(),
            complement: vec!["x".to_string()],
        };
        command.call(conn, request.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), request);
    }

    #[test]
    fn test_command_error_display() {
        assert_eq!(
            CommandError::MissingArgument("brightness percent").to_string(),
            "missing argument: brightness percent"
        );
        assert_eq!(
            CommandError::InvalidArgument {
                name: "brightness percent",
                reason: "not an integer".into()
            }
            .to_string(),
            "invalid brightness percent: not an integer"
        );
        assert!(CommandError::Transport(io::Error::from(io::ErrorKind::BrokenPipe)).is_transport());
        assert!(!CommandError::Failed("x".into()).is_transport());
    }
}
