// ABOUTME: Prefix command parsing plus the name/alias command registry
// ABOUTME: Registry tables are rebuilt whole on load and swapped in atomically

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::session::SessionContext;
use crate::traits::MessageEnvelope;

// =============================================================================
// Parsing
// =============================================================================

/// A prefixed message split into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Command token as typed (without prefix, case preserved)
    pub name: String,
    /// `--flag` / `--flag=value` tokens, without the leading dashes
    pub flags: Vec<String>,
    /// Non-flag arguments (handles quoted strings)
    pub args: Vec<String>,
    /// Argument string with flags removed
    pub raw_args: String,
}

impl ParsedCommand {
    /// Get the first argument if present
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags
            .iter()
            .any(|f| f == flag || f.split_once('=').is_some_and(|(name, _)| name == flag))
    }

    /// Value of a `--flag=value` token
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.flags.iter().find_map(|f| match f.split_once('=') {
            Some((name, value)) if name == flag => Some(value),
            _ => None,
        })
    }
}

/// Result of parsing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// Message starts with the prefix followed by a command token
    Command(ParsedCommand),
    /// A regular message (not a command)
    Message(String),
    /// Message should be ignored (empty, bare prefix)
    Ignore,
}

impl ParseResult {
    pub fn is_command(&self) -> bool {
        matches!(self, ParseResult::Command(_))
    }

    pub fn as_command(&self) -> Option<&ParsedCommand> {
        match self {
            ParseResult::Command(cmd) => Some(cmd),
            _ => None,
        }
    }
}

/// Parse arguments from a string, respecting quoted strings
fn parse_args(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut quote_char = '"';

    for c in input.chars() {
        match c {
            '"' | '\'' if !in_quotes => {
                in_quotes = true;
                quote_char = c;
            }
            c if c == quote_char && in_quotes => {
                in_quotes = false;
                // Don't add empty strings from consecutive quotes
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Split raw tokens (quotes kept verbatim) into flags and the remaining text
fn split_flags(input: &str) -> (Vec<String>, String) {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match (quote, c) {
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, c) if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut flags = Vec::new();
    let mut rest = Vec::new();
    for token in tokens {
        match token.strip_prefix("--") {
            Some(flag) if !flag.is_empty() => flags.push(flag.to_string()),
            _ => rest.push(token),
        }
    }
    (flags, rest.join(" "))
}

/// Parse a chat message to determine if it's a command
///
/// # Arguments
/// * `body` - The message body to parse
/// * `prefix` - The configured command prefix (e.g., "!")
///
/// # Command Recognition
/// `{prefix}{token} [args...]`. Whitespace between the prefix and the token is
/// tolerated. The token keeps its case; registry lookups are exact.
pub fn parse_message(body: &str, prefix: &str) -> ParseResult {
    let trimmed = body.trim();

    if trimmed.is_empty() {
        return ParseResult::Ignore;
    }

    let Some(after_prefix) = trimmed.strip_prefix(prefix).filter(|_| !prefix.is_empty()) else {
        return ParseResult::Message(trimmed.to_string());
    };

    let text = after_prefix.trim_start();
    if text.is_empty() {
        return ParseResult::Ignore;
    }

    let (name, rest) = match text.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (text, ""),
    };
    let (flags, raw_args) = split_flags(rest);
    let args = parse_args(&raw_args);

    ParseResult::Command(ParsedCommand {
        name: name.to_string(),
        flags,
        args,
        raw_args,
    })
}

// =============================================================================
// Commands
// =============================================================================

/// Static description of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Unique command name
    pub name: String,
    /// Alternate tokens resolving to this command
    pub aliases: Vec<String>,
    /// Experience a sender needs before the command runs
    pub min_exp: u64,
    pub category: String,
    pub description: String,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            min_exp: 0,
            category: category.into(),
            description: String::new(),
        }
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn min_exp(mut self, min_exp: u64) -> Self {
        self.min_exp = min_exp;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Name followed by aliases
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(|a| a.as_str()))
    }
}

/// A unit of bot functionality invoked through prefixed chat text.
///
/// Authorization is the command's own business: return `Ok(())` without
/// replying to ignore a sender.
#[async_trait]
pub trait Command: Send + Sync {
    fn descriptor(&self) -> &CommandDescriptor;

    async fn execute(
        &self,
        session: &SessionContext,
        flags: &[String],
        args: &str,
        message: &MessageEnvelope,
    ) -> Result<()>;
}

/// Compiled-in set of commands handed to the registry on every load
#[derive(Clone, Default)]
pub struct CommandCatalog {
    commands: Vec<Arc<dyn Command>>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<C: Command + 'static>(mut self, command: C) -> Self {
        self.commands.push(Arc::new(command));
        self
    }

    pub fn push(&mut self, command: Arc<dyn Command>) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sorted, de-duplicated category names
    pub fn categories(&self) -> Vec<String> {
        self.commands
            .iter()
            .map(|c| c.descriptor().category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Command>> {
        self.commands.iter()
    }
}

impl fmt::Debug for CommandCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.commands.iter().map(|c| &c.descriptor().name))
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// What to do when two commands claim the same name or alias
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Fail the load and keep the previous table
    #[default]
    Reject,
    /// Later registration silently replaces the earlier one
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    Collision {
        key: String,
        existing: String,
        incoming: String,
    },
    InvalidKey {
        command: String,
        key: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collision {
                key,
                existing,
                incoming,
            } => write!(
                f,
                "command key '{}' of '{}' is already registered by '{}'",
                key, incoming, existing
            ),
            Self::InvalidKey { command, key } => {
                write!(f, "command '{}' has an invalid key {:?}", command, key)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

type CommandTable = HashMap<String, Arc<dyn Command>>;

/// Name-or-alias index over loaded commands
pub struct CommandRegistry {
    table: RwLock<Arc<CommandTable>>,
    policy: CollisionPolicy,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::with_policy(CollisionPolicy::default())
    }

    pub fn with_policy(policy: CollisionPolicy) -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
            policy,
        }
    }

    /// Build a fresh table from the catalog and swap it in.
    ///
    /// Returns the number of distinct commands loaded. On error the current
    /// table is left untouched.
    pub fn load(&self, catalog: &CommandCatalog) -> Result<usize, RegistryError> {
        let mut table: CommandTable = HashMap::new();

        for command in catalog.iter() {
            let desc = command.descriptor();
            for key in desc.keys() {
                if key.is_empty() || key.chars().any(char::is_whitespace) {
                    return Err(RegistryError::InvalidKey {
                        command: desc.name.clone(),
                        key: key.to_string(),
                    });
                }
                if let Some(existing) = table.get(key) {
                    // A command repeating its own name as an alias is not a conflict
                    if Arc::ptr_eq(existing, command) {
                        continue;
                    }
                    let existing = existing.descriptor().name.clone();
                    match self.policy {
                        CollisionPolicy::Reject => {
                            return Err(RegistryError::Collision {
                                key: key.to_string(),
                                existing,
                                incoming: desc.name.clone(),
                            });
                        }
                        CollisionPolicy::Overwrite => {
                            tracing::warn!(
                                key,
                                existing = %existing,
                                incoming = %desc.name,
                                "Command key overwritten"
                            );
                        }
                    }
                }
                table.insert(key.to_string(), Arc::clone(command));
            }
            tracing::debug!(
                command = %desc.name.to_uppercase(),
                category = %desc.category,
                "Loaded command"
            );
        }

        let count = unique_count(&table);
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        tracing::info!(commands = count, "Successfully loaded commands");
        Ok(count)
    }

    fn snapshot(&self) -> Arc<CommandTable> {
        Arc::clone(&self.table.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Exact, case-sensitive lookup by name or alias
    pub fn resolve(&self, token: &str) -> Option<Arc<dyn Command>> {
        self.snapshot().get(token).cloned()
    }

    /// Every registered key (names and aliases), sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Distinct commands sorted by category then name
    pub fn commands(&self) -> Vec<Arc<dyn Command>> {
        let table = self.snapshot();
        let mut seen = BTreeSet::new();
        let mut commands: Vec<Arc<dyn Command>> = table
            .values()
            .filter(|c| seen.insert(c.descriptor().name.clone()))
            .cloned()
            .collect();
        commands.sort_by(|a, b| {
            let (a, b) = (a.descriptor(), b.descriptor());
            (&a.category, &a.name).cmp(&(&b.category, &b.name))
        });
        commands
    }

    /// Number of distinct commands
    pub fn len(&self) -> usize {
        unique_count(&self.snapshot())
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

fn unique_count(table: &CommandTable) -> usize {
    table
        .values()
        .map(|c| c.descriptor().name.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("keys", &self.keys())
            .field("policy", &self.policy)
            .finish()
    }
}
