//! Ordered trigger/action table.
//!
//! Every inbound message is matched against a list of `(predicate, action)`
//! pairs; the first predicate that holds decides the action. The table is
//! only constructible through [`RuleTableBuilder`], which pins the
//! authorization rule to the front and the catch-all to the back.

use crate::transport::{CommandSpec, ConversationId, InboundMessage};
use std::collections::HashSet;
use std::fmt;

/// What to do with a matched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Sender is not allowed; log and drop.
    Ignore,
    Pong,
    OpenReverseTunnel,
    StopTunnel,
    OpenForwardingTunnel,
    /// Catch-all for unrecognized text.
    Unknown,
}

/// Recognized commands, in matching order.
pub const COMMANDS: &[(CommandSpec, Action)] = &[
    (
        CommandSpec {
            command: "ping",
            description: "ping pong, bot availability test",
        },
        Action::Pong,
    ),
    (
        CommandSpec {
            command: "opentunnel",
            description: "open tunnel for ssh connection using serveo",
        },
        Action::OpenReverseTunnel,
    ),
    (
        CommandSpec {
            command: "stopconnecting",
            description: "stop connecting to tunnel",
        },
        Action::StopTunnel,
    ),
    (
        CommandSpec {
            command: "openngrok",
            description: "open tunnel using ngrok",
        },
        Action::OpenForwardingTunnel,
    ),
];

/// Command menu entries published to each allowed chat.
pub fn command_specs() -> Vec<CommandSpec> {
    COMMANDS.iter().map(|(spec, _)| *spec).collect()
}

/// Conversations allowed to issue commands. Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    chats: HashSet<ConversationId>,
}

impl AllowList {
    pub fn new(chats: impl IntoIterator<Item = ConversationId>) -> Self {
        Self {
            chats: chats.into_iter().collect(),
        }
    }

    pub fn contains(&self, conversation: ConversationId) -> bool {
        self.chats.contains(&conversation)
    }

    /// Whether the message comes from an allowed conversation.
    ///
    /// Messages without a conversation are never authorized.
    pub fn authorizes(&self, message: &InboundMessage) -> bool {
        message
            .conversation_id
            .is_some_and(|conversation| self.contains(conversation))
    }

    pub fn iter(&self) -> impl Iterator<Item = ConversationId> + '_ {
        self.chats.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }
}

type Predicate = Box<dyn Fn(&InboundMessage) -> bool + Send + Sync>;

struct Rule {
    name: String,
    predicate: Predicate,
    action: Action,
}

/// Ordered rule table. Evaluation always yields an action.
pub struct RuleTable {
    rules: Vec<Rule>,
    fallback: Action,
}

impl RuleTable {
    /// Start a table whose first rule routes unauthorized senders to
    /// [`Action::Ignore`].
    pub fn builder(allow_list: AllowList) -> RuleTableBuilder {
        let authorization = Rule {
            name: "unauthorized".to_string(),
            predicate: Box::new(move |message| !allow_list.authorizes(message)),
            action: Action::Ignore,
        };
        RuleTableBuilder {
            rules: vec![authorization],
        }
    }

    /// The table used by the bot: authorization, [`COMMANDS`], then
    /// [`Action::Unknown`].
    pub fn standard(allow_list: AllowList) -> Self {
        COMMANDS
            .iter()
            .fold(Self::builder(allow_list), |builder, (spec, action)| {
                builder.command(&format!("/{}", spec.command), *action)
            })
            .fallback(Action::Unknown)
    }

    /// Return the action of the first rule whose predicate holds.
    pub fn evaluate(&self, message: &InboundMessage) -> Action {
        self.rules
            .iter()
            .find(|rule| (rule.predicate)(message))
            .map_or(self.fallback, |rule| rule.action)
    }

    /// Rule names in evaluation order, ending with the catch-all.
    pub fn rule_names(&self) -> Vec<&str> {
        self.rules
            .iter()
            .map(|rule| rule.name.as_str())
            .chain(std::iter::once("fallback"))
            .collect()
    }
}

impl fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleTable")
            .field("rules", &self.rule_names())
            .field("fallback", &self.fallback)
            .finish()
    }
}

/// Builder that appends rules after the authorization rule.
pub struct RuleTableBuilder {
    rules: Vec<Rule>,
}

impl RuleTableBuilder {
    /// Match the message body exactly.
    pub fn command(self, text: &str, action: Action) -> Self {
        let expected = text.to_string();
        self.rule(text, move |message| message.text == expected, action)
    }

    /// Append an arbitrary predicate.
    pub fn rule<F>(mut self, name: &str, predicate: F, action: Action) -> Self
    where
        F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            name: name.to_string(),
            predicate: Box::new(predicate),
            action,
        });
        self
    }

    /// Close the table with an unconditional catch-all.
    pub fn fallback(self, action: Action) -> RuleTable {
        RuleTable {
            rules: self.rules,
            fallback: action,
        }
    }
}
