pub(crate) mod context;
pub(crate) mod queue;

pub(crate) use context::{AnyOrchestrator, BotContext};
pub(crate) use queue::{dispatch_message, new_chat_queues};
