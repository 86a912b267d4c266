use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::bot::context::BotContext;
use crate::handlers::message::handle_message;
use crate::telegram::Message;

type QueueKey = i64;

pub(crate) type ChatQueueMap = Arc<Mutex<HashMap<QueueKey, mpsc::UnboundedSender<Message>>>>;

pub(crate) fn new_chat_queues() -> ChatQueueMap {
    Arc::new(Mutex::new(HashMap::new()))
}

/// Routes an inbound message onto its chat's sequential queue, after a
/// quick allowlist/sender check so unauthorized traffic never reaches a
/// worker task.
pub(crate) async fn dispatch_message(queues: &ChatQueueMap, context: &Arc<BotContext>, message: Message) {
    if !should_process_message(context, &message) {
        return;
    }
    enqueue_message(queues, context, message).await;
}

/// Returns false for messages that should be silently ignored: the single
/// allowed chat doesn't match, the sender is missing or is a bot, or the
/// sender isn't in the user allowlist.
fn should_process_message(context: &BotContext, message: &Message) -> bool {
    if message.chat.id != context.chat_id() {
        tracing::warn!(chat_id = message.chat.id, "ignoring message from non-allowlisted chat");
        return false;
    }

    let Some(user) = message.from.as_ref() else {
        tracing::warn!(chat_id = message.chat.id, "ignoring message without a sender");
        return false;
    };

    if user.is_bot {
        return false;
    }

    if !context.allowlist_user_ids().contains(&user.id) {
        tracing::warn!(user_id = user.id, chat_id = message.chat.id, "denied non-allowlisted user");
        return false;
    }

    true
}

async fn enqueue_message(queues: &ChatQueueMap, context: &Arc<BotContext>, message: Message) {
    let key = message.chat.id;
    let sender = {
        let mut queues = queues.lock().await;
        if let Some(sender) = queues.get(&key) {
            sender.clone()
        } else {
            let (sender, receiver) = mpsc::unbounded_channel();
            spawn_queue_worker(key, receiver, Arc::clone(context));
            queues.insert(key, sender.clone());
            sender
        }
    };

    if let Err(err) = sender.send(message) {
        let message = err.0;
        let (sender, receiver) = mpsc::unbounded_channel();
        spawn_queue_worker(key, receiver, Arc::clone(context));
        {
            let mut queues = queues.lock().await;
            queues.insert(key, sender.clone());
        }
        let _ = sender.send(message);
    }
}

fn spawn_queue_worker(key: QueueKey, mut receiver: mpsc::UnboundedReceiver<Message>, context: Arc<BotContext>) {
    tokio::spawn(async move {
        while let Some(message) = receiver.recv().await {
            if let Err(err) = handle_message(context.as_ref(), message).await {
                tracing::warn!(chat_id = key, error = %err, "message handling error");
            }
        }
    });
}
