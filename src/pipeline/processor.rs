//! The message-lane adapter installed into the group queue.
//!
//! Invoked by the queue whenever a group's message lane wins a slot. Drains
//! the store from the group's watermark, folds the messages into one prompt,
//! runs the agent container, and relays each textual result back through the
//! chat transport — quoting the newest inbound message. Returns false for
//! transient failures so the queue schedules a backoff retry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{
    ContainerHandle, ContainerInput, ContainerRuntime, Lane, OutputEvent, RunEvent, RunStatus,
};
use crate::queue::{GroupQueue, MessageHandler};
use crate::registry::{GroupJid, GroupRegistry};
use crate::store::MessageStore;
use crate::transport::TransportRegistry;

use super::prompt::{format_prompt, strip_internal_markers};

/// Message pipeline — the queue's message-lane callback.
pub struct MessagePipeline {
    config: Config,
    store: Arc<MessageStore>,
    registry: Arc<GroupRegistry>,
    transports: Arc<TransportRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    queue: GroupQueue,
}

impl MessagePipeline {
    pub fn new(
        config: Config,
        store: Arc<MessageStore>,
        registry: Arc<GroupRegistry>,
        transports: Arc<TransportRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        queue: GroupQueue,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            transports,
            runtime,
            queue,
        }
    }

    async fn run(&self, group: &GroupJid) -> bool {
        let Some(registered) = self.registry.get(group) else {
            warn!(group = %group, "Message check for unregistered group, nothing to do");
            return true;
        };

        let messages = match self.store.messages_since(
            group.as_str(),
            registered.last_processed,
            &self.config.assistant_name,
        ) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(group = %group, error = %e, "Message query failed");
                return false;
            }
        };

        if messages.is_empty() {
            debug!(group = %group, "No new messages");
            return true;
        }

        let newest = messages.last().expect("checked nonempty");
        let reply_to = newest.id.clone();
        let newest_at = newest.timestamp;
        let prompt = format_prompt(&messages);
        info!(
            group = %group,
            count = messages.len(),
            "Running message container"
        );

        let input = ContainerInput {
            prompt,
            session_id: registered.session_id.clone(),
            group_folder: registered.folder.clone(),
            chat_jid: group.to_string(),
            is_main: self.config.is_main_folder(&registered.folder),
            is_scheduled_task: false,
            assistant_name: Some(self.config.assistant_name.clone()),
        };

        self.transports.set_typing(group, true).await;

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let runtime = self.runtime.clone();
        let run = tokio::spawn(async move { runtime.run_agent(input, events_tx).await });

        let mut saw_error = false;
        while let Some(event) = events_rx.recv().await {
            match event {
                RunEvent::Spawned {
                    container_name,
                    pid,
                } => {
                    self.queue.register_container(ContainerHandle {
                        group: group.clone(),
                        lane: Lane::Message,
                        group_folder: registered.folder.clone(),
                        container_name,
                        pid,
                    });
                }
                RunEvent::Output(OutputEvent::Success {
                    result,
                    new_session_id,
                }) => {
                    if let Some(session_id) = new_session_id {
                        self.registry.set_session_id(group, Some(session_id));
                    }
                    if let Some(text) = result
                        && !text.trim().is_empty()
                    {
                        let reply = strip_internal_markers(&text);
                        if !reply.is_empty()
                            && let Err(e) = self
                                .transports
                                .send_message(group, &reply, Some(&reply_to))
                                .await
                        {
                            warn!(group = %group, error = %e, "Reply delivery failed");
                        }
                    }
                    self.queue.notify_idle(group);
                }
                RunEvent::Output(OutputEvent::Error { message }) => {
                    warn!(group = %group, error = %message, "Container error event");
                    saw_error = true;
                }
            }
        }

        let outcome = run.await;
        self.transports.set_typing(group, false).await;

        let clean_exit = match outcome {
            Ok(Ok(outcome)) => {
                if let Some(session_id) = outcome.new_session_id {
                    self.registry.set_session_id(group, Some(session_id));
                }
                outcome.status == RunStatus::Success && !saw_error
            }
            Ok(Err(e)) => {
                warn!(group = %group, error = %e, "Container run failed");
                false
            }
            Err(e) => {
                warn!(group = %group, error = %e, "Container run panicked");
                false
            }
        };

        if clean_exit {
            // Failed runs keep the watermark so the retry reprocesses the
            // same batch.
            self.registry.advance_watermark(group, newest_at);
        }
        clean_exit
    }
}

#[async_trait]
impl MessageHandler for MessagePipeline {
    async fn process_messages(&self, group: &GroupJid) -> bool {
        self.run(group).await
    }
}
