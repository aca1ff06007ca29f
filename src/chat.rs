//! Streaming chat turn driver.
//!
//! One turn runs as a spawned task feeding an event channel: resolve the
//! conversation, persist the user message, retrieve context, stream the
//! completion, persist the assistant message. Events reach the client in
//! generation order; the concatenation of all `content` deltas equals the
//! persisted assistant text whenever the turn reaches `done`.
//!
//! Mid-stream failures cannot change the transport status, so they are
//! delivered as a terminal in-band `error` event instead.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::completion::{ChatMessage, CompletionClient, StreamEnd};
use crate::config::{CompletionConfig, ServerConfig};
use crate::context::{self, AssembledContext};
use crate::error::Result;
use crate::models::{Conversation, Message, Role};
use crate::retrieval::RetrievalEngine;
use crate::store::ConversationStore;

/// Server-to-client events of one chat turn.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ChatEvent {
    /// Sent once, first, when the turn created a new conversation.
    Conversation { conversation_id: String },
    /// One incremental text fragment.
    Content { delta: String },
    /// Terminal: the turn completed and was persisted.
    Done,
    /// Terminal: the turn failed; any already-streamed text stands.
    Error { message: String },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Conversation { .. } => "conversation",
            ChatEvent::Content { .. } => "content",
            ChatEvent::Done => "done",
            ChatEvent::Error { .. } => "error",
        }
    }

    /// JSON payload for the SSE `data:` field.
    pub fn payload(&self) -> String {
        match self {
            ChatEvent::Conversation { conversation_id } => {
                serde_json::json!({ "conversationId": conversation_id }).to_string()
            }
            ChatEvent::Content { delta } => {
                serde_json::json!({ "delta": delta }).to_string()
            }
            ChatEvent::Done => "{}".to_string(),
            ChatEvent::Error { message } => {
                serde_json::json!({ "message": message }).to_string()
            }
        }
    }
}

/// Dependencies one chat turn needs, cloned out of the server state.
pub struct ChatTurnDeps {
    pub store: ConversationStore,
    pub retrieval: Arc<RetrievalEngine>,
    pub client: Arc<dyn CompletionClient>,
    pub completion: CompletionConfig,
    pub server: ServerConfig,
}

/// Conversation resolved for a turn before streaming starts.
#[derive(Debug)]
pub struct TurnContext {
    pub conversation: Conversation,
    pub is_new: bool,
}

/// Resolve the turn's conversation. Runs before the stream is committed,
/// so validation and ownership failures still surface as status codes.
pub async fn prepare_turn(
    store: &ConversationStore,
    user_id: &str,
    message: &str,
    conversation_id: Option<&str>,
) -> Result<TurnContext> {
    if message.trim().is_empty() {
        return Err(crate::error::ChatError::validation(
            "message must not be empty",
        ));
    }

    match conversation_id {
        Some(id) => {
            let conversation = store.get_owned(id, user_id).await?;
            Ok(TurnContext {
                conversation,
                is_new: false,
            })
        }
        None => {
            let conversation = store.create_conversation(user_id, message).await?;
            Ok(TurnContext {
                conversation,
                is_new: true,
            })
        }
    }
}

/// Spawn the turn and return its event stream. The receiver half drives
/// the SSE response; when the client disconnects the channel closes and
/// the next send aborts upstream generation.
pub fn stream_turn(
    deps: ChatTurnDeps,
    ctx: TurnContext,
    message: String,
) -> UnboundedReceiverStream<ChatEvent> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let verbose = deps.server.verbose_errors;
        let persist_partial = deps.server.persist_partial_on_error;
        let conversation_id = ctx.conversation.id.clone();

        if ctx.is_new {
            let _ = tx.send(ChatEvent::Conversation {
                conversation_id: conversation_id.clone(),
            });
        }

        let mut streamed = String::new();
        match drive_turn(&deps, &ctx, &message, &tx, &mut streamed).await {
            Ok(StreamEnd::Done) => {
                let _ = tx.send(ChatEvent::Done);
            }
            Ok(StreamEnd::Cancelled) => {
                debug!(%conversation_id, "client disconnected, turn cancelled");
            }
            Err(err) => {
                warn!(%conversation_id, error = %err, "chat turn failed");
                if persist_partial && !streamed.is_empty() {
                    if let Err(persist_err) = deps
                        .store
                        .add_message(
                            &conversation_id,
                            Role::Assistant,
                            &streamed,
                            Some(r#"{"partial":true}"#),
                        )
                        .await
                    {
                        warn!(%conversation_id, error = %persist_err, "partial persist failed");
                    }
                }
                let _ = tx.send(ChatEvent::Error {
                    message: err.client_message(verbose),
                });
            }
        }
    });

    UnboundedReceiverStream::new(rx)
}

/// The turn body. Persists the user message, retrieves and assembles
/// context, streams the completion, persists the result on completion.
async fn drive_turn(
    deps: &ChatTurnDeps,
    ctx: &TurnContext,
    message: &str,
    tx: &mpsc::UnboundedSender<ChatEvent>,
    streamed: &mut String,
) -> Result<StreamEnd> {
    let conversation_id = &ctx.conversation.id;

    // History is read before this turn's user message lands.
    let history = deps
        .store
        .get_conversation_messages(conversation_id, &ctx.conversation.user_id)
        .await?;

    deps.store
        .add_message(conversation_id, Role::User, message, None)
        .await?;

    let retrieved = deps.retrieval.retrieve(message, conversation_id).await?;
    let assembled = context::assemble(&retrieved.general, &retrieved.user_documents);
    debug!(
        %conversation_id,
        general = retrieved.general.len(),
        user_documents = retrieved.user_documents.len(),
        "context retrieved"
    );

    let messages = compose_messages(
        &deps.completion,
        &history,
        message,
        &assembled,
    );

    let mut on_delta = |delta: &str| {
        streamed.push_str(delta);
        tx.send(ChatEvent::Content {
            delta: delta.to_string(),
        })
        .is_ok()
    };
    let (full, end) = deps
        .client
        .stream_chat(&deps.completion, &messages, &mut on_delta)
        .await?;

    if end == StreamEnd::Done {
        let metadata = if assembled.sources.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "sources": assembled.sources }).to_string())
        };
        deps.store
            .add_message(
                conversation_id,
                Role::Assistant,
                &full,
                metadata.as_deref(),
            )
            .await?;
    }

    Ok(end)
}

/// Compose the completion message list: system prompt, bounded prior
/// history, then the current turn with retrieved context injected.
fn compose_messages(
    config: &CompletionConfig,
    history: &[Message],
    message: &str,
    assembled: &AssembledContext,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(&config.system_prompt)];

    let start = history.len().saturating_sub(config.history_limit);
    for m in &history[start..] {
        match Role::parse(&m.role) {
            Some(Role::User) => messages.push(ChatMessage::user(&m.content)),
            Some(Role::Assistant) => messages.push(ChatMessage::assistant(&m.content)),
            None => {}
        }
    }

    let current = if assembled.is_empty() {
        message.to_string()
    } else {
        format!(
            "Context:\n{}\n\nQuestion: {}",
            assembled.context, message
        )
    };
    messages.push(ChatMessage::user(current));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, RetrievalConfig};
    use crate::embedding::DisabledProvider;
    use crate::error::ChatError;
    use crate::vector::SqliteVectorIndex;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    /// Completion backend replaying a fixed delta script.
    struct ScriptedCompletion {
        deltas: Vec<&'static str>,
        fail_at_end: bool,
    }

    #[async_trait]
    impl CompletionClient for ScriptedCompletion {
        async fn stream_chat(
            &self,
            _config: &CompletionConfig,
            _messages: &[ChatMessage],
            on_delta: &mut (dyn for<'a> FnMut(&'a str) -> bool + Send),
        ) -> crate::error::Result<(String, StreamEnd)> {
            let mut full = String::new();
            for delta in &self.deltas {
                full.push_str(delta);
                if !on_delta(delta) {
                    return Ok((full, StreamEnd::Cancelled));
                }
            }
            if self.fail_at_end {
                return Err(ChatError::upstream(anyhow::anyhow!("completions offline")));
            }
            Ok((full, StreamEnd::Done))
        }
    }

    async fn turn_deps(
        client: ScriptedCompletion,
        persist_partial: bool,
    ) -> (ChatTurnDeps, sqlx::SqlitePool) {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let retrieval = Arc::new(RetrievalEngine::new(
            Arc::new(SqliteVectorIndex::new(pool.clone())),
            Arc::new(DisabledProvider),
            EmbeddingConfig::default(),
            RetrievalConfig::default(),
        ));
        let deps = ChatTurnDeps {
            store: ConversationStore::new(pool.clone()),
            retrieval,
            client: Arc::new(client),
            completion: CompletionConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".to_string(),
                verbose_errors: false,
                persist_partial_on_error: persist_partial,
            },
        };
        (deps, pool)
    }

    #[tokio::test]
    async fn streamed_deltas_concatenate_to_persisted_assistant_message() {
        let client = ScriptedCompletion {
            deltas: vec!["The ", "rate ", "is 42."],
            fail_at_end: false,
        };
        let (deps, pool) = turn_deps(client, false).await;
        let store = deps.store.clone();

        let ctx = prepare_turn(&store, "alice", "what is the rate?", None)
            .await
            .unwrap();
        let conversation_id = ctx.conversation.id.clone();
        // Age the conversation so the turn's activity bump is observable
        sqlx::query("UPDATE conversations SET updated_at = 1 WHERE id = ?")
            .bind(&conversation_id)
            .execute(&pool)
            .await
            .unwrap();

        let events: Vec<ChatEvent> = stream_turn(deps, ctx, "what is the rate?".to_string())
            .collect()
            .await;

        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], ChatEvent::Conversation { .. }));
        assert_eq!(*events.last().unwrap(), ChatEvent::Done);
        let streamed: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Content { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, "The rate is 42.");

        let messages = store
            .get_conversation_messages(&conversation_id, "alice")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, streamed);

        let list = store.get_conversations("alice").await.unwrap();
        assert!(list[0].updated_at > 1);
    }

    #[tokio::test]
    async fn failed_turn_emits_error_and_persists_partial_when_enabled() {
        let client = ScriptedCompletion {
            deltas: vec!["half ", "an answer"],
            fail_at_end: true,
        };
        let (deps, _pool) = turn_deps(client, true).await;
        let store = deps.store.clone();

        let ctx = prepare_turn(&store, "alice", "tell me", None).await.unwrap();
        let conversation_id = ctx.conversation.id.clone();

        let events: Vec<ChatEvent> = stream_turn(deps, ctx, "tell me".to_string())
            .collect()
            .await;

        match events.last().unwrap() {
            ChatEvent::Error { message } => assert_eq!(message, "upstream provider error"),
            other => panic!("expected terminal error event, got {other:?}"),
        }
        assert!(!events.contains(&ChatEvent::Done));

        let messages = store
            .get_conversation_messages(&conversation_id, "alice")
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "half an answer");
        assert_eq!(
            messages[1].metadata_json.as_deref(),
            Some(r#"{"partial":true}"#)
        );
    }

    #[tokio::test]
    async fn failed_turn_discards_partial_by_default() {
        let client = ScriptedCompletion {
            deltas: vec!["lost"],
            fail_at_end: true,
        };
        let (deps, _pool) = turn_deps(client, false).await;
        let store = deps.store.clone();

        let ctx = prepare_turn(&store, "alice", "tell me", None).await.unwrap();
        let conversation_id = ctx.conversation.id.clone();

        let events: Vec<ChatEvent> = stream_turn(deps, ctx, "tell me".to_string())
            .collect()
            .await;

        assert!(matches!(events.last().unwrap(), ChatEvent::Error { .. }));
        let messages = store
            .get_conversation_messages(&conversation_id, "alice")
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn event_names_and_payloads() {
        let e = ChatEvent::Conversation {
            conversation_id: "c1".to_string(),
        };
        assert_eq!(e.name(), "conversation");
        assert_eq!(e.payload(), r#"{"conversationId":"c1"}"#);

        let e = ChatEvent::Content {
            delta: "hi".to_string(),
        };
        assert_eq!(e.name(), "content");
        assert_eq!(e.payload(), r#"{"delta":"hi"}"#);

        assert_eq!(ChatEvent::Done.payload(), "{}");
    }

    #[tokio::test]
    async fn prepare_turn_creates_when_no_conversation_given() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = ConversationStore::new(pool);

        let ctx = prepare_turn(&store, "alice", "first question", None)
            .await
            .unwrap();
        assert!(ctx.is_new);
        assert_eq!(ctx.conversation.user_id, "alice");

        let again = prepare_turn(&store, "alice", "followup", Some(&ctx.conversation.id))
            .await
            .unwrap();
        assert!(!again.is_new);
        assert_eq!(again.conversation.id, ctx.conversation.id);
    }

    #[tokio::test]
    async fn prepare_turn_rejects_empty_message_and_foreign_conversation() {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let store = ConversationStore::new(pool);

        let err = prepare_turn(&store, "alice", "  ", None).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let ctx = prepare_turn(&store, "alice", "mine", None).await.unwrap();
        let err = prepare_turn(&store, "bob", "peek", Some(&ctx.conversation.id))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Authorization));
    }

    #[test]
    fn compose_respects_history_limit_and_injects_context() {
        let config = CompletionConfig {
            history_limit: 2,
            ..CompletionConfig::default()
        };
        let history: Vec<Message> = (0..4)
            .map(|i| Message {
                id: i.to_string(),
                conversation_id: "c".to_string(),
                role: if i % 2 == 0 { "user" } else { "assistant" }.to_string(),
                content: format!("turn {i}"),
                metadata_json: None,
                created_at: i,
            })
            .collect();
        let assembled = AssembledContext {
            context: "Content: facts\nSource: kb.md".to_string(),
            sources: vec!["kb.md".to_string()],
        };

        let messages = compose_messages(&config, &history, "current q", &assembled);
        // system + 2 history turns + current
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "turn 2");
        assert!(messages[3].content.contains("Content: facts"));
        assert!(messages[3].content.ends_with("Question: current q"));
    }

    #[test]
    fn compose_without_context_sends_message_verbatim() {
        let config = CompletionConfig::default();
        let assembled = AssembledContext {
            context: String::new(),
            sources: Vec::new(),
        };
        let messages = compose_messages(&config, &[], "plain question", &assembled);
        assert_eq!(messages.last().unwrap().content, "plain question");
    }
}
