//! Conversation engine: cache bounds, send pipeline, cancellation and persistence

use crate::integration::support::{snapshot_of, CountingStore, MemoryLoader, Reply, ScriptedClient};
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use skein::clock::{Clock, ManualClock};
use skein::context::{ContextBudget, ContextPreparer};
use skein::conversation::{
    ContextRequest, Conversation, ConversationEngine, ConversationKey, Message, Role, SendOutcome,
    StreamCallback, StreamDelta, DEFAULT_TITLE,
};
use skein::error::{EngineError, TransportError};
use skein::provider::{MessageRole, StreamEvent};
use skein::types::FileId;
use skein::workspace::DescriptorPathResolver;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Harness {
    engine: Arc<ConversationEngine>,
    store: Arc<CountingStore>,
    client: Arc<ScriptedClient>,
    loader: Arc<MemoryLoader>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new(capacity: usize) -> Self {
        Self::build(capacity, CountingStore::default(), ScriptedClient::default())
    }

    fn build(capacity: usize, store: CountingStore, client: ScriptedClient) -> Self {
        let store = Arc::new(store);
        let client = Arc::new(client);
        let loader = Arc::new(
            MemoryLoader::default()
                .with_file("/w/a.rs", "fn a() {}")
                .with_file("/w/b.rs", "fn b() {}")
                .with_file("/elsewhere/notes.md", "notes"),
        );
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let engine = Arc::new(ConversationEngine::with_clock(
            store.clone(),
            client.clone(),
            ContextPreparer::new(loader.clone()),
            capacity,
            clock.clone(),
        ));
        Self {
            engine,
            store,
            client,
            loader,
            clock,
        }
    }

    fn tick(&self) {
        self.clock.advance(Duration::seconds(1));
    }

    async fn send(&self, text: &str, conversation: &Conversation) -> Result<SendOutcome, EngineError> {
        self.tick();
        self.engine
            .send_message(text, conversation.id, None, None, &CancellationToken::new())
            .await
    }
}

fn path_key(path: &str) -> ConversationKey {
    ConversationKey::Path(PathBuf::from(path))
}

#[tokio::test]
async fn test_cache_bound_of_one_evicts_older_conversation() {
    let h = Harness::new(1);
    let key_a = path_key("/w/a.rs");
    let key_b = path_key("/w/b.rs");

    let a = h.engine.ensure_conversation(&key_a, None).unwrap();
    h.send("first", &a).await.unwrap();
    h.tick();
    let b = h.engine.ensure_conversation(&key_b, None).unwrap();
    h.send("second", &b).await.unwrap();

    assert!(h.engine.conversation_for(&key_a).is_none());
    assert!(h.engine.conversation_for(&key_b).is_some());
    assert_eq!(h.engine.cache_len(), 1);
    // Evicted conversations stay persisted
    assert!(h.store.stored(&a.id).is_some());
}

#[tokio::test]
async fn test_ensure_conversation_is_idempotent_and_not_persisted() {
    let h = Harness::new(4);
    let key = path_key("/w/a.rs");

    let first = h.engine.ensure_conversation(&key, None).unwrap();
    let second = h.engine.ensure_conversation(&key, None).unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.title, DEFAULT_TITLE);
    assert_eq!(first.context_file_paths, vec![PathBuf::from("/w/a.rs")]);
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_yields_one_conversation() {
    let h = Harness::new(4);
    let key = path_key("/w/a.rs");

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let engine = h.engine.clone();
            let key = key.clone();
            tokio::spawn(async move { engine.ensure_conversation(&key, None).unwrap().id })
        })
        .collect();
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.engine.cache_len(), 1);
}

#[tokio::test]
async fn test_descriptor_key_resolves_through_snapshot() {
    let h = Harness::new(4);
    let a = FileId::new();
    let b = FileId::new();
    let snapshot = snapshot_of(&[("/w/a.rs", a), ("/w/b.rs", b)]);

    let resolver: &dyn DescriptorPathResolver = &snapshot;

    let key = ConversationKey::descriptors([b, a]);
    let conversation = h.engine.ensure_conversation(&key, Some(resolver)).unwrap();
    let mut paths = conversation.context_file_paths.clone();
    paths.sort();
    assert_eq!(paths, vec![PathBuf::from("/w/a.rs"), PathBuf::from("/w/b.rs")]);
    assert_eq!(conversation.key(), Some(key.clone()));
    assert_eq!(
        h.engine.conversation_for(&ConversationKey::descriptors([a, b])).map(|c| c.id),
        Some(conversation.id)
    );

    let unknown = ConversationKey::descriptors([FileId::new()]);
    assert!(matches!(
        h.engine.ensure_conversation(&unknown, Some(resolver)),
        Err(EngineError::ContextLoadFailed(_))
    ));
    assert!(matches!(
        h.engine.ensure_conversation(&key, None),
        Ok(ref existing) if existing.id == conversation.id
    ));
    assert!(matches!(
        h.engine.ensure_conversation(&ConversationKey::descriptors([a]), None),
        Err(EngineError::ContextLoadFailed(_))
    ));
}

#[tokio::test]
async fn test_send_commits_exchange_and_streams_aggregate() {
    let client = ScriptedClient::with_replies([Reply::tokens(&["Hel", "lo", "!"])]);
    let h = Harness::build(4, CountingStore::default(), client);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    let deltas = Mutex::new(Vec::new());
    let record = |delta: StreamDelta| deltas.lock().push(delta);
    let on_stream: StreamCallback<'_> = &record;
    h.tick();
    let outcome = h
        .engine
        .send_message(
            "Explain this file\nplease",
            conversation.id,
            None,
            Some(on_stream),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let committed = outcome.conversation().unwrap().clone();
    assert_eq!(committed.id, conversation.id);
    assert_eq!(committed.title, "Explain this file");
    assert_eq!(committed.message_count(), 2);
    assert_eq!(committed.messages[0].role, Role::User);
    assert_eq!(committed.messages[1].text, "Hello!");
    assert_eq!(committed.updated_at, h.clock.now());
    assert_eq!(h.store.save_count(), 1);
    assert_eq!(h.store.stored(&conversation.id), Some((*committed).clone()));
    assert_eq!(
        h.engine.conversation(&conversation.id).unwrap().message_count(),
        2
    );

    let deltas = deltas.lock();
    assert!(matches!(deltas[0], StreamDelta::Context { ref attachments, .. } if attachments.is_empty()));
    let texts: Vec<&str> = deltas[1..]
        .iter()
        .map(|d| match d {
            StreamDelta::Text { aggregate } => aggregate.as_str(),
            other => panic!("unexpected delta {:?}", other),
        })
        .collect();
    assert_eq!(texts, vec!["Hel", "Hello", "Hello!"]);
}

#[tokio::test]
async fn test_history_is_sent_with_each_message() {
    let h = Harness::new(4);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();
    h.send("one", &conversation).await.unwrap();
    h.send("two", &conversation).await.unwrap();

    let requests = h.client.requests.lock();
    assert_eq!(requests.len(), 2);
    let roles: Vec<MessageRole> = requests[1].messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]
    );
    assert_eq!(requests[1].messages[2].content, "two");
    assert_eq!(
        h.engine.conversation(&conversation.id).unwrap().message_count(),
        4
    );
}

#[tokio::test]
async fn test_final_output_replaces_tokens_and_missing_done_completes() {
    let client = ScriptedClient::with_replies([
        Reply::Events(vec![
            Ok(StreamEvent::Token("draft".into())),
            Ok(StreamEvent::Output("final answer".into())),
            Ok(StreamEvent::Done),
        ]),
        Reply::Events(vec![Ok(StreamEvent::Token("no done".into()))]),
    ]);
    let h = Harness::build(4, CountingStore::default(), client);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    let first = h.send("q1", &conversation).await.unwrap();
    assert_eq!(first.conversation().unwrap().messages[1].text, "final answer");

    let second = h.send("q2", &conversation).await.unwrap();
    assert_eq!(second.conversation().unwrap().messages[3].text, "no done");
}

#[tokio::test]
async fn test_rejects_empty_text_and_unknown_conversation() {
    let h = Harness::new(4);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    assert!(matches!(
        h.send("  \n\t", &conversation).await,
        Err(EngineError::EmptyMessage)
    ));

    let stranger = Conversation::new(&path_key("/w/z.rs"), vec![], Utc::now());
    assert!(matches!(
        h.send("hello", &stranger).await,
        Err(EngineError::ConversationNotFound(id)) if id == stranger.id
    ));
    assert_eq!(h.client.request_count(), 0);
}

#[tokio::test]
async fn test_cancel_mid_stream_commits_nothing() {
    let client = ScriptedClient::with_replies([
        Reply::tokens(&["warm"]),
        Reply::Stall(vec![Ok(StreamEvent::Token("partial".into()))]),
    ]);
    let h = Harness::build(4, CountingStore::default(), client);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();
    h.send("warm up", &conversation).await.unwrap();

    let saves_before = h.store.save_count();
    let messages_before = h.engine.conversation(&conversation.id).unwrap().message_count();

    let cancel = CancellationToken::new();
    let cancel_on_text = |delta: StreamDelta| {
        if matches!(delta, StreamDelta::Text { .. }) {
            cancel.cancel();
        }
    };
    let on_stream: StreamCallback<'_> = &cancel_on_text;
    let outcome = h
        .engine
        .send_message("next", conversation.id, None, Some(on_stream), &cancel)
        .await
        .unwrap();

    assert_eq!(outcome, SendOutcome::Cancelled);
    assert_eq!(h.store.save_count(), saves_before);
    assert_eq!(
        h.engine.conversation(&conversation.id).unwrap().message_count(),
        messages_before
    );

    // The in-flight mark is released
    assert!(h.send("again", &conversation).await.is_ok());
}

#[tokio::test]
async fn test_cancel_before_start_never_calls_transport() {
    let h = Harness::new(4);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h
        .engine
        .send_message("hi", conversation.id, None, None, &cancel)
        .await
        .unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(h.client.request_count(), 0);
    assert_eq!(h.store.save_count(), 0);
}

#[tokio::test]
async fn test_second_save_failure_leaves_cache_unchanged() {
    let h = Harness::build(4, CountingStore::failing_on_save([2]), ScriptedClient::default());
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    h.send("one", &conversation).await.unwrap();
    assert_eq!(h.store.save_count(), 1);
    let cached = h.engine.conversation(&conversation.id).unwrap();
    assert_eq!(cached.message_count(), 2);

    let err = h.send("two", &conversation).await.unwrap_err();
    assert!(matches!(err, EngineError::PersistenceFailed(_)));
    assert_eq!(h.store.save_count(), 2);
    let after = h.engine.conversation(&conversation.id).unwrap();
    assert_eq!(after.message_count(), 2);
    assert_eq!(after, cached);
    assert_eq!(h.store.stored(&conversation.id).unwrap().message_count(), 2);
}

#[tokio::test]
async fn test_transport_failures_propagate_without_commit() {
    let client = ScriptedClient::with_replies([
        Reply::Refuse(TransportError::AuthFailed("bad key".into())),
        Reply::Events(vec![
            Ok(StreamEvent::Token("half".into())),
            Err(TransportError::Interrupted("connection reset".into())),
        ]),
    ]);
    let h = Harness::build(4, CountingStore::default(), client);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    assert!(matches!(
        h.send("one", &conversation).await,
        Err(EngineError::StreamingTransport(TransportError::AuthFailed(_)))
    ));
    assert!(matches!(
        h.send("two", &conversation).await,
        Err(EngineError::StreamingTransport(TransportError::Interrupted(_)))
    ));
    assert_eq!(h.store.save_count(), 0);
    assert_eq!(
        h.engine.conversation(&conversation.id).unwrap().message_count(),
        0
    );
}

#[tokio::test]
async fn test_concurrent_send_on_same_conversation_is_busy() {
    let client = ScriptedClient::with_replies([Reply::Stall(vec![])]);
    let h = Harness::build(4, CountingStore::default(), client);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();
    let cancel = CancellationToken::new();

    let first = h
        .engine
        .send_message("slow", conversation.id, None, None, &cancel);
    let second = async {
        while h.client.request_count() == 0 {
            tokio::task::yield_now().await;
        }
        let busy = h
            .engine
            .send_message("fast", conversation.id, None, None, &CancellationToken::new())
            .await;
        let delete = h.engine.delete_conversation(&conversation.id).await;
        cancel.cancel();
        (busy, delete)
    };

    let (first, (busy, delete)) = tokio::join!(first, second);
    assert!(first.unwrap().is_cancelled());
    assert!(matches!(busy, Err(EngineError::ConversationBusy(id)) if id == conversation.id));
    assert!(matches!(delete, Err(EngineError::ConversationBusy(_))));
    assert_eq!(h.client.request_count(), 1);
}

#[tokio::test]
async fn test_descriptor_context_wins_over_explicit_paths() {
    let h = Harness::new(4);
    let a = FileId::new();
    let snapshot = Arc::new(snapshot_of(&[("/w/a.rs", a), ("/w/b.rs", FileId::new())]));
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    let request = ContextRequest {
        snapshot: Some(snapshot),
        preferred_descriptor_ids: vec![a],
        explicit_paths: vec![PathBuf::from("/elsewhere/notes.md")],
        budget: ContextBudget::default(),
    };
    let outcome = h
        .engine
        .send_message("review", conversation.id, Some(request), None, &CancellationToken::new())
        .await
        .unwrap();

    let committed = outcome.conversation().unwrap();
    assert_eq!(committed.messages[0].attachments, vec![PathBuf::from("/w/a.rs")]);
    let requests = h.client.requests.lock();
    assert_eq!(requests[0].segments.len(), 1);
    assert!(requests[0].segments[0].encoded.contains("fn a() {}"));
    assert!(!requests[0].segments[0].encoded.contains("notes"));
}

#[tokio::test]
async fn test_explicit_paths_used_when_snapshot_resolves_nothing() {
    let h = Harness::new(4);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    let request = ContextRequest {
        snapshot: Some(Arc::new(snapshot_of(&[("/w/a.rs", FileId::new())]))),
        explicit_paths: vec![PathBuf::from("/elsewhere/notes.md")],
        ..ContextRequest::default()
    };
    let outcome = h
        .engine
        .send_message("notes?", conversation.id, Some(request), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        outcome.conversation().unwrap().messages[0].attachments,
        vec![PathBuf::from("/elsewhere/notes.md")]
    );
}

#[tokio::test]
async fn test_missing_preferred_descriptor_fails_before_loading() {
    let h = Harness::new(4);
    let conversation = h.engine.ensure_conversation(&path_key("/w/a.rs"), None).unwrap();

    let request = ContextRequest {
        snapshot: Some(Arc::new(snapshot_of(&[("/w/a.rs", FileId::new())]))),
        preferred_descriptor_ids: vec![FileId::new()],
        explicit_paths: vec![PathBuf::from("/elsewhere/notes.md")],
        budget: ContextBudget::default(),
    };
    let err = h
        .engine
        .send_message("hi", conversation.id, Some(request), None, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ContextLoadFailed(_)));
    assert_eq!(h.loader.loads.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.client.request_count(), 0);
}

#[tokio::test]
async fn test_hydrate_fills_free_slots_newest_first() {
    let store = CountingStore::default();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        let at = base + Duration::minutes(i);
        let conversation = Conversation::new(&path_key(&format!("/w/{}.rs", i)), vec![], at)
            .with_exchange(
                Message::new(Role::User, format!("q{}", i), at),
                Message::new(Role::Assistant, format!("a{}", i), at),
                at,
            );
        ids.push(conversation.id);
        store.preload(conversation);
    }
    let h = Harness::build(3, store, ScriptedClient::default());

    assert_eq!(h.engine.hydrate().await.unwrap(), 3);
    let cached: Vec<_> = h.engine.conversations().iter().map(|c| c.id).collect();
    assert_eq!(cached, vec![ids[4], ids[3], ids[2]]);

    // Nothing is reloaded once the cache is full
    assert_eq!(h.engine.hydrate().await.unwrap(), 0);
    assert_eq!(h.engine.cache_len(), 3);
}

#[tokio::test]
async fn test_delete_conversation() {
    let h = Harness::new(4);
    let key = path_key("/w/a.rs");
    let conversation = h.engine.ensure_conversation(&key, None).unwrap();
    h.send("keep me?", &conversation).await.unwrap();

    h.engine.delete_conversation(&conversation.id).await.unwrap();
    assert!(h.engine.conversation(&conversation.id).is_none());
    assert!(h.engine.conversation_for(&key).is_none());
    assert!(h.store.stored(&conversation.id).is_none());

    assert!(matches!(
        h.engine.delete_conversation(&conversation.id).await,
        Err(EngineError::ConversationNotFound(_))
    ));
}

#[tokio::test]
async fn test_concurrent_sends_keep_their_own_streams() {
    let client = ScriptedClient::with_replies([
        Reply::paced_tokens(&["a1 ", "a2 ", "a3"]),
        Reply::paced_tokens(&["b1 ", "b2 ", "b3"]),
    ]);
    let h = Harness::build(4, CountingStore::default(), client);
    let a = FileId::new();
    let b = FileId::new();
    let snapshot = snapshot_of(&[("/w/a.rs", a), ("/w/b.rs", b)]);
    let resolver: &dyn DescriptorPathResolver = &snapshot;
    let first = h
        .engine
        .ensure_conversation(&ConversationKey::descriptors([a]), Some(resolver))
        .unwrap();
    let second = h
        .engine
        .ensure_conversation(&ConversationKey::descriptors([b]), Some(resolver))
        .unwrap();

    let log: Mutex<Vec<(char, String)>> = Mutex::new(Vec::new());
    let record_a = |delta: StreamDelta| {
        if let StreamDelta::Text { aggregate } = delta {
            log.lock().push(('a', aggregate));
        }
    };
    let record_b = |delta: StreamDelta| {
        if let StreamDelta::Text { aggregate } = delta {
            log.lock().push(('b', aggregate));
        }
    };
    let on_a: StreamCallback<'_> = &record_a;
    let on_b: StreamCallback<'_> = &record_b;
    let cancel = CancellationToken::new();

    let (out_a, out_b) = tokio::join!(
        h.engine.send_message("first", first.id, None, Some(on_a), &cancel),
        h.engine.send_message("second", second.id, None, Some(on_b), &cancel),
    );

    let committed_a = out_a.unwrap().conversation().unwrap().clone();
    let committed_b = out_b.unwrap().conversation().unwrap().clone();
    assert_eq!(committed_a.messages[1].text, "a1 a2 a3");
    assert_eq!(committed_b.messages[1].text, "b1 b2 b3");

    let log = log.lock();
    assert_eq!(log.len(), 6);
    for (owner, aggregate) in log.iter() {
        let foreign = if *owner == 'a' { 'b' } else { 'a' };
        assert!(!aggregate.contains(foreign), "{} saw {:?}", owner, aggregate);
    }
    // The two streams really did interleave
    let owners: String = log.iter().map(|(owner, _)| *owner).collect();
    assert_ne!(owners, "aaabbb");
    assert_ne!(owners, "bbbaaa");
}
