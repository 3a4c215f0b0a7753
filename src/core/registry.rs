use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::approvals::{ApprovalBroker, ApprovalDecision, ApprovalWait};
use crate::core::engine::{CompletionEngine, CompletionRequest, ProviderEvent, ProviderResolver};
use crate::core::errors::{classify_provider_error, TurnError, TurnErrorKind};
use crate::core::message::{ControlMarker, Message, Part, Role};
use crate::core::persistence::{PersistenceWriter, SessionStore};
use crate::core::policy::{PolicyChain, PolicyContext, PolicyDecision};
use crate::core::prompt;
use crate::core::session::{Session, SessionMode};
use crate::core::stream::{Chunk, StreamAccumulator, TurnOutcome};
use crate::mcp::descriptor::DescriptorStore;
use crate::mcp::readiness::ReadinessManager;

/// Answer recorded against an interactive question that nobody resolved
/// before the safety timeout.
const QUESTION_TIMEOUT_ANSWER: &str = "Timed out";

/// Defaults applied when a turn arrives for a session id with no stored
/// state yet.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub working_dir: PathBuf,
    pub mode: SessionMode,
    /// Free-form profile text folded into every assembled prompt.
    pub profile: Option<String>,
    pub restricted: bool,
    pub automation: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            mode: SessionMode::Agent,
            profile: None,
            restricted: false,
            automation: false,
        }
    }
}

struct ActiveTurn {
    cancel: CancellationToken,
    generation: u64,
}

/// Owns the per-session turn lifecycle: at most one in-flight generation
/// per session id, with the previous generation cancelled before the
/// next consumes the engine.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    store: Arc<dyn SessionStore>,
    writer: PersistenceWriter,
    engine: Arc<dyn CompletionEngine>,
    resolver: Arc<dyn ProviderResolver>,
    descriptors: Arc<dyn DescriptorStore>,
    readiness: ReadinessManager,
    approvals: ApprovalBroker,
    chain: PolicyChain,
    defaults: SessionDefaults,
    active: Mutex<HashMap<String, ActiveTurn>>,
    /// Serializes session mutation: turn N+1 waits for turn N's
    /// teardown (cancel already signalled) before touching the session.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        engine: Arc<dyn CompletionEngine>,
        resolver: Arc<dyn ProviderResolver>,
        descriptors: Arc<dyn DescriptorStore>,
        readiness: ReadinessManager,
        approvals: ApprovalBroker,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                writer: PersistenceWriter::new(store.clone()),
                store,
                engine,
                resolver,
                descriptors,
                readiness,
                approvals,
                chain: PolicyChain::standard(),
                defaults,
                active: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn approvals(&self) -> &ApprovalBroker {
        &self.inner.approvals
    }

    pub fn is_generating(&self, session_id: &str) -> bool {
        self.inner
            .active
            .lock()
            .expect("active lock")
            .contains_key(session_id)
    }

    /// Submits one user turn. Any generation already running for the
    /// session id is cancelled, and the fresh cancellation token is
    /// registered before any other work happens. The returned channel
    /// carries this turn's chunks and ends with exactly one `Finish`.
    pub fn submit_turn(&self, session_id: &str, input: &str) -> mpsc::UnboundedReceiver<Chunk> {
        self.submit_turn_with_attachments(session_id, input, Vec::new())
    }

    /// `submit_turn` with attachment parts carried on the stored user
    /// message. Attachments do not participate in duplicate detection;
    /// only the rendered text does.
    pub fn submit_turn_with_attachments(
        &self,
        session_id: &str,
        input: &str,
        attachments: Vec<Part>,
    ) -> mpsc::UnboundedReceiver<Chunk> {
        let cancel = CancellationToken::new();
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut active = self.inner.active.lock().expect("active lock");
            if let Some(previous) = active.insert(
                session_id.to_string(),
                ActiveTurn {
                    cancel: cancel.clone(),
                    generation,
                },
            ) {
                debug!(session_id = %session_id, "Cancelling superseded generation");
                previous.cancel.cancel();
            }
        }
        self.inner.approvals.cancel_session(session_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = self.inner.clone();
        let session_id = session_id.to_string();
        let input = input.to_string();
        tokio::spawn(async move {
            run_turn(&inner, &session_id, &input, attachments, cancel, generation, &tx).await;
        });
        rx
    }

    /// Cancels the in-flight generation for a session, if any. The turn
    /// still flushes whatever it accumulated.
    pub fn cancel_turn(&self, session_id: &str) -> bool {
        self.inner.approvals.cancel_session(session_id);
        let active = self.inner.active.lock().expect("active lock");
        match active.get(session_id) {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

fn release_turn(inner: &RegistryInner, session_id: &str, generation: u64) {
    let mut active = inner.active.lock().expect("active lock");
    // A newer turn may have replaced the entry already.
    if active
        .get(session_id)
        .is_some_and(|turn| turn.generation == generation)
    {
        active.remove(session_id);
    }
}

fn emit(tx: &mpsc::UnboundedSender<Chunk>, chunk: Chunk) {
    let _ = tx.send(chunk);
}

/// The full turn pipeline. Every exit path flushes the accumulator and
/// releases the active-turn slot; failures surface as one Error chunk
/// plus Finish, never as a panic.
async fn run_turn(
    inner: &RegistryInner,
    session_id: &str,
    input: &str,
    attachments: Vec<Part>,
    cancel: CancellationToken,
    generation: u64,
    tx: &mpsc::UnboundedSender<Chunk>,
) {
    let lock = {
        let mut locks = inner.locks.lock().expect("locks lock");
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    };
    let _guard = lock.lock().await;

    let mut session = match load_or_create(inner, session_id).await {
        Ok(session) => session,
        Err(error) => {
            emit(tx, Chunk::Error(error));
            emit(
                tx,
                Chunk::Finish {
                    outcome: TurnOutcome::Errored,
                },
            );
            release_turn(inner, session_id, generation);
            return;
        }
    };

    let accumulator = StreamAccumulator::new();
    let outcome = match drive_turn(inner, &mut session, input, attachments, &cancel, tx).await {
        Ok((accumulator, outcome)) => {
            finish_turn(inner, &mut session, accumulator, outcome, tx).await;
            outcome
        }
        Err(error) => {
            // Outermost boundary: whatever failed, the turn still
            // flushes and reports a classified error.
            emit(tx, Chunk::Error(error.clone()));
            let mut accumulator = accumulator;
            accumulator.set_error(error);
            finish_turn(inner, &mut session, accumulator, TurnOutcome::Errored, tx).await;
            TurnOutcome::Errored
        }
    };
    debug!(session_id = %session_id, outcome = ?outcome, "Turn finished");
    release_turn(inner, session_id, generation);
}

async fn load_or_create(inner: &RegistryInner, session_id: &str) -> Result<Session, TurnError> {
    let loaded = inner.store.load(session_id).await.map_err(TurnError::unknown)?;
    Ok(loaded.unwrap_or_else(|| {
        Session::new(
            session_id,
            inner.defaults.working_dir.clone(),
            inner.defaults.mode,
        )
    }))
}

async fn finish_turn(
    inner: &RegistryInner,
    session: &mut Session,
    accumulator: StreamAccumulator,
    outcome: TurnOutcome,
    tx: &mpsc::UnboundedSender<Chunk>,
) {
    if let Err(message) = inner.writer.flush(session, accumulator, outcome).await {
        warn!(session_id = %session.id, error = %message, "Flush failed");
    }
    emit(tx, Chunk::Finish { outcome });
}

async fn drive_turn(
    inner: &RegistryInner,
    session: &mut Session,
    input: &str,
    attachments: Vec<Part>,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<Chunk>,
) -> Result<(StreamAccumulator, TurnOutcome), TurnError> {
    // A successor submitted back-to-back may have cancelled this turn
    // before its task first ran; if it also won the session lock, its
    // effects are already in the store. Bail before touching anything.
    if cancel.is_cancelled() {
        return Ok((StreamAccumulator::new(), TurnOutcome::Cancelled));
    }

    // Duplicate resubmission: the previous turn was torn down after the
    // user message was persisted but before any reply. Reuse it instead
    // of storing a second copy.
    let duplicate = session
        .last_message()
        .is_some_and(|message| message.is_user() && message.rendered_text() == input);
    if !duplicate {
        let mut parts = vec![Part::text(input)];
        parts.extend(attachments);
        session.messages.push(Message::new(Role::User, parts));
    }
    session.in_progress = true;
    inner.store.save(session).await.map_err(TurnError::unknown)?;

    let provider = inner.resolver.resolve().await.map_err(|message| {
        TurnError::new(TurnErrorKind::NetworkError, message)
    })?;
    debug!(provider = %provider.name, model = %provider.model, fallback = provider.is_fallback, "Provider resolved");

    // Stranded turns since the last assistant reply fold into this
    // prompt, most recent last; the entry for the current input is the
    // tail of that list and is excluded from the merge.
    let mut stranded: Vec<String> = session
        .stranded_user_turns()
        .iter()
        .map(|message| message.rendered_text())
        .collect();
    stranded.pop();
    let merged = prompt::merge_stranded_turns(&stranded, input);

    let expanded = prompt::expand_mentions(&merged);
    let assembled = prompt::assemble(session, &expanded, inner.defaults.profile.as_deref());

    let all_descriptors = inner.descriptors.descriptors().await;
    let descriptors = inner.readiness.connected_descriptors(&all_descriptors);

    let history: Vec<Message> = session
        .messages
        .iter()
        .take(session.messages.len().saturating_sub(1))
        .cloned()
        .collect();
    let request = CompletionRequest {
        model: provider.model,
        prompt: assembled,
        history,
        descriptors,
        resume_token: session.resume_token.clone(),
    };

    // Cancellation may have landed during the save or resolve awaits;
    // a cancelled turn must not consume the engine.
    if cancel.is_cancelled() {
        return Ok((StreamAccumulator::new(), TurnOutcome::Cancelled));
    }

    let mut events = inner
        .engine
        .start(request, cancel.clone())
        .await
        .map_err(|message| classify_provider_error(&message))?;

    let ctx = PolicyContext {
        mode: session.mode,
        restricted: inner.defaults.restricted,
        automation: inner.defaults.automation,
    };
    let mut accumulator = StreamAccumulator::new();

    let outcome = loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break TurnOutcome::Cancelled,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            // Engine hung up without a terminal event; treat whatever
            // arrived as the complete reply.
            break TurnOutcome::Completed;
        };

        let chunks = match event {
            ProviderEvent::ToolCall {
                call_id,
                name,
                input,
            } => {
                negotiate_tool_call(
                    inner,
                    &session.id,
                    &mut accumulator,
                    &ctx,
                    call_id,
                    name,
                    input,
                    cancel,
                    tx,
                )
                .await
            }
            other => accumulator.apply(other),
        };

        let terminal = StreamAccumulator::is_terminal(&chunks);
        let mut outcome = None;
        for chunk in chunks {
            if let Chunk::Finish {
                outcome: finish_outcome,
            } = chunk
            {
                outcome = Some(finish_outcome);
                // Finish is emitted once by finish_turn after the flush.
                continue;
            }
            emit(tx, chunk);
        }
        if terminal {
            break outcome.unwrap_or(TurnOutcome::Completed);
        }
        if cancel.is_cancelled() {
            break TurnOutcome::Cancelled;
        }
    };

    if outcome == TurnOutcome::Cancelled {
        accumulator.flush_pending_text();
        // Nothing streamed means nothing to mark as interrupted; the
        // stored user message stays the tail for duplicate detection.
        if accumulator.has_parts() {
            accumulator.push_control(ControlMarker::Interrupted);
        }
        emit(tx, Chunk::Control(ControlMarker::Interrupted));
    }
    Ok((accumulator, outcome))
}

/// Runs one announced tool call through the policy chain and, for
/// interactive questions, parks the pipeline on the approval broker.
#[allow(clippy::too_many_arguments)]
async fn negotiate_tool_call(
    inner: &RegistryInner,
    session_id: &str,
    accumulator: &mut StreamAccumulator,
    ctx: &PolicyContext,
    call_id: String,
    name: String,
    input: serde_json::Value,
    cancel: &CancellationToken,
    tx: &mpsc::UnboundedSender<Chunk>,
) -> Vec<Chunk> {
    let original = input.clone();
    match inner.chain.evaluate(&name, input, ctx) {
        PolicyDecision::Allow { input } => accumulator.apply(ProviderEvent::ToolCall {
            call_id,
            name,
            input,
        }),
        PolicyDecision::Deny { message } => {
            debug!(call_id = %call_id, tool = %name, "Tool call denied by policy");
            let mut chunks = accumulator.apply(ProviderEvent::ToolCall {
                call_id: call_id.clone(),
                name,
                input: original,
            });
            accumulator.attach_tool_output(&call_id, message.clone());
            chunks.push(Chunk::ToolOutputAvailable {
                call_id,
                output: message,
            });
            chunks
        }
        PolicyDecision::Ask { input } => {
            let mut chunks = accumulator.apply(ProviderEvent::ToolCall {
                call_id: call_id.clone(),
                name,
                input,
            });
            for chunk in chunks.drain(..) {
                emit(tx, chunk);
            }
            emit(
                tx,
                Chunk::QuestionPending {
                    call_id: call_id.clone(),
                },
            );

            match inner.approvals.wait(session_id, &call_id, cancel).await {
                ApprovalWait::Resolved(decision) => {
                    let answer = match decision {
                        ApprovalDecision::Approved { answer } => {
                            answer.unwrap_or_else(|| "Approved".to_string())
                        }
                        ApprovalDecision::Denied { message } => message,
                    };
                    accumulator.attach_tool_output(&call_id, answer.clone());
                    vec![
                        Chunk::QuestionAnswered {
                            call_id: call_id.clone(),
                        },
                        Chunk::ToolOutputAvailable {
                            call_id,
                            output: answer,
                        },
                    ]
                }
                ApprovalWait::TimedOut => {
                    accumulator.attach_tool_output(&call_id, QUESTION_TIMEOUT_ANSWER.to_string());
                    vec![
                        Chunk::QuestionTimedOut {
                            call_id: call_id.clone(),
                        },
                        Chunk::ToolOutputAvailable {
                            call_id,
                            output: QUESTION_TIMEOUT_ANSWER.to_string(),
                        },
                    ]
                }
                ApprovalWait::Cancelled => Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::FixedProvider;
    use crate::core::message::Part;
    use crate::core::persistence::MemoryStore;
    use crate::core::policy::QUESTION_TOOL;
    use crate::mcp::descriptor::{NoCredentials, StaticDescriptorStore};
    use crate::mcp::probe::{ProbeClassification, ProbeOutcome, Prober};
    use async_trait::async_trait;

    struct NeverProbe;

    #[async_trait]
    impl Prober for NeverProbe {
        async fn probe(
            &self,
            _descriptor: &crate::mcp::descriptor::ServerDescriptor,
            _credential: Option<&str>,
        ) -> ProbeOutcome {
            ProbeOutcome {
                operations: Vec::new(),
                classification: ProbeClassification::Failed,
            }
        }
    }

    /// One scripted event list per `start` call. `hold` keeps the event
    /// channel open after the script drains, so the turn only ends via
    /// cancellation.
    struct ScriptedEngine {
        scripts: Mutex<Vec<(Vec<ProviderEvent>, bool)>>,
    }

    impl ScriptedEngine {
        fn new(scripts: Vec<(Vec<ProviderEvent>, bool)>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
            }
        }
    }

    #[async_trait]
    impl CompletionEngine for ScriptedEngine {
        async fn start(
            &self,
            _request: CompletionRequest,
            cancel: CancellationToken,
        ) -> Result<mpsc::UnboundedReceiver<ProviderEvent>, String> {
            let (events, hold) = {
                let mut scripts = self.scripts.lock().expect("scripts lock");
                if scripts.is_empty() {
                    return Err("no script remaining".to_string());
                }
                scripts.remove(0)
            };
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                if hold {
                    cancel.cancelled().await;
                }
            });
            Ok(rx)
        }
    }

    fn registry_with(engine: ScriptedEngine, store: Arc<MemoryStore>) -> SessionRegistry {
        let descriptors = Arc::new(StaticDescriptorStore::new(Vec::new()));
        let readiness = ReadinessManager::new(
            descriptors.clone(),
            Arc::new(NoCredentials),
            Arc::new(NeverProbe),
        );
        SessionRegistry::new(
            store,
            Arc::new(engine),
            Arc::new(FixedProvider::new("local", "test-model")),
            descriptors,
            readiness,
            ApprovalBroker::new(),
            SessionDefaults::default(),
        )
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<Chunk>) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let done = matches!(chunk, Chunk::Finish { .. });
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[tokio::test]
    async fn completed_turn_persists_user_and_assistant_messages() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![(
            vec![
                ProviderEvent::TextDelta("hello ".to_string()),
                ProviderEvent::TextDelta("there".to_string()),
                ProviderEvent::Done,
            ],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        let chunks = collect(registry.submit_turn("s1", "hi")).await;
        assert!(matches!(
            chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Completed
            })
        ));

        let session = store.load("s1").await.expect("load").expect("session");
        assert!(!session.in_progress);
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].rendered_text(), "hi");
        assert_eq!(session.messages[1].rendered_text(), "hello there");
        assert!(!registry.is_generating("s1"));
    }

    #[tokio::test]
    async fn second_turn_cancels_the_first_and_both_flush() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![
            (
                vec![ProviderEvent::TextDelta("partial".to_string())],
                true,
            ),
            (
                vec![
                    ProviderEvent::TextDelta("done".to_string()),
                    ProviderEvent::Done,
                ],
                false,
            ),
        ]);
        let registry = registry_with(engine, store.clone());

        let mut first = registry.submit_turn("s1", "one");
        // Wait until the first turn has streamed something.
        let chunk = first.recv().await.expect("first chunk");
        assert_eq!(
            chunk,
            Chunk::TextDelta {
                text: "partial".to_string()
            }
        );

        let second = registry.submit_turn("s1", "two");
        let first_chunks = collect(first).await;
        assert!(first_chunks.contains(&Chunk::Control(ControlMarker::Interrupted)));
        assert!(matches!(
            first_chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Cancelled
            })
        ));

        let second_chunks = collect(second).await;
        assert!(matches!(
            second_chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Completed
            })
        ));

        let session = store.load("s1").await.expect("load").expect("session");
        assert!(!session.in_progress);
        // The cancelled turn still persisted its partial reply.
        let texts: Vec<String> = session
            .messages
            .iter()
            .map(|message| message.rendered_text())
            .collect();
        assert!(texts.contains(&"partial".to_string()));
        assert!(texts.contains(&"done".to_string()));
    }

    #[tokio::test]
    async fn duplicate_resubmission_reuses_the_stored_user_message() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![
            (Vec::new(), true),
            (vec![ProviderEvent::Done], false),
        ]);
        let registry = registry_with(engine, store.clone());

        let first = registry.submit_turn("s1", "same question");
        tokio::task::yield_now().await;
        let second = registry.submit_turn("s1", "same question");
        collect(first).await;
        collect(second).await;

        let session = store.load("s1").await.expect("load").expect("session");
        let copies = session
            .messages
            .iter()
            .filter(|message| message.is_user() && message.rendered_text() == "same question")
            .count();
        assert_eq!(copies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_question_times_out_denied_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![(
            vec![
                ProviderEvent::ToolCall {
                    call_id: "q-1".to_string(),
                    name: QUESTION_TOOL.to_string(),
                    input: serde_json::json!({"question": "deploy?"}),
                },
                ProviderEvent::Done,
            ],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        let chunks = collect(registry.submit_turn("s1", "ship it")).await;
        let timeouts = chunks
            .iter()
            .filter(|chunk| matches!(chunk, Chunk::QuestionTimedOut { .. }))
            .count();
        assert_eq!(timeouts, 1);
        assert!(chunks.contains(&Chunk::QuestionPending {
            call_id: "q-1".to_string()
        }));

        let session = store.load("s1").await.expect("load").expect("session");
        let output = session
            .messages
            .iter()
            .flat_map(|message| message.parts.iter())
            .find_map(|part| match part {
                Part::ToolInvocation { output, .. } => output.clone(),
                _ => None,
            });
        assert_eq!(output.as_deref(), Some("Timed out"));
    }

    #[tokio::test]
    async fn answered_question_attaches_the_answer_and_resumes() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![(
            vec![
                ProviderEvent::ToolCall {
                    call_id: "q-1".to_string(),
                    name: QUESTION_TOOL.to_string(),
                    input: serde_json::json!({"question": "deploy?"}),
                },
                ProviderEvent::TextDelta("deploying".to_string()),
                ProviderEvent::Done,
            ],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        let mut rx = registry.submit_turn("s1", "ship it");
        let mut chunks = Vec::new();
        loop {
            let chunk = rx.recv().await.expect("chunk");
            if matches!(chunk, Chunk::QuestionPending { .. }) {
                chunks.push(chunk);
                break;
            }
            chunks.push(chunk);
        }
        assert!(registry.approvals().resolve(
            "q-1",
            ApprovalDecision::Approved {
                answer: Some("yes, go".to_string())
            }
        ));
        while let Some(chunk) = rx.recv().await {
            let done = matches!(chunk, Chunk::Finish { .. });
            chunks.push(chunk);
            if done {
                break;
            }
        }

        assert!(chunks.contains(&Chunk::QuestionAnswered {
            call_id: "q-1".to_string()
        }));
        assert!(chunks.contains(&Chunk::ToolOutputAvailable {
            call_id: "q-1".to_string(),
            output: "yes, go".to_string()
        }));
        assert!(matches!(
            chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Completed
            })
        ));
    }

    #[tokio::test]
    async fn provider_error_flushes_and_reports_classified_kind() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![(
            vec![
                ProviderEvent::TextDelta("part".to_string()),
                ProviderEvent::Error {
                    message: "429 rate limit exceeded".to_string(),
                    resume_token_invalid: false,
                },
            ],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        let chunks = collect(registry.submit_turn("s1", "go")).await;
        assert!(chunks.iter().any(|chunk| matches!(
            chunk,
            Chunk::Error(TurnError {
                kind: TurnErrorKind::RateLimit,
                ..
            })
        )));
        assert!(matches!(
            chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Errored
            })
        ));

        let session = store.load("s1").await.expect("load").expect("session");
        assert!(!session.in_progress);
        let reply = session
            .messages
            .iter()
            .find(|message| message.is_assistant())
            .expect("assistant message");
        assert_eq!(reply.rendered_text(), "part");
        // The classified error is stored with the partial reply.
        assert!(reply.parts.iter().any(|part| matches!(
            part,
            Part::Error {
                error: TurnError {
                    kind: TurnErrorKind::RateLimit,
                    ..
                }
            }
        )));
    }

    #[tokio::test]
    async fn turn_superseded_before_it_runs_leaves_no_trace() {
        let store = Arc::new(MemoryStore::new());
        // One script only: the superseded turn must never reach the
        // engine.
        let engine = ScriptedEngine::new(vec![(
            vec![
                ProviderEvent::TextDelta("reply".to_string()),
                ProviderEvent::Done,
            ],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        // Back to back, before the first task ever polls: its token is
        // cancelled while it is still queued.
        let first = registry.submit_turn("s1", "first ask");
        let second = registry.submit_turn("s1", "second ask");

        let first_chunks = collect(first).await;
        assert_eq!(
            first_chunks,
            vec![Chunk::Finish {
                outcome: TurnOutcome::Cancelled
            }]
        );

        let second_chunks = collect(second).await;
        assert!(matches!(
            second_chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Completed
            })
        ));

        let session = store.load("s1").await.expect("load").expect("session");
        let texts: Vec<String> = session
            .messages
            .iter()
            .map(|message| message.rendered_text())
            .collect();
        assert_eq!(texts, vec!["second ask".to_string(), "reply".to_string()]);
    }

    #[tokio::test]
    async fn invalid_resume_token_clears_the_session_token() {
        let store = Arc::new(MemoryStore::new());
        let mut seeded = Session::new("s1", PathBuf::from("."), SessionMode::Agent);
        seeded.resume_token = Some("rt-old".to_string());
        store.save(&seeded).await.expect("seed");

        let engine = ScriptedEngine::new(vec![(
            vec![ProviderEvent::Error {
                message: "session expired: resume token invalid".to_string(),
                resume_token_invalid: true,
            }],
            false,
        )]);
        let registry = registry_with(engine, store.clone());

        collect(registry.submit_turn("s1", "continue")).await;
        let session = store.load("s1").await.expect("load").expect("session");
        assert!(session.resume_token.is_none());
    }

    #[tokio::test]
    async fn cancel_turn_interrupts_and_flushes() {
        let store = Arc::new(MemoryStore::new());
        let engine = ScriptedEngine::new(vec![(
            vec![ProviderEvent::TextDelta("working".to_string())],
            true,
        )]);
        let registry = registry_with(engine, store.clone());

        let mut rx = registry.submit_turn("s1", "task");
        let first = rx.recv().await.expect("chunk");
        assert!(matches!(first, Chunk::TextDelta { .. }));

        assert!(registry.cancel_turn("s1"));
        let chunks = collect(rx).await;
        assert!(matches!(
            chunks.last(),
            Some(Chunk::Finish {
                outcome: TurnOutcome::Cancelled
            })
        ));
        let session = store.load("s1").await.expect("load").expect("session");
        assert!(!session.in_progress);
        assert!(session
            .messages
            .iter()
            .any(|message| message.rendered_text() == "working"));
    }
}
