//! Session worker and caller-facing handle
//!
//! Backend types hold state that must not be shared across threads, so the
//! whole session (evaluator, queue, history, cursors) lives on one dedicated
//! worker thread. Callers talk to it through channels: commands are processed
//! strictly in arrival order, results and streamed tokens come back as
//! asynchronous events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::evaluator::{EvalError, Evaluator};
use crate::session::{ChatEngine, SessionConfig, SessionError};
use crate::streaming::{StreamToken, Utf8Assembler};

/// Progress of a model load, streamed while the backend reads weights.
#[derive(Debug, Clone)]
pub enum LoadEvent {
    /// Fractional completion in `[0, 1]`
    Progress(f32),
    /// The model is loaded and the session can start a chat
    Ready { n_ctx: usize },
    Failed(String),
}

/// Opens an evaluator for a session. Invoked on the worker thread; the
/// progress callback forwards fractional completion to the caller.
pub type BackendFactory<E> =
    dyn FnMut(&SessionConfig, &dyn Fn(f32)) -> Result<E, EvalError> + Send;

/// In-flight fragments the caller may lag behind before the worker blocks.
const TOKEN_STREAM_DEPTH: usize = 64;

enum Command {
    Load {
        config: SessionConfig,
        events: Sender<LoadEvent>,
    },
    Unload {
        done: Sender<Result<(), SessionError>>,
    },
    StartChat {
        done: Sender<Result<(), SessionError>>,
    },
    SendTurn {
        text: String,
        tokens: SyncSender<StreamToken>,
        stop: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Explicit session phases; conflicting requests are rejected instead of
/// silently interleaving.
enum WorkerState<E> {
    Unloaded,
    Loaded { eval: E, config: SessionConfig },
    Chatting { engine: ChatEngine<E> },
}

/// Handle to a single chat session running on its own worker thread.
///
/// Dropping the handle shuts the worker down and joins it.
pub struct ChatSession {
    command_tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Spawns the session worker around a backend factory.
    pub fn with_backend<E, F>(factory: F) -> Self
    where
        E: Evaluator + 'static,
        F: FnMut(&SessionConfig, &dyn Fn(f32)) -> Result<E, EvalError> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel();
        let worker = thread::spawn(move || worker_main(command_rx, factory));
        tracing::info!("session worker thread started");
        Self {
            command_tx: Some(command_tx),
            worker: Some(worker),
        }
    }

    /// Shortcut for the llama.cpp backend.
    #[cfg(feature = "llama")]
    pub fn llama() -> Self {
        Self::with_backend(crate::backend::llama::LlamaEvaluator::open)
    }

    fn tx(&self) -> Result<&Sender<Command>, SessionError> {
        self.command_tx
            .as_ref()
            .ok_or_else(|| SessionError::Worker("session is shut down".into()))
    }

    /// Requests a model load. Progress and the terminal `Ready`/`Failed`
    /// arrive on the returned receiver.
    pub fn load(&self, config: SessionConfig) -> Result<Receiver<LoadEvent>, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        let (events_tx, events_rx) = mpsc::channel();
        self.tx()?
            .send(Command::Load {
                config,
                events: events_tx,
            })
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        Ok(events_rx)
    }

    /// Releases the evaluator; the session is unusable until reloaded.
    pub fn unload(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx()?
            .send(Command::Unload { done: done_tx })
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        done_rx.recv().map_err(|e| SessionError::Worker(e.to_string()))?
    }

    /// Primes the chat context. Blocks until priming finishes.
    pub fn start_chat(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx()?
            .send(Command::StartChat { done: done_tx })
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        done_rx.recv().map_err(|e| SessionError::Worker(e.to_string()))?
    }

    /// Queues one user turn. Returns a receiver for the streamed response
    /// and a stop flag checked between generation steps.
    ///
    /// The stream is bounded: the worker suspends after each emitted
    /// fragment until the caller keeps up, which is also what makes the stop
    /// flag responsive.
    pub fn send_turn(&self, text: &str) -> Result<(Receiver<StreamToken>, Arc<AtomicBool>), SessionError> {
        let (tokens_tx, tokens_rx) = mpsc::sync_channel(TOKEN_STREAM_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        self.tx()?
            .send(Command::SendTurn {
                text: text.to_string(),
                tokens: tokens_tx,
                stop: stop.clone(),
            })
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        Ok((tokens_rx, stop))
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_main<E, F>(command_rx: Receiver<Command>, mut factory: F)
where
    E: Evaluator + 'static,
    F: FnMut(&SessionConfig, &dyn Fn(f32)) -> Result<E, EvalError> + Send,
{
    let mut state: WorkerState<E> = WorkerState::Unloaded;

    loop {
        let command = match command_rx.recv() {
            Ok(c) => c,
            Err(_) => {
                tracing::debug!("command channel closed, worker exiting");
                break;
            }
        };

        match command {
            Command::Load { config, events } => {
                state = match state {
                    WorkerState::Unloaded => {
                        let progress = |p: f32| {
                            let _ = events.send(LoadEvent::Progress(p));
                        };
                        match factory(&config, &progress) {
                            Ok(eval) => {
                                let n_ctx = eval.context_capacity();
                                tracing::info!(n_ctx, "model loaded");
                                let _ = events.send(LoadEvent::Ready { n_ctx });
                                WorkerState::Loaded { eval, config }
                            }
                            Err(e) => {
                                tracing::error!("model load failed: {e}");
                                let _ = events.send(LoadEvent::Failed(e.to_string()));
                                WorkerState::Unloaded
                            }
                        }
                    }
                    busy => {
                        let _ = events.send(LoadEvent::Failed(SessionError::AlreadyLoaded.to_string()));
                        busy
                    }
                };
            }
            Command::Unload { done } => {
                state = WorkerState::Unloaded;
                tracing::info!("model unloaded");
                let _ = done.send(Ok(()));
            }
            Command::StartChat { done } => {
                state = match state {
                    WorkerState::Loaded { eval, config } => {
                        match ChatEngine::start(eval, config.clone()) {
                            Ok(engine) => {
                                let _ = done.send(Ok(()));
                                WorkerState::Chatting { engine }
                            }
                            Err((eval, e)) => {
                                // priming failed: stay loaded, pre-chat
                                let _ = done.send(Err(e));
                                WorkerState::Loaded { eval, config }
                            }
                        }
                    }
                    WorkerState::Unloaded => {
                        let _ = done.send(Err(SessionError::NotLoaded));
                        WorkerState::Unloaded
                    }
                    chatting @ WorkerState::Chatting { .. } => {
                        let _ = done.send(Err(SessionError::ChatAlreadyStarted));
                        chatting
                    }
                };
            }
            Command::SendTurn { text, tokens, stop } => match &mut state {
                WorkerState::Chatting { engine } => run_turn(engine, &text, &tokens, &stop),
                WorkerState::Loaded { .. } => {
                    let _ = tokens.send(StreamToken::Error(SessionError::ChatNotStarted.to_string()));
                }
                WorkerState::Unloaded => {
                    let _ = tokens.send(StreamToken::Error(SessionError::NotLoaded.to_string()));
                }
            },
            Command::Shutdown => {
                tracing::info!("worker thread shutting down");
                break;
            }
        }
    }
}

/// Drives one turn to completion, streaming reassembled text fragments.
fn run_turn<E: Evaluator>(
    engine: &mut ChatEngine<E>,
    text: &str,
    tx: &SyncSender<StreamToken>,
    stop: &Arc<AtomicBool>,
) {
    if let Err(e) = engine.begin_turn(text) {
        let _ = tx.send(StreamToken::Error(e.to_string()));
        return;
    }

    let mut assembler = Utf8Assembler::new();
    while engine.turn_active() {
        if stop.load(Ordering::Relaxed) {
            tracing::debug!("turn stopped by caller");
            break;
        }
        match engine.step() {
            Ok(Some(id)) => {
                if let Some(fragment) = assembler.push(&engine.piece(id)) {
                    if tx.send(StreamToken::Token(fragment)).is_err() {
                        tracing::debug!("receiver dropped, stopping turn");
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                // tokens already streamed stay valid; the turn just ends here
                let _ = tx.send(StreamToken::Error(e.to_string()));
                return;
            }
        }
    }

    if let Some(rest) = assembler.flush() {
        let _ = tx.send(StreamToken::Token(rest));
    }
    let _ = tx.send(StreamToken::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::testing::{ScriptedEvaluator, EOS};
    use crate::evaluator::Token;

    fn scripted_session(script: Vec<(Token, &'static str)>) -> ChatSession {
        ChatSession::with_backend(move |config: &SessionConfig, progress: &dyn Fn(f32)| {
            progress(0.5);
            progress(1.0);
            let eval = ScriptedEvaluator::with_script(
                config.n_ctx as usize,
                &script.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            );
            for (id, piece) in &script {
                eval.define_piece(*id, piece);
            }
            Ok(eval)
        })
    }

    fn load_ready(session: &ChatSession, config: SessionConfig) -> Vec<LoadEvent> {
        let rx = session.load(config).unwrap();
        let mut events = Vec::new();
        loop {
            let event = rx.recv().unwrap();
            let terminal = matches!(event, LoadEvent::Ready { .. } | LoadEvent::Failed(_));
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn collect_turn(rx: &Receiver<StreamToken>) -> (String, bool) {
        let mut text = String::new();
        loop {
            match rx.recv().unwrap() {
                StreamToken::Token(s) => text.push_str(&s),
                StreamToken::Done => return (text, true),
                StreamToken::Error(_) => return (text, false),
            }
        }
    }

    #[test]
    fn full_chat_flow_streams_response() {
        let session = scripted_session(vec![(200, "Hello"), (201, " world"), (EOS, "")]);
        let events = load_ready(&session, SessionConfig::default());
        assert!(matches!(events.first(), Some(LoadEvent::Progress(_))));
        assert!(matches!(events.last(), Some(LoadEvent::Ready { n_ctx: 512 })));

        session.start_chat().unwrap();
        let (rx, _stop) = session.send_turn("hi there").unwrap();
        let (text, done) = collect_turn(&rx);
        assert!(done);
        assert_eq!(text, "Hello world");
    }

    #[test]
    fn send_turn_before_load_reports_error() {
        let session = scripted_session(vec![]);
        let (rx, _stop) = session.send_turn("hi").unwrap();
        let event = rx.recv().unwrap();
        assert!(event.is_error());
    }

    #[test]
    fn send_turn_before_start_chat_reports_error() {
        let session = scripted_session(vec![]);
        load_ready(&session, SessionConfig::default());
        let (rx, _stop) = session.send_turn("hi").unwrap();
        assert!(rx.recv().unwrap().is_error());
    }

    #[test]
    fn start_chat_requires_load() {
        let session = scripted_session(vec![]);
        assert!(matches!(
            session.start_chat(),
            Err(SessionError::NotLoaded)
        ));
    }

    #[test]
    fn second_load_is_rejected() {
        let session = scripted_session(vec![]);
        load_ready(&session, SessionConfig::default());
        let events = load_ready(&session, SessionConfig::default());
        assert!(matches!(events.last(), Some(LoadEvent::Failed(_))));
    }

    #[test]
    fn second_start_chat_is_rejected() {
        let session = scripted_session(vec![]);
        load_ready(&session, SessionConfig::default());
        session.start_chat().unwrap();
        assert!(matches!(
            session.start_chat(),
            Err(SessionError::ChatAlreadyStarted)
        ));
    }

    #[test]
    fn unload_returns_session_to_unloaded() {
        let session = scripted_session(vec![]);
        load_ready(&session, SessionConfig::default());
        session.start_chat().unwrap();
        session.unload().unwrap();
        assert!(matches!(
            session.start_chat(),
            Err(SessionError::NotLoaded)
        ));
        // and a reload works again
        let events = load_ready(&session, SessionConfig::default());
        assert!(matches!(events.last(), Some(LoadEvent::Ready { .. })));
    }

    #[test]
    fn oversized_preamble_fails_priming_but_stays_loaded() {
        let session = scripted_session(vec![]);
        let config = SessionConfig {
            n_ctx: 8,
            system_prompt: "a b c d e f g h i j".to_string(),
            ..Default::default()
        };
        load_ready(&session, config);
        assert!(matches!(
            session.start_chat(),
            Err(SessionError::PromptTooLong { .. })
        ));
        // still loaded: a short preamble can be primed after an unload/reload
        let (rx, _stop) = session.send_turn("hi").unwrap();
        assert!(rx.recv().unwrap().is_error());
    }

    #[test]
    fn load_failure_leaves_session_unloaded() {
        let session = ChatSession::with_backend(
            |_config: &SessionConfig, _progress: &dyn Fn(f32)| -> Result<ScriptedEvaluator, EvalError> {
                Err(EvalError::Load("bad model file".into()))
            },
        );
        let events = load_ready(&session, SessionConfig::default());
        assert!(matches!(events.last(), Some(LoadEvent::Failed(_))));
        assert!(matches!(
            session.start_chat(),
            Err(SessionError::NotLoaded)
        ));
    }

    #[test]
    fn stop_flag_ends_turn_early() {
        // long script, no EOS: only the stop flag can end the turn early
        let script: Vec<(Token, &'static str)> = (300..1000).map(|id| (id, "x")).collect();
        let session = scripted_session(script);
        let config = SessionConfig {
            n_ctx: 8192,
            n_predict: 700,
            ..Default::default()
        };
        load_ready(&session, config);
        session.start_chat().unwrap();

        let (rx, stop) = session.send_turn("hi").unwrap();
        // stop as soon as the first fragment lands
        let first = rx.recv().unwrap();
        assert!(first.is_token());
        stop.store(true, Ordering::Relaxed);

        let mut fragments = 1usize;
        let mut finished = false;
        for event in rx.iter() {
            match event {
                StreamToken::Token(_) => fragments += 1,
                StreamToken::Done => {
                    finished = true;
                    break;
                }
                StreamToken::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(finished);
        assert!(fragments < 698, "stop flag was never honored");
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let session = scripted_session(vec![]);
        let config = SessionConfig {
            n_batch: 0,
            ..Default::default()
        };
        assert!(matches!(
            session.load(config),
            Err(SessionError::Config(_))
        ));
    }
}
