//! End-to-end turn flow through the orchestrator, with typed capture and
//! scripted generation/synthesis doubles.

use async_trait::async_trait;
use parley_voice::turn::{STATUS_ERROR, STATUS_NO_REPLY};
use parley_voice::{
    CaptureProvider, ChatBackend, ChatParams, DisplayEntry, OrchestratorConfig, OrchestratorHandle, Playback,
    Role, SessionView, SynthesisCallbacks, SynthesisProvider, Turn, TurnState, TypedCapture, VoiceError,
    VoiceOrchestrator, VoiceResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

type Reply = VoiceResult<Vec<&'static str>>;

#[derive(Default)]
struct ScriptedChat {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<ChatParams>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedChat {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    fn gated(replies: Vec<Reply>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(replies)
        }
    }

    fn calls(&self) -> Vec<ChatParams> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn chat_stream(
        &self,
        params: ChatParams,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> VoiceResult<String> {
        self.calls.lock().unwrap().push(params);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        let mut full = String::new();
        for chunk in reply? {
            on_chunk(chunk);
            full.push_str(chunk);
        }
        Ok(full)
    }

    async fn is_available(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct FakeSynthesis {
    callbacks: Mutex<SynthesisCallbacks>,
    spoken: Mutex<Vec<String>>,
    current: Mutex<Option<CancellationToken>>,
    cancels: AtomicUsize,
    /// Keep "playing" until cancelled.
    hold: bool,
    fail: bool,
}

impl FakeSynthesis {
    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SynthesisProvider for FakeSynthesis {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_supported(&self) -> bool {
        true
    }

    fn set_callbacks(&self, callbacks: SynthesisCallbacks) {
        *self.callbacks.lock().unwrap() = callbacks;
    }

    async fn speak(&self, text: &str) -> VoiceResult<Playback> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(VoiceError::Decode("TTS server returned invalid audio: garbage".into()));
        }
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = Some(token.clone());
        let callbacks = self.callbacks.lock().unwrap().clone();

        if let Some(on_start) = &callbacks.on_start {
            on_start();
        }
        let played = if self.hold {
            token.cancelled().await;
            false
        } else {
            tokio::select! {
                _ = token.cancelled() => false,
                _ = tokio::time::sleep(Duration::from_millis(10)) => true,
            }
        };
        if !played {
            return Ok(Playback::Cancelled);
        }
        if let Some(on_end) = &callbacks.on_end {
            on_end();
        }
        Ok(Playback::Completed)
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.current.lock().unwrap().take() {
            token.cancel();
        }
    }
}

struct Harness {
    handle: OrchestratorHandle,
    view: watch::Receiver<SessionView>,
    typed: Arc<TypedCapture>,
    chat: Arc<ScriptedChat>,
    synth: Arc<FakeSynthesis>,
}

fn start(chat: ScriptedChat, synth: FakeSynthesis) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let typed = Arc::new(TypedCapture::new());
    let chat = Arc::new(chat);
    let synth = Arc::new(synth);
    let config = OrchestratorConfig {
        system_prompt: "sys".to_string(),
        ..Default::default()
    };
    let (orchestrator, handle) =
        VoiceOrchestrator::new(config, typed.clone(), chat.clone(), synth.clone());
    orchestrator.spawn();

    Harness {
        view: handle.subscribe(),
        handle,
        typed,
        chat,
        synth,
    }
}

async fn wait_until(
    view: &mut watch::Receiver<SessionView>,
    pred: impl FnMut(&SessionView) -> bool,
) -> SessionView {
    let seen = timeout(Duration::from_secs(5), view.wait_for(pred))
        .await
        .expect("timed out waiting for view")
        .expect("orchestrator stopped");
    seen.clone()
}

impl Harness {
    /// Toggle on, say `text`, toggle off.
    async fn say(&mut self, text: &str) {
        self.handle.toggle();
        wait_until(&mut self.view, |v| v.state == TurnState::Listening).await;
        assert!(self.typed.feed(text));
        self.handle.toggle();
    }
}

#[tokio::test]
async fn hello_round_trip() {
    let mut h = start(
        ScriptedChat::new(vec![Ok(vec!["Hi", " there"])]),
        FakeSynthesis::default(),
    );

    h.say("hello").await;
    let view = wait_until(&mut h.view, |v| v.state == TurnState::Idle && v.messages.len() == 2).await;

    assert_eq!(
        view.messages,
        vec![
            DisplayEntry::new(Role::User, "hello"),
            DisplayEntry::new(Role::Assistant, "Hi there"),
        ]
    );
    assert!(view.error.is_none());
    assert!(!view.playing_audio);
    assert_eq!(h.synth.spoken(), vec!["Hi there"]);

    let calls = h.chat.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].messages, vec![Turn::system("sys"), Turn::user("hello")]);
}

#[tokio::test]
async fn second_turn_sends_full_history() {
    let mut h = start(
        ScriptedChat::new(vec![Ok(vec!["one"]), Ok(vec!["two"])]),
        FakeSynthesis::default(),
    );

    h.say("first").await;
    wait_until(&mut h.view, |v| v.state == TurnState::Idle && v.messages.len() == 2).await;
    h.say("second").await;
    wait_until(&mut h.view, |v| v.state == TurnState::Idle && v.messages.len() == 4).await;

    let calls = h.chat.calls();
    assert_eq!(
        calls[1].messages,
        vec![
            Turn::system("sys"),
            Turn::user("first"),
            Turn::assistant("one"),
            Turn::user("second"),
        ]
    );
}

#[tokio::test]
async fn stop_without_speech_does_not_generate() {
    let mut h = start(ScriptedChat::default(), FakeSynthesis::default());

    h.handle.toggle();
    wait_until(&mut h.view, |v| v.state == TurnState::Listening).await;
    assert!(h.typed.feed_interim("uh"));
    h.handle.toggle();

    let view = wait_until(&mut h.view, |v| v.state == TurnState::Idle).await;
    assert!(view.messages.is_empty());
    assert!(view.interim.is_empty());
    assert!(h.chat.calls().is_empty());
}

#[tokio::test]
async fn empty_reply_skips_synthesis() {
    let mut h = start(ScriptedChat::new(vec![Ok(vec!["  "])]), FakeSynthesis::default());

    h.say("hello").await;
    let view = wait_until(&mut h.view, |v| v.status == STATUS_NO_REPLY).await;

    assert_eq!(view.state, TurnState::Idle);
    assert_eq!(view.messages, vec![DisplayEntry::new(Role::User, "hello")]);
    assert!(h.synth.spoken().is_empty());
}

#[tokio::test]
async fn reset_while_speaking_stops_playback() {
    let mut h = start(
        ScriptedChat::new(vec![Ok(vec!["a long answer"]), Ok(vec!["again?"])]),
        FakeSynthesis {
            hold: true,
            ..Default::default()
        },
    );

    h.say("hello").await;
    wait_until(&mut h.view, |v| v.playing_audio).await;

    h.handle.new_conversation();
    let view = wait_until(&mut h.view, |v| v.messages.is_empty()).await;

    assert_eq!(view.state, TurnState::Idle);
    assert!(!view.playing_audio);
    assert!(h.synth.cancels.load(Ordering::SeqCst) >= 1);

    // The conversation really is back to the system turn only.
    h.say("again").await;
    wait_until(&mut h.view, |v| v.state == TurnState::Speaking).await;
    assert_eq!(
        h.chat.calls().last().unwrap().messages,
        vec![Turn::system("sys"), Turn::user("again")]
    );
}

#[tokio::test]
async fn toggles_while_thinking_are_ignored() {
    let gate = Arc::new(Notify::new());
    let mut h = start(
        ScriptedChat::gated(vec![Ok(vec!["ok"])], gate.clone()),
        FakeSynthesis::default(),
    );

    h.say("hello").await;
    wait_until(&mut h.view, |v| v.state == TurnState::Thinking).await;

    h.handle.toggle();
    h.handle.toggle();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.snapshot().state, TurnState::Thinking);
    assert!(!h.typed.is_listening());

    gate.notify_one();
    let view = wait_until(&mut h.view, |v| v.state == TurnState::Idle).await;
    assert_eq!(view.messages.len(), 2);
    assert_eq!(h.chat.calls().len(), 1);
}

#[tokio::test]
async fn stale_generation_is_discarded_after_reset() {
    let gate = Arc::new(Notify::new());
    let mut h = start(
        ScriptedChat::gated(vec![Ok(vec!["stale", " reply"])], gate.clone()),
        FakeSynthesis::default(),
    );

    h.say("hello").await;
    wait_until(&mut h.view, |v| v.state == TurnState::Thinking).await;
    h.handle.new_conversation();
    wait_until(&mut h.view, |v| v.state == TurnState::Idle && v.messages.is_empty()).await;

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let view = h.handle.snapshot();
    assert_eq!(view.state, TurnState::Idle);
    assert!(view.messages.is_empty());
    assert!(h.synth.spoken().is_empty());
}

#[tokio::test]
async fn generation_failure_is_shown_and_recoverable() {
    let mut h = start(
        ScriptedChat::new(vec![
            Err(VoiceError::status(500, "Ollama error 500: model crashed")),
            Ok(vec!["fine now"]),
        ]),
        FakeSynthesis::default(),
    );

    h.say("hello").await;
    let view = wait_until(&mut h.view, |v| v.error.is_some()).await;
    assert_eq!(view.error.as_deref(), Some("Ollama error 500: model crashed"));
    assert_eq!(view.status, STATUS_ERROR);
    assert_eq!(view.messages, vec![DisplayEntry::new(Role::User, "hello")]);

    h.say("retry").await;
    let view = wait_until(&mut h.view, |v| v.state == TurnState::Idle && v.messages.len() == 3).await;
    assert!(view.error.is_none());
}

#[tokio::test]
async fn synthesis_failure_keeps_the_reply() {
    let mut h = start(
        ScriptedChat::new(vec![Ok(vec!["hello back"])]),
        FakeSynthesis {
            fail: true,
            ..Default::default()
        },
    );

    h.say("hello").await;
    let view = wait_until(&mut h.view, |v| v.error.is_some()).await;
    assert_eq!(view.state, TurnState::Idle);
    assert_eq!(view.messages.last().unwrap(), &DisplayEntry::new(Role::Assistant, "hello back"));
}

#[tokio::test]
async fn shutdown_cancels_playback() {
    let mut h = start(
        ScriptedChat::new(vec![Ok(vec!["bye"])]),
        FakeSynthesis {
            hold: true,
            ..Default::default()
        },
    );

    h.say("hello").await;
    wait_until(&mut h.view, |v| v.playing_audio).await;
    h.handle.shutdown();

    timeout(Duration::from_secs(5), h.view.changed())
        .await
        .expect("timed out waiting for shutdown")
        .expect_err("view sender should close on shutdown");
    assert!(h.synth.cancels.load(Ordering::SeqCst) >= 1);
}
