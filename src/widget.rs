use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    flow::{Field, FlowOption},
    lead::{Lead, LeadSink},
    scheduler::{NudgeHandler, ProactiveScheduler},
    session::{AnswerError, Phase, Session, SessionError, Step, SwapOutcome},
    store::{ConfigStore, SubscriptionGuard, WidgetDocument},
};

/// Host-page bootstrap settings: the only configuration the embed snippet
/// has to provide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedSettings {
    pub url: String,
    pub chatbot_id: String,
}

/// Everything the rendering layer reacts to, in emit order.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetUpdate {
    Opened,
    Closed,
    /// Welcome copy from the flow.
    Bot(String),
    /// The option list to present.
    Options(Vec<FlowOption>),
    /// Ask the visitor for this field.
    Prompt(Field),
    /// A scripted nudge fired while the widget sat closed.
    Proactive(String),
    /// The last answer did not pass; re-ask the same field.
    Rejected { field: Field, reason: AnswerError },
    /// The conversation finished.
    Completed {
        end_message: String,
        show_end_screen: bool,
    },
    /// A new document was applied; `document()` has the fresh snapshot.
    ConfigChanged,
}

struct WidgetState {
    document: Arc<WidgetDocument>,
    session: Session,
    open: bool,
    subscription: Option<SubscriptionGuard>,
    pump: Option<JoinHandle<()>>,
}

struct WidgetShared {
    chatbot_id: String,
    events: broadcast::Sender<WidgetUpdate>,
    state: Mutex<WidgetState>,
    scheduler: ProactiveScheduler,
    sink: Arc<dyn LeadSink>,
    destroyed: AtomicBool,
}

/// The embedded widget instance: owns the session, the proactive scheduler
/// and the live config subscription, and is the only surface the host page
/// talks to.
///
/// Handles are cheap clones of one instance. `destroy()` releases the
/// subscription and every timer synchronously; a destroyed instance ignores
/// everything else.
#[derive(Clone)]
pub struct ChatWidget {
    shared: Arc<WidgetShared>,
}

impl ChatWidget {
    /// Mount an instance for `settings.chatbot_id`. The caller-supplied
    /// document is the config source of truth until the store's first
    /// snapshot arrives; the store silently wins from that moment on. A
    /// store that cannot be subscribed leaves the default in place for the
    /// lifetime of the instance.
    pub async fn mount(
        settings: &EmbedSettings,
        default_document: WidgetDocument,
        store: Arc<dyn ConfigStore>,
        sink: Arc<dyn LeadSink>,
    ) -> ChatWidget {
        let (events, _) = broadcast::channel(64);

        let on_fire: NudgeHandler = {
            let events = events.clone();
            Arc::new(move |message: String| {
                let _ = events.send(WidgetUpdate::Proactive(message));
            })
        };
        let scheduler =
            ProactiveScheduler::new(default_document.flow.proactive.clone(), on_fire);

        let shared = Arc::new(WidgetShared {
            chatbot_id: settings.chatbot_id.clone(),
            events,
            state: Mutex::new(WidgetState {
                document: Arc::new(default_document),
                session: Session::new(),
                open: false,
                subscription: None,
                pump: None,
            }),
            scheduler,
            sink,
            destroyed: AtomicBool::new(false),
        });

        match store.subscribe(&settings.chatbot_id).await {
            Ok(subscription) => {
                let (mut rx, guard) = subscription.into_parts();
                let pump_shared = shared.clone();
                let pump = tokio::spawn(async move {
                    while let Some(push) = rx.recv().await {
                        match push {
                            Ok(document) => apply_document(&pump_shared, document),
                            Err(e) => {
                                warn!(error = %e, "config push failed; keeping current config")
                            }
                        }
                    }
                    debug!("config subscription stream ended");
                });
                let mut state = shared.state.lock().unwrap();
                state.subscription = Some(guard);
                state.pump = Some(pump);
            }
            Err(e) => {
                warn!(error = %e, "config unavailable; staying on caller-supplied default");
            }
        }

        // the widget mounts closed, so proactive nudges may start
        shared.scheduler.arm();
        info!(chatbot_id = %settings.chatbot_id, "widget mounted");
        ChatWidget { shared }
    }

    /// Listen for UI-facing updates. Subscribe before driving the widget;
    /// a receiver only sees events sent after it exists.
    pub fn subscribe(&self) -> broadcast::Receiver<WidgetUpdate> {
        self.shared.events.subscribe()
    }

    /// Open the widget. Engaging permanently ends the proactive phase for
    /// this instance. Idempotent.
    pub fn open(&self) {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.shared.scheduler.engage();

        let mut state = self.shared.state.lock().unwrap();
        if state.open {
            return;
        }
        state.open = true;
        state.session.open();

        let document = state.document.clone();
        let flow = &document.flow;
        self.emit(WidgetUpdate::Opened);
        match state.session.phase() {
            Phase::CollectingField { .. } => {
                // reopened mid-flow: put the visitor back on the same field
                if let Some(field) = state.session.current_field(flow) {
                    self.emit(WidgetUpdate::Prompt(field.clone()));
                }
            }
            _ => {
                self.emit(WidgetUpdate::Bot(flow.welcome_message.clone()));
                self.emit(WidgetUpdate::Options(flow.options.clone()));
            }
        }
    }

    /// Close the widget. Proactive messaging does not come back; it is a
    /// before-first-engagement feature only. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if !state.open {
            return;
        }
        state.open = false;
        self.emit(WidgetUpdate::Closed);
    }

    /// Visitor picked a top-level option.
    pub fn choose_option(&self, option_id: &str) -> Result<(), SessionError> {
        let mut state = self.lock_open()?;
        let document = state.document.clone();
        let step = state.session.choose_option(&document.flow, option_id)?;
        drop(state);
        self.handle_step(step, &document);
        Ok(())
    }

    /// Visitor answered the current field prompt.
    pub fn submit_answer(&self, raw: &str) -> Result<(), SessionError> {
        let mut state = self.lock_open()?;
        let document = state.document.clone();
        let step = state.session.submit_answer(&document.flow, raw)?;
        drop(state);
        self.handle_step(step, &document);
        Ok(())
    }

    /// Tear the instance down: release the store subscription, stop the
    /// config pump and abort any armed proactive timer, all before this
    /// returns. Safe to call any number of times.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (guard, pump) = {
            let mut state = self.shared.state.lock().unwrap();
            state.open = false;
            (state.subscription.take(), state.pump.take())
        };
        if let Some(guard) = guard {
            guard.cancel();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.shared.scheduler.shutdown();
        info!(chatbot_id = %self.shared.chatbot_id, "widget destroyed");
    }

    /// Snapshot of the active document.
    pub fn document(&self) -> Arc<WidgetDocument> {
        self.shared.state.lock().unwrap().document.clone()
    }

    /// Snapshot of the session position.
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().unwrap().session.phase().clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().open
    }

    pub fn chatbot_id(&self) -> &str {
        &self.shared.chatbot_id
    }

    pub fn proactive_fired(&self) -> u32 {
        self.shared.scheduler.fired_count()
    }

    fn lock_open(&self) -> Result<std::sync::MutexGuard<'_, WidgetState>, SessionError> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::NotOpen);
        }
        let state = self.shared.state.lock().unwrap();
        if !state.open {
            return Err(SessionError::NotOpen);
        }
        Ok(state)
    }

    fn handle_step(&self, step: Step, document: &WidgetDocument) {
        match step {
            Step::Prompt(field) => self.emit(WidgetUpdate::Prompt(field)),
            Step::Rejected { field, reason } => {
                self.emit(WidgetUpdate::Rejected { field, reason })
            }
            Step::Done { option_id, answers } => {
                self.emit(WidgetUpdate::Completed {
                    end_message: document.flow.end_message.clone(),
                    show_end_screen: document.flow.show_end_screen,
                });
                let lead = Lead::new(self.shared.chatbot_id.clone(), option_id, answers);
                let sink = self.shared.sink.clone();
                tokio::spawn(async move {
                    if let Err(e) = sink.create(lead).await {
                        // visitor-facing success is not gated on this write
                        error!(error = %e, "failed to persist completed interaction");
                    }
                });
            }
        }
    }

    fn emit(&self, update: WidgetUpdate) {
        let _ = self.shared.events.send(update);
    }
}

impl std::fmt::Debug for ChatWidget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatWidget")
            .field("chatbot_id", &self.shared.chatbot_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Apply one pushed document to a live instance: validate, swap the session
/// position over by id, hand the new policy to the scheduler.
fn apply_document(shared: &WidgetShared, document: WidgetDocument) {
    if let Err(e) = document.flow.validate() {
        warn!(error = %e, "rejecting invalid pushed config; keeping last good one");
        return;
    }

    let (outcome, open, options, completed) = {
        let mut state = shared.state.lock().unwrap();
        let outcome = state.session.apply_config(&document.flow);
        state.document = Arc::new(document);
        let flow = &state.document.flow;
        shared.scheduler.update_policy(flow.proactive.clone());
        (
            outcome,
            state.open,
            flow.options.clone(),
            (flow.end_message.clone(), flow.show_end_screen),
        )
    };

    let _ = shared.events.send(WidgetUpdate::ConfigChanged);
    match outcome {
        SwapOutcome::FellBack if open => {
            // selection no longer exists; put the visitor back on the list
            let _ = shared.events.send(WidgetUpdate::Options(options));
        }
        SwapOutcome::Clamped if open => {
            let (end_message, show_end_screen) = completed;
            let _ = shared.events.send(WidgetUpdate::Completed {
                end_message,
                show_end_screen,
            });
        }
        _ => {}
    }
}
