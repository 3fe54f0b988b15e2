//! Runtime engine for an embeddable, form-driven chat widget.
//!
//! A widget instance executes a branching conversational flow defined by
//! data, swaps its whole configuration mid-session when the document store
//! pushes a new snapshot, and runs a capped, cancellable proactive-message
//! scheduler while the widget sits closed. The builder UI, the document
//! store backend and the host page are all on the far side of the traits in
//! [`store`] and [`lead`].

pub mod flow;
pub mod lead;
pub mod logger;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod theme;
pub mod widget;

pub use flow::{Field, FieldType, FlowConfig, FlowError, FlowOption, ProactivePolicy};
pub use lead::{InMemoryLeadSink, Lead, LeadSink};
pub use scheduler::ProactiveScheduler;
pub use session::{AnswerError, Phase, Session, SessionError, Step, SwapOutcome};
pub use store::{
    ConfigPush, ConfigStore, ConfigSubscription, InMemoryConfigStore, StoreError,
    SubscriptionGuard, WidgetDocument,
};
pub use theme::Theme;
pub use widget::{ChatWidget, EmbedSettings, WidgetUpdate};
