// Affinity context - single-consumer dispatcher for render calls
//
// Background workers never touch the UI collaborator directly: they queue
// render calls on a cloneable AffinityHandle and one consumer task applies
// them, in order, to the RenderSink. This models a single logical UI thread
// the way a main-dispatcher/queue pair would.

use tokio::sync::{mpsc, oneshot};

/// The external UI collaborator. Everything outbound goes through these four
/// calls, always on the affinity context.
pub trait RenderSink: Send + 'static {
    fn render_text(&mut self, view_id: &str, text: &str);
    fn render_progress(&mut self, percent: u8);
    fn notify_user(&mut self, message: &str);
    fn set_button_label(&mut self, label: &str);
}

enum RenderCall {
    Text { view_id: String, text: String },
    Progress(u8),
    Notify(String),
    ButtonLabel(String),
    Flush(oneshot::Sender<()>),
}

/// Cheap cloneable sender half of the affinity context. Calls are applied in
/// the order a given sender queued them.
#[derive(Clone)]
pub struct AffinityHandle {
    tx: mpsc::UnboundedSender<RenderCall>,
}

impl AffinityHandle {
    /// Spawn the consumer task that owns the sink and apply calls until every
    /// handle is dropped.
    pub fn spawn<S: RenderSink>(mut sink: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                match call {
                    RenderCall::Text { view_id, text } => sink.render_text(&view_id, &text),
                    RenderCall::Progress(percent) => sink.render_progress(percent),
                    RenderCall::Notify(message) => sink.notify_user(&message),
                    RenderCall::ButtonLabel(label) => sink.set_button_label(&label),
                    RenderCall::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::debug!("Affinity dispatcher stopped");
        });
        Self { tx }
    }

    pub fn render_text(&self, view_id: &str, text: &str) {
        self.send(RenderCall::Text {
            view_id: view_id.to_string(),
            text: text.to_string(),
        });
    }

    pub fn render_progress(&self, percent: u8) {
        self.send(RenderCall::Progress(percent));
    }

    pub fn notify_user(&self, message: &str) {
        self.send(RenderCall::Notify(message.to_string()));
    }

    pub fn set_button_label(&self, label: &str) {
        self.send(RenderCall::ButtonLabel(label.to_string()));
    }

    /// Resolves once every call queued on this handle before it has been
    /// applied to the sink.
    pub async fn flushed(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(RenderCall::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn send(&self, call: RenderCall) {
        if self.tx.send(call).is_err() {
            log::warn!("Render call dropped: affinity dispatcher is gone");
        }
    }
}
