//! Event loop around the [`Watcher`].
//!
//! One task owns the watcher and handles control signals, mutation batches
//! and repeat ticks strictly one after another, so the watcher needs no
//! locking of its own. The page is shared with whoever mutates it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, Settings, SettingsStore};
use crate::dom::{Dom, MutationSource};
use crate::watch::{ControlResponse, Notification, WatchState, Watcher};

/// Signals from the settings surface.
#[derive(Debug, Clone)]
pub enum ControlSignal {
    SettingsUpdated(Settings),
    StopMonitoring,
}

enum Command {
    Control(ControlSignal, oneshot::Sender<ControlResponse>),
    State(oneshot::Sender<WatchState>),
    Shutdown,
}

/// Handle to a running watch loop.
pub struct WatchHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub async fn send(&self, signal: ControlSignal) -> ControlResponse {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Control(signal, reply_tx)).is_err() {
            return not_running();
        }
        reply_rx.await.unwrap_or_else(|_| not_running())
    }

    pub async fn update_settings(&self, settings: Settings) -> ControlResponse {
        self.send(ControlSignal::SettingsUpdated(settings)).await
    }

    pub async fn stop_monitoring(&self) -> ControlResponse {
        self.send(ControlSignal::StopMonitoring).await
    }

    pub async fn state(&self) -> Option<WatchState> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(Command::State(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    /// Stop the loop. Timers are cancelled; the stored monitoring state is
    /// left untouched so the next start resumes where this one was.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            log::error!("[watch] loop ended abnormally: {}", e);
        }
    }
}

fn not_running() -> ControlResponse {
    ControlResponse {
        ok: false,
        status: "Watcher is not running".to_string(),
    }
}

fn lock<D>(dom: &Mutex<D>) -> MutexGuard<'_, D> {
    dom.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Load the stored state, attach to `dom` and start the loop.
///
/// Every notification the watcher emits goes to `outbound`.
pub fn spawn_watch<D>(
    dom: Arc<Mutex<D>>,
    store: Arc<dyn SettingsStore>,
    outbound: mpsc::UnboundedSender<Notification>,
) -> Result<WatchHandle, ConfigError>
where
    D: Dom + MutationSource + Send + 'static,
{
    let stored = store.load()?;

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
    let (mutation_tx, mut mutation_rx) = mpsc::unbounded_channel();
    let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();

    let mut watcher = Watcher::new(mutation_tx, tick_tx, outbound);
    watcher.load(&mut *lock(&dom), &stored);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        Command::Control(signal, reply) => {
                            let response = handle_control(&mut watcher, &dom, store.as_ref(), signal);
                            let _ = reply.send(response);
                        }
                        Command::State(reply) => {
                            let _ = reply.send(watcher.state());
                        }
                        Command::Shutdown => {
                            watcher.stop(&mut *lock(&dom));
                            break;
                        }
                    }
                }
                Some(batch) = mutation_rx.recv() => {
                    let guard = lock(&dom);
                    watcher.handle_mutations(&*guard, &batch);
                }
                Some(session) = tick_rx.recv() => {
                    let guard = lock(&dom);
                    watcher.on_repeat_tick(&*guard, session);
                }
            }
        }
        log::info!("[watch] loop stopped");
    });

    Ok(WatchHandle {
        commands: command_tx,
        task,
    })
}

fn handle_control<D>(
    watcher: &mut Watcher,
    dom: &Mutex<D>,
    store: &dyn SettingsStore,
    signal: ControlSignal,
) -> ControlResponse
where
    D: Dom + MutationSource,
{
    match signal {
        ControlSignal::SettingsUpdated(settings) => {
            let response = watcher.update_settings(&mut *lock(dom), settings);
            if response.ok {
                let saved = watcher.settings().cloned();
                persist(store, &mut |state| {
                    state.settings = saved.clone();
                    state.monitoring_state = true;
                });
            }
            response
        }
        ControlSignal::StopMonitoring => {
            let response = watcher.stop(&mut *lock(dom));
            persist(store, &mut |state| state.monitoring_state = false);
            response
        }
    }
}

fn persist(store: &dyn SettingsStore, f: &mut dyn FnMut(&mut crate::config::StoredState)) {
    if let Err(e) = store.update(f) {
        log::error!("[watch] failed to persist state: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryStore, StoredState};
    use crate::dom::{Document, StyleChannel};
    use std::time::Duration;

    struct Fixture {
        doc: Arc<Mutex<Document>>,
        store: Arc<MemoryStore>,
        handle: WatchHandle,
        outbound: mpsc::UnboundedReceiver<Notification>,
    }

    impl Fixture {
        fn start(stored: StoredState) -> Self {
            let doc = Arc::new(Mutex::new(Document::new("https://example.test/booking")));
            let store = Arc::new(MemoryStore::new(stored));
            let (out_tx, outbound) = mpsc::unbounded_channel();
            let handle = spawn_watch(doc.clone(), store.clone(), out_tx).unwrap();
            Self { doc, store, handle, outbound }
        }

        async fn inject(&self, class: &str, text: &str, background: &str) {
            {
                let mut doc = self.doc.lock().unwrap();
                let div = doc.create_element("div");
                doc.set_attribute(div, "class", class);
                doc.set_style(div, StyleChannel::BackgroundColor, background);
                let t = doc.create_text(text);
                doc.append_child(div, t).unwrap();
                let body = doc.body();
                doc.append_child(body, div).unwrap();
                doc.flush_mutations();
            }
            settle().await;
        }

        fn drain(&mut self) -> usize {
            let mut count = 0;
            while self.outbound.try_recv().is_ok() {
                count += 1;
            }
            count
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn cal_settings() -> Settings {
        Settings::new("DIV.cal", "#14a38b", &["Available"])
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_then_every_four_seconds_until_stop() {
        let mut f = Fixture::start(StoredState::default());
        assert!(f.handle.update_settings(cal_settings()).await.ok);

        f.inject("cal", "Available now", "rgb(20,163,139)").await;
        assert_eq!(f.drain(), 1);
        assert_eq!(f.handle.state().await, Some(WatchState::Matched));

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(f.drain(), 1);
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(f.drain(), 1);

        let response = f.handle.stop_monitoring().await;
        assert_eq!(response.status, "Monitoring stopped");
        assert_eq!(f.handle.state().await, Some(WatchState::Idle));

        tokio::time::sleep(Duration::from_secs(20)).await;
        f.inject("cal", "Available again", "rgb(20,163,139)").await;
        assert_eq!(f.drain(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_update_keeps_running_timer() {
        let mut f = Fixture::start(StoredState::default());
        f.handle.update_settings(cal_settings()).await;
        f.inject("cal", "Available", "#14a38b").await;
        assert_eq!(f.drain(), 1);

        let response = f
            .handle
            .update_settings(Settings::new("span.slot", "#000", &["Open"]))
            .await;
        assert!(response.ok);
        assert_eq!(f.handle.state().await, Some(WatchState::Matched));

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(f.drain(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_color_reports_failure_and_keeps_state() {
        let f = Fixture::start(StoredState::default());
        let response = f
            .handle
            .update_settings(Settings::new("div", "red", &["Available"]))
            .await;
        assert!(!response.ok);
        assert_eq!(response.status, "Invalid targetColor format");
        assert_eq!(f.handle.state().await, Some(WatchState::Idle));
        assert!(!f.store.load().unwrap().monitoring_state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_signals_are_persisted() {
        let f = Fixture::start(StoredState::default());
        f.handle
            .update_settings(Settings::new("DIV.cal", "#14a38b", &["a", "", "b", "c", "d"]))
            .await;
        let stored = f.store.load().unwrap();
        assert!(stored.monitoring_state);
        assert_eq!(stored.settings.unwrap().target_texts, vec!["a", "b", "c"]);

        f.handle.stop_monitoring().await;
        assert!(!f.store.load().unwrap().monitoring_state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_stored_monitoring_state() {
        let stored = StoredState {
            settings: Some(cal_settings()),
            monitoring_state: true,
            last_notification_time: 0,
        };
        let mut f = Fixture::start(stored);
        assert_eq!(f.handle.state().await, Some(WatchState::Armed));

        f.inject("cal", "Available", "#14a38b").await;
        assert_eq!(f.drain(), 1);

        let Fixture { handle, mut outbound, store, .. } = f;
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(outbound.try_recv().is_err());
        // Shutdown is not a user stop.
        assert!(store.load().unwrap().monitoring_state);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_reports_when_loop_is_gone() {
        let f = Fixture::start(StoredState::default());
        let Fixture { handle, .. } = f;
        let commands = handle.commands.clone();
        handle.shutdown().await;

        let probe = WatchHandle {
            commands,
            task: tokio::spawn(async {}),
        };
        assert!(!probe.stop_monitoring().await.ok);
        assert_eq!(probe.state().await, None);
    }
}
