//! Watch module - reacts to page insertions and drives repeat notifications
//!
//! The watcher is a plain state machine. The runtime feeds it mutation
//! batches, control signals and repeat ticks one at a time; it never runs
//! concurrently with itself.

use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};

use crate::config::{Settings, SettingsError, StoredState};
use crate::dom::{Dom, MutationBatch, MutationSink, MutationSource, NodeId, ObserverId};
use crate::matcher::Matcher;
use crate::selector::Selector;

/// Cadence of repeat notifications while a match session is active.
pub const REPEAT_INTERVAL: Duration = Duration::from_millis(4000);

pub const MATCH_MESSAGE: &str = "Match found!";

/// Outbound notification signal, emitted once per tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub details: NotificationDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationDetails {
    pub element: String,
    pub text: String,
    pub url: String,
    pub timestamp: String,
}

impl Notification {
    fn for_element<D: Dom + ?Sized>(dom: &D, node: NodeId) -> Self {
        Self {
            message: MATCH_MESSAGE.to_string(),
            details: NotificationDetails {
                element: dom.tag_name(node).unwrap_or_default().to_string(),
                text: dom.rendered_text(node),
                url: dom.url().to_string(),
                timestamp: chrono::Utc::now()
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            },
        }
    }
}

/// Reply to a control signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub status: String,
}

impl ControlResponse {
    fn ok(status: &str) -> Self {
        Self { ok: true, status: status.to_string() }
    }

    fn failed(status: &str) -> Self {
        Self { ok: false, status: status.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Armed,
    Matched,
}

/// Cancellable repeating tick. Each period it sends its session id.
pub struct RepeatHandle {
    stop_tx: Option<oneshot::Sender<()>>,
}

impl RepeatHandle {
    /// Start ticking. The first tick arrives one full `period` from now.
    pub fn start(period: Duration, session: u64, ticks: mpsc::UnboundedSender<u64>) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut int = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = int.tick() => {
                        if ticks.send(session).is_err() {
                            break;
                        }
                    }
                    _ = &mut stop_rx => {
                        break;
                    }
                }
            }
        });

        Self {
            stop_tx: Some(stop_tx),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_active(&self) -> bool {
        self.stop_tx.is_some()
    }
}

impl Drop for RepeatHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The currently matched element and its repeat timer.
struct MatchSession {
    id: u64,
    element: NodeId,
    timer: RepeatHandle,
}

/// Validated settings ready for matching.
struct Armed {
    settings: Settings,
    selector: Selector,
    matcher: Matcher,
}

impl Armed {
    fn try_new(settings: Settings) -> Result<Self, SettingsError> {
        let (settings, selector) = settings.validate()?;
        let matcher = Matcher::from_settings(&settings)?;
        Ok(Self {
            settings,
            selector,
            matcher,
        })
    }
}

pub struct Watcher {
    armed: Option<Armed>,
    monitoring: bool,
    observer: Option<ObserverId>,
    session: Option<MatchSession>,
    next_session: u64,
    mutations: MutationSink,
    ticks: mpsc::UnboundedSender<u64>,
    outbound: mpsc::UnboundedSender<Notification>,
    repeat_interval: Duration,
}

impl Watcher {
    pub fn new(
        mutations: MutationSink,
        ticks: mpsc::UnboundedSender<u64>,
        outbound: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        Self {
            armed: None,
            monitoring: false,
            observer: None,
            session: None,
            next_session: 1,
            mutations,
            ticks,
            outbound,
            repeat_interval: REPEAT_INTERVAL,
        }
    }

    pub fn state(&self) -> WatchState {
        if self.session.as_ref().is_some_and(|s| s.timer.is_active()) {
            WatchState::Matched
        } else if self.monitoring && self.observer.is_some() {
            WatchState::Armed
        } else {
            WatchState::Idle
        }
    }

    pub fn settings(&self) -> Option<&Settings> {
        self.armed.as_ref().map(|a| &a.settings)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Initialise from persisted state. Arms only when the stored settings are
    /// valid and monitoring was left on.
    pub fn load<D: Dom + MutationSource>(&mut self, dom: &mut D, stored: &StoredState) {
        let Some(settings) = stored.settings.clone() else {
            log::info!("[watch] no settings found");
            return;
        };

        match Armed::try_new(settings) {
            Ok(armed) => {
                log::info!("[watch] settings loaded: {:?}", armed.settings);
                self.armed = Some(armed);
                self.monitoring = stored.monitoring_state;
                if self.monitoring {
                    self.subscribe(dom);
                }
            }
            Err(e) => {
                log::error!("[watch] stored settings rejected: {}", e);
            }
        }
    }

    /// Replace the settings and force monitoring on.
    ///
    /// The mutation subscription is rebuilt; an active match session is left
    /// running. Invalid settings leave everything as it was.
    pub fn update_settings<D: Dom + MutationSource>(
        &mut self,
        dom: &mut D,
        settings: Settings,
    ) -> ControlResponse {
        let armed = match Armed::try_new(settings) {
            Ok(armed) => armed,
            Err(e) => {
                log::error!("[watch] settings update rejected: {}", e);
                return ControlResponse::failed(e.status());
            }
        };

        log::info!("[watch] settings updated: {:?}", armed.settings);
        self.armed = Some(armed);
        self.monitoring = true;
        self.subscribe(dom);
        ControlResponse::ok("Settings updated")
    }

    /// Tear down to idle: drop the subscription and cancel the repeat timer.
    pub fn stop<D: MutationSource>(&mut self, dom: &mut D) -> ControlResponse {
        self.monitoring = false;
        if let Some(observer) = self.observer.take() {
            dom.disconnect(observer);
            log::info!("[watch] mutation observer disconnected");
        }
        if let Some(mut session) = self.session.take() {
            session.timer.cancel();
            log::info!("[watch] notification loop stopped");
        }
        ControlResponse::ok("Monitoring stopped")
    }

    fn subscribe<D: MutationSource>(&mut self, dom: &mut D) {
        if let Some(observer) = self.observer.take() {
            dom.disconnect(observer);
        }
        self.observer = Some(dom.observe(self.mutations.clone()));
        log::info!("[watch] observing the document for target elements");
    }

    /// Handle one batch of insertions.
    pub fn handle_mutations<D: Dom>(&mut self, dom: &D, batch: &MutationBatch) {
        if !self.monitoring || self.observer != Some(batch.observer) {
            return;
        }
        let Some(selector) = self.armed.as_ref().map(|a| a.selector.clone()) else {
            return;
        };

        for record in &batch.records {
            for &node in &record.added_nodes {
                if !dom.is_element(node) {
                    continue;
                }
                if dom.matches(node, &selector) {
                    log::debug!("[watch] target element added: {:?}", dom.tag_name(node));
                    self.check_element(dom, node);
                }
                for nested in dom.query_selector_all(node, &selector) {
                    log::debug!("[watch] nested target element added: {:?}", dom.tag_name(nested));
                    self.check_element(dom, nested);
                }
            }
        }
    }

    /// Check `node`; when it does not match, check its children depth-first.
    /// Returns whether a match was found in the subtree.
    pub fn check_element<D: Dom>(&mut self, dom: &D, node: NodeId) -> bool {
        if !self.monitoring {
            return false;
        }
        let Some(armed) = self.armed.as_ref() else {
            return false;
        };

        let outcome = armed.matcher.matches(dom, node);
        if outcome.is_match() {
            self.begin_session(dom, node);
            return true;
        }
        log::debug!(
            "[watch] conditions not met for {:?}: color={} text={}",
            dom.tag_name(node),
            outcome.color_hit,
            outcome.text_hit
        );

        for child in dom.children(node) {
            if self.check_element(dom, child) {
                return true;
            }
        }
        false
    }

    fn begin_session<D: Dom>(&mut self, dom: &D, node: NodeId) {
        if self.session.is_some() {
            log::debug!("[watch] notification loop is already active");
            return;
        }

        log::info!("[watch] match found with both conditions, starting notification loop");
        self.emit(dom, node);

        let id = self.next_session;
        self.next_session += 1;
        self.session = Some(MatchSession {
            id,
            element: node,
            timer: RepeatHandle::start(self.repeat_interval, id, self.ticks.clone()),
        });
    }

    /// Repeat tick for `session`. Ticks from a cancelled session are ignored.
    pub fn on_repeat_tick<D: Dom>(&mut self, dom: &D, session: u64) {
        if !self.monitoring {
            return;
        }
        let Some(element) = self
            .session
            .as_ref()
            .filter(|s| s.id == session)
            .map(|s| s.element)
        else {
            return;
        };
        self.emit(dom, element);
    }

    fn emit<D: Dom>(&self, dom: &D, node: NodeId) {
        let notification = Notification::for_element(dom, node);
        log::info!(
            "[watch] sending notification for {} at {}",
            notification.details.element,
            notification.details.url
        );
        if self.outbound.send(notification).is_err() {
            log::warn!("[watch] notification receiver is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{Document, StyleChannel};

    struct Harness {
        doc: Document,
        watcher: Watcher,
        mutations: mpsc::UnboundedReceiver<MutationBatch>,
        ticks: mpsc::UnboundedReceiver<u64>,
        outbound: mpsc::UnboundedReceiver<Notification>,
    }

    impl Harness {
        fn new() -> Self {
            let (mutation_tx, mutations) = mpsc::unbounded_channel();
            let (tick_tx, ticks) = mpsc::unbounded_channel();
            let (out_tx, outbound) = mpsc::unbounded_channel();
            Self {
                doc: Document::new("https://example.test/booking"),
                watcher: Watcher::new(mutation_tx, tick_tx, out_tx),
                mutations,
                ticks,
                outbound,
            }
        }

        fn add_cell(&mut self, class: &str, text: &str, background: &str) -> NodeId {
            let div = self.doc.create_element("div");
            self.doc.set_attribute(div, "class", class);
            self.doc.set_style(div, StyleChannel::BackgroundColor, background);
            let t = self.doc.create_text(text);
            self.doc.append_child(div, t).unwrap();
            self.doc.append_child(self.doc.body(), div).unwrap();
            div
        }

        fn deliver(&mut self) {
            self.doc.flush_mutations();
            while let Ok(batch) = self.mutations.try_recv() {
                self.watcher.handle_mutations(&self.doc, &batch);
            }
        }

        fn sent(&mut self) -> Vec<Notification> {
            let mut out = Vec::new();
            while let Ok(n) = self.outbound.try_recv() {
                out.push(n);
            }
            out
        }
    }

    fn cal_settings() -> Settings {
        Settings::new("DIV.cal", "#14a38b", &["Available"])
    }

    #[tokio::test]
    async fn test_match_emits_immediately_once() {
        let mut h = Harness::new();
        let response = h.watcher.update_settings(&mut h.doc, cal_settings());
        assert!(response.ok);
        assert_eq!(h.watcher.state(), WatchState::Armed);

        h.add_cell("cal", "Available now", "rgb(20,163,139)");
        h.add_cell("cal", "Available later", "rgb(20,163,139)");
        h.deliver();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, "Match found!");
        assert_eq!(sent[0].details.element, "DIV");
        assert_eq!(sent[0].details.text, "Available now");
        assert_eq!(sent[0].details.url, "https://example.test/booking");
        assert_eq!(h.watcher.state(), WatchState::Matched);
    }

    #[tokio::test]
    async fn test_signal_payload_keys() {
        let mut h = Harness::new();
        let response = h.watcher.update_settings(&mut h.doc, cal_settings());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"ok": true, "status": "Settings updated"})
        );

        h.add_cell("cal", "Available", "#14a38b");
        h.deliver();
        let value = serde_json::to_value(&h.sent()[0]).unwrap();
        assert_eq!(value["message"], "Match found!");
        assert_eq!(value["details"]["element"], "DIV");
        assert_eq!(value["details"]["text"], "Available");
        assert_eq!(value["details"]["url"], "https://example.test/booking");
        assert!(value["details"]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn test_non_matching_elements_ignored() {
        let mut h = Harness::new();
        h.watcher.update_settings(&mut h.doc, cal_settings());

        h.add_cell("cal", "Fully booked", "rgb(20,163,139)");
        h.add_cell("cal", "Available", "rgb(200,0,0)");
        h.add_cell("other", "Available", "rgb(20,163,139)");
        h.deliver();

        assert!(h.sent().is_empty());
        assert_eq!(h.watcher.state(), WatchState::Armed);
    }

    #[tokio::test]
    async fn test_nested_target_found_inside_added_container() {
        let mut h = Harness::new();
        h.watcher.update_settings(&mut h.doc, cal_settings());

        let wrapper = h.doc.create_element("section");
        let cal = h.doc.create_element("div");
        h.doc.set_attribute(cal, "class", "cal");
        let day = h.doc.create_element("button");
        h.doc.set_style(day, StyleChannel::BackgroundColor, "#14a38b");
        let label = h.doc.create_text("Available");
        h.doc.append_child(day, label).unwrap();
        h.doc.append_child(cal, day).unwrap();
        h.doc.append_child(wrapper, cal).unwrap();
        h.doc.append_child(h.doc.body(), wrapper).unwrap();
        h.deliver();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].details.element, "DIV");
    }

    #[tokio::test]
    async fn test_check_element_walks_children_without_match() {
        let mut h = Harness::new();
        h.watcher
            .update_settings(&mut h.doc, Settings::new("ul", "#14a38b", &["Available"]));

        let list = h.doc.create_element("ul");
        for (text, color) in [("Booked", "#14a38b"), ("Available", "#ff0000")] {
            let item = h.doc.create_element("li");
            h.doc.set_style(item, StyleChannel::BackgroundColor, color);
            let t = h.doc.create_text(text);
            h.doc.append_child(item, t).unwrap();
            h.doc.append_child(list, item).unwrap();
        }

        // The list carries both the text and the color, but never on a single
        // item; the list itself still matches as a whole.
        assert!(h.watcher.check_element(&h.doc, list));
        assert_eq!(h.sent()[0].details.element, "UL");

        let mut h = Harness::new();
        h.watcher
            .update_settings(&mut h.doc, Settings::new("ul", "#14a38b", &["Open"]));
        let list = h.doc.create_element("ul");
        let item = h.doc.create_element("li");
        let t = h.doc.create_text("Closed");
        h.doc.append_child(item, t).unwrap();
        h.doc.append_child(list, item).unwrap();

        assert!(!h.watcher.check_element(&h.doc, list));
        assert!(h.sent().is_empty());
        assert_eq!(h.watcher.state(), WatchState::Armed);
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_prior_state() {
        let mut h = Harness::new();
        let response = h.watcher.update_settings(&mut h.doc, Settings::new("div", "red", &["x"]));
        assert_eq!(
            response,
            ControlResponse { ok: false, status: "Invalid targetColor format".to_string() }
        );
        assert!(!h.watcher.is_monitoring());
        assert_eq!(h.watcher.state(), WatchState::Idle);
        assert_eq!(h.doc.observer_count(), 0);

        h.watcher.update_settings(&mut h.doc, cal_settings());
        let response = h.watcher.update_settings(&mut h.doc, Settings::new("div", "red", &["x"]));
        assert!(!response.ok);
        assert_eq!(h.watcher.state(), WatchState::Armed);
        assert_eq!(h.watcher.settings().unwrap().selector, "DIV.cal");
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_observer() {
        let mut h = Harness::new();
        h.watcher.update_settings(&mut h.doc, cal_settings());
        h.watcher.update_settings(&mut h.doc, cal_settings());
        assert_eq!(h.doc.observer_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_disconnects_and_silences() {
        let mut h = Harness::new();
        h.watcher.update_settings(&mut h.doc, cal_settings());
        h.add_cell("cal", "Available", "#14a38b");
        h.deliver();
        assert_eq!(h.sent().len(), 1);

        let response = h.watcher.stop(&mut h.doc);
        assert_eq!(response.status, "Monitoring stopped");
        assert_eq!(h.watcher.state(), WatchState::Idle);
        assert_eq!(h.doc.observer_count(), 0);

        h.add_cell("cal", "Available", "#14a38b");
        h.deliver();
        h.watcher.on_repeat_tick(&h.doc, 1);
        assert!(h.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_ticks_target_same_element() {
        let mut h = Harness::new();
        h.watcher.update_settings(&mut h.doc, cal_settings());
        h.add_cell("cal", "Available", "#14a38b");
        h.deliver();
        assert_eq!(h.sent().len(), 1);

        tokio::time::sleep(REPEAT_INTERVAL + Duration::from_millis(10)).await;
        let session = h.ticks.try_recv().unwrap();

        // A later match does not move the session.
        h.add_cell("cal", "Available again", "#14a38b");
        h.deliver();
        assert!(h.sent().is_empty());

        h.watcher.on_repeat_tick(&h.doc, session);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].details.text, "Available");

        // Stale session ids are dropped.
        h.watcher.on_repeat_tick(&h.doc, session + 1);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_load_respects_monitoring_state() {
        let mut h = Harness::new();
        let stored = StoredState {
            settings: Some(cal_settings()),
            monitoring_state: false,
            last_notification_time: 0,
        };
        h.watcher.load(&mut h.doc, &stored);
        assert_eq!(h.watcher.state(), WatchState::Idle);
        assert!(h.watcher.settings().is_some());

        let mut h = Harness::new();
        let stored = StoredState { monitoring_state: true, ..stored };
        h.watcher.load(&mut h.doc, &stored);
        assert_eq!(h.watcher.state(), WatchState::Armed);

        let mut h = Harness::new();
        let stored = StoredState {
            settings: Some(Settings::new("div", "#12", &["x"])),
            ..stored
        };
        h.watcher.load(&mut h.doc, &stored);
        assert_eq!(h.watcher.state(), WatchState::Idle);
        assert!(h.watcher.settings().is_none());
    }
}
