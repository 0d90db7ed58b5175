//! Single-use challenge token acquisition.
//!
//! The anti-abuse widget is driven through [`ChallengeWidget`], whose only
//! asynchronous output is a callback carrying a token. Requests wait on a
//! single-slot mailbox: one generation-tagged `oneshot` sender. The widget
//! callback and the timeout (or a dropped request) each clear the slot, and
//! only the first of them finds it filled.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const TOKEN_TIMEOUT: Duration = Duration::from_millis(8000);
/// Mount gives up after this many polls (30 s at the default interval).
pub const DEFAULT_MOUNT_ATTEMPTS: usize = 100;
/// Token sent by development builds, which skip the widget entirely.
pub const LOCAL_TOKEN: &str = "local";

pub type TokenCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Opaque handle returned by the widget on render.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WidgetId(pub String);

/// The third-party widget API as exposed by the host environment.
pub trait ChallengeWidget: Send + Sync {
    /// Create an invisible widget; `callback` receives every solved token.
    fn render(&self, callback: TokenCallback) -> WidgetId;
    /// Current unused response, if the widget already holds one.
    fn get_response(&self, id: &WidgetId) -> Option<String>;
    /// Start a fresh challenge.
    fn execute(&self, id: &WidgetId);
    /// Discard the current response so the next turn needs a new one.
    fn reset(&self, id: &WidgetId);
}

/// Source of the widget API; absent until the vendor script has loaded.
pub trait WidgetHost: Send + Sync {
    fn widget_api(&self) -> Option<Arc<dyn ChallengeWidget>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Uninitialized,
    WidgetRendering,
    WidgetReady,
    TokenPending,
    TokenAvailable,
    TornDown,
}

/// Anything that can hand the chat client a token for one turn.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `None` means verification is unavailable for this turn.
    async fn acquire_token(&self) -> Option<String>;

    /// Called after every turn; tokens are single-use.
    fn reset(&self) {}
}

/// A fixed token, for terminal clients and development servers.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn acquire_token(&self) -> Option<String> {
        Some(self.0.clone()).filter(|t| !t.is_empty())
    }
}

struct Shared {
    state: TokenState,
    widget: Option<(Arc<dyn ChallengeWidget>, WidgetId)>,
    generation: u64,
    slot: Option<(u64, oneshot::Sender<String>)>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the mailbox for its own generation when a request stops waiting.
struct PendingGuard<'a> {
    shared: &'a Mutex<Shared>,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut s = lock(self.shared);
        if s.slot.as_ref().is_some_and(|(g, _)| *g == self.generation) {
            s.slot = None;
            if s.state == TokenState::TokenPending {
                s.state = TokenState::WidgetReady;
            }
        }
    }
}

pub struct TokenSource {
    shared: Arc<Mutex<Shared>>,
    timeout: Duration,
    poll_interval: Duration,
    local: bool,
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource {
    pub fn new() -> Self {
        Self::with_timing(POLL_INTERVAL, TOKEN_TIMEOUT)
    }

    pub fn with_timing(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: TokenState::Uninitialized,
                widget: None,
                generation: 0,
                slot: None,
            })),
            timeout,
            poll_interval,
            local: false,
        }
    }

    /// Development source: no widget, always [`LOCAL_TOKEN`].
    pub fn local() -> Self {
        Self {
            local: true,
            ..Self::new()
        }
    }

    pub fn state(&self) -> TokenState {
        lock(&self.shared).state
    }

    /// Poll `host` at a fixed interval until the widget API appears, then
    /// render the widget once. Returns `false` if the API never appeared
    /// within `max_attempts` polls or the source was torn down meanwhile.
    pub async fn mount(&self, host: &dyn WidgetHost, max_attempts: usize) -> bool {
        if self.local {
            return true;
        }
        for attempt in 0..max_attempts {
            {
                let s = lock(&self.shared);
                match s.state {
                    TokenState::TornDown => return false,
                    TokenState::Uninitialized => {}
                    _ => return true,
                }
            }

            if let Some(api) = host.widget_api() {
                lock(&self.shared).state = TokenState::WidgetRendering;
                let id = api.render(self.callback());
                let mut s = lock(&self.shared);
                if s.state == TokenState::TornDown {
                    return false;
                }
                info!(widget = %id.0, attempt, "challenge widget ready");
                s.widget = Some((api, id));
                s.state = TokenState::WidgetReady;
                return true;
            }

            debug!(attempt, "challenge widget api not loaded yet");
            tokio::time::sleep(self.poll_interval).await;
        }
        warn!(max_attempts, "challenge widget api never became available");
        false
    }

    fn callback(&self) -> TokenCallback {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |token: String| {
            let sender = {
                let mut s = lock(&shared);
                if s.state != TokenState::TornDown {
                    s.state = TokenState::TokenAvailable;
                }
                s.slot.take()
            };
            match sender {
                Some((_, tx)) => {
                    let _ = tx.send(token);
                }
                None => debug!("challenge token arrived with no pending request"),
            }
        })
    }

    /// Acquire a token for one turn. Returns `None` when no widget is ready,
    /// when another request is already pending, or after the timeout.
    pub async fn acquire(&self) -> Option<String> {
        if self.local {
            return Some(LOCAL_TOKEN.to_string());
        }

        let (widget, id) = {
            let s = lock(&self.shared);
            match &s.widget {
                Some((w, id)) => (Arc::clone(w), id.clone()),
                None => {
                    warn!("token requested before the challenge widget was ready");
                    return None;
                }
            }
        };

        if let Some(existing) = widget.get_response(&id).filter(|t| !t.is_empty()) {
            lock(&self.shared).state = TokenState::TokenAvailable;
            return Some(existing);
        }

        let (tx, rx) = oneshot::channel();
        let generation = {
            let mut s = lock(&self.shared);
            if s.slot.is_some() {
                warn!("token request already pending; serialize turns");
                return None;
            }
            s.generation += 1;
            let generation = s.generation;
            s.slot = Some((generation, tx));
            s.state = TokenState::TokenPending;
            generation
        };
        let _guard = PendingGuard {
            shared: &self.shared,
            generation,
        };

        widget.execute(&id);

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(token)) if !token.is_empty() => Some(token),
            Ok(Ok(_)) => None,
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "challenge token timed out");
                None
            }
        }
    }

    /// Reset the widget so the next turn requires a fresh token.
    pub fn reset_widget(&self) {
        let widget = {
            let mut s = lock(&self.shared);
            if matches!(s.state, TokenState::TokenAvailable | TokenState::TokenPending) {
                s.state = TokenState::WidgetReady;
            }
            s.widget.clone()
        };
        if let Some((w, id)) = widget {
            w.reset(&id);
        }
    }

    /// Drop the widget handle and any pending request.
    pub fn teardown(&self) {
        let mut s = lock(&self.shared);
        s.state = TokenState::TornDown;
        s.widget = None;
        s.slot = None;
    }
}

#[async_trait]
impl TokenProvider for TokenSource {
    async fn acquire_token(&self) -> Option<String> {
        self.acquire().await
    }

    fn reset(&self) {
        self.reset_widget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeWidget {
        callback: Mutex<Option<TokenCallback>>,
        cached: Mutex<Option<String>>,
        /// Token delivered from a spawned task after `delay` on execute.
        answer: Option<(String, Duration)>,
        renders: AtomicUsize,
        executes: AtomicUsize,
        resets: AtomicUsize,
    }

    impl FakeWidget {
        fn answering(token: &str, delay: Duration) -> Self {
            Self {
                answer: Some((token.to_string(), delay)),
                ..Default::default()
            }
        }

        fn fire(&self, token: &str) {
            let cb = self.callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb(token.to_string());
            }
        }
    }

    impl ChallengeWidget for FakeWidget {
        fn render(&self, callback: TokenCallback) -> WidgetId {
            self.renders.fetch_add(1, Ordering::SeqCst);
            *self.callback.lock().unwrap() = Some(callback);
            WidgetId("widget-1".into())
        }

        fn get_response(&self, _id: &WidgetId) -> Option<String> {
            self.cached.lock().unwrap().clone()
        }

        fn execute(&self, _id: &WidgetId) {
            self.executes.fetch_add(1, Ordering::SeqCst);
            if let Some((token, delay)) = self.answer.clone() {
                let cb = self.callback.lock().unwrap().clone();
                if let Some(cb) = cb {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        cb(token);
                    });
                }
            }
        }

        fn reset(&self, _id: &WidgetId) {
            self.resets.fetch_add(1, Ordering::SeqCst);
            *self.cached.lock().unwrap() = None;
        }
    }

    struct FakeHost {
        widget: Arc<FakeWidget>,
        available_after: usize,
        polls: AtomicUsize,
    }

    impl FakeHost {
        fn new(widget: Arc<FakeWidget>, available_after: usize) -> Self {
            Self {
                widget,
                available_after,
                polls: AtomicUsize::new(0),
            }
        }
    }

    impl WidgetHost for FakeHost {
        fn widget_api(&self) -> Option<Arc<dyn ChallengeWidget>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n >= self.available_after {
                Some(self.widget.clone() as Arc<dyn ChallengeWidget>)
            } else {
                None
            }
        }
    }

    async fn mounted(widget: Arc<FakeWidget>) -> TokenSource {
        let source = TokenSource::new();
        assert!(source.mount(&FakeHost::new(widget, 0), 1).await);
        source
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_polls_until_api_available() {
        let widget = Arc::new(FakeWidget::default());
        let host = FakeHost::new(widget.clone(), 3);
        let source = TokenSource::new();
        assert_eq!(source.state(), TokenState::Uninitialized);

        let start = tokio::time::Instant::now();
        assert!(source.mount(&host, DEFAULT_MOUNT_ATTEMPTS).await);
        assert!(start.elapsed() >= POLL_INTERVAL * 3);
        assert_eq!(host.polls.load(Ordering::SeqCst), 4);
        assert_eq!(widget.renders.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), TokenState::WidgetReady);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_is_bounded() {
        let host = FakeHost::new(Arc::new(FakeWidget::default()), usize::MAX);
        let source = TokenSource::new();
        assert!(!source.mount(&host, 5).await);
        assert_eq!(host.polls.load(Ordering::SeqCst), 5);
        assert_eq!(source.state(), TokenState::Uninitialized);
    }

    #[tokio::test]
    async fn test_mount_twice_renders_once() {
        let widget = Arc::new(FakeWidget::default());
        let source = mounted(widget.clone()).await;
        assert!(source.mount(&FakeHost::new(widget.clone(), 0), 1).await);
        assert_eq!(widget.renders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_before_mount_is_empty() {
        assert_eq!(TokenSource::new().acquire().await, None);
    }

    #[tokio::test]
    async fn test_acquire_uses_cached_response() {
        let widget = Arc::new(FakeWidget::default());
        *widget.cached.lock().unwrap() = Some("cached-token".into());
        let source = mounted(widget.clone()).await;
        assert_eq!(source.acquire().await.as_deref(), Some("cached-token"));
        assert_eq!(widget.executes.load(Ordering::SeqCst), 0);
        assert_eq!(source.state(), TokenState::TokenAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_executes_and_waits_for_callback() {
        let widget = Arc::new(FakeWidget::answering("fresh", Duration::from_millis(250)));
        let source = mounted(widget.clone()).await;
        assert_eq!(source.acquire().await.as_deref(), Some("fresh"));
        assert_eq!(widget.executes.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), TokenState::TokenAvailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_and_clears_slot() {
        let widget = Arc::new(FakeWidget::default());
        let source = mounted(widget.clone()).await;

        let start = tokio::time::Instant::now();
        assert_eq!(source.acquire().await, None);
        assert!(start.elapsed() >= TOKEN_TIMEOUT);
        assert_eq!(source.state(), TokenState::WidgetReady);

        // A late callback finds nothing pending.
        widget.fire("late");

        // The slot is free again, so a new request executes a new challenge.
        assert_eq!(source.acquire().await, None);
        assert_eq!(widget.executes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_request_does_not_execute_twice() {
        let widget = Arc::new(FakeWidget::answering("only", Duration::from_millis(500)));
        let source = mounted(widget.clone()).await;

        let (first, second) = tokio::join!(source.acquire(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            source.acquire().await
        });
        assert_eq!(first.as_deref(), Some("only"));
        assert_eq!(second, None);
        assert_eq!(widget.executes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_frees_slot() {
        let widget = Arc::new(FakeWidget::default());
        let source = mounted(widget.clone()).await;

        let _ = tokio::time::timeout(Duration::from_millis(100), source.acquire()).await;
        assert_eq!(source.state(), TokenState::WidgetReady);

        *widget.cached.lock().unwrap() = Some("next".into());
        assert_eq!(source.acquire().await.as_deref(), Some("next"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_resolves_pending_request() {
        let widget = Arc::new(FakeWidget::default());
        let source = mounted(widget.clone()).await;

        let (token, _) = tokio::join!(source.acquire(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            source.teardown();
        });
        assert_eq!(token, None);
        assert_eq!(source.state(), TokenState::TornDown);
        assert_eq!(source.acquire().await, None);
    }

    #[tokio::test]
    async fn test_reset_widget_after_turn() {
        let widget = Arc::new(FakeWidget::default());
        *widget.cached.lock().unwrap() = Some("used".into());
        let source = mounted(widget.clone()).await;
        assert!(source.acquire().await.is_some());

        TokenProvider::reset(&source);
        assert_eq!(widget.resets.load(Ordering::SeqCst), 1);
        assert_eq!(source.state(), TokenState::WidgetReady);
        assert!(widget.cached.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_source_always_local() {
        let source = TokenSource::local();
        assert_eq!(source.acquire_token().await.as_deref(), Some(LOCAL_TOKEN));
        let host = FakeHost::new(Arc::new(FakeWidget::default()), usize::MAX);
        assert!(source.mount(&host, 1).await);
        assert_eq!(host.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_static_token_provider() {
        assert_eq!(StaticToken("abc".into()).acquire_token().await.as_deref(), Some("abc"));
        assert_eq!(StaticToken(String::new()).acquire_token().await, None);
    }
}
