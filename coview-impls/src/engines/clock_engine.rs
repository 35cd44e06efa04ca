use std::time::Duration;

use async_trait::async_trait;
use coview_core::{
    EngineError, EngineEvent, EngineEventSender, Introspect, PlaybackEngine, SourceKind,
};
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};

/// A playback engine without any media, driven purely by the clock.
///
/// It keeps a position that advances while playing and fires the same events
/// a real player would, which makes it suitable for simulations and tests.
pub struct ClockEngine {
    events: EngineEventSender,
    state: Mutex<ClockState>,
    /// How long a source takes to become ready after loading
    load_delay: Duration,
    /// How fast the clock runs relative to real time, used to simulate drift
    rate: f64,
    failing: AtomicCell<bool>,
    stats: ClockStats,
}

struct ClockState {
    source: Option<LoadedSource>,
    /// The position at `anchored_at`
    anchor: f64,
    anchored_at: Instant,
    paused: bool,
}

struct LoadedSource {
    url: String,
    kind: SourceKind,
    ready_at: Instant,
}

#[derive(Default)]
struct ClockStats {
    loads: AtomicCell<usize>,
    plays: AtomicCell<usize>,
    pauses: AtomicCell<usize>,
    seeks: AtomicCell<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClockEngineIntrospection {
    pub source: Option<String>,
    pub kind: Option<SourceKind>,
    pub position: f64,
    pub paused: bool,
    pub loads: usize,
    pub plays: usize,
    pub pauses: usize,
    pub seeks: usize,
}

impl ClockEngine {
    pub fn new(events: EngineEventSender) -> Self {
        Self {
            events,
            state: Mutex::new(ClockState {
                source: None,
                anchor: 0.,
                anchored_at: Instant::now(),
                paused: true,
            }),
            load_delay: Duration::from_millis(200),
            rate: 1.0,
            failing: false.into(),
            stats: Default::default(),
        }
    }

    /// Sets how long loading a source takes.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Makes the clock run faster or slower than real time.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    /// Makes every following load fail, like a player that cannot initialize.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing);
    }

    fn emit(&self, event: EngineEvent) {
        // Nobody listening just means the client detached
        let _ = self.events.send(event);
    }
}

impl ClockState {
    fn position(&self, rate: f64) -> f64 {
        if self.paused {
            return self.anchor;
        }

        let elapsed = Instant::now() - self.anchored_at;
        self.anchor + elapsed.as_secs_f64() * rate
    }

    fn reanchor(&mut self, position: f64) {
        self.anchor = position;
        self.anchored_at = Instant::now();
    }
}

#[async_trait]
impl PlaybackEngine for ClockEngine {
    async fn load(&self, url: &str, kind: SourceKind) -> Result<(), EngineError> {
        self.stats.loads.fetch_add(1);

        if self.failing.load() {
            return Err(EngineError::LoadFailed {
                url: url.to_string(),
                reason: "engine is in a failing state".to_string(),
            });
        }

        let ready_at = Instant::now() + self.load_delay;

        {
            let mut state = self.state.lock();

            state.source = Some(LoadedSource {
                url: url.to_string(),
                kind,
                ready_at,
            });
            state.paused = true;
            state.reanchor(0.);
        }

        info!("Loading {} as {}", url, kind.mime());

        let events = self.events.clone();
        tokio::spawn(async move {
            sleep_until(ready_at).await;
            let _ = events.send(EngineEvent::Ready);
        });

        Ok(())
    }

    async fn ready(&self) -> Result<(), EngineError> {
        let ready_at = self
            .state
            .lock()
            .source
            .as_ref()
            .map(|s| s.ready_at)
            .ok_or(EngineError::NoSource)?;

        sleep_until(ready_at).await;
        Ok(())
    }

    fn play(&self) {
        self.stats.plays.fetch_add(1);

        let started = {
            let mut state = self.state.lock();

            if state.source.is_none() || !state.paused {
                false
            } else {
                let position = state.position(self.rate);
                state.reanchor(position);
                state.paused = false;
                true
            }
        };

        if started {
            self.emit(EngineEvent::Play);
        }
    }

    fn pause(&self) {
        self.stats.pauses.fetch_add(1);

        let stopped = {
            let mut state = self.state.lock();

            if state.paused {
                false
            } else {
                let position = state.position(self.rate);
                state.reanchor(position);
                state.paused = true;
                true
            }
        };

        if stopped {
            self.emit(EngineEvent::Pause);
        }
    }

    fn seek(&self, position: f64) {
        self.stats.seeks.fetch_add(1);
        debug!("Seeking to {:.2}s", position);

        self.emit(EngineEvent::Seeking);
        self.state.lock().reanchor(position.max(0.));
        self.emit(EngineEvent::Seeked);
    }

    fn current_time(&self) -> f64 {
        self.state.lock().position(self.rate)
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn source(&self) -> Option<String> {
        self.state.lock().source.as_ref().map(|s| s.url.clone())
    }
}

impl Introspect<ClockEngineIntrospection> for ClockEngine {
    fn introspect(&self) -> ClockEngineIntrospection {
        let state = self.state.lock();

        ClockEngineIntrospection {
            source: state.source.as_ref().map(|s| s.url.clone()),
            kind: state.source.as_ref().map(|s| s.kind),
            position: state.position(self.rate),
            paused: state.paused,
            loads: self.stats.loads.load(),
            plays: self.stats.plays.load(),
            pauses: self.stats.pauses.load(),
            seeks: self.stats.seeks.load(),
        }
    }
}
