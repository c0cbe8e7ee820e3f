use super::*;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ErrorKind;

/// Session recording granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum SessionRecordLevel {
    /// Disable recording.
    Off,
    /// Record connection and command events only.
    KeyEventsOnly,
    /// Also record every connection state transition.
    #[default]
    Full,
}

/// A single recorded session event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Options for normalizing JSONL recordings into stable fixtures.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Keep state-changed events.
    pub keep_state_changed: bool,
    /// Keep connection-closed events.
    pub keep_connection_closed: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_state_changed: false,
            keep_connection_closed: true,
        }
    }
}

/// Supported recorded event types.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    ConnectionEstablished {
        target: String,
        transport: TransportKind,
    },
    ConnectionFailed {
        target: String,
        transport: TransportKind,
        error: String,
        #[serde(default = "connection_kind")]
        error_kind: ErrorKind,
    },
    ConnectionClosed {
        reason: String,
    },
    CommandOutput {
        request: Request,
        success: bool,
        /// Raw output on success, the error message otherwise.
        content: String,
        #[serde(default)]
        error_kind: Option<ErrorKind>,
    },
    StateChanged {
        state: ConnectionState,
    },
}

fn connection_kind() -> ErrorKind {
    ErrorKind::Connection
}

/// In-memory session recorder.
///
/// Clones share one event buffer, so a recorder handed to a
/// [`RecordingTransport`] can still be exported by its creator.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

impl SessionRecorder {
    /// Create a recorder with the given level.
    pub fn new(level: SessionRecordLevel) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current recording level.
    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Record a key-level event.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), WrtError> {
        if self.level == SessionRecordLevel::Off {
            return Ok(());
        }
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| WrtError::InternalServerError(format!("record lock error: {e}")))?;
        guard.push(SessionRecordEntry {
            ts_ms: now_ms(),
            event,
        });
        Ok(())
    }

    /// Record a connection state transition when recording at full level.
    pub fn record_state(&self, state: ConnectionState) -> Result<(), WrtError> {
        if self.level != SessionRecordLevel::Full {
            return Ok(());
        }
        self.record_event(SessionEvent::StateChanged { state })
    }

    /// Snapshot all records.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, WrtError> {
        let guard = self
            .entries
            .lock()
            .map_err(|e| WrtError::InternalServerError(format!("record lock error: {e}")))?;
        Ok(guard.clone())
    }

    /// Clears all recorded events.
    pub fn clear(&self) -> Result<(), WrtError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| WrtError::InternalServerError(format!("record lock error: {e}")))?;
        guard.clear();
        Ok(())
    }

    /// Export records as JSONL.
    pub fn to_jsonl(&self) -> Result<String, WrtError> {
        let entries = self.entries()?;
        let mut lines = Vec::with_capacity(entries.len());
        for entry in entries {
            let line = serde_json::to_string(&entry).map_err(|e| {
                WrtError::InternalServerError(format!("record encode error: {e}"))
            })?;
            lines.push(line);
        }
        Ok(lines.join("\n"))
    }

    /// Restore recorder from JSONL lines.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, WrtError> {
        let recorder = Self::new(SessionRecordLevel::Full);
        if jsonl.trim().is_empty() {
            return Ok(recorder);
        }

        let mut parsed = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionRecordEntry = serde_json::from_str(line).map_err(|e| {
                WrtError::InternalServerError(format!("record decode error: {e}"))
            })?;
            parsed.push(entry);
        }

        let mut guard = recorder
            .entries
            .lock()
            .map_err(|e| WrtError::InternalServerError(format!("record lock error: {e}")))?;
        *guard = parsed;
        drop(guard);

        Ok(recorder)
    }

    /// Normalize JSONL recording content into a stable fixture representation.
    ///
    /// Sorts events by timestamp (stable for equal stamps) and drops the
    /// event types `options` excludes.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, WrtError> {
        let recorder = Self::from_jsonl(jsonl)?;
        let mut indexed = recorder
            .entries()?
            .into_iter()
            .enumerate()
            .collect::<Vec<(usize, SessionRecordEntry)>>();

        indexed
            .sort_by(|(idx_a, a), (idx_b, b)| a.ts_ms.cmp(&b.ts_ms).then_with(|| idx_a.cmp(idx_b)));

        let filtered = indexed
            .into_iter()
            .filter_map(|(_, entry)| match &entry.event {
                SessionEvent::StateChanged { .. } if !options.keep_state_changed => None,
                SessionEvent::ConnectionClosed { .. } if !options.keep_connection_closed => None,
                _ => Some(entry),
            })
            .collect::<Vec<_>>();

        let normalized = SessionRecorder {
            level: SessionRecordLevel::Full,
            entries: Arc::new(Mutex::new(filtered)),
        };
        normalized.to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::Full)
    }
}

/// Wraps a transport and records its connection and command events.
pub struct RecordingTransport {
    inner: Box<dyn Transport>,
    recorder: SessionRecorder,
    last_state: ConnectionState,
}

impl RecordingTransport {
    pub fn new(inner: Box<dyn Transport>, recorder: SessionRecorder) -> Self {
        let last_state = inner.state();
        Self {
            inner,
            recorder,
            last_state,
        }
    }

    pub fn recorder(&self) -> &SessionRecorder {
        &self.recorder
    }

    fn note_state(&mut self) {
        let state = self.inner.state();
        if state != self.last_state {
            self.last_state = state;
            if let Err(e) = self.recorder.record_state(state) {
                debug!("{} failed to record state change: {}", self.inner.target(), e);
            }
        }
    }

    fn record(&self, event: SessionEvent) {
        if let Err(e) = self.recorder.record_event(event) {
            debug!("{} failed to record event: {}", self.inner.target(), e);
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    fn target(&self) -> &str {
        self.inner.target()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn connect(&mut self) -> Result<(), WrtError> {
        let result = self.inner.connect().await;
        let target = self.inner.target().to_string();
        let transport = self.inner.kind();
        match &result {
            Ok(()) => self.record(SessionEvent::ConnectionEstablished { target, transport }),
            Err(e) => self.record(SessionEvent::ConnectionFailed {
                target,
                transport,
                error: e.to_string(),
                error_kind: e.kind(),
            }),
        }
        self.note_state();
        result
    }

    async fn run(&mut self, request: &Request) -> Result<String, WrtError> {
        let result = self.inner.run(request).await;
        let event = match &result {
            Ok(output) => SessionEvent::CommandOutput {
                request: request.clone(),
                success: true,
                content: output.clone(),
                error_kind: None,
            },
            Err(e) => SessionEvent::CommandOutput {
                request: request.clone(),
                success: false,
                content: e.to_string(),
                error_kind: Some(e.kind()),
            },
        };
        self.record(event);
        self.note_state();
        result
    }

    async fn disconnect(&mut self) -> Result<(), WrtError> {
        let result = self.inner.disconnect().await;
        self.record(SessionEvent::ConnectionClosed {
            reason: "disconnect requested".to_string(),
        });
        self.note_state();
        result
    }
}

/// Offline transport that serves outputs from a recorded session.
///
/// Requests are matched in recording order. With [`ReplayTransport::rewinding`]
/// the recording starts over once exhausted, so one recorded cycle can
/// answer any number of polls.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    entries: Vec<SessionRecordEntry>,
    cursor: usize,
    target: String,
    kind: TransportKind,
    state: ConnectionState,
    rewind: bool,
}

impl ReplayTransport {
    /// Build a replayer from a recorder snapshot.
    pub fn from_recorder(recorder: &SessionRecorder) -> Result<Self, WrtError> {
        let entries = recorder.entries()?;
        let (target, kind) = entries
            .iter()
            .find_map(|entry| match &entry.event {
                SessionEvent::ConnectionEstablished { target, transport }
                | SessionEvent::ConnectionFailed {
                    target, transport, ..
                } => Some((target.clone(), *transport)),
                _ => None,
            })
            .ok_or_else(|| {
                WrtError::ReplayMismatchError("recording has no connection event".to_string())
            })?;
        Ok(Self {
            entries,
            cursor: 0,
            target,
            kind,
            state: ConnectionState::Disconnected,
            rewind: false,
        })
    }

    /// Build a replayer from JSONL recording data.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, WrtError> {
        let recorder = SessionRecorder::from_jsonl(jsonl)?;
        Self::from_recorder(&recorder)
    }

    /// Starts over from the first event once the recording is exhausted.
    pub fn rewinding(mut self) -> Self {
        self.rewind = true;
        self
    }

    /// Finds the next event at or after the cursor accepted by `matches`,
    /// wrapping once when rewinding.
    fn advance_to(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> Option<SessionEvent> {
        let passes = if self.rewind { 2 } else { 1 };
        for _ in 0..passes {
            while self.cursor < self.entries.len() {
                let entry = &self.entries[self.cursor];
                self.cursor += 1;
                if matches(&entry.event) {
                    return Some(entry.event.clone());
                }
            }
            self.cursor = 0;
        }
        self.cursor = self.entries.len();
        None
    }
}

fn replayed_error(kind: Option<ErrorKind>, message: String) -> WrtError {
    match kind {
        Some(ErrorKind::Connection) => WrtError::ConnectionError(message),
        Some(ErrorKind::Parse) => WrtError::ParseError(message),
        _ => WrtError::CommandError(message),
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), WrtError> {
        self.state = ConnectionState::Connecting;
        let event = self.advance_to(|event| {
            matches!(
                event,
                SessionEvent::ConnectionEstablished { .. } | SessionEvent::ConnectionFailed { .. }
            )
        });
        match event {
            Some(SessionEvent::ConnectionEstablished { .. }) => {
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Some(SessionEvent::ConnectionFailed {
                error, error_kind, ..
            }) => {
                self.state = ConnectionState::Failed;
                Err(replayed_error(Some(error_kind), error))
            }
            _ => {
                self.state = ConnectionState::Failed;
                Err(WrtError::ReplayMismatchError(format!(
                    "no recorded connection left for {}",
                    self.target
                )))
            }
        }
    }

    async fn run(&mut self, request: &Request) -> Result<String, WrtError> {
        if !self.state.is_connected() {
            return Err(WrtError::NotConnected);
        }
        let event = self.advance_to(|event| {
            matches!(event, SessionEvent::CommandOutput { request: recorded, .. } if recorded == request)
        });
        match event {
            Some(SessionEvent::CommandOutput {
                success: true,
                content,
                ..
            }) => Ok(content),
            Some(SessionEvent::CommandOutput {
                content,
                error_kind,
                ..
            }) => {
                self.state = ConnectionState::Failed;
                Err(replayed_error(error_kind, content))
            }
            _ => Err(WrtError::ReplayMismatchError(format!(
                "no replayable output found for {request}"
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<(), WrtError> {
        self.state = ConnectionState::Disconnected;
        Ok(())
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
