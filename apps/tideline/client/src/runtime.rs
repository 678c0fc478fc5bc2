use std::collections::{HashMap, HashSet, VecDeque};

use tideline_core::{Arguments, SignalMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What a [`ClientRuntime::call`] did with the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The signal id was already processed; nothing ran.
    Duplicate,
    /// Local handlers ran and the call was written to the live connection.
    Sent,
    /// Local handlers ran and the call waits for the next connection.
    Buffered,
    /// A server echo: local handlers ran, nothing was sent back.
    Local,
    /// The call could not be encoded.
    Dropped,
}

/// Handed to local handlers so they can queue follow-up calls. The calls run
/// after every handler of the current signal has returned.
#[derive(Debug, Default)]
pub struct CallScope {
    follow_ups: Vec<(String, Arguments)>,
}

impl CallScope {
    pub fn call(&mut self, signal: impl Into<String>, arguments: Arguments) {
        self.follow_ups.push((signal.into(), arguments));
    }
}

type LocalHandler = Box<dyn FnMut(&mut CallScope, &Arguments)>;

/// Connection-independent client state: local handlers, the dedup set and
/// the pending buffer. Owned by one task; no method blocks.
pub struct ClientRuntime {
    state: ConnectionState,
    handlers: HashMap<String, Vec<LocalHandler>>,
    seen: HashSet<String>,
    pending: VecDeque<String>,
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl Default for ClientRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRuntime {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            handlers: HashMap::new(),
            seen: HashSet::new(),
            pending: VecDeque::new(),
            sink: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Registers a local handler. Handlers of a signal run in registration
    /// order.
    pub fn connect<F>(&mut self, signal: impl Into<String>, handler: F)
    where
        F: FnMut(&mut CallScope, &Arguments) + 'static,
    {
        self.handlers
            .entry(signal.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Runs the local handlers of `signal` and, for calls without a signal
    /// id, forwards the call to the server. A signal id seen before makes
    /// the call a no-op.
    pub fn call(
        &mut self,
        signal: &str,
        arguments: Arguments,
        signal_id: Option<&str>,
    ) -> CallOutcome {
        if let Some(id) = signal_id {
            if !self.seen.insert(id.to_string()) {
                debug!(signal, signal_id = id, "duplicate signal id ignored");
                return CallOutcome::Duplicate;
            }
        }

        self.run_handlers(signal, &arguments);

        if signal_id.is_some() {
            return CallOutcome::Local;
        }
        match SignalMessage::new(signal, arguments).encode() {
            Ok(frame) => self.send_or_buffer(frame),
            Err(err) => {
                warn!(signal, error = %err, "failed to encode outbound call");
                CallOutcome::Dropped
            }
        }
    }

    /// Handles a text frame from the server. Frames are never forwarded
    /// back, with or without a signal id.
    pub fn receive(&mut self, frame: &str) -> Option<CallOutcome> {
        let message = match SignalMessage::decode(frame) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "ignoring frame without a signal");
                return None;
            }
        };
        if let Some(id) = message.signal_id.as_deref() {
            if !self.seen.insert(id.to_string()) {
                debug!(signal = %message.signal, signal_id = id, "duplicate signal id ignored");
                return Some(CallOutcome::Duplicate);
            }
        }
        self.run_handlers(&message.signal, &message.opts);
        Some(CallOutcome::Local)
    }

    pub fn begin_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Attaches the outbound side of a fresh connection and flushes the
    /// buffer in order. Returns how many buffered calls were handed over.
    pub fn on_connected(&mut self, sink: mpsc::UnboundedSender<String>) -> usize {
        self.state = ConnectionState::Connected;
        self.sink = Some(sink);
        let mut flushed = 0usize;
        while let Some(frame) = self.pending.pop_front() {
            if let Err(err) = self.write(frame) {
                self.pending.push_front(err);
                self.on_disconnected();
                break;
            }
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "flushed buffered calls");
        }
        flushed
    }

    /// Puts frames that were handed to a connection but never written back
    /// at the front of the buffer, ahead of anything buffered since.
    pub fn requeue_unsent(&mut self, frames: Vec<String>) -> usize {
        let count = frames.len();
        for frame in frames.into_iter().rev() {
            self.pending.push_front(frame);
        }
        if count > 0 {
            debug!(count, "requeued unsent calls");
        }
        count
    }

    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.sink = None;
    }

    fn send_or_buffer(&mut self, frame: String) -> CallOutcome {
        if self.state != ConnectionState::Connected {
            self.pending.push_back(frame);
            return CallOutcome::Buffered;
        }
        match self.write(frame) {
            Ok(()) => CallOutcome::Sent,
            Err(frame) => {
                self.pending.push_back(frame);
                self.on_disconnected();
                CallOutcome::Buffered
            }
        }
    }

    /// Hands the frame to the connection, giving it back when the
    /// connection is gone.
    fn write(&self, frame: String) -> Result<(), String> {
        match &self.sink {
            Some(sink) => sink.send(frame).map_err(|err| err.0),
            None => Err(frame),
        }
    }

    fn run_handlers(&mut self, signal: &str, arguments: &Arguments) {
        let mut scope = CallScope::default();
        if let Some(handlers) = self.handlers.get_mut(signal) {
            for handler in handlers.iter_mut() {
                handler(&mut scope, arguments);
            }
        }
        for (signal, arguments) in scope.follow_ups {
            self.call(&signal, arguments, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use serde_json::json;
    use tideline_core::args;

    fn recorder(runtime: &mut ClientRuntime, signal: &str) -> Rc<RefCell<Vec<Arguments>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        runtime.connect(signal, move |_, arguments| sink.borrow_mut().push(arguments.clone()));
        seen
    }

    fn decode(frame: &str) -> SignalMessage {
        SignalMessage::decode(frame).unwrap()
    }

    #[test]
    fn calls_buffer_until_connected_and_flush_in_order() {
        let mut runtime = ClientRuntime::new();
        assert_eq!(runtime.call("a", args(json!({"n": 1})), None), CallOutcome::Buffered);
        assert_eq!(runtime.call("b", args(json!({"n": 2})), None), CallOutcome::Buffered);
        assert_eq!(runtime.pending_len(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.begin_connecting();
        assert_eq!(runtime.call("c", args(json!({})), None), CallOutcome::Buffered);
        assert_eq!(runtime.on_connected(tx), 3);
        assert_eq!(runtime.pending_len(), 0);

        let order: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|frame| decode(&frame).signal)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);

        assert_eq!(runtime.call("d", args(json!({})), None), CallOutcome::Sent);
        assert_eq!(decode(&rx.try_recv().unwrap()).signal, "d");
    }

    #[test]
    fn sent_frames_carry_no_signal_id() {
        let mut runtime = ClientRuntime::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.on_connected(tx);
        runtime.call("a", args(json!({"x": true})), None);
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(frame, json!({"signal": "a", "opts": {"x": true}}));
    }

    #[test]
    fn local_handlers_run_in_order_before_sending() {
        let mut runtime = ClientRuntime::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for label in ["first", "second"] {
            let order = order.clone();
            runtime.connect("s", move |_, _| order.borrow_mut().push(label));
        }
        runtime.call("s", args(json!({})), None);
        assert_eq!(*order.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn signal_ids_are_processed_once() {
        let mut runtime = ClientRuntime::new();
        let seen = recorder(&mut runtime, "s");
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.on_connected(tx);

        assert_eq!(runtime.call("s", args(json!({})), Some("id-1")), CallOutcome::Local);
        assert_eq!(runtime.call("s", args(json!({})), Some("id-1")), CallOutcome::Duplicate);
        assert_eq!(seen.borrow().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn received_frames_dedup_and_never_echo() {
        let mut runtime = ClientRuntime::new();
        let seen = recorder(&mut runtime, "s");
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.on_connected(tx);

        let frame = r#"{"signal":"s","opts":{"n":1},"signal_id":"x"}"#;
        assert_eq!(runtime.receive(frame), Some(CallOutcome::Local));
        assert_eq!(runtime.receive(frame), Some(CallOutcome::Duplicate));
        assert_eq!(runtime.receive(r#"{"signal":"s","opts":{}}"#), Some(CallOutcome::Local));
        assert_eq!(runtime.receive("not json"), None);

        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(seen.borrow()[0]["n"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn follow_up_calls_run_after_handlers() {
        let mut runtime = ClientRuntime::new();
        runtime.connect("ping", |scope, arguments| {
            scope.call("pong", arguments.clone());
        });
        let pongs = recorder(&mut runtime, "pong");

        runtime.receive(r#"{"signal":"ping","opts":{"n":3},"signal_id":"p1"}"#);
        assert_eq!(pongs.borrow().len(), 1);
        assert_eq!(runtime.pending_len(), 1);
        assert_eq!(decode(&runtime.pending[0]).signal, "pong");
    }

    #[test]
    fn frames_lost_mid_flush_return_to_the_front_in_order() {
        let mut runtime = ClientRuntime::new();
        for signal in ["a", "b", "c"] {
            runtime.call(signal, args(json!({})), None);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(runtime.on_connected(tx), 3);
        let written = rx.try_recv().unwrap();
        assert_eq!(decode(&written).signal, "a");

        runtime.on_disconnected();
        assert_eq!(runtime.call("d", args(json!({})), None), CallOutcome::Buffered);
        let unsent: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(runtime.requeue_unsent(unsent), 2);

        let order: Vec<String> = runtime.pending.iter().map(|frame| decode(frame).signal).collect();
        assert_eq!(order, vec!["b", "c", "d"]);
        assert_eq!(runtime.pending_len(), 3);
    }

    #[test]
    fn a_lost_sink_rebuffers() {
        let mut runtime = ClientRuntime::new();
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.on_connected(tx);
        drop(rx);

        assert_eq!(runtime.call("a", args(json!({})), None), CallOutcome::Buffered);
        assert_eq!(runtime.state(), ConnectionState::Disconnected);
        assert_eq!(runtime.pending_len(), 1);

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(rx);
        assert_eq!(runtime.on_connected(tx), 0);
        assert_eq!(runtime.pending_len(), 1);
        assert_eq!(runtime.state(), ConnectionState::Disconnected);
    }
}
