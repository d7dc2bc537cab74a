//! The opaque message-body handle.
//!
//! The message-body buffer chain is treated as an external collaborator:
//! everything this crate needs from a message is exposed through this
//! trait, never through direct access to the body bytes.

/// An opaque, reference-counted message handle.
///
/// Implementors own whatever representation the embedding router uses for
/// message bodies (a buffer-chain, a `bytes::Bytes`, ...). This crate never
/// inspects the body; it only calls the operations below.
pub trait Message: std::fmt::Debug + Send + Sync {
    /// `true` once the full multi-frame transfer has been received.
    fn receive_complete(&self) -> bool;

    /// Produce an independent copy suitable for handing to a fanout peer.
    /// Implementations that are reference-counted internally may make this
    /// cheap; this crate treats it as an owned, independent value.
    fn copy(&self) -> Box<dyn Message>;

    /// Overwrite (or clear, with `None`) the `to` override annotation used
    /// by fallback redirection.
    fn set_to_override_annotation(&mut self, to: Option<String>);

    /// Overwrite the phase annotation used by fallback redirection.
    fn set_phase_annotation(&mut self, phase: i32);

    /// Read back whatever `set_to_override_annotation` last stored, for
    /// tests and diagnostics.
    fn to_override_annotation(&self) -> Option<&str>;

    /// Read back whatever `set_phase_annotation` last stored.
    fn phase_annotation(&self) -> i32;
}

/// Free-function alias kept for readers translating from the C source,
/// where `qd_message_free` is a distinct call. In Rust, freeing is just
/// dropping the `Box<dyn Message>` / `Arc<dyn Message>`; this function
/// exists only to give that drop a name at call sites that want to be
/// explicit about it.
pub fn free(_message: Box<dyn Message>) {}

/// A minimal in-memory [`Message`] used by this crate's own tests.
#[derive(Debug, Clone)]
pub struct TestMessage {
    complete: bool,
    to_override: Option<String>,
    phase: i32,
}

impl TestMessage {
    /// Construct a message whose `receive_complete` is already `true`.
    pub fn complete() -> Self {
        Self {
            complete: true,
            to_override: None,
            phase: 0,
        }
    }

    /// Construct a message that is still streaming (`receive_complete` is
    /// `false`).
    pub fn incomplete() -> Self {
        Self {
            complete: false,
            to_override: None,
            phase: 0,
        }
    }

    /// Mark a previously-incomplete message as complete, as the transport
    /// would after the final frame of a streaming transfer arrives.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }
}

impl Message for TestMessage {
    fn receive_complete(&self) -> bool {
        self.complete
    }

    fn copy(&self) -> Box<dyn Message> {
        Box::new(self.clone())
    }

    fn set_to_override_annotation(&mut self, to: Option<String>) {
        self.to_override = to;
    }

    fn set_phase_annotation(&mut self, phase: i32) {
        self.phase = phase;
    }

    fn to_override_annotation(&self) -> Option<&str> {
        self.to_override.as_deref()
    }

    fn phase_annotation(&self) -> i32 {
        self.phase
    }
}
