//! Hand-pumped fakes for exercising the engine without an OS underneath:
//! a scriptable transport, a buffering identity filter with a scriptable
//! handshake, a manual platform, and a recording event handler. Tests hold
//! their own `Arc` to each fake and drive/inspect it directly.

mod fake_filter;
mod fake_platform;
mod recording_events;

pub use fake_filter::FakeFilter;
pub use fake_platform::FakePlatform;
pub use fake_transport::{FakeTransport, OpenBehavior};
pub use recording_events::RecordingEvents;
