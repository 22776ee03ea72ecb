//! Doubles and fixtures shared by the runspace test suites.

mod engine;
mod observer;
mod world;

pub use engine::{Behaviour, Call, FakeRunspace, FakeRuntime, Latch, MISSING_SCRIPT, version_record};
pub use observer::{ObservedEvent, PATIENCE, RecordingObserver, ScriptedConsole, eventually};
pub use world::{TestSession, TestWorld, stop_at};
