//! Immutable projections of debugger state captured when execution stops.

mod breakpoint_details;
mod snapshot;
mod stack_frame;
mod variables;

pub use breakpoint_details::{BreakpointDetails, BreakpointDetailsBase};
pub use snapshot::DebuggerStopped;
pub use stack_frame::{NO_FILE, StackFrameDetails};
pub use variables::{VariableContainerDetails, VariableDetails};

pub(crate) use snapshot::DebuggerSnapshot;
