pub mod agent_command;
pub mod batcher;
pub mod delivery;
pub mod event_loop;
pub mod heartbeat;
pub mod orchestrator;
pub mod router;
pub mod session_registry;
pub mod sessions;
pub mod shutdown;
pub mod supervisor;

pub use agent_command::{AgentCommandContext, build_agent_command};
pub use batcher::{BatchTiming, FlushTrigger, OutputBatch, OutputBatcher};
pub use delivery::{DeliveryError, DeliveryOutcome, DeliveryQueue, DeliveryStats};
pub use event_loop::run;
pub use heartbeat::{format_uptime, heartbeat_loop};
pub use orchestrator::{Daemon, VERSION};
pub use router::{DispatchOutcome, MessageRouter};
pub use session_registry::{
    SessionRecord, SessionRegistry, SessionState, SharedSessionRegistry, new_session_registry,
};
pub use sessions::{SessionManager, StopOutcome};
pub use shutdown::graceful_shutdown;
pub use supervisor::{Supervisor, SupervisorExit};
