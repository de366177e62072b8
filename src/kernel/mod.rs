//! Kernel side: subprocess supervision, client, output flush, and the
//! kernel-manager relay service.

pub mod client;
pub mod flush;
pub mod manager;
pub mod pid_registry;
pub mod supervisor;

pub use client::{shared, ConnectionDescriptor, KernelClient, SharedKernelClient, TcpKernelClient};
pub use flush::{flush, map_event, spawn_flush_loop, strip_ansi, FlushSettings, FlushSummary};
pub use manager::{run_manager, KernelManagerHandler};
pub use pid_registry::{CleanupReport, PidRegistry};
pub use supervisor::KernelSupervisor;
