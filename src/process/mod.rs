//! Process management: external tools, signals and supervision backends.

mod command;
mod control;
mod supervisor;

pub use command::{failure_detail, run_tool, shell, stdout_text};
pub use control::{force_kill, graceful_shutdown, is_process_alive};
pub use supervisor::{
    ContainerBackend, StandaloneBackend, Supervision, Supervisor, SystemdBackend, COMPOSE_FILE,
    GRACEFUL_SHUTDOWN_TIMEOUT,
};
