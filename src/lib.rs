//! devwarden: run a dev server under supervision, notice when it is ready,
//! and diagnose its crashes from the captured output.

pub mod cli;
pub mod config;
pub mod control;
pub mod detector;
pub mod diagnosis;
pub mod events;
pub mod evidence;
pub mod feedback;
pub mod log;
pub mod session;
pub mod shell_completion;
pub mod supervisor;
pub mod timers;
