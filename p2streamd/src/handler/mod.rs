pub mod coglog;
pub mod debugger;
pub mod terminal;
pub mod window;

pub use coglog::CogLog;
pub use debugger::DebuggerFeed;
pub use terminal::TerminalLog;
pub use window::WindowFeed;
