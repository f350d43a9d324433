//! Hook handler implementations
//!
//! - TCL procs executed in the sandbox
//! - Built-in handlers

pub mod builtin;
pub mod tcl_handler;

pub use self::builtin::*;
pub use self::tcl_handler::TclScriptHandler;
