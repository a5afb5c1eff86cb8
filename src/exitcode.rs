//! Process exit codes.
//!
//! Bit-meaningful so a supervisor can tell client-side problems from
//! server/environment ones without parsing logs (spec.md §6).

/// Clean shutdown requested by the operator.
pub const CLEAN_SHUTDOWN: i32 = 0;
/// The client misbehaved talking to a correctly-behaving server (bad local
/// state, local bug) and the server rejected it outright.
pub const CLIENT_OR_SERVER_ERROR: i32 = 0x01;
/// An error only the client side could have caused (bad local data).
pub const CLIENT_UNEXPECTED_ERROR: i32 = 0x02;
/// Could be the remote server or the local environment (reconnect budget
/// exhausted, DNS failure, etc).
pub const SERVER_OR_ENVIRONMENT_ERROR: i32 = 0x04;
/// Could be the client's own request or the hosting environment.
pub const CLIENT_OR_ENVIRONMENT_ERROR: i32 = 0x08;
/// The environment (coordinator operator) kicked this node.
pub const ENVIRONMENT_ERROR: i32 = 0x10;

/// Terminate the process with the given exit code.
///
/// Centralized so every call site is grep-able; mirrors the original's
/// `osExit` indirection used so tests can stub it out.
pub fn exit(code: i32) -> ! {
    tracing::warn!(code, "exiting process");
    std::process::exit(code)
}
