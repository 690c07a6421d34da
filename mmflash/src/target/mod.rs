//! Boards and the provisioning session.

pub mod board;
pub mod session;

pub use {
    board::Board,
    session::{
        AgentConfig, ConnectTarget, Finish, Plan, ResetTiming, Session, SessionConfig,
        SessionState, reset_to_download,
    },
};
