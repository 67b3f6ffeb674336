//! Core services for SysManage-Server.
//!
//! Everything that makes agent communication correct under partial failure,
//! with no HTTP or WebSocket surface of its own: the tamper-evident audit
//! log, the RBAC engine, the durable per-host message queue, connection and
//! message security, login security, client certificate issuance, and the
//! external vault client.

pub mod audit;
pub mod certs;
pub mod comsec;
pub mod error;
pub mod login;
pub mod queue;
pub mod rbac;
pub mod vault;
