pub mod access;
pub mod audit_log;
pub mod rate_limit;
