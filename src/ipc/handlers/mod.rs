pub mod approvals;
pub mod auth;
pub mod backup;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod fees;
pub mod notifications;
pub mod reports;
pub mod results;
pub mod setup;
pub mod students;
pub mod users;
