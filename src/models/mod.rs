pub mod dispatch;
pub mod job;
pub mod style;
