pub mod assessment;
pub mod core;
pub mod rubric;
pub mod setup;
pub mod timetable;
pub mod visits;
