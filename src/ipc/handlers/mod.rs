pub mod academic;
pub mod assignments;
pub mod attendance;
pub mod backup;
pub mod classes;
pub mod core;
pub mod grades;
pub mod planner;
pub mod reports;
pub mod resources;
pub mod setup;
pub mod subjects;
pub mod timetable;
pub mod users;
