pub mod classes;
pub mod core;
pub mod grading;
pub mod reports;
pub mod results;
pub mod schools;
pub mod sessions;
pub mod students;
pub mod subjects;
