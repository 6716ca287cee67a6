pub mod attendance;
pub mod classes;
pub mod core;
pub mod people;
pub mod reports;
pub mod scores;
pub mod students;
pub mod subjects;
