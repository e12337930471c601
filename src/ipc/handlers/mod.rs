pub mod attendance;
pub mod classes;
pub mod core;
pub mod institutions;
pub mod payments;
pub mod reports;
pub mod scores;
pub mod students;
pub mod subjects;
pub mod years;
