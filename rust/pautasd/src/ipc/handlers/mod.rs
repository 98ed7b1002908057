pub mod calc;
pub mod classes;
pub mod components;
pub mod core;
pub mod reports;
pub mod scores;
pub mod setup;
pub mod students;
pub mod subjects;
