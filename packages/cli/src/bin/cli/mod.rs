pub mod discover;
pub mod projects;
pub mod run;
pub mod utils;
